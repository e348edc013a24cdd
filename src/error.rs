use thiserror::Error;

#[derive(Debug, Error)]
pub enum GaleError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("task {0} is unavailable")]
    TaskUnavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("coordinator error: {0}")]
    Coordinator(String),

    #[error("model server error: {0}")]
    ModelServer(String),

    #[error("model not found: {model}. {suggestion}")]
    ModelNotFound { model: String, suggestion: String },

    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("subprocess error: {0}")]
    Subprocess(String),

    #[error("process exited with code {code}: {stderr}")]
    ProcessExit { code: i32, stderr: String },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("cancelled")]
    Cancelled,

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GaleError {
    /// True for errors that abort startup: the process exits non-zero.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// True for errors the dispatcher logs and drops without retrying.
    /// The coordinator re-delivers or re-assigns; the runner does not.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::TaskUnavailable(_) | Self::NotFound(_))
    }

    /// True when a retry inside the owning component may help.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Request(_) | Self::Timeout(_) | Self::Coordinator(_) | Self::ModelServer(_)
        )
    }
}
