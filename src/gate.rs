//! Two-layer rate gate in front of the model server: a counting gate
//! that caps concurrent requests, and a process-global minimum spacing
//! between consecutive request starts. Both layers are enforced on
//! every outbound LLM call; all call sites share one `LlmGate` value.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::GateConfig;
use crate::error::GaleError;

pub struct LlmGate {
    semaphore: Arc<Semaphore>,
    /// Start time of the most recent request, process-wide. Locked only
    /// briefly; the spacing sleep happens outside the lock.
    last_request: Mutex<Option<Instant>>,
    min_interval: Duration,
    release_delay: Duration,
    settle_delay: Duration,
}

/// Held for the duration of one model-server request. Dropping it
/// returns the slot after `release_delay`, giving the model server time
/// to quiesce between requests.
#[derive(Debug)]
pub struct GatePermit {
    permit: Option<OwnedSemaphorePermit>,
    release_delay: Duration,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            let delay = self.release_delay;
            if delay.is_zero() {
                drop(permit);
            } else {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    drop(permit);
                });
            }
        }
    }
}

impl LlmGate {
    pub fn new(cfg: &GateConfig) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(cfg.capacity.max(1))),
            last_request: Mutex::new(None),
            min_interval: cfg.min_interval,
            release_delay: cfg.release_delay,
            settle_delay: cfg.settle_delay,
        }
    }

    /// Acquire a request slot, then wait out the remainder of the
    /// minimum inter-request interval. Cancellation while waiting
    /// returns `Cancelled` without touching the last-request timestamp.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<GatePermit, GaleError> {
        let permit = tokio::select! {
            acquired = self.semaphore.clone().acquire_owned() => {
                acquired.map_err(|_| GaleError::Cancelled)?
            }
            _ = cancel.cancelled() => return Err(GaleError::Cancelled),
        };

        let wait = {
            let last = self.last_request.lock().expect("gate mutex poisoned");
            match *last {
                Some(at) => self.min_interval.saturating_sub(at.elapsed()),
                None => Duration::ZERO,
            }
        };

        if !wait.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => {
                    // Permit drops here without the release delay: the
                    // request never started, so there is nothing for the
                    // model server to quiesce from.
                    drop(permit);
                    return Err(GaleError::Cancelled);
                }
            }
        }

        *self.last_request.lock().expect("gate mutex poisoned") = Some(Instant::now());

        Ok(GatePermit {
            permit: Some(permit),
            release_delay: self.release_delay,
        })
    }

    /// Short pause after a successful response, before the result is
    /// handed back to the caller.
    pub async fn settle(&self) {
        if !self.settle_delay.is_zero() {
            tokio::time::sleep(self.settle_delay).await;
        }
    }
}

/// Run `op` up to `max_attempts` times with a linear inter-attempt
/// backoff of `base_delay × attempt_number`. Cancellation short-circuits
/// both the operation and the backoff sleep. On success, returns the
/// value together with the wall-clock time spent across all attempts.
pub async fn with_retries<T, F, Fut>(
    max_attempts: u32,
    base_delay: Duration,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<(T, Duration), GaleError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, GaleError>>,
{
    let start = Instant::now();
    let attempts = max_attempts.max(1);
    let mut last_err = GaleError::Cancelled;

    for attempt in 1..=attempts {
        match op(attempt).await {
            Ok(value) => return Ok((value, start.elapsed())),
            Err(GaleError::Cancelled) => return Err(GaleError::Cancelled),
            Err(e) => {
                tracing::warn!(attempt, max_attempts = attempts, "llm request failed: {e}");
                last_err = e;
            }
        }

        if attempt < attempts {
            let backoff = base_delay * attempt;
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = cancel.cancelled() => return Err(GaleError::Cancelled),
            }
        }
    }

    Err(last_err)
}
