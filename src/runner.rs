//! Runner lifecycle: composes the tunnel, model server, dispatcher,
//! and heartbeat scheduler; owns startup ordering and reverse-order
//! shutdown under a single overall deadline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::{RegisterRequest, TaskClient};
use crate::config::Config;
use crate::dispatch::dedup::DedupMap;
use crate::dispatch::Dispatcher;
use crate::error::GaleError;
use crate::executor::ExecutorRegistry;
use crate::heartbeat::HeartbeatScheduler;
use crate::metrics::SystemMetrics;
use crate::model::{ModelCapability, RunnerIdentity};
use crate::ollama::OllamaSupervisor;
use crate::tunnel::TunnelSupervisor;

/// Floor given to every shutdown step so a spent overall deadline still
/// lets the step make a token attempt before being logged as late.
const MIN_STEP_SLICE: Duration = Duration::from_millis(100);

struct HttpServer {
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct Runner {
    cfg: Config,
    identity: RunnerIdentity,
    client: Arc<TaskClient>,
    dispatcher: Arc<Dispatcher>,
    heartbeat: HeartbeatScheduler,
    ollama: Option<Arc<OllamaSupervisor>>,
    tunnel: tokio::sync::Mutex<TunnelSupervisor>,
    http: tokio::sync::Mutex<Option<HttpServer>>,
    capabilities: std::sync::Mutex<Vec<ModelCapability>>,
    webhook_id: std::sync::Mutex<Option<String>>,
    cancel: CancellationToken,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl Runner {
    pub fn new(
        cfg: Config,
        identity: RunnerIdentity,
        executors: ExecutorRegistry,
        metrics: Arc<dyn SystemMetrics>,
        ollama: Option<Arc<OllamaSupervisor>>,
    ) -> Self {
        let client = Arc::new(TaskClient::new(
            &cfg.coordinator_url,
            &identity.instance_id,
            &identity.device_id,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            DedupMap::new(),
            Arc::clone(&client),
            Arc::new(executors),
            identity.clone(),
        ));
        let heartbeat = HeartbeatScheduler::new(
            cfg.heartbeat.clone(),
            Arc::clone(&client),
            identity.wallet_address.clone(),
            metrics,
            dispatcher.in_flight_handle(),
            None,
        );
        let tunnel = tokio::sync::Mutex::new(TunnelSupervisor::new(cfg.tunnel.clone()));

        Self {
            cfg,
            identity,
            client,
            dispatcher,
            heartbeat,
            ollama,
            tunnel,
            http: tokio::sync::Mutex::new(None),
            capabilities: std::sync::Mutex::new(Vec::new()),
            webhook_id: std::sync::Mutex::new(None),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn heartbeat(&self) -> &HeartbeatScheduler {
        &self.heartbeat
    }

    pub fn webhook_id(&self) -> Option<String> {
        self.webhook_id.lock().expect("runner mutex poisoned").clone()
    }

    pub fn model_capabilities(&self) -> Vec<ModelCapability> {
        self.capabilities.lock().expect("runner mutex poisoned").clone()
    }

    /// Bring the node up: tunnel, model server, registration, webhook
    /// server, heartbeats — strictly in that order. Any failure before
    /// the webhook server is listening aborts startup.
    pub async fn start(&self) -> Result<(), GaleError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(GaleError::Validation("runner already started".into()));
        }

        // The listen port must be free before anything is announced.
        let probe = TcpListener::bind(("0.0.0.0", self.cfg.local_port)).await?;
        drop(probe);

        let public_url = if self.cfg.tunnel.enabled {
            let mut tunnel = self.tunnel.lock().await;
            tunnel.start(self.cfg.local_port, &self.cancel).await?
        } else {
            format!("{}/webhook", self.cfg.local_webhook_url())
        };

        if let Some(ref ollama) = self.ollama {
            ollama.ensure_installed().await?;
            ollama.start(&self.cancel).await?;
            ollama
                .ensure_models(&self.cfg.ollama.models, &self.cancel)
                .await?;
            let caps = ollama.capabilities(&self.cfg.ollama.models).await;
            *self.capabilities.lock().expect("runner mutex poisoned") = caps;
        }

        let register = RegisterRequest {
            wallet_address: self.identity.wallet_address.clone(),
            status: "online".to_string(),
            webhook: public_url.clone(),
            model_capabilities: self.model_capabilities(),
        };
        let response = self.client.register(&register).await?;
        *self.webhook_id.lock().expect("runner mutex poisoned") = Some(response.webhook_id);
        tracing::info!(webhook = %public_url, "registered with coordinator");

        self.serve().await?;
        self.heartbeat.start();

        tracing::info!(port = self.cfg.local_port, "runner started");
        Ok(())
    }

    async fn serve(&self) -> Result<(), GaleError> {
        let listener = TcpListener::bind(("0.0.0.0", self.cfg.local_port)).await?;
        let router = Arc::clone(&self.dispatcher).router();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = serve.await {
                tracing::error!("webhook server error: {e}");
            }
        });

        *self.http.lock().await = Some(HttpServer {
            shutdown_tx,
            handle,
        });
        Ok(())
    }

    /// Tear the node down in reverse order. Each step gets a slice of
    /// the single overall deadline; an overrunning step is logged and
    /// the next one proceeds regardless. Idempotent: the second call
    /// returns immediately.
    pub async fn stop(&self, deadline: Duration) -> Result<(), GaleError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            tracing::debug!("stop called again, nothing to do");
            return Ok(());
        }
        let end = Instant::now() + deadline;
        tracing::info!(deadline_ms = deadline.as_millis() as u64, "stopping runner");

        // 1-2. Final offline heartbeat, then halt the scheduler.
        self.heartbeat.stop(true, slice(end)).await;

        // 3. Deregister the webhook.
        let unregister = self.client.unregister(&self.identity.device_id);
        match tokio::time::timeout(slice(end), unregister).await {
            Ok(Ok(())) => tracing::info!("webhook deregistered"),
            Ok(Err(e)) => tracing::warn!("webhook deregistration failed: {e}"),
            Err(_) => tracing::warn!("webhook deregistration timed out"),
        }

        // 4. Cancel in-flight work and close the webhook server.
        self.dispatcher.shutdown();
        self.cancel.cancel();
        if let Some(server) = self.http.lock().await.take() {
            let _ = server.shutdown_tx.send(());
            match tokio::time::timeout(slice(end), server.handle).await {
                Ok(Ok(())) => tracing::info!("webhook server shut down"),
                Ok(Err(e)) => tracing::warn!("webhook server join failed: {e}"),
                Err(_) => tracing::warn!("webhook server shutdown timed out"),
            }
        }

        // 5. Model server, only when configured as a full cleanup.
        if let Some(ref ollama) = self.ollama {
            if self.cfg.ollama.cleanup_on_shutdown {
                match tokio::time::timeout(slice(end), ollama.cleanup()).await {
                    Ok(()) => {}
                    Err(_) => tracing::warn!("model server cleanup timed out"),
                }
            } else {
                tracing::debug!("leaving model server running for restart");
            }
        }

        // 6. Tunnel last.
        let mut tunnel = self.tunnel.lock().await;
        match tokio::time::timeout(slice(end), tunnel.stop()).await {
            Ok(()) => {}
            Err(_) => tracing::warn!("tunnel shutdown timed out"),
        }

        tracing::info!("runner stopped");
        Ok(())
    }
}

fn slice(end: Instant) -> Duration {
    end.saturating_duration_since(Instant::now()).max(MIN_STEP_SLICE)
}
