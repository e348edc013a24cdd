//! Periodic status reporter with self-tuning cadence: consecutive send
//! failures stretch the interval linearly up to a cap, and the first
//! success while idle snaps it back to the base interval.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::TaskClient;
use crate::config::HeartbeatConfig;
use crate::error::GaleError;
use crate::metrics::SystemMetrics;
use crate::model::{unix_seconds, HeartbeatReport, RunnerStatus};

/// Hysteresis band around the base interval. A successful tick restores
/// the base cadence only when the current schedule drifted outside this
/// band, so a near-base schedule is not churned every tick.
const RESTORE_BAND: f64 = 0.10;

struct ScheduleState {
    base_interval: Duration,
    current_interval: Duration,
    consecutive_failures: u32,
}

struct HeartbeatInner {
    cfg: HeartbeatConfig,
    client: Arc<TaskClient>,
    wallet_address: String,
    metrics: Arc<dyn SystemMetrics>,
    /// Dispatcher's in-flight task count; non-zero reports as busy.
    in_flight: Arc<AtomicUsize>,
    public_ip: Option<String>,
    started_at: Instant,
    state: Mutex<ScheduleState>,
}

pub struct HeartbeatScheduler {
    inner: Arc<HeartbeatInner>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatInner {
    fn build_report(&self) -> HeartbeatReport {
        let status = if self.in_flight.load(Ordering::SeqCst) > 0 {
            RunnerStatus::Busy
        } else {
            RunnerStatus::Online
        };
        HeartbeatReport {
            wallet_address: self.wallet_address.clone(),
            status,
            timestamp: unix_seconds(),
            uptime: self.started_at.elapsed().as_secs(),
            memory_usage: self.metrics.memory_usage(),
            cpu_usage: self.metrics.cpu_usage(),
            public_ip: self.public_ip.clone(),
        }
    }

    /// Send one report with bounded inner retries (linear backoff).
    async fn send_with_retries(&self, cancel: &CancellationToken) -> Result<(), GaleError> {
        let attempts = self.cfg.max_retries.max(1);
        let mut last_err = GaleError::Cancelled;

        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(GaleError::Cancelled);
            }
            let report = self.build_report();
            match self.client.heartbeat(&report, self.cfg.send_timeout).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::debug!(attempt, "heartbeat send failed: {e}");
                    last_err = e;
                }
            }
            if attempt < attempts {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(1) * attempt) => {}
                    _ = cancel.cancelled() => return Err(GaleError::Cancelled),
                }
            }
        }
        Err(last_err)
    }

    fn on_failure(&self) {
        let mut state = self.state.lock().expect("heartbeat mutex poisoned");
        state.consecutive_failures += 1;
        let next = (self.cfg.base_backoff * state.consecutive_failures).min(self.cfg.max_backoff);
        if next != state.base_interval {
            state.current_interval = next;
        }
        tracing::warn!(
            failures = state.consecutive_failures,
            next_interval_ms = state.current_interval.as_millis() as u64,
            "heartbeat failed, backing off"
        );
    }

    fn on_success(&self) {
        let busy = self.in_flight.load(Ordering::SeqCst) > 0;
        let mut state = self.state.lock().expect("heartbeat mutex poisoned");
        state.consecutive_failures = 0;

        if busy {
            return;
        }
        let lo = state.base_interval.mul_f64(1.0 - RESTORE_BAND);
        let hi = state.base_interval.mul_f64(1.0 + RESTORE_BAND);
        if state.current_interval < lo || state.current_interval > hi {
            tracing::info!(
                interval_ms = state.base_interval.as_millis() as u64,
                "heartbeat cadence restored"
            );
            state.current_interval = state.base_interval;
        }
    }

    async fn tick(&self, cancel: &CancellationToken) {
        match self.send_with_retries(cancel).await {
            Ok(()) => self.on_success(),
            Err(GaleError::Cancelled) => {}
            Err(_) => self.on_failure(),
        }
    }
}

impl HeartbeatScheduler {
    pub fn new(
        cfg: HeartbeatConfig,
        client: Arc<TaskClient>,
        wallet_address: String,
        metrics: Arc<dyn SystemMetrics>,
        in_flight: Arc<AtomicUsize>,
        public_ip: Option<String>,
    ) -> Self {
        let state = ScheduleState {
            base_interval: cfg.interval,
            current_interval: cfg.interval,
            consecutive_failures: 0,
        };
        Self {
            inner: Arc::new(HeartbeatInner {
                cfg,
                client,
                wallet_address,
                metrics,
                in_flight,
                public_ip,
                started_at: Instant::now(),
                state: Mutex::new(state),
            }),
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// Start the tick loop. Ticks are serialised by construction: the
    /// loop awaits each send before sleeping again, and a second call
    /// to `start` is a no-op.
    pub fn start(&self) {
        let mut handle = self.handle.lock().expect("heartbeat mutex poisoned");
        if handle.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let cancel = self.cancel.clone();
        *handle = Some(tokio::spawn(async move {
            loop {
                let interval = inner
                    .state
                    .lock()
                    .expect("heartbeat mutex poisoned")
                    .current_interval;
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = cancel.cancelled() => break,
                }
                inner.tick(&cancel).await;
            }
            tracing::debug!("heartbeat loop exited");
        }));
    }

    /// Replace the base interval and reschedule the active tick.
    pub fn set_interval(&self, interval: Duration) {
        let mut state = self.inner.state.lock().expect("heartbeat mutex poisoned");
        state.base_interval = interval;
        state.current_interval = interval;
    }

    /// Halt the loop. When `deadline` allows, one final report with
    /// status offline is sent first as a bare payload.
    pub async fn stop(&self, send_offline: bool, deadline: Duration) {
        self.cancel.cancel();
        let handle = self.handle.lock().expect("heartbeat mutex poisoned").take();
        if let Some(handle) = handle {
            let _ = handle
                .await
                .inspect_err(|e| tracing::warn!("heartbeat loop join failed: {e}"));
        }

        if send_offline {
            let mut report = self.inner.build_report();
            report.status = RunnerStatus::Offline;
            let send = self.inner.client.heartbeat(&report, self.inner.cfg.send_timeout);
            match tokio::time::timeout(deadline, send).await {
                Ok(Ok(())) => tracing::info!("final offline heartbeat sent"),
                Ok(Err(e)) => tracing::warn!("final offline heartbeat failed: {e}"),
                Err(_) => tracing::warn!("final offline heartbeat timed out"),
            }
        }
    }

    // Introspection for callers and tests.

    pub fn current_interval(&self) -> Duration {
        self.inner
            .state
            .lock()
            .expect("heartbeat mutex poisoned")
            .current_interval
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner
            .state
            .lock()
            .expect("heartbeat mutex poisoned")
            .consecutive_failures
    }
}
