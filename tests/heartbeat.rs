//! Heartbeat scheduler: backoff growth under coordinator failure,
//! cadence restore on recovery, and the final offline report.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{wait_for, MockCoordinator};
use gale::client::TaskClient;
use gale::config::HeartbeatConfig;
use gale::heartbeat::HeartbeatScheduler;
use gale::metrics::StaticMetrics;

fn quick_config() -> HeartbeatConfig {
    HeartbeatConfig {
        interval: Duration::from_millis(40),
        base_backoff: Duration::from_millis(60),
        max_backoff: Duration::from_millis(150),
        max_retries: 1,
        send_timeout: Duration::from_secs(1),
    }
}

fn scheduler_for(
    coordinator: &MockCoordinator,
    cfg: HeartbeatConfig,
    in_flight: Arc<AtomicUsize>,
) -> HeartbeatScheduler {
    let client = Arc::new(TaskClient::new(&coordinator.url(), "instance-1", "device-1"));
    HeartbeatScheduler::new(
        cfg,
        client,
        "0xwallet".to_string(),
        Arc::new(StaticMetrics {
            memory: 256 * 1024 * 1024,
            cpu: 12.5,
        }),
        in_flight,
        Some("203.0.113.7".to_string()),
    )
}

#[tokio::test]
async fn reports_carry_identity_and_metrics() {
    let coordinator = MockCoordinator::spawn().await;
    let scheduler = scheduler_for(
        &coordinator,
        quick_config(),
        Arc::new(AtomicUsize::new(0)),
    );
    scheduler.start();

    assert!(
        wait_for(Duration::from_secs(2), || coordinator.heartbeat_count() >= 1).await,
        "no heartbeat arrived"
    );
    scheduler.stop(false, Duration::from_millis(100)).await;

    let report = coordinator.last_heartbeat().unwrap();
    assert_eq!(report["wallet_address"], "0xwallet");
    assert_eq!(report["status"], "online");
    assert_eq!(report["memory_usage"].as_u64(), Some(256 * 1024 * 1024));
    assert_eq!(report["public_ip"], "203.0.113.7");
    assert!(report["timestamp"].as_u64().unwrap() > 0);
    // Bare payload: no envelope fields.
    assert!(report.get("type").is_none());
    assert!(report.get("payload").is_none());
}

#[tokio::test]
async fn busy_dispatcher_reports_busy_status() {
    let coordinator = MockCoordinator::spawn().await;
    let in_flight = Arc::new(AtomicUsize::new(1));
    let scheduler = scheduler_for(&coordinator, quick_config(), in_flight);
    scheduler.start();

    assert!(wait_for(Duration::from_secs(2), || coordinator.heartbeat_count() >= 1).await);
    scheduler.stop(false, Duration::from_millis(100)).await;

    let report = coordinator.last_heartbeat().unwrap();
    assert_eq!(report["status"], "busy");
}

#[tokio::test]
async fn backoff_grows_linearly_and_caps() {
    let coordinator = MockCoordinator::spawn().await;
    let cfg = quick_config();
    coordinator.state.heartbeat_failures.store(10, Ordering::SeqCst);
    let scheduler = scheduler_for(&coordinator, cfg.clone(), Arc::new(AtomicUsize::new(0)));
    scheduler.start();

    // Sample the schedule as failures accumulate. Every stable
    // observation must satisfy next = min(k × base_backoff, max); the
    // double-read of the failure counter discards samples that raced a
    // tick between the two getters.
    let mut observed = std::collections::BTreeSet::new();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while std::time::Instant::now() < deadline && observed.len() < 4 {
        let failures = scheduler.consecutive_failures();
        let interval = scheduler.current_interval();
        if failures > 0 && scheduler.consecutive_failures() == failures {
            let expected = (cfg.base_backoff * failures).min(cfg.max_backoff);
            assert_eq!(interval, expected, "wrong interval after {failures} failures");
            observed.insert(failures);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(
        observed.len() >= 4,
        "too few failure counts observed: {observed:?}"
    );
    // The cap engaged: 3 × 60ms exceeds the 150ms maximum.
    assert!(observed.iter().any(|k| *k >= 3));

    scheduler.stop(false, Duration::from_millis(100)).await;
}

#[tokio::test]
async fn success_restores_base_interval_within_one_tick() {
    let coordinator = MockCoordinator::spawn().await;
    let cfg = quick_config();
    coordinator.state.heartbeat_failures.store(3, Ordering::SeqCst);
    let scheduler = scheduler_for(&coordinator, cfg.clone(), Arc::new(AtomicUsize::new(0)));
    scheduler.start();

    assert!(wait_for(Duration::from_secs(3), || scheduler.consecutive_failures() >= 3).await);

    // Failures are exhausted; the next tick succeeds and snaps back.
    assert!(
        wait_for(Duration::from_secs(3), || coordinator.heartbeat_count() >= 1).await,
        "recovery heartbeat never arrived"
    );
    assert!(
        wait_for(Duration::from_secs(1), || {
            scheduler.consecutive_failures() == 0
                && scheduler.current_interval() == cfg.interval
        })
        .await,
        "cadence not restored after success"
    );

    scheduler.stop(false, Duration::from_millis(100)).await;
}

#[tokio::test]
async fn near_base_cadence_is_left_alone() {
    let coordinator = MockCoordinator::spawn().await;
    let cfg = HeartbeatConfig {
        interval: Duration::from_millis(100),
        // One failure lands inside the ±10% band around base.
        base_backoff: Duration::from_millis(105),
        max_backoff: Duration::from_millis(400),
        max_retries: 1,
        send_timeout: Duration::from_secs(1),
    };
    coordinator.state.heartbeat_failures.store(1, Ordering::SeqCst);
    let scheduler = scheduler_for(&coordinator, cfg.clone(), Arc::new(AtomicUsize::new(0)));
    scheduler.start();

    assert!(wait_for(Duration::from_secs(2), || scheduler.consecutive_failures() >= 1).await);

    assert!(wait_for(Duration::from_secs(2), || coordinator.heartbeat_count() >= 1).await);
    assert!(
        wait_for(Duration::from_secs(1), || scheduler.consecutive_failures() == 0).await
    );
    // Within the hysteresis band the drifted schedule stays.
    assert_eq!(scheduler.current_interval(), cfg.base_backoff);

    scheduler.stop(false, Duration::from_millis(100)).await;
}

#[tokio::test]
async fn stop_sends_final_offline_report() {
    let coordinator = MockCoordinator::spawn().await;
    let scheduler = scheduler_for(
        &coordinator,
        quick_config(),
        Arc::new(AtomicUsize::new(0)),
    );
    scheduler.start();
    assert!(wait_for(Duration::from_secs(2), || coordinator.heartbeat_count() >= 1).await);

    let before = coordinator.heartbeat_count();
    scheduler.stop(true, Duration::from_secs(1)).await;

    assert!(coordinator.heartbeat_count() > before, "no final report sent");
    let report = coordinator.last_heartbeat().unwrap();
    assert_eq!(report["status"], "offline");
    assert!(report.get("type").is_none(), "offline report must be a bare payload");
}

#[tokio::test]
async fn set_interval_replaces_base() {
    let coordinator = MockCoordinator::spawn().await;
    let scheduler = scheduler_for(
        &coordinator,
        quick_config(),
        Arc::new(AtomicUsize::new(0)),
    );
    scheduler.set_interval(Duration::from_millis(20));
    assert_eq!(scheduler.current_interval(), Duration::from_millis(20));

    scheduler.start();
    assert!(wait_for(Duration::from_secs(1), || coordinator.heartbeat_count() >= 2).await);
    scheduler.stop(false, Duration::from_millis(100)).await;
}
