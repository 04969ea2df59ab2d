//! Integration tests for the channel health monitor
//!
//! Covers window accounting under concurrency, the open-bucket exclusion,
//! quarantine expiry boundaries, config reloads and the background loops.

use std::sync::Arc;
use std::time::Duration;

use relay_gateway::core::clock::ManualClock;
use relay_gateway::core::config::HealthSettings;
use relay_gateway::health::{
    FileConfigSource, HealthConfigStore, HealthMonitor, Sample, StaticConfigSource,
};
use tokio_util::sync::CancellationToken;

const START: i64 = 1_700_000_000;

const CONFIG: &str = r#"{
    "gpt-4o": {
        "1": {
            "enabled": true,
            "timeout_window": 60,
            "timeout_frt_time_ms": 1000,
            "timeout_use_time": 30,
            "disable_recovery_time": 300
        }
    }
}"#;

fn monitor_with(config: &str) -> (Arc<HealthMonitor>, Arc<ManualClock>) {
    let store = Arc::new(HealthConfigStore::new());
    store.reload_from_str(config).unwrap();
    let clock = Arc::new(ManualClock::at_unix(START));
    (
        Arc::new(HealthMonitor::with_clock(store, clock.clone())),
        clock,
    )
}

fn slow() -> Sample {
    Sample::from_raw(5_000, 10.0)
}

fn fast() -> Sample {
    Sample::from_raw(200, 1.0)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_samples_are_not_lost() {
    let (monitor, _clock) = monitor_with(CONFIG);

    let mut handles = Vec::new();
    for task in 0..8 {
        let monitor = Arc::clone(&monitor);
        handles.push(tokio::spawn(async move {
            for i in 0..250 {
                let latency = if (task + i) % 5 == 0 { -1 } else { 100 };
                monitor.record_sample(1, "gpt-4o", Sample::from_raw(latency, 1.0));
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let (single, _) = monitor_with(CONFIG);
    for task in 0..8 {
        for i in 0..250 {
            let latency = if (task + i) % 5 == 0 { -1 } else { 100 };
            single.record_sample(1, "gpt-4o", Sample::from_raw(latency, 1.0));
        }
    }

    let concurrent = monitor.monitor_stats(1, "gpt-4o").unwrap();
    let sequential = single.monitor_stats(1, "gpt-4o").unwrap();
    assert_eq!(concurrent.window.total_requests, 2000);
    assert_eq!(concurrent.window, sequential.window);
    assert_eq!(concurrent.buckets, 1);
}

#[tokio::test]
async fn test_samples_survive_rotation() {
    let (monitor, clock) = monitor_with(CONFIG);

    for _ in 0..6 {
        for _ in 0..3 {
            monitor.record_sample(1, "gpt-4o", fast());
        }
        clock.advance(Duration::from_secs(10));
    }

    let stats = monitor.monitor_stats(1, "gpt-4o").unwrap();
    assert_eq!(stats.buckets, 6);
    assert_eq!(stats.window.total_requests, 18);

    // Seventh bucket pushes the oldest out of the 60s window
    monitor.record_sample(1, "gpt-4o", fast());
    let stats = monitor.monitor_stats(1, "gpt-4o").unwrap();
    assert_eq!(stats.buckets, 6);
    assert_eq!(stats.window.total_requests, 16);
}

#[tokio::test]
async fn test_open_bucket_never_triggers_disable() {
    let (monitor, clock) = monitor_with(CONFIG);

    for _ in 0..20 {
        monitor.record_sample(1, "gpt-4o", slow());
    }
    assert_eq!(monitor.evaluate_and_maybe_disable(), 0);
    assert!(!monitor.is_disabled(1, "gpt-4o"));

    clock.advance(Duration::from_secs(9));
    assert_eq!(monitor.evaluate_and_maybe_disable(), 0);

    clock.advance(Duration::from_secs(1));
    assert_eq!(monitor.evaluate_and_maybe_disable(), 1);
    assert!(monitor.is_disabled(1, "gpt-4o"));

    let entries = monitor.disabled_entries();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].reason.contains("first-response latency"));
    assert_eq!(entries[0].duration, Duration::from_secs(300));
}

#[tokio::test]
async fn test_quarantine_expiry_boundary() {
    let (monitor, clock) = monitor_with(CONFIG);
    monitor.record_sample(1, "gpt-4o", slow());
    clock.advance(Duration::from_secs(10));
    assert_eq!(monitor.evaluate_and_maybe_disable(), 1);

    clock.advance(Duration::from_millis(299_999));
    assert!(monitor.is_disabled(1, "gpt-4o"));

    clock.advance(Duration::from_millis(1));
    assert!(!monitor.is_disabled(1, "gpt-4o"));
    assert!(monitor.disabled_entries().is_empty());

    clock.advance(Duration::from_secs(60));
    assert!(!monitor.is_disabled(1, "gpt-4o"));
}

#[tokio::test]
async fn test_no_redisable_without_fresh_samples() {
    let (monitor, clock) = monitor_with(CONFIG);
    monitor.record_sample(1, "gpt-4o", slow());
    clock.advance(Duration::from_secs(10));
    assert_eq!(monitor.evaluate_and_maybe_disable(), 1);

    // Cooldown: evaluation skips the pairing while quarantined
    monitor.record_sample(1, "gpt-4o", slow());
    clock.advance(Duration::from_secs(10));
    assert_eq!(monitor.evaluate_and_maybe_disable(), 0);

    clock.advance(Duration::from_secs(300));
    assert_eq!(monitor.sweep_expired(), 1);

    // The old slow sample fell out of the window; nothing to judge
    assert_eq!(monitor.evaluate_and_maybe_disable(), 0);
    assert!(!monitor.is_disabled(1, "gpt-4o"));
}

#[tokio::test]
async fn test_disabled_entry_for_unmonitored_pairing_reports_available() {
    let (monitor, clock) = monitor_with(CONFIG);
    monitor.record_sample(1, "gpt-4o", slow());
    clock.advance(Duration::from_secs(10));
    assert_eq!(monitor.evaluate_and_maybe_disable(), 1);

    // Monitoring switched off while the quarantine is active
    monitor.config().reload_from_str("").unwrap();
    assert!(!monitor.is_disabled(1, "gpt-4o"));
}

#[tokio::test]
async fn test_file_reload_keeps_last_good_config() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("channel_health.json");
    std::fs::write(&path, CONFIG).unwrap();

    let (monitor, _clock) = monitor_with("");
    let source = FileConfigSource::new(&path);
    assert!(monitor.reload_config(&source).await);
    assert!(monitor.config().any_enabled());

    std::fs::write(&path, "{ this is not json").unwrap();
    assert!(!monitor.reload_config(&source).await);
    assert!(monitor.config().any_enabled());

    std::fs::remove_file(&path).unwrap();
    assert!(!monitor.reload_config(&source).await);
    assert!(monitor.config().any_enabled());

    assert!(monitor.reload_config(&StaticConfigSource::new("")).await);
    assert!(!monitor.config().any_enabled());
}

#[tokio::test(start_paused = true)]
async fn test_background_scan_and_recovery() {
    let (monitor, clock) = monitor_with(CONFIG);
    let settings = HealthSettings::default();
    let cancel = CancellationToken::new();
    let handles = monitor.spawn_background_tasks(
        Arc::new(StaticConfigSource::new(CONFIG)),
        &settings,
        cancel.clone(),
    );

    monitor.record_sample(1, "gpt-4o", slow());
    clock.advance(Duration::from_secs(10));

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(!monitor.disabled_entries().is_empty());

    clock.advance(Duration::from_secs(300));
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert!(monitor.disabled_entries().is_empty());

    cancel.cancel();
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test]
async fn test_extreme_telemetry_still_trips_the_breaker() {
    let (monitor, clock) = monitor_with(CONFIG);
    for _ in 0..3 {
        monitor.record_sample(1, "gpt-4o", Sample::from_raw(i64::MAX, 1e20));
    }

    let stats = monitor.monitor_stats(1, "gpt-4o").unwrap();
    assert_eq!(stats.window.total_requests, 3);
    assert_eq!(stats.window.total_latency_ms, u64::MAX);

    clock.advance(Duration::from_secs(10));
    assert_eq!(monitor.evaluate_and_maybe_disable(), 1);
    assert!(monitor.is_disabled(1, "gpt-4o"));
}
