use broker::{HealthConfig, HealthMonitor, SubscriptionKey, SubscriptionMultiplexer};
use driver::testing::FakeUpstreamClient;
use std::sync::Arc;
use std::time::Duration;

async fn subscribed_and_watched(
    config: HealthConfig,
) -> (Arc<SubscriptionMultiplexer>, FakeUpstreamClient, Arc<HealthMonitor>, SubscriptionKey) {
    let fake = FakeUpstreamClient::new();
    let mux = Arc::new(SubscriptionMultiplexer::new(Arc::new(fake.clone())));
    mux.connect().await.expect("connect");

    let monitor = HealthMonitor::new(Arc::clone(&mux), config);
    monitor.start().await;

    let key = SubscriptionKey::new("BINANCE:BTCUSDT", "1");
    assert!(mux.subscribe(&key, "client").await);
    tokio::time::sleep(Duration::from_millis(20)).await;

    (mux, fake, monitor, key)
}

#[tokio::test]
async fn a_single_stale_key_below_threshold_gets_individual_recovery() {
    let config = HealthConfig {
        stale_threshold_multiplier: 1e-9,
        full_reconnect_threshold: 5,
        ..HealthConfig::default()
    };
    let (_mux, fake, monitor, _key) = subscribed_and_watched(config).await;

    monitor.scan().await;

    assert_eq!(fake.delete_count(), 1, "individual recovery should unsubscribe once");
    assert_eq!(fake.open_count(), 2, "individual recovery should reopen the chart");
}

#[tokio::test]
async fn stale_count_at_threshold_triggers_full_reconnect_instead() {
    let config = HealthConfig {
        stale_threshold_multiplier: 1e-9,
        full_reconnect_threshold: 1,
        ..HealthConfig::default()
    };
    let (mux, fake, monitor, key) = subscribed_and_watched(config).await;

    monitor.scan().await;

    assert_eq!(
        fake.delete_count(),
        0,
        "full reconnect tears down via driver end(), not per-chart delete()"
    );
    assert_eq!(fake.open_count(), 2, "the snapshot is fully restored after reconnect");
    assert_eq!(mux.list().await, vec![key]);
}

#[tokio::test]
async fn recovery_attempts_exhaust_after_the_configured_maximum() {
    let config = HealthConfig {
        stale_threshold_multiplier: 1e-9,
        full_reconnect_threshold: 100,
        max_recovery_attempts: 2,
        ..HealthConfig::default()
    };
    let (_mux, fake, monitor, _key) = subscribed_and_watched(config).await;

    for _ in 0..5 {
        monitor.scan().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(fake.delete_count(), 2, "recovery stops after max_recovery_attempts");
}
