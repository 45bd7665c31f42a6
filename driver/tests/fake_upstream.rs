use driver::testing::FakeUpstreamClient;
use driver::{ChartEvent, RawPeriod, UpstreamClient};

fn period(time: i64, close: f64) -> RawPeriod {
    RawPeriod {
        time,
        open: close,
        close,
        high: None,
        low: None,
        max: None,
        min: None,
        volume: None,
    }
}

#[tokio::test]
async fn open_chart_then_set_market_then_receive_update() {
    let client = FakeUpstreamClient::new();
    client.connect().await.expect("connect");

    let mut opened = client.open_chart().await.expect("open_chart");
    opened
        .handle
        .set_market("BINANCE:BTCUSDT", "1")
        .await
        .expect("set_market");

    assert!(client.push_update("BINANCE:BTCUSDT", "1", period(1_000, 42.0)));

    let event = opened.events.recv().await.expect("event");
    match event {
        ChartEvent::Update(p) => assert_eq!(p.close, 42.0),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn delete_stops_further_delivery() {
    let client = FakeUpstreamClient::new();
    client.connect().await.expect("connect");
    let opened = client.open_chart().await.expect("open_chart");
    opened
        .handle
        .set_market("BINANCE:ETHUSDT", "5")
        .await
        .expect("set_market");
    opened.handle.delete().await.expect("delete");

    assert!(!client.push_update("BINANCE:ETHUSDT", "5", period(1, 1.0)));
    assert_eq!(client.delete_count(), 1);
}

#[tokio::test]
async fn connect_failure_surfaces_once() {
    let client = FakeUpstreamClient::new();
    client.fail_next_connect();
    assert!(client.connect().await.is_err());
    assert!(client.connect().await.is_ok());
    assert!(client.is_connected());
}
