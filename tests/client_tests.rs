//! Construction and configuration tests for the client facade.

use std::time::Duration;

use fdfs::{Client, ClientConfig, ClientError, Endpoint};

#[tokio::test]
async fn client_requires_at_least_one_tracker() {
    let err = Client::new(ClientConfig::new(Vec::new())).unwrap_err();
    assert!(matches!(err, ClientError::Config(_)));
}

#[tokio::test]
async fn client_rejects_unparseable_tracker_addresses() {
    assert!(ClientConfig::from_tracker_addrs(["not-an-address"]).is_err());
    assert!(ClientConfig::from_tracker_addrs(["host:99999"]).is_err());
}

#[tokio::test]
async fn builder_setters_take_effect() {
    let config = ClientConfig::new(vec![Endpoint::new("10.0.0.1", 22122)])
        .with_connect_timeout(Duration::from_secs(2))
        .with_read_timeout(Duration::from_secs(10))
        .with_acquire_timeout(Duration::from_millis(250))
        .with_max_total_per_pool(4)
        .with_max_idle_per_pool(2)
        .with_reconnect(5, Duration::from_millis(100))
        .with_tcp_nodelay(false)
        .with_write_watermarks(8 * 1024, 32 * 1024);

    assert_eq!(config.connect_timeout, Duration::from_secs(2));
    assert_eq!(config.read_timeout, Duration::from_secs(10));
    assert_eq!(config.acquire_timeout, Duration::from_millis(250));
    assert_eq!(config.max_total_per_pool, 4);
    assert_eq!(config.max_idle_per_pool, 2);
    assert!(config.enable_reconnect);
    assert_eq!(config.max_reconnect, 5);
    assert!(!config.tcp_nodelay);
    assert_eq!(config.write_low_water, 8 * 1024);
    assert_eq!(config.write_high_water, 32 * 1024);
    assert!(config.validate().is_ok());

    let client = Client::new(config).unwrap();
    client.close().await;
}

#[tokio::test]
async fn close_is_idempotent() {
    let config = ClientConfig::new(vec![Endpoint::new("10.0.0.1", 22122)]);
    let client = Client::new(config).unwrap();
    client.close().await;
    client.close().await;
    assert!(matches!(
        client.query_storage(None).await.unwrap_err(),
        ClientError::Closed
    ));
}

#[tokio::test]
async fn operations_against_unreachable_trackers_fail_with_connect_error() {
    // Nothing listens on port 1; with reconnect disabled this fails fast.
    let config = ClientConfig::from_tracker_addrs(["127.0.0.1:1"]).unwrap();
    let client = Client::new(config).unwrap();

    let err = client.list_groups().await.unwrap_err();
    assert!(matches!(err, ClientError::Connect { .. }));

    client.close().await;
}
