//! Soft-stop semantics: a populated fabric refuses the graceful stop and
//! reports its peers; the forced stop clears everything.

use logrelay::broker::{BrokerConfig, LogServer};
use logrelay::protocol::LogLevel;
use logrelay::LogClient;
use std::time::Duration;
use tokio::time::sleep;

#[tokio::test]
async fn soft_stop_is_refused_with_live_peers_then_forced() {
    let mut server = LogServer::new(BrokerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
    });
    server.start().await.expect("server start");
    let port = server.local_addr().unwrap().port();

    // A client with unacked sends pending and no lander to drain them.
    let mut client = LogClient::new();
    client.connect("127.0.0.1", port).await.expect("client connect");
    let _handles: Vec<_> = (0..100)
        .map(|i| client.tolog_with_ack(format!("pending-{i}"), LogLevel::Warning))
        .collect();

    // Let the frames reach the server's routing queue.
    sleep(Duration::from_secs(1)).await;

    assert!(!server.stop(true).await, "soft stop must be refused");
    let report = server.status();
    assert_eq!(report.clients.len(), 1);

    assert!(server.stop(false).await, "forced stop must succeed");
    let report = server.status();
    assert!(report.clients.is_empty());
    assert!(report.landers.is_empty());
}

#[tokio::test]
async fn soft_stop_succeeds_once_peers_left() {
    let mut server = LogServer::new(BrokerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
    });
    server.start().await.expect("server start");
    let port = server.local_addr().unwrap().port();

    let mut client = LogClient::new();
    client.connect("127.0.0.1", port).await.expect("client connect");
    client.tolog("just passing through", LogLevel::Info);
    client.disconnect().await;

    assert!(server.stop(true).await);
}
