//! The one-frame handshake, exercised over raw sockets so the bytes on
//! the wire are exactly what the protocol tables promise.

use logrelay::broker::{BrokerConfig, LogServer};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::sleep;

async fn started_server() -> LogServer {
    let mut server = LogServer::new(BrokerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
    });
    server.start().await.expect("server start");
    server
}

#[tokio::test]
async fn one_frame_handshake_classifies_both_peer_kinds() {
    let mut server = started_server().await;
    let addr = server.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_u16(2560).await.unwrap(); // authorize_info
    assert_eq!(client.read_u16().await.unwrap(), 9766); // authorize_ret

    let mut lander = TcpStream::connect(addr).await.unwrap();
    lander.write_u16(1101).await.unwrap(); // handshake_info
    assert_eq!(lander.read_u16().await.unwrap(), 8455); // handshake_ret

    // Classification is asynchronous; poll the registries briefly.
    let started = std::time::Instant::now();
    loop {
        let report = server.status();
        if report.clients.len() == 1 && report.landers.len() == 1 {
            break;
        }
        if started.elapsed() > Duration::from_secs(5) {
            panic!("peers never appeared in the status report: {report:?}");
        }
        sleep(Duration::from_millis(50)).await;
    }

    assert!(!server.stop(true).await, "peers are still attached");
    assert!(server.stop(false).await);
}

#[tokio::test]
async fn close_head_is_confirmed_with_close_ret() {
    let mut server = started_server().await;
    let addr = server.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_u16(2560).await.unwrap();
    assert_eq!(client.read_u16().await.unwrap(), 9766);

    client.write_u16(2561).await.unwrap(); // close_head
    // The server lets in-flight replies drain before confirming.
    assert_eq!(client.read_u16().await.unwrap(), 9767); // close_ret

    assert!(server.stop(true).await, "no peers should remain");
}
