//! End-to-end tests over a full fabric: relay server, storage lander and
//! emitting clients on loopback, with the dated file checked on disk.

use logrelay::broker::{BrokerConfig, LogServer};
use logrelay::client::AckStatus;
use logrelay::lander::Lander;
use logrelay::protocol::LogLevel;
use logrelay::record::{current_date, dated_file_name, scan_records, DiskRecord};
use logrelay::LogClient;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::{sleep, timeout};

async fn start_fabric(dir: &Path) -> (LogServer, Lander, u16) {
    let mut server = LogServer::new(BrokerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
    });
    server.start().await.expect("server start");
    let port = server.local_addr().unwrap().port();

    let mut lander = Lander::new(dir);
    lander.connect("127.0.0.1", port).await.expect("lander connect");
    (server, lander, port)
}

fn dated_path(dir: &Path) -> PathBuf {
    dated_file_name(dir, &current_date())
}

/// Poll the dated file until it holds at least `expected` records.
async fn wait_for_records(path: &Path, expected: usize) -> Vec<DiskRecord> {
    let deadline = Duration::from_secs(30);
    let started = std::time::Instant::now();
    loop {
        let records = std::fs::read(path)
            .map(|bytes| scan_records(&bytes))
            .unwrap_or_default();
        if records.len() >= expected {
            return records;
        }
        if started.elapsed() > deadline {
            panic!(
                "only {} of {expected} records reached {path:?} in {deadline:?}",
                records.len()
            );
        }
        sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn acked_log_lands_on_disk_and_resolves() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, mut lander, port) = start_fabric(dir.path()).await;

    let mut client = LogClient::new();
    client.connect("127.0.0.1", port).await.expect("client connect");

    let handle = client.tolog_with_ack("hello", LogLevel::Info);
    let ack = timeout(Duration::from_secs(10), handle.wait())
        .await
        .expect("acknowledgement arrived");
    assert_eq!(ack.status, AckStatus::Success);

    let records = wait_for_records(&dated_path(dir.path()), 1).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].content, b"hello");
    assert_eq!(records[0].level, LogLevel::Info);

    client.disconnect().await;
    lander.disconnect().await;
    assert!(server.stop(true).await);
}

#[tokio::test]
async fn thousand_unacked_logs_arrive_in_submission_order() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, mut lander, port) = start_fabric(dir.path()).await;

    let mut client = LogClient::new();
    client.connect("127.0.0.1", port).await.expect("client connect");

    for i in 0..1000u32 {
        client.tolog(format!("entry-{i:04}"), LogLevel::Debug);
    }

    let records = wait_for_records(&dated_path(dir.path()), 1000).await;
    assert_eq!(records.len(), 1000);
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.content, format!("entry-{i:04}").as_bytes());
        assert_eq!(record.level, LogLevel::Debug);
    }

    client.disconnect().await;
    lander.disconnect().await;
    assert!(server.stop(true).await);
}

#[tokio::test]
async fn two_clients_get_their_own_acknowledgements() {
    let dir = tempfile::tempdir().unwrap();
    let (mut server, mut lander, port) = start_fabric(dir.path()).await;

    let per_client = 500usize;
    let mut tasks = Vec::new();
    for name in ["alpha", "beta"] {
        tasks.push(tokio::spawn(async move {
            let mut client = LogClient::new();
            client.connect("127.0.0.1", port).await.expect("client connect");
            let handles: Vec<_> = (0..per_client)
                .map(|i| client.tolog_with_ack(format!("{name}-{i:03}"), LogLevel::Info))
                .collect();
            let mut succeeded = 0usize;
            for handle in handles {
                let ack = timeout(Duration::from_secs(60), handle.wait())
                    .await
                    .expect("acknowledgement arrived");
                if ack.status == AckStatus::Success {
                    succeeded += 1;
                }
            }
            client.disconnect().await;
            succeeded
        }));
    }
    for task in tasks {
        // Each handle resolves exactly once; all of them as success.
        assert_eq!(task.await.unwrap(), per_client);
    }

    let records = wait_for_records(&dated_path(dir.path()), 2 * per_client).await;
    assert_eq!(records.len(), 2 * per_client);

    lander.disconnect().await;
    assert!(server.stop(true).await);
}
