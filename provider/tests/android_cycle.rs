//! Full add/remove cycle against a scripted debug-bridge daemon.

mod test_utils;

use std::sync::Arc;

use provider::{
    adb::AdbClient,
    heartbeat::DeviceUpdate,
    mock::{MockFactory, MockLog},
    registry::{android_tracker, Registry, TrackerContext},
    Platform,
};
use test_utils::{wait_for, CollectorSink};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};

fn frame(payload: &str) -> Vec<u8> {
    format!("{:04x}{}", payload.len(), payload).into_bytes()
}

#[tokio::test]
async fn add_and_remove_drive_supervisor_and_heartbeat() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // The daemon publishes one device, then an empty table, then idles.
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 256];
        let _ = sock.read(&mut buf).await.unwrap();

        sock.write_all(b"OKAY").await.unwrap();
        sock.write_all(&frame("AAA\tdevice\n")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        sock.write_all(&frame("")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
    });

    let registry = Arc::new(Registry::new());
    let sink = Arc::new(CollectorSink::default());
    let log = Arc::new(MockLog::default());
    let ctx = TrackerContext {
        registry: registry.clone(),
        updates: sink.clone(),
        factory: Arc::new(MockFactory {
            platform: Platform::Android,
            log: log.clone(),
            ports: vec![28001, 28002],
        }),
    };

    let tracker = tokio::spawn(android_tracker(AdbClient::new(addr), ctx));

    wait_for(|| sink.updates().len() >= 2).await;
    let updates = sink.updates();
    assert_eq!(updates.len(), 2);
    match &updates[0] {
        DeviceUpdate::Init { serial, endpoints, .. } => {
            assert_eq!(serial, "AAA");
            assert!(endpoints.agent_url.is_some());
        }
        other => panic!("expected init first, got {other:?}"),
    }
    assert_eq!(updates[1], DeviceUpdate::Delete { serial: "AAA".into() });

    // The record is gone and the device was torn down (ports released,
    // helpers reaped).
    wait_for(|| registry.is_empty()).await;
    let calls = log.calls();
    assert!(calls.contains(&"create AAA".to_string()));
    assert!(calls.contains(&"prepare AAA".to_string()));
    assert!(calls.contains(&"teardown AAA".to_string()));

    tracker.abort();
}
