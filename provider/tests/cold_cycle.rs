//! Remote cold command: the device restarts through its supervisor and
//! re-announces exactly once; bogus serials never reach a supervisor.

mod test_utils;

use std::sync::Arc;

use provider::{
    adb::DeviceEvent,
    heartbeat::DeviceUpdate,
    mock::{MockFactory, MockLog},
    registry::{handle_android_event, handle_ios_event, Registry, TrackerContext},
    Platform,
};
use test_utils::{wait_for, CollectorSink};

fn context(platform: Platform, log: &Arc<MockLog>) -> (Arc<Registry>, Arc<CollectorSink>, TrackerContext) {
    let registry = Arc::new(Registry::new());
    let sink = Arc::new(CollectorSink::default());
    let ctx = TrackerContext {
        registry: registry.clone(),
        updates: sink.clone(),
        factory: Arc::new(MockFactory {
            platform,
            log: log.clone(),
            ports: vec![28010],
        }),
    };
    (registry, sink, ctx)
}

fn attach(serial: &str) -> DeviceEvent {
    DeviceEvent {
        present: true,
        serial: serial.to_string(),
        status: Some("device".to_string()),
    }
}

#[tokio::test]
async fn cold_restarts_and_reannounces_once() {
    let log = Arc::new(MockLog::default());
    let (registry, sink, ctx) = context(Platform::Android, &log);

    handle_android_event(&ctx, attach("AAA"));
    wait_for(|| sink.updates().len() == 1).await;

    assert!(registry.cold("AAA"));

    // Ready -> Terminating -> Initializing -> Ready, one re-emitted init.
    wait_for(|| sink.updates().len() == 2).await;
    let updates = sink.updates();
    assert!(matches!(&updates[0], DeviceUpdate::Init { serial, .. } if serial == "AAA"));
    assert!(matches!(&updates[1], DeviceUpdate::Init { serial, .. } if serial == "AAA"));

    let calls = log.calls();
    let cold_at = calls.iter().position(|c| c == "cold AAA").unwrap();
    assert_eq!(calls[cold_at + 1], "teardown AAA");
    assert_eq!(calls[cold_at + 2], "prepare AAA");

    // Removal still works after the cold cycle.
    registry.stop("AAA");
    wait_for(|| sink.updates().len() == 3).await;
    assert_eq!(
        sink.updates()[2],
        DeviceUpdate::Delete { serial: "AAA".into() }
    );
    wait_for(|| registry.is_empty()).await;
}

#[tokio::test]
async fn cold_for_unknown_serial_is_rejected() {
    let log = Arc::new(MockLog::default());
    let (_registry, _sink, ctx) = context(Platform::Android, &log);
    assert!(!ctx.registry.cold("missing"));
}

#[tokio::test]
async fn bogus_ios_serials_never_spawn_supervisors() {
    let log = Arc::new(MockLog::default());
    let (registry, sink, ctx) = context(Platform::Ios, &log);

    handle_ios_event(
        &ctx,
        DeviceEvent {
            present: true,
            serial: "ffffffffffffffffff12".to_string(),
            status: None,
        },
    );

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(registry.is_empty());
    assert!(sink.updates().is_empty());
    assert!(log.calls().is_empty());
}
