use std::{sync::Mutex, time::Duration};

use provider::heartbeat::{DeviceUpdate, UpdateSink};

/// Captures heartbeat traffic instead of sending it upstream.
#[derive(Default)]
pub struct CollectorSink {
    updates: Mutex<Vec<DeviceUpdate>>,
}

impl CollectorSink {
    pub fn updates(&self) -> Vec<DeviceUpdate> {
        self.updates.lock().unwrap().clone()
    }
}

impl UpdateSink for CollectorSink {
    fn enqueue(&self, update: DeviceUpdate) {
        self.updates.lock().unwrap().push(update);
    }
}

/// Polls `check` until it passes or five seconds elapse.
pub async fn wait_for(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached within deadline");
}
