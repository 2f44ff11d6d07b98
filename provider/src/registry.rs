//! Authoritative map of live devices.
//!
//! The registry is owned by the tracker task and handed by reference to the
//! HTTP surface and the heartbeat link; supervisors are the only writers of
//! their own records.

use std::{
    collections::HashMap,
    net::SocketAddrV4,
    sync::{Arc, Mutex, RwLock},
};

use serde::Serialize;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    adb::{AdbClient, DeviceEvent},
    heartbeat::UpdateSink,
    supervisor::{self, DeviceFactory, SupervisorCommand},
    usbmux::UsbmuxClient,
    Platform, Result,
};

/// Lifecycle phase of a device record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Initializing,
    Ready,
    Degraded,
    Terminating,
    Dead,
}

/// Host-visible `host:port` endpoints advertised for one device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Endpoints {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screen_stream_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub automation_url: Option<String>,
}

/// Per-device state. Mutated only by the owning supervisor task.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceRecord {
    pub serial: String,
    pub platform: Platform,
    pub phase: Phase,
    pub endpoints: Endpoints,
    pub properties: serde_json::Value,
    pub allocated_ports: Vec<u16>,
}

impl DeviceRecord {
    pub fn new(serial: String, platform: Platform) -> Self {
        Self {
            serial,
            platform,
            phase: Phase::Initializing,
            endpoints: Endpoints::default(),
            properties: serde_json::Value::Null,
            allocated_ports: Vec::new(),
        }
    }
}

pub(crate) struct Entry {
    pub record: Arc<RwLock<DeviceRecord>>,
    pub mailbox: mpsc::Sender<SupervisorCommand>,
    pub cancel: CancellationToken,
    pub task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
pub struct Registry {
    inner: RwLock<HashMap<String, Entry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, serial: &str) -> bool {
        self.inner.read().unwrap().contains_key(serial)
    }

    pub fn get(&self, serial: &str) -> Option<Arc<RwLock<DeviceRecord>>> {
        self.inner
            .read()
            .unwrap()
            .get(serial)
            .map(|e| e.record.clone())
    }

    pub fn snapshot(&self) -> Vec<Arc<RwLock<DeviceRecord>>> {
        self.inner
            .read()
            .unwrap()
            .values()
            .map(|e| e.record.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Routes a cold command to the owning supervisor. Returns whether a
    /// supervisor accepted it.
    pub fn cold(&self, serial: &str) -> bool {
        match self.inner.read().unwrap().get(serial) {
            Some(entry) => entry.mailbox.try_send(SupervisorCommand::Cold).is_ok(),
            None => false,
        }
    }

    /// Requests termination of one device's supervisor (removal event).
    pub fn stop(&self, serial: &str) {
        if let Some(entry) = self.inner.read().unwrap().get(serial) {
            entry.cancel.cancel();
        }
    }

    /// Cancels every supervisor and returns their join handles so the caller
    /// can await a clean teardown.
    pub fn shutdown(&self) -> Vec<JoinHandle<()>> {
        let inner = self.inner.read().unwrap();
        let mut handles = Vec::with_capacity(inner.len());
        for entry in inner.values() {
            entry.cancel.cancel();
            if let Some(task) = entry.task.lock().unwrap().take() {
                handles.push(task);
            }
        }
        handles
    }

    pub(crate) fn insert(&self, serial: String, entry: Entry) {
        self.inner.write().unwrap().insert(serial, entry);
    }

    pub(crate) fn set_task(&self, serial: &str, task: JoinHandle<()>) {
        if let Some(entry) = self.inner.read().unwrap().get(serial) {
            entry.task.lock().unwrap().replace(task);
        }
    }

    pub(crate) fn remove(&self, serial: &str) {
        self.inner.write().unwrap().remove(serial);
    }
}

/// Serials like `N.N.N.N:port` belong to remote (TCP) devices and are not
/// supervised by this host.
pub fn is_remote_android_serial(serial: &str) -> bool {
    serial.parse::<SocketAddrV4>().is_ok()
}

/// Known-bogus USB-mux entries surface as serials with eighteen leading `f`s.
pub fn is_bogus_ios_serial(serial: &str) -> bool {
    serial.starts_with("ffffffffffffffffff")
}

/// Everything a tracker needs to turn events into supervised devices.
pub struct TrackerContext {
    pub registry: Arc<Registry>,
    pub updates: Arc<dyn UpdateSink>,
    pub factory: Arc<dyn DeviceFactory>,
}

impl TrackerContext {
    pub fn handle_event(&self, event: DeviceEvent) {
        if event.present {
            if self.registry.contains(&event.serial) {
                return;
            }
            let device = self.factory.create(&event.serial);
            supervisor::spawn(device, &self.registry, self.updates.clone());
        } else {
            self.registry.stop(&event.serial);
        }
    }
}

/// One Android tracker event, with the remote-serial filter applied.
pub fn handle_android_event(ctx: &TrackerContext, event: DeviceEvent) {
    if is_remote_android_serial(&event.serial) {
        log::debug!("skip remote device: {}", event.serial);
        return;
    }
    log::debug!("android event: {:?}", event);
    ctx.handle_event(event);
}

/// One iOS tracker event, with the bogus-serial filter applied.
pub fn handle_ios_event(ctx: &TrackerContext, event: DeviceEvent) {
    if is_bogus_ios_serial(&event.serial) {
        log::debug!("skip bogus serial: {}", event.serial);
        return;
    }
    log::debug!("apple event: {:?}", event);
    ctx.handle_event(event);
}

/// Follows the adb device table forever, creating and destroying supervisors.
pub async fn android_tracker(adb: AdbClient, ctx: TrackerContext) -> Result<()> {
    adb.track_devices(&["device"], |event| handle_android_event(&ctx, event))
        .await
}

/// Follows the USB-mux device set forever.
pub async fn ios_tracker(mux: UsbmuxClient, ctx: TrackerContext) -> Result<()> {
    mux.track_devices(|event| handle_ios_event(&ctx, event)).await
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn remote_serials_are_filtered() {
        assert!(is_remote_android_serial("192.168.1.30:5555"));
        assert!(!is_remote_android_serial("emulator-5554"));
        assert!(!is_remote_android_serial("0123456789ABCDEF"));
    }

    #[test]
    fn bogus_ios_serials_are_filtered() {
        assert!(is_bogus_ios_serial("ffffffffffffffffff12"));
        assert!(!is_bogus_ios_serial("fffffffffffffffff1")); // only 17 f's
        assert!(!is_bogus_ios_serial("00008110-001234567890"));
    }

    #[test]
    fn endpoints_skip_unset_fields() {
        let endpoints = Endpoints {
            agent_url: Some("10.0.0.2:20001".into()),
            ..Default::default()
        };
        let value = serde_json::to_value(&endpoints).unwrap();
        assert_eq!(value["agent_url"], "10.0.0.2:20001");
        assert!(value.get("automation_url").is_none());
    }
}
