//! Per-device lifecycle supervision.
//!
//! One task per live device drives it through
//! `Initializing -> Ready <-> Degraded -> Terminating -> Dead`, keeps the
//! helpers alive with health probes, and owns exclusive write access to the
//! device's registry record.

use std::{
    sync::{Arc, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    heartbeat::{DeviceUpdate, UpdateSink},
    registry::{DeviceRecord, Endpoints, Entry, Phase, Registry},
    Platform, Result,
};

pub mod android;
pub mod ios;

pub const HEALTHY_PROBE_INTERVAL: Duration = Duration::from_secs(60);
pub const DEGRADED_PROBE_INTERVAL: Duration = Duration::from_secs(10);
const RECOVERY_ATTEMPTS: u32 = 3;
const RECOVERY_WINDOW: Duration = Duration::from_secs(30);

/// External commands accepted through a supervisor's mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorCommand {
    /// Upstream-initiated reset between test sessions.
    Cold,
}

/// Result of a completed preparation pipeline.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub endpoints: Endpoints,
    pub properties: serde_json::Value,
    pub ports: Vec<u16>,
}

/// Outcome of one health probe.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProbeReport {
    pub healthy: bool,
    /// The externally visible address set changed; clients must re-dial.
    pub readdressed: bool,
}

/// What happened to an in-place cold request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColdOutcome {
    /// Handled without tearing the device down; endpoints may have moved.
    Handled,
    /// The device wants a full teardown and re-preparation.
    Restart,
}

/// A platform-specific device driven by the supervisor state machine.
#[async_trait]
pub trait ManagedDevice: Send {
    fn serial(&self) -> &str;
    fn platform(&self) -> Platform;

    /// Runs the preparation pipeline to completion. The supervisor runs the
    /// first health probe afterwards and only then declares the device ready.
    async fn prepare(&mut self) -> Result<Prepared>;

    /// One health probe; failures fold into `healthy == false`.
    async fn probe(&mut self) -> ProbeReport;

    /// In-place recovery of a failing helper while degraded.
    async fn recover(&mut self) -> Result<()>;

    /// Reacts to a cold command.
    async fn cold(&mut self) -> Result<ColdOutcome>;

    /// Terminates every helper in reverse start order and releases ports.
    async fn teardown(&mut self);

    /// Teardown performed for a cold restart; platforms may add steps between
    /// helper teardown and re-preparation.
    async fn reset(&mut self) {
        self.teardown().await;
    }

    /// Current endpoints, used when re-announcing after recovery or cold.
    fn endpoints(&self) -> Endpoints;
    fn properties(&self) -> serde_json::Value;
}

/// Creates platform devices for the tracker; swapped out in tests.
pub trait DeviceFactory: Send + Sync {
    fn create(&self, serial: &str) -> Box<dyn ManagedDevice>;
}

/// Registers a record for the device and starts its supervisor task.
pub fn spawn(
    device: Box<dyn ManagedDevice>,
    registry: &Arc<Registry>,
    updates: Arc<dyn UpdateSink>,
) {
    let serial = device.serial().to_string();
    let record = Arc::new(RwLock::new(DeviceRecord::new(
        serial.clone(),
        device.platform(),
    )));
    let (mailbox, commands) = mpsc::channel(4);
    let cancel = CancellationToken::new();

    registry.insert(
        serial.clone(),
        Entry {
            record: record.clone(),
            mailbox,
            cancel: cancel.clone(),
            task: std::sync::Mutex::new(None),
        },
    );

    let task = tokio::spawn(run(
        device,
        record,
        registry.clone(),
        updates,
        commands,
        cancel,
    ));
    registry.set_task(&serial, task);
}

fn set_phase(record: &RwLock<DeviceRecord>, phase: Phase) {
    record.write().unwrap().phase = phase;
}

fn announce(updates: &dyn UpdateSink, serial: &str, device: &dyn ManagedDevice) {
    updates.enqueue(DeviceUpdate::Init {
        serial: serial.to_string(),
        endpoints: device.endpoints(),
        properties: device.properties(),
    });
}

async fn run(
    mut device: Box<dyn ManagedDevice>,
    record: Arc<RwLock<DeviceRecord>>,
    registry: Arc<Registry>,
    updates: Arc<dyn UpdateSink>,
    mut commands: mpsc::Receiver<SupervisorCommand>,
    cancel: CancellationToken,
) {
    let serial = device.serial().to_string();

    'lifecycle: loop {
        set_phase(&record, Phase::Initializing);
        log::info!("[{}] initializing", serial);

        let prepared = tokio::select! {
            _ = cancel.cancelled() => break 'lifecycle,
            result = device.prepare() => result,
        };
        let prepared = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                // Preparation failures drop the device; the next attach
                // event retries from scratch.
                log::warn!("[{}] init failed: {}", serial, e);
                break 'lifecycle;
            }
        };

        // Readiness requires the first full health probe to pass, not just
        // the preparation steps.
        let first_probe = tokio::select! {
            _ = cancel.cancelled() => break 'lifecycle,
            report = device.probe() => report,
        };
        if !first_probe.healthy {
            log::warn!("[{}] init failed: first health probe unhealthy", serial);
            break 'lifecycle;
        }

        {
            let mut rec = record.write().unwrap();
            rec.endpoints = prepared.endpoints.clone();
            rec.properties = prepared.properties.clone();
            rec.allocated_ports = prepared.ports.clone();
            rec.phase = Phase::Ready;
        }
        announce(updates.as_ref(), &serial, device.as_ref());
        log::info!("[{}] ready", serial);

        let mut phase = Phase::Ready;
        let mut attempts: u32 = 0;
        let mut window_start = Instant::now();

        loop {
            let interval = match phase {
                Phase::Ready => HEALTHY_PROBE_INTERVAL,
                _ => DEGRADED_PROBE_INTERVAL,
            };

            tokio::select! {
                _ = cancel.cancelled() => break 'lifecycle,

                command = commands.recv() => match command {
                    Some(SupervisorCommand::Cold) => {
                        log::info!("[{}] cold requested", serial);
                        match device.cold().await {
                            Ok(ColdOutcome::Handled) => {
                                record.write().unwrap().endpoints = device.endpoints();
                                announce(updates.as_ref(), &serial, device.as_ref());
                            }
                            Ok(ColdOutcome::Restart) | Err(_) => {
                                set_phase(&record, Phase::Terminating);
                                device.reset().await;
                                record.write().unwrap().allocated_ports.clear();
                                continue 'lifecycle;
                            }
                        }
                    }
                    None => break 'lifecycle,
                },

                _ = tokio::time::sleep(interval) => {
                    let report = device.probe().await;
                    match (phase, report.healthy) {
                        (Phase::Ready, true) => {
                            if report.readdressed {
                                record.write().unwrap().endpoints = device.endpoints();
                                announce(updates.as_ref(), &serial, device.as_ref());
                            }
                        }
                        (Phase::Ready, false) => {
                            log::warn!("[{}] probe failed, degraded", serial);
                            phase = Phase::Degraded;
                            set_phase(&record, phase);
                            attempts = 0;
                            window_start = Instant::now();
                        }
                        (_, true) => {
                            log::info!("[{}] probe recovered", serial);
                            let was_degraded_endpoints = record.read().unwrap().endpoints.clone();
                            phase = Phase::Ready;
                            set_phase(&record, phase);
                            let endpoints = device.endpoints();
                            if report.readdressed || endpoints != was_degraded_endpoints {
                                record.write().unwrap().endpoints = endpoints;
                                announce(updates.as_ref(), &serial, device.as_ref());
                            }
                        }
                        (_, false) => {
                            if window_start.elapsed() > RECOVERY_WINDOW {
                                attempts = 0;
                                window_start = Instant::now();
                            }
                            attempts += 1;
                            if attempts > RECOVERY_ATTEMPTS {
                                log::error!("[{}] recovery retries exhausted", serial);
                                break 'lifecycle;
                            }
                            log::warn!("[{}] recovery attempt {}", serial, attempts);
                            if let Err(e) = device.recover().await {
                                log::warn!("[{}] recovery failed: {}", serial, e);
                            }
                        }
                    }
                }
            }
        }
    }

    set_phase(&record, Phase::Terminating);
    log::info!("[{}] terminating", serial);
    device.teardown().await;
    {
        let mut rec = record.write().unwrap();
        rec.allocated_ports.clear();
        rec.phase = Phase::Dead;
    }
    registry.remove(&serial);
    updates.enqueue(DeviceUpdate::Delete { serial: serial.clone() });
    log::info!("[{}] dead", serial);
}
