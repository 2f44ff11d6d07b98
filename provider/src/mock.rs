//! Mock managed device used to exercise the supervisor, registry and
//! heartbeat without real hardware.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::{
    registry::Endpoints,
    supervisor::{ColdOutcome, DeviceFactory, ManagedDevice, Prepared, ProbeReport},
    Platform, Result,
};

/// Shared view of everything mock devices did, for assertions.
#[derive(Debug, Default)]
pub struct MockLog {
    pub calls: Mutex<Vec<String>>,
}

impl MockLog {
    pub fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

pub struct MockFactory {
    pub platform: Platform,
    pub log: Arc<MockLog>,
    /// Ports every created device pretends to hold.
    pub ports: Vec<u16>,
}

impl DeviceFactory for MockFactory {
    fn create(&self, serial: &str) -> Box<dyn ManagedDevice> {
        self.log.record(format!("create {serial}"));
        Box::new(MockDevice {
            serial: serial.to_string(),
            platform: self.platform,
            log: self.log.clone(),
            ports: self.ports.clone(),
            endpoints: Endpoints {
                agent_url: Some(format!("10.0.0.1:{}", self.ports.first().copied().unwrap_or(0))),
                ..Default::default()
            },
        })
    }
}

pub struct MockDevice {
    serial: String,
    platform: Platform,
    log: Arc<MockLog>,
    ports: Vec<u16>,
    endpoints: Endpoints,
}

#[async_trait]
impl ManagedDevice for MockDevice {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn platform(&self) -> Platform {
        self.platform
    }

    async fn prepare(&mut self) -> Result<Prepared> {
        self.log.record(format!("prepare {}", self.serial));
        Ok(Prepared {
            endpoints: self.endpoints.clone(),
            properties: serde_json::json!({"system": "mock"}),
            ports: self.ports.clone(),
        })
    }

    async fn probe(&mut self) -> ProbeReport {
        self.log.record(format!("probe {}", self.serial));
        ProbeReport { healthy: true, readdressed: false }
    }

    async fn recover(&mut self) -> Result<()> {
        self.log.record(format!("recover {}", self.serial));
        Ok(())
    }

    async fn cold(&mut self) -> Result<ColdOutcome> {
        self.log.record(format!("cold {}", self.serial));
        Ok(ColdOutcome::Restart)
    }

    async fn teardown(&mut self) {
        self.log.record(format!("teardown {}", self.serial));
        self.ports.clear();
    }

    fn endpoints(&self) -> Endpoints {
        self.endpoints.clone()
    }

    fn properties(&self) -> serde_json::Value {
        serde_json::json!({"system": "mock"})
    }
}
