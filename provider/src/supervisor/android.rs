//! Android preparation pipeline and health probing.
//!
//! Prep order matters: binaries are pushed before the agent is (re)started,
//! ports are forwarded before the pipe forwarders that re-expose them, and
//! the screen proxy starts last.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use hyper::client::HttpConnector;
use serde_json::json;
use tokio::sync::Mutex;

use crate::{
    adb::AdbClient,
    pipe::PortForwarder,
    ports::PortAllocator,
    registry::Endpoints,
    scrcpy::{ScreenProxy, ScrcpyOptions},
    supervisor::{ColdOutcome, DeviceFactory, ManagedDevice, Prepared, ProbeReport},
    vendor::{self, ApkArtifact},
    Platform, ProviderError, Result,
};

const AGENT_PATH: &str = "/data/local/tmp/atx-agent";
const SCRCPY_PATH: &str = "/data/local/tmp/scrcpy-server";
const AGENT_PORT: u16 = 7912;
const INPUT_PORT: u16 = 6677;

const AGENT_READY_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// ABI family to prebuilt agent binary.
fn pick_arch(abis: &[String]) -> Option<&'static str> {
    abis.iter().find_map(|abi| match abi.as_str() {
        "armeabi-v7a" | "arm64-v8a" => Some("armv7"),
        "armeabi" => Some("armv6"),
        "x86" => Some("386"),
        _ => None,
    })
}

/// First token following `key` in a shell dump, e.g. `versionCode=7 targetSdk=28`.
fn dumpsys_value<'a>(output: &'a str, key: &str) -> Option<&'a str> {
    let start = output.find(key)? + key.len();
    let rest = &output[start..];
    let end = rest
        .find(|c: char| c.is_whitespace())
        .unwrap_or(rest.len());
    Some(&rest[..end])
}

/// `Physical size: 1080x1920` -> `1080x1920`.
fn parse_wm_size(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.rsplit_once(": ").map(|(_, size)| size.trim().to_string()))
}

pub struct AndroidFactory {
    pub adb: AdbClient,
    pub allocator: Arc<Mutex<PortAllocator>>,
    pub host: String,
    pub options: ScrcpyOptions,
}

impl DeviceFactory for AndroidFactory {
    fn create(&self, serial: &str) -> Box<dyn ManagedDevice> {
        Box::new(AndroidDevice::new(
            serial.to_string(),
            self.adb.clone(),
            self.allocator.clone(),
            self.host.clone(),
            self.options,
        ))
    }
}

pub struct AndroidDevice {
    serial: String,
    adb: AdbClient,
    allocator: Arc<Mutex<PortAllocator>>,
    host: String,
    options: ScrcpyOptions,
    http: hyper::Client<HttpConnector>,

    endpoints: Endpoints,
    properties: serde_json::Value,
    ports: Vec<u16>,
    forwarders: Vec<PortForwarder>,
    screen: Option<ScreenProxy>,
    agent_running: bool,
    agent_probe_port: u16,
}

impl AndroidDevice {
    pub fn new(
        serial: String,
        adb: AdbClient,
        allocator: Arc<Mutex<PortAllocator>>,
        host: String,
        options: ScrcpyOptions,
    ) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(CONNECT_TIMEOUT));
        let http = hyper::Client::builder().build(connector);
        Self {
            serial,
            adb,
            allocator,
            host,
            options,
            http,
            endpoints: Endpoints::default(),
            properties: serde_json::Value::Null,
            ports: Vec::new(),
            forwarders: Vec::new(),
            screen: None,
            agent_running: false,
            agent_probe_port: 0,
        }
    }

    async fn allocate(&mut self) -> Result<u16> {
        let port = self.allocator.lock().await.get()?;
        self.ports.push(port);
        Ok(port)
    }

    async fn getprop(&self, name: &str) -> Result<String> {
        let value = self.adb.shell(&self.serial, &format!("getprop {name}")).await?;
        Ok(value.trim().to_string())
    }

    async fn abilist(&self) -> Result<Vec<String>> {
        let mut list = self.getprop("ro.product.cpu.abilist").await?;
        if list.is_empty() {
            list = self.getprop("ro.product.cpu.abi").await?;
        }
        Ok(list.split(',').map(|s| s.trim().to_string()).collect())
    }

    async fn push_binaries(&mut self, arch: &'static str) -> Result<()> {
        let agent = tokio::fs::read(vendor::agent_binary(arch).await?).await?;
        let server = tokio::fs::read(vendor::scrcpy_server().await?).await?;

        let mut sync = self.adb.sync(&self.serial).await?;
        if sync.push_if_different(AGENT_PATH, 0o755, &agent).await? {
            log::debug!("[{}] pushed agent ({} bytes)", self.serial, agent.len());
        }
        if sync.push_if_different(SCRCPY_PATH, 0o755, &server).await? {
            log::debug!("[{}] pushed capture server ({} bytes)", self.serial, server.len());
        }
        let _ = sync.quit().await;
        Ok(())
    }

    async fn apk_up_to_date(&self, artifact: &ApkArtifact) -> Result<bool> {
        let output = self
            .adb
            .shell(&self.serial, &format!("dumpsys package {}", artifact.package))
            .await?;
        let code = dumpsys_value(&output, "versionCode=");
        let name = dumpsys_value(&output, "versionName=");
        Ok(match (code, name) {
            (Some(code), Some(name)) => {
                code == artifact.version_code.to_string()
                    && (name == artifact.version_name || name == "null")
            }
            _ => false,
        })
    }

    async fn install_apks(&mut self) -> Result<()> {
        for (artifact, path) in vendor::helper_apks().await? {
            if self.apk_up_to_date(artifact).await? {
                log::debug!("[{}] already installed {}", self.serial, artifact.package);
                continue;
            }

            let bytes = tokio::fs::read(&path).await?;
            let millis = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or(0);
            let dest = format!("/data/local/tmp/tmp-{millis}.apk");

            let mut sync = self.adb.sync(&self.serial).await?;
            sync.push(&dest, 0o644, &bytes).await?;
            let _ = sync.quit().await;

            log::debug!("[{}] installing {}", self.serial, artifact.package);
            let output = self
                .adb
                .shell(&self.serial, &format!("pm install -r -t {dest}"))
                .await?;
            let _ = self.adb.shell(&self.serial, &format!("rm -f {dest}")).await;
            if !output.contains("Success") {
                return Err(ProviderError::InstallRejected(format!(
                    "{}: {}",
                    artifact.package,
                    output.trim()
                )));
            }
        }
        Ok(())
    }

    async fn restart_agent(&mut self) -> Result<()> {
        let _ = self
            .adb
            .shell(&self.serial, "/data/local/tmp/atx-agent server --stop")
            .await;
        self.adb
            .shell(
                &self.serial,
                "cd /data/local/tmp && ./atx-agent server --nouia -d",
            )
            .await?;
        self.agent_running = true;
        Ok(())
    }

    /// Reverse-proxies a device port onto a stable bind-any host port.
    ///
    /// ADB forwards to loopback only, so a user-space pipe forwarder provides
    /// the advertised address. Existing forward rules are reused before new
    /// local ports are allocated.
    async fn proxy_device_port(&mut self, device_port: u16) -> Result<(u16, u16)> {
        let remote = format!("tcp:{device_port}");

        let mut local_port = None;
        for rule in self.adb.forward_list().await? {
            if rule.serial == self.serial && rule.remote == remote {
                if let Some(port) = rule.local.strip_prefix("tcp:").and_then(|p| p.parse().ok()) {
                    local_port = Some(port);
                    break;
                }
            }
        }
        let local_port = match local_port {
            Some(port) => port,
            None => {
                let port = self.allocate().await?;
                self.adb
                    .forward(&self.serial, &format!("tcp:{port}"), &remote, false)
                    .await?;
                port
            }
        };

        let listen_port = self.allocate().await?;
        log::debug!(
            "[{}] proxy *:{} -> 127.0.0.1:{} -> device:{}",
            self.serial, listen_port, local_port, device_port
        );
        self.forwarders
            .push(PortForwarder::spawn(listen_port, local_port).await?);
        Ok((listen_port, local_port))
    }

    async fn collect_properties(&self, version: &str) -> Result<serde_json::Value> {
        let brand = self.getprop("ro.product.brand").await?;
        let model = self.getprop("ro.product.model").await?;
        let size = self
            .adb
            .shell(&self.serial, "wm size")
            .await
            .ok()
            .and_then(|out| parse_wm_size(&out))
            .unwrap_or_else(|| "unknown".to_string());
        Ok(json!({
            "system": "android",
            "brand": brand,
            "version": version,
            "model": model,
            "name": model,
            "size": size,
        }))
    }

    async fn agent_http_ok(&self) -> bool {
        let uri = match format!("http://127.0.0.1:{}/", self.agent_probe_port).parse() {
            Ok(uri) => uri,
            Err(_) => return false,
        };
        matches!(
            tokio::time::timeout(REQUEST_TIMEOUT, self.http.get(uri)).await,
            Ok(Ok(resp)) if resp.status().is_success()
        )
    }

    async fn wait_agent_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.agent_http_ok().await {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Err(ProviderError::NotReady(timeout))
    }

    async fn open_identify(&self) -> Result<()> {
        self.adb
            .shell(
                &self.serial,
                "am start -n com.github.uiautomator/.IdentifyActivity -e theme black",
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ManagedDevice for AndroidDevice {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn platform(&self) -> Platform {
        Platform::Android
    }

    async fn prepare(&mut self) -> Result<Prepared> {
        let abis = self.abilist().await?;
        let arch = pick_arch(&abis).ok_or(ProviderError::NoCompatibleAbi(abis))?;
        let version = self.getprop("ro.build.version.release").await?;

        self.push_binaries(arch).await?;
        self.install_apks().await?;
        self.restart_agent().await?;

        let (agent_listen, agent_local) = self.proxy_device_port(AGENT_PORT).await?;
        self.agent_probe_port = agent_local;
        let (input_listen, _) = self.proxy_device_port(INPUT_PORT).await?;

        let screen_port = self.allocate().await?;
        self.screen = Some(
            ScreenProxy::start(
                screen_port,
                self.serial.clone(),
                self.adb.clone(),
                self.options,
            )
            .await?,
        );

        self.endpoints = Endpoints {
            agent_url: Some(format!("{}:{}", self.host, agent_listen)),
            screen_stream_url: Some(format!("{}:{}", self.host, screen_port)),
            input_url: Some(format!("{}:{}", self.host, input_listen)),
            automation_url: None,
        };
        self.properties = self.collect_properties(&version).await?;

        self.wait_agent_ready(AGENT_READY_TIMEOUT).await?;
        let _ = self.open_identify().await;

        Ok(Prepared {
            endpoints: self.endpoints.clone(),
            properties: self.properties.clone(),
            ports: self.ports.clone(),
        })
    }

    async fn probe(&mut self) -> ProbeReport {
        let shell_ok = matches!(
            tokio::time::timeout(
                REQUEST_TIMEOUT,
                self.adb.shell(&self.serial, "echo ok"),
            )
            .await,
            Ok(Ok(out)) if out.trim() == "ok"
        );
        let http_ok = self.agent_http_ok().await;
        ProbeReport {
            healthy: shell_ok && http_ok,
            readdressed: false,
        }
    }

    async fn recover(&mut self) -> Result<()> {
        self.restart_agent().await?;
        // Rebuild any pipe forwarder whose listener died.
        for i in 0..self.forwarders.len() {
            if self.forwarders[i].is_finished() {
                let (local, target) = (
                    self.forwarders[i].local_port(),
                    self.forwarders[i].target_port(),
                );
                self.forwarders[i] = PortForwarder::spawn(local, target).await?;
            }
        }
        Ok(())
    }

    async fn cold(&mut self) -> Result<ColdOutcome> {
        Ok(ColdOutcome::Restart)
    }

    // The home key goes in only after the helpers are gone.
    async fn reset(&mut self) {
        self.teardown().await;
        let _ = self.adb.shell(&self.serial, "input keyevent HOME").await;
    }

    async fn teardown(&mut self) {
        // Reverse start order: screen proxy, pipe forwarders, then the agent.
        self.screen.take();
        while self.forwarders.pop().is_some() {}
        if self.agent_running {
            let _ = self
                .adb
                .shell(&self.serial, "/data/local/tmp/atx-agent server --stop")
                .await;
            self.agent_running = false;
        }
        self.ports.clear();
        self.endpoints = Endpoints::default();
    }

    fn endpoints(&self) -> Endpoints {
        self.endpoints.clone()
    }

    fn properties(&self) -> serde_json::Value {
        self.properties.clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn abi_table_matches_binaries() {
        let pick = |abis: &[&str]| {
            pick_arch(&abis.iter().map(|s| s.to_string()).collect::<Vec<_>>())
        };
        assert_eq!(pick(&["arm64-v8a", "armeabi-v7a"]), Some("armv7"));
        assert_eq!(pick(&["armeabi"]), Some("armv6"));
        assert_eq!(pick(&["x86"]), Some("386"));
        assert_eq!(pick(&["mips"]), None);
        // First compatible entry wins.
        assert_eq!(pick(&["mips", "x86"]), Some("386"));
    }

    #[test]
    fn dumpsys_fields_parse() {
        let output = "    versionCode=233 minSdk=21 targetSdk=28\n    versionName=2.3.3\n";
        assert_eq!(dumpsys_value(output, "versionCode="), Some("233"));
        assert_eq!(dumpsys_value(output, "versionName="), Some("2.3.3"));
        assert_eq!(dumpsys_value(output, "signatures="), None);
    }

    #[test]
    fn wm_size_parses() {
        assert_eq!(
            parse_wm_size("Physical size: 1080x1920\n"),
            Some("1080x1920".to_string())
        );
        assert_eq!(parse_wm_size("garbage"), None);
    }
}
