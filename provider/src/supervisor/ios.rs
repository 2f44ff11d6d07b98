//! WebDriverAgent lifecycle for attached iOS devices.
//!
//! Launch goes through a cross-device lock (WDA servers start one at a time
//! on the host): the `xctest` launcher plus two relay children translate host
//! ports to device ports 8100/9100, and an in-process HTTP proxy exposes both
//! behind a single public port.

use std::{collections::HashMap, process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hyper::{client::HttpConnector, service::service_fn, Body, Request, Response};
use serde_json::json;
use tokio::{net::TcpListener, process::Child, sync::Mutex};

use crate::{
    ports::PortAllocator,
    registry::Endpoints,
    supervisor::{ColdOutcome, DeviceFactory, ManagedDevice, Prepared, ProbeReport},
    usbmux::UsbmuxClient,
    utils::OwnedJoinHandle,
    Platform, ProviderError, Result,
};

const WDA_DEVICE_PORT: &str = "8100";
const MJPEG_DEVICE_PORT: &str = "9100";

const READY_TIMEOUT: Duration = Duration::from_secs(60);
const LAUNCH_ATTEMPTS: u32 = 3;
const LAUNCH_RETRY_PAUSE: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

const PNG_MAGIC: [u8; 8] = [0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a];

pub struct IosFactory {
    pub mux: UsbmuxClient,
    pub allocator: Arc<Mutex<PortAllocator>>,
    pub host: String,
    pub wda_bundle_id: String,
    /// Shared across every device on the host.
    pub launch_lock: Arc<Mutex<()>>,
}

impl DeviceFactory for IosFactory {
    fn create(&self, serial: &str) -> Box<dyn ManagedDevice> {
        Box::new(WdaDevice::new(
            serial.to_string(),
            self.mux.clone(),
            self.allocator.clone(),
            self.host.clone(),
            self.wda_bundle_id.clone(),
            self.launch_lock.clone(),
        ))
    }
}

pub struct WdaDevice {
    serial: String,
    mux: UsbmuxClient,
    allocator: Arc<Mutex<PortAllocator>>,
    host: String,
    bundle_id: String,
    launch_lock: Arc<Mutex<()>>,
    http: hyper::Client<HttpConnector>,

    info: HashMap<String, String>,
    children: Vec<(String, Child)>,
    proxy: Option<WdaProxy>,
    wda_port: u16,
    mjpeg_port: u16,
    endpoints: Endpoints,
    properties: serde_json::Value,
    ports: Vec<u16>,
    last_ip: Option<String>,
}

impl WdaDevice {
    pub fn new(
        serial: String,
        mux: UsbmuxClient,
        allocator: Arc<Mutex<PortAllocator>>,
        host: String,
        bundle_id: String,
        launch_lock: Arc<Mutex<()>>,
    ) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(CONNECT_TIMEOUT));
        let http = hyper::Client::builder().build(connector);
        Self {
            serial,
            mux,
            allocator,
            host,
            bundle_id,
            launch_lock,
            http,
            info: HashMap::new(),
            children: Vec::new(),
            proxy: None,
            wda_port: 0,
            mjpeg_port: 0,
            endpoints: Endpoints::default(),
            properties: serde_json::Value::Null,
            ports: Vec::new(),
            last_ip: None,
        }
    }

    async fn allocate(&mut self) -> Result<u16> {
        let port = self.allocator.lock().await.get()?;
        self.ports.push(port);
        Ok(port)
    }

    fn spawn_child(&mut self, name: &str, args: &[&str]) -> Result<()> {
        let child = tokio::process::Command::new("tidevice")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        self.children.push((name.to_string(), child));
        Ok(())
    }

    async fn destroy_children(&mut self) {
        // Reverse start order.
        self.proxy.take();
        while let Some((name, mut child)) = self.children.pop() {
            log::debug!("[{}] terminating {}", self.serial, name);
            let _ = child.kill().await;
        }
    }

    async fn restart_proxy(&mut self) -> Result<u16> {
        self.proxy.take();
        let public_port = self.allocate().await?;
        self.proxy = Some(WdaProxy::start(public_port, self.wda_port, self.mjpeg_port).await?);
        self.endpoints.automation_url = Some(format!("{}:{}", self.host, public_port));
        log::debug!("[{}] wda proxy on *:{}", self.serial, public_port);
        Ok(public_port)
    }

    async fn launch(&mut self) -> Result<()> {
        {
            let _guard = self.launch_lock.clone().lock_owned().await;
            self.wda_port = self.allocate().await?;
            self.mjpeg_port = self.allocate().await?;
            let serial = self.serial.clone();
            let bundle = self.bundle_id.clone();
            let wda_port = self.wda_port.to_string();
            let mjpeg_port = self.mjpeg_port.to_string();
            self.spawn_child("xctest", &["-u", &serial, "xctest", "-B", &bundle])?;
            self.spawn_child(
                "relay-wda",
                &["-u", &serial, "relay", &wda_port, WDA_DEVICE_PORT],
            )?;
            self.spawn_child(
                "relay-mjpeg",
                &["-u", &serial, "relay", &mjpeg_port, MJPEG_DEVICE_PORT],
            )?;
            self.restart_proxy().await?;
        }
        self.wait_until_ready(READY_TIMEOUT).await
    }

    async fn wait_until_ready(&mut self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            for (name, child) in &mut self.children {
                if let Ok(Some(status)) = child.try_wait() {
                    return Err(ProviderError::HelperExited(format!("{name} ({status})")));
                }
            }
            if self.wda_status().await.is_some() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Err(ProviderError::NotReady(timeout))
    }

    async fn get_json(&self, path: &str) -> Option<serde_json::Value> {
        let uri = format!("http://127.0.0.1:{}{}", self.wda_port, path)
            .parse()
            .ok()?;
        let response = tokio::time::timeout(REQUEST_TIMEOUT, self.http.get(uri))
            .await
            .ok()?
            .ok()?;
        let body = tokio::time::timeout(
            REQUEST_TIMEOUT,
            hyper::body::to_bytes(response.into_body()),
        )
        .await
        .ok()?
        .ok()?;
        serde_json::from_slice(&body).ok()
    }

    async fn post(&self, path: &str) {
        let uri = format!("http://127.0.0.1:{}{}", self.wda_port, path);
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty());
        if let Ok(request) = request {
            let _ = tokio::time::timeout(REQUEST_TIMEOUT, self.http.request(request)).await;
        }
    }

    async fn wda_status(&self) -> Option<serde_json::Value> {
        self.get_json("/status").await
    }

    fn status_ip(status: &serde_json::Value) -> Option<String> {
        status
            .pointer("/value/ios/ip")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    async fn screenshot_ok(&self) -> bool {
        let Some(body) = self.get_json("/screenshot").await else {
            return false;
        };
        let Some(data) = body.get("value").and_then(|v| v.as_str()) else {
            return false;
        };
        match BASE64.decode(data) {
            Ok(png) => png.starts_with(&PNG_MAGIC),
            Err(_) => false,
        }
    }

    async fn screen_size(&self) -> String {
        self.post("/wda/homescreen").await;
        match self.get_json("/window/size").await {
            Some(body) => {
                let w = body.pointer("/value/width").and_then(|v| v.as_f64());
                let h = body.pointer("/value/height").and_then(|v| v.as_f64());
                match (w, h) {
                    (Some(w), Some(h)) => format!("{w}*{h}"),
                    _ => "unknown".to_string(),
                }
            }
            None => "unknown".to_string(),
        }
    }

    async fn collect_properties(&self) -> serde_json::Value {
        let get = |key: &str| self.info.get(key).cloned().unwrap_or_default();
        json!({
            "system": "apple",
            "brand": "Apple",
            "version": get("ProductVersion"),
            "model": get("MarketName"),
            "name": get("DeviceName"),
            "size": self.screen_size().await,
        })
    }
}

#[async_trait]
impl ManagedDevice for WdaDevice {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn platform(&self) -> Platform {
        Platform::Ios
    }

    async fn prepare(&mut self) -> Result<Prepared> {
        self.info = self.mux.device_info(&self.serial).await?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.launch().await {
                Ok(()) => break,
                Err(e) if attempt < LAUNCH_ATTEMPTS => {
                    log::warn!(
                        "[{}] wda launch failed ({}), retry in {:?}",
                        self.serial, e, LAUNCH_RETRY_PAUSE
                    );
                    self.destroy_children().await;
                    tokio::time::sleep(LAUNCH_RETRY_PAUSE).await;
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(status) = self.wda_status().await {
            self.last_ip = Self::status_ip(&status);
        }
        self.properties = self.collect_properties().await;

        Ok(Prepared {
            endpoints: self.endpoints.clone(),
            properties: self.properties.clone(),
            ports: self.ports.clone(),
        })
    }

    async fn probe(&mut self) -> ProbeReport {
        let Some(status) = self.wda_status().await else {
            return ProbeReport::default();
        };
        let Some(ip) = Self::status_ip(&status) else {
            return ProbeReport::default();
        };
        if !self.screenshot_ok().await {
            return ProbeReport::default();
        }

        let readdressed = self.last_ip.as_deref() != Some(ip.as_str());
        self.last_ip = Some(ip);
        ProbeReport { healthy: true, readdressed }
    }

    async fn recover(&mut self) -> Result<()> {
        log::info!("[{}] restarting wda", self.serial);
        self.destroy_children().await;
        self.launch().await?;
        self.post("/wda/healthcheck").await;
        Ok(())
    }

    async fn cold(&mut self) -> Result<ColdOutcome> {
        self.restart_proxy().await?;
        self.post("/wda/healthcheck").await;
        if !self.probe().await.healthy {
            self.recover().await?;
        }
        Ok(ColdOutcome::Handled)
    }

    async fn teardown(&mut self) {
        self.destroy_children().await;
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

/// Minimal reverse proxy exposing the automation and MJPEG relays behind one
/// public port: `/mjpeg` prefixed paths reach the MJPEG relay, everything
/// else the automation relay.
pub struct WdaProxy {
    pub wda_port: u16,
    pub mjpeg_port: u16,
    _task: OwnedJoinHandle<()>,
}

impl WdaProxy {
    pub async fn start(public_port: u16, wda_port: u16, mjpeg_port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", public_port)).await?;
        let client = hyper::Client::new();

        let task = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        log::warn!("wda proxy accept error: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };
                let client = client.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        forward(client.clone(), req, wda_port, mjpeg_port)
                    });
                    if let Err(e) = hyper::server::conn::Http::new()
                        .serve_connection(stream, service)
                        .await
                    {
                        log::debug!("wda proxy connection error: {}", e);
                    }
                });
            }
        })
        .into();

        Ok(Self { wda_port, mjpeg_port, _task: task })
    }
}

async fn forward(
    client: hyper::Client<HttpConnector>,
    mut req: Request<Body>,
    wda_port: u16,
    mjpeg_port: u16,
) -> Result<Response<Body>, hyper::Error> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let (port, path) = match path.strip_prefix("/mjpeg") {
        Some(rest) if rest.is_empty() => (mjpeg_port, "/".to_string()),
        Some(rest) => (mjpeg_port, rest.to_string()),
        None => (wda_port, path),
    };

    let uri = format!("http://127.0.0.1:{port}{path}");
    match uri.parse() {
        Ok(uri) => *req.uri_mut() = uri,
        Err(_) => {
            return Ok(Response::builder()
                .status(400)
                .body(Body::empty())
                .unwrap())
        }
    }
    client.request(req).await
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_ip_requires_non_empty_value() {
        let status = serde_json::json!({"value": {"ios": {"ip": "10.0.0.9"}}});
        assert_eq!(WdaDevice::status_ip(&status), Some("10.0.0.9".to_string()));

        let empty = serde_json::json!({"value": {"ios": {"ip": ""}}});
        assert_eq!(WdaDevice::status_ip(&empty), None);

        let missing = serde_json::json!({"value": {}});
        assert_eq!(WdaDevice::status_ip(&missing), None);
    }

    #[test]
    fn png_magic_is_the_png_signature() {
        assert_eq!(PNG_MAGIC, *b"\x89PNG\r\n\x1a\n");
    }
}
