//! Local REST surface for automation clients.
//!
//! One router per enabled platform, CORS-open, every response wrapped in the
//! `{status, message, data?}` envelope. Handlers are thin wrappers over
//! shell-outs and the device registry; the registry is read-only here.

use std::{net::SocketAddr, process::Stdio, sync::Arc, time::Duration};

use anyhow::{anyhow, Context};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hyper::{client::HttpConnector, Body, Request, Response, Server};
use provider::{
    adb::AdbClient,
    registry::{Endpoints, Registry},
    vendor, Platform,
};
use routerify::{ext::RequestExt, Router, RouterService};
use routerify_query::{query_parser, RequestQueryExt};
use serde::Deserialize;
use serde_json::json;

mod error;
pub use error::Error;
use error::{error_handler, success};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct PlatformState {
    pub platform: Platform,
    pub registry: Arc<Registry>,
    /// Present on the Android surface only.
    pub adb: Option<AdbClient>,
    pub http: hyper::Client<HttpConnector>,
}

impl PlatformState {
    fn adb(&self) -> Result<&AdbClient, Error> {
        self.adb
            .as_ref()
            .ok_or_else(|| Error::Failed("not an android surface".into()))
    }

    fn endpoints(&self, serial: &str) -> Result<Endpoints, Error> {
        let record = self
            .registry
            .get(serial)
            .ok_or_else(|| Error::UnknownDevice(serial.to_string()))?;
        let endpoints = record.read().unwrap().endpoints.clone();
        Ok(endpoints)
    }

    async fn get_bytes(&self, authority: &str, path: &str) -> Result<Vec<u8>, Error> {
        let uri = format!("http://{authority}{path}")
            .parse::<hyper::Uri>()
            .map_err(|e| Error::Failed(format!("bad endpoint: {e}")))?;
        let response = tokio::time::timeout(REQUEST_TIMEOUT, self.http.get(uri))
            .await
            .map_err(|_| Error::Failed("device request timed out".into()))?
            .map_err(|e| Error::Failed(format!("device request failed: {e}")))?;
        let body = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|e| Error::Failed(format!("device response failed: {e}")))?;
        Ok(body.to_vec())
    }

    async fn get_json(&self, authority: &str, path: &str) -> Result<serde_json::Value, Error> {
        let bytes = self.get_bytes(authority, path).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::Failed(format!("bad device response: {e}")))
    }
}

fn state_of(req: &Request<Body>) -> Arc<PlatformState> {
    req.data::<Arc<PlatformState>>()
        .expect("router state missing")
        .clone()
}

fn query<'r>(req: &'r Request<Body>, name: &'static str) -> Result<&'r str, Error> {
    req.query(name)
        .map(String::as_str)
        .ok_or(Error::MissingParameter(name))
}

async fn parse_body<T: for<'de> Deserialize<'de>>(req: Request<Body>) -> Result<T, Error> {
    let bytes = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|e| Error::ParseError(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| Error::ParseError(e.to_string()))
}

async fn run_tidevice(args: &[&str]) -> Result<String, Error> {
    let output = tokio::process::Command::new("tidevice")
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| Error::Failed(format!("tidevice failed to start: {e}")))?;
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(text)
}

#[derive(Debug, Deserialize)]
struct InstallBody {
    serial: String,
    url: String,
}

/// Downloads (cached by the md5 of the url), pushes and installs a package.
async fn post_app_install(req: Request<Body>) -> Result<Response<Body>, Error> {
    let state = state_of(&req);
    let body: InstallBody = parse_body(req).await?;

    let path = vendor::cache_download(state.platform, &body.url).await?;
    match state.platform {
        Platform::Android => {
            let adb = state.adb()?;
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|e| Error::Internal(anyhow!(e)))?;
            let millis = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or(0);
            let dest = format!("/data/local/tmp/tmp-{millis}.apk");

            let mut sync = adb.sync(&body.serial).await?;
            sync.push(&dest, 0o644, &bytes).await?;
            let _ = sync.quit().await;

            let output = adb
                .shell(&body.serial, &format!("pm install -r -t {dest}"))
                .await?;
            let _ = adb.shell(&body.serial, &format!("rm -f {dest}")).await;
            if !output.contains("Success") {
                return Err(Error::Failed(format!("install failed: {}", output.trim())));
            }
        }
        Platform::Ios => {
            let path = path.to_string_lossy().into_owned();
            let output = run_tidevice(&["-u", &body.serial, "install", &path]).await?;
            if !output.contains("Complete") {
                let last = output.lines().rev().find(|l| !l.trim().is_empty());
                return Err(Error::Failed(format!(
                    "install failed: {}",
                    last.unwrap_or("no output")
                )));
            }
        }
    }
    Ok(success("install succeeded", None))
}

#[derive(Debug, Deserialize)]
struct UninstallBody {
    serial: String,
    #[serde(rename = "packageName")]
    package_name: String,
}

async fn post_app_uninstall(req: Request<Body>) -> Result<Response<Body>, Error> {
    let state = state_of(&req);
    let body: UninstallBody = parse_body(req).await?;

    let ok = match state.platform {
        Platform::Android => {
            let output = state
                .adb()?
                .shell(&body.serial, &format!("pm uninstall {}", body.package_name))
                .await?;
            output.contains("Success")
        }
        Platform::Ios => {
            let output =
                run_tidevice(&["-u", &body.serial, "uninstall", &body.package_name]).await?;
            output.contains("Complete")
        }
    };
    if !ok {
        return Err(Error::Failed("uninstall failed".into()));
    }
    Ok(success("uninstall succeeded", None))
}

async fn get_screenshot(req: Request<Body>) -> Result<Response<Body>, Error> {
    let state = state_of(&req);
    let serial = query(&req, "serial")?;
    let endpoints = state.endpoints(serial)?;

    let jpeg = match state.platform {
        Platform::Android => {
            let agent = endpoints
                .agent_url
                .ok_or_else(|| Error::Failed("device has no agent endpoint".into()))?;
            // The on-device agent already serves JPEG.
            state.get_bytes(&agent, "/screenshot").await?
        }
        Platform::Ios => {
            let automation = endpoints
                .automation_url
                .ok_or_else(|| Error::Failed("device has no automation endpoint".into()))?;
            let body = state.get_json(&automation, "/screenshot").await?;
            let png = body
                .get("value")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::Failed("screenshot reply carried no image".into()))?;
            let png = BASE64
                .decode(png)
                .map_err(|e| Error::Failed(format!("bad screenshot payload: {e}")))?;
            // Transcoding is CPU-bound; keep it off the event loop.
            tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<u8>> {
                let decoded = image::load_from_memory(&png)?;
                let rgb = image::DynamicImage::ImageRgb8(decoded.to_rgb8());
                let mut out = std::io::Cursor::new(Vec::new());
                rgb.write_to(&mut out, image::ImageFormat::Jpeg)?;
                Ok(out.into_inner())
            })
            .await
            .map_err(|e| Error::Internal(anyhow!("transcode task failed: {e}")))?
            .context("transcoding screenshot")?
        }
    };

    Ok(success(
        "screenshot captured",
        Some(json!({
            "type": "jpeg",
            "encoding": "base64",
            "data": BASE64.encode(jpeg),
        })),
    ))
}

async fn get_hierarchy(req: Request<Body>) -> Result<Response<Body>, Error> {
    let state = state_of(&req);
    let serial = query(&req, "serial")?;
    let endpoints = state.endpoints(serial)?;

    let data = match state.platform {
        Platform::Android => {
            let agent = endpoints
                .agent_url
                .ok_or_else(|| Error::Failed("device has no agent endpoint".into()))?;
            let dump = state.get_json(&agent, "/dump/hierarchy").await?;
            let hierarchy = dump.get("result").cloned().unwrap_or(dump);
            let size = state
                .adb()?
                .shell(serial, "wm size")
                .await
                .ok()
                .and_then(|out| {
                    out.lines()
                        .find_map(|l| l.rsplit_once(": ").map(|(_, s)| s.trim().to_string()))
                });
            json!({"jsonHierarchy": hierarchy, "windowSize": size})
        }
        Platform::Ios => {
            let automation = endpoints
                .automation_url
                .ok_or_else(|| Error::Failed("device has no automation endpoint".into()))?;
            let source = state.get_json(&automation, "/source?format=json").await?;
            let size = state.get_json(&automation, "/window/size").await.ok();
            json!({
                "jsonHierarchy": source.get("value").cloned().unwrap_or(source),
                "windowSize": size.and_then(|s| s.get("value").cloned()),
            })
        }
    };
    Ok(success("hierarchy dumped", Some(data)))
}

/// Same path as the remote `cold@<serial>` command.
async fn post_cold(req: Request<Body>) -> Result<Response<Body>, Error> {
    let state = state_of(&req);
    let serial = query(&req, "serial")?;
    if !state.registry.cold(serial) {
        return Err(Error::UnknownDevice(serial.to_string()));
    }
    Ok(success("cold accepted", None))
}

fn router(state: Arc<PlatformState>) -> Router<Body, Error> {
    Router::builder()
        .data(state)
        .middleware(query_parser())
        .middleware(routerify_cors::enable_cors_all())
        .post("/app/install", post_app_install)
        .post("/app/uninstall", post_app_uninstall)
        .get("/device/screenshot", get_screenshot)
        .get("/device/hierarchy", get_hierarchy)
        .post("/cold", post_cold)
        .err_handler(error_handler)
        .build()
        .expect("could not build http router")
}

pub async fn serve(port: u16, state: Arc<PlatformState>) -> anyhow::Result<()> {
    let service = RouterService::new(router(state)).expect("while building router service");
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let server = Server::try_bind(&addr)
        .with_context(|| format!("cannot bind http port {port}"))?
        .serve(service);
    log::info!("http surface on {}", addr);
    server.await.context("http server failed")
}
