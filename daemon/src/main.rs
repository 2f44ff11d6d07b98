//! `providerd`, the mobile device provider agent.
//!
//! Discovers locally attached Android and iOS devices, prepares them for
//! remote automation and mirrors the live device table to the upstream
//! platform over the heartbeat link.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context};
use clap::Parser;
use hyper::client::HttpConnector;
use provider::{
    adb::AdbClient,
    heartbeat::{HeartbeatLink, UpdateSink},
    ports::PortAllocator,
    registry::{android_tracker, ios_tracker, Registry, TrackerContext},
    scrcpy::ScrcpyOptions,
    supervisor::{android::AndroidFactory, ios::IosFactory},
    usbmux::UsbmuxClient,
    vendor, Platform,
};
use tokio::{sync::Mutex, task::JoinHandle};

mod config;
mod http;

use config::Config;

#[derive(Debug, Parser)]
#[command(version, about = "Mobile device provider agent")]
struct Opts {
    /// Path to the INI configuration file
    #[arg(short, long, default_value = "config/config.ini")]
    config: PathBuf,
}

/// Handles needed for an orderly shutdown of one platform service.
struct PlatformService {
    name: &'static str,
    registry: Arc<Registry>,
    heartbeat: Arc<HeartbeatLink>,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let opts = Opts::parse();

    if let Err(e) = run(opts).await {
        log::error!("fatal: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(opts: Opts) -> anyhow::Result<()> {
    let config = Config::load(&opts.config)?;
    log::info!(
        "provider agent starting (project {}, owner {})",
        config.project,
        config.owner
    );
    log::info!("vendor artifacts: {}", vendor::describe_versions());

    let mut services = Vec::new();
    let mut tasks: Vec<JoinHandle<anyhow::Result<()>>> = Vec::new();

    if config.enable_android {
        let (service, task) = start_android(&config)?;
        services.push(service);
        tasks.push(task);
    }
    if config.enable_apple {
        let (service, task) = start_apple(&config)?;
        services.push(service);
        tasks.push(task);
    }
    if services.is_empty() {
        bail!("both platforms are disabled in the configuration");
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("interrupt caught, shutting down");
        }
        (result, index, _) = futures::future::select_all(tasks.iter_mut()) => {
            let name = services[index].name;
            match result {
                Ok(Ok(())) => bail!("{name} service exited unexpectedly"),
                Ok(Err(e)) => return Err(e).with_context(|| format!("{name} service failed")),
                Err(e) => bail!("{name} service panicked: {e}"),
            }
        }
    }

    // Orderly teardown: every supervisor is cancelled and awaited (releasing
    // ports and reaping children), then the heartbeat queues flush.
    for task in &tasks {
        task.abort();
    }
    for service in &services {
        let supervisors = service.registry.shutdown();
        futures::future::join_all(supervisors).await;
        service.heartbeat.drain(Duration::from_secs(2)).await;
    }
    Ok(())
}

fn http_client() -> hyper::Client<HttpConnector> {
    let mut connector = HttpConnector::new();
    connector.set_connect_timeout(Some(Duration::from_secs(3)));
    hyper::Client::builder().build(connector)
}

fn heartbeat_for(
    config: &Config,
    system: &'static str,
    registry: &Arc<Registry>,
) -> anyhow::Result<Arc<HeartbeatLink>> {
    let url = HeartbeatLink::endpoint(&config.platform_url, &config.project, &config.owner)
        .context("building heartbeat url")?;
    let cold_registry = registry.clone();
    Ok(HeartbeatLink::connect(
        url,
        system,
        Box::new(move |serial| {
            if !cold_registry.cold(serial) {
                log::warn!("cold command for unknown device {serial}");
            }
        }),
    ))
}

fn start_android(config: &Config) -> anyhow::Result<(PlatformService, JoinHandle<anyhow::Result<()>>)> {
    let registry = Arc::new(Registry::new());
    let heartbeat = heartbeat_for(config, "Android", &registry)?;

    let adb = AdbClient::default();
    let factory = Arc::new(AndroidFactory {
        adb: adb.clone(),
        allocator: Arc::new(Mutex::new(PortAllocator::android())),
        host: config.host.clone(),
        options: ScrcpyOptions::default(),
    });
    let ctx = TrackerContext {
        registry: registry.clone(),
        updates: heartbeat.clone() as Arc<dyn UpdateSink>,
        factory,
    };
    let state = Arc::new(http::PlatformState {
        platform: Platform::Android,
        registry: registry.clone(),
        adb: Some(adb.clone()),
        http: http_client(),
    });

    let port = config.android_port;
    let task = tokio::spawn(async move {
        if let Err(e) = vendor::fetch_android().await {
            log::warn!("artifact prefetch failed: {e}; pushes will retry per device");
        }
        tokio::try_join!(http::serve(port, state), async {
            android_tracker(adb, ctx).await.map_err(anyhow::Error::from)
        })?;
        Ok(())
    });

    Ok((
        PlatformService { name: "android", registry, heartbeat },
        task,
    ))
}

fn start_apple(config: &Config) -> anyhow::Result<(PlatformService, JoinHandle<anyhow::Result<()>>)> {
    let registry = Arc::new(Registry::new());
    let heartbeat = heartbeat_for(config, "Apple", &registry)?;

    let mux = UsbmuxClient::default();
    let factory = Arc::new(IosFactory {
        mux: mux.clone(),
        allocator: Arc::new(Mutex::new(PortAllocator::apple())),
        host: config.host.clone(),
        // The runner bundle is matched as a glob.
        wda_bundle_id: format!("*{}*", config.wda_bundle_id),
        launch_lock: Arc::new(Mutex::new(())),
    });
    let ctx = TrackerContext {
        registry: registry.clone(),
        updates: heartbeat.clone() as Arc<dyn UpdateSink>,
        factory,
    };
    let state = Arc::new(http::PlatformState {
        platform: Platform::Ios,
        registry: registry.clone(),
        adb: None,
        http: http_client(),
    });

    let port = config.apple_port;
    let task = tokio::spawn(async move {
        tokio::try_join!(http::serve(port, state), async {
            ios_tracker(mux, ctx).await.map_err(anyhow::Error::from)
        })?;
        Ok(())
    });

    Ok((
        PlatformService { name: "apple", registry, heartbeat },
        task,
    ))
}
