//! The control channel to the upstream platform.
//!
//! A single outbound WebSocket carries JSON state messages; a bounded queue
//! sits in front of the socket and a per-serial last-value map makes the
//! device table recoverable after a reconnect. The only inbound command is
//! `cold@<serial>`.

use std::{collections::HashMap, sync::Arc, time::Duration};

use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::Serialize;
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot, Mutex},
};
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};
use url2::Url2;

use crate::{registry::Endpoints, utils::OwnedJoinHandle, ProviderError, Result};

const QUEUE_CAPACITY: usize = 1024;
const PING_INTERVAL: Duration = Duration::from_secs(30);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const FAILURES_BEFORE_HINT: u32 = 30;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Socket write half plus a connection epoch. The epoch is bumped on every
/// reconnect; the drain task compares it against the epoch it last wrote
/// under and re-asserts the whole shadow map before anything newer, even if
/// an update slipped into the queue ahead of the replay request.
struct LinkSink {
    sink: Option<WsSink>,
    epoch: u64,
}

type SharedSink = Arc<Mutex<LinkSink>>;

/// State mirrored to the platform, one tagged value per serial;
/// merges collapse to last-write-wins.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum DeviceUpdate {
    Init {
        serial: String,
        endpoints: Endpoints,
        properties: serde_json::Value,
    },
    Delete {
        serial: String,
    },
}

impl DeviceUpdate {
    pub fn serial(&self) -> &str {
        match self {
            DeviceUpdate::Init { serial, .. } | DeviceUpdate::Delete { serial } => serial,
        }
    }
}

/// Anything that accepts device state updates. Supervisors talk to this
/// instead of the concrete link so tests can capture the traffic.
pub trait UpdateSink: Send + Sync {
    fn enqueue(&self, update: DeviceUpdate);
}

enum Outbound {
    Update(DeviceUpdate),
    /// Replay the whole last-value map before resuming normal draining.
    Replay,
    Ping,
    /// Acknowledged once everything enqueued before it has drained.
    Flush(oneshot::Sender<()>),
}

/// Handler invoked for inbound `cold@<serial>` commands.
pub type ColdHandler = Box<dyn Fn(&str) + Send + Sync>;

pub struct HeartbeatLink {
    queue: mpsc::Sender<Outbound>,
    _tasks: Vec<OwnedJoinHandle<()>>,
}

impl HeartbeatLink {
    /// Builds the heartbeat URL from the configured platform URL.
    pub fn endpoint(platform_url: &str, project: &str, owner: &str) -> Result<Url2> {
        let mut url = Url2::try_parse(platform_url)
            .map_err(|e| ProviderError::Heartbeat(format!("bad platform url: {e}")))?;
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| ProviderError::Heartbeat("bad platform url scheme".into()))?;
        url.set_path("/websocket/heartbeat");
        url.query_pairs_mut()
            .clear()
            .append_pair("project", project)
            .append_pair("owner", owner);
        Ok(url)
    }

    /// Starts the link. Connection management runs in the background: the
    /// returned handle accepts updates immediately and replays state after
    /// every (re)connection.
    pub fn connect(url: Url2, system: &'static str, cold: ColdHandler) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_CAPACITY);
        let sink: SharedSink = Arc::new(Mutex::new(LinkSink { sink: None, epoch: 0 }));

        let mut tasks = Vec::new();
        tasks.push(OwnedJoinHandle::new(tokio::spawn(receive_task(
            url,
            system,
            sink.clone(),
            queue_tx.clone(),
            cold,
        ))));
        tasks.push(OwnedJoinHandle::new(tokio::spawn(drain_task(
            queue_rx,
            sink,
            system,
        ))));
        tasks.push(OwnedJoinHandle::new(tokio::spawn(ping_task(
            queue_tx.clone(),
        ))));

        Arc::new(Self { queue: queue_tx, _tasks: tasks })
    }

    /// Flushes the queue, waiting at most `deadline`. Used on shutdown.
    pub async fn drain(&self, deadline: Duration) {
        let (tx, rx) = oneshot::channel();
        if self.queue.send(Outbound::Flush(tx)).await.is_err() {
            return;
        }
        let _ = tokio::time::timeout(deadline, rx).await;
    }
}

impl UpdateSink for HeartbeatLink {
    fn enqueue(&self, update: DeviceUpdate) {
        if self.queue.try_send(Outbound::Update(update)).is_err() {
            log::warn!("heartbeat queue full, dropping update");
        }
    }
}

async fn connect_ws(url: &Url2) -> Result<(WsSink, WsStream)> {
    let (ws, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
    Ok(ws.split())
}

/// Owns the read side: consumes inbound commands and re-establishes the
/// connection with capped backoff whenever the stream ends.
async fn receive_task(
    url: Url2,
    system: &'static str,
    sink: SharedSink,
    queue: mpsc::Sender<Outbound>,
    cold: ColdHandler,
) {
    let mut stream: Option<WsStream> = None;
    loop {
        let mut current = match stream.take() {
            Some(s) => s,
            None => {
                let (new_sink, mut new_stream) = reconnect(&url, system).await;
                // First inbound frame is the agent identifier.
                if let Some(Ok(Message::Text(id))) = new_stream.next().await {
                    log::info!("{} agent id: {}", system, id);
                }
                {
                    let mut guard = sink.lock().await;
                    guard.sink = Some(new_sink);
                    guard.epoch += 1;
                }
                let _ = queue.send(Outbound::Replay).await;
                new_stream
            }
        };

        loop {
            match current.next().await {
                Some(Ok(Message::Text(text))) => {
                    log::info!("{} platform message: {}", system, text);
                    if let Some(serial) = text.strip_prefix("cold@") {
                        cold(serial);
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::warn!("{} heartbeat read error: {}", system, e);
                    break;
                }
                None => {
                    log::warn!("{} heartbeat closed by peer", system);
                    break;
                }
            }
        }

        sink.lock().await.sink = None;
    }
}

async fn reconnect(url: &Url2, system: &'static str) -> (WsSink, WsStream) {
    let mut failures: u32 = 0;
    loop {
        match connect_ws(url).await {
            Ok(pair) => return pair,
            Err(e) => {
                failures += 1;
                let backoff = Duration::from_secs(u64::from(failures)).min(BACKOFF_CAP);
                if failures == FAILURES_BEFORE_HINT {
                    log::warn!(
                        "{} cannot reach the platform after {} attempts; check the platform \
                         url, project and owner settings",
                        system,
                        failures
                    );
                }
                log::debug!("{} heartbeat connect error: {}, retry in {:?}", system, e, backoff);
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

/// Owns the write side: preserves FIFO order of the queue, except that after
/// a reconnect the full last-value replay reaches the socket before anything
/// newer. The epoch check makes that hold even for updates enqueued between
/// the sink installation and the replay request.
async fn drain_task(mut queue: mpsc::Receiver<Outbound>, sink: SharedSink, system: &'static str) {
    let mut shadow: HashMap<String, DeviceUpdate> = HashMap::new();
    let mut synced_epoch = 0u64;
    while let Some(item) = queue.recv().await {
        match item {
            Outbound::Update(update) => {
                shadow.insert(update.serial().to_string(), update.clone());
                let mut guard = sink.lock().await;
                if guard.sink.is_none() {
                    // Recoverable through the shadow map once reconnected.
                    continue;
                }
                if guard.epoch != synced_epoch {
                    // A reconnect happened since the last write; the replay
                    // (which now includes this update) must go out first.
                    synced_epoch = guard.epoch;
                    replay(&mut guard, &shadow, system).await;
                } else {
                    send_json(&mut guard, system, &update).await;
                }
            }
            Outbound::Replay => {
                let mut guard = sink.lock().await;
                if guard.sink.is_some() && guard.epoch != synced_epoch {
                    synced_epoch = guard.epoch;
                    replay(&mut guard, &shadow, system).await;
                }
            }
            Outbound::Ping => {
                let mut guard = sink.lock().await;
                if let Some(ws) = guard.sink.as_mut() {
                    let _ = ws.send(Message::Ping(Vec::new())).await;
                }
            }
            Outbound::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

async fn replay(guard: &mut LinkSink, shadow: &HashMap<String, DeviceUpdate>, system: &str) {
    log::info!("{} replaying {} device states", system, shadow.len());
    for update in shadow.values() {
        send_json(guard, system, update).await;
    }
}

async fn send_json(guard: &mut LinkSink, system: &str, update: &DeviceUpdate) {
    let text = match serde_json::to_string(update) {
        Ok(text) => text,
        Err(e) => {
            log::error!("unserializable update: {}", e);
            return;
        }
    };
    if let Some(ws) = guard.sink.as_mut() {
        if let Err(e) = ws.send(Message::Text(text.clone())).await {
            // The message stays recoverable through the shadow map.
            log::info!("{} heartbeat send failed: {}", system, e);
        } else {
            log::debug!("{} heartbeat sent: {}", system, text);
        }
    }
}

async fn ping_task(queue: mpsc::Sender<Outbound>) {
    loop {
        tokio::time::sleep(PING_INTERVAL).await;
        if queue.send(Outbound::Ping).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn endpoint_maps_scheme_and_encodes_query() {
        let url =
            HeartbeatLink::endpoint("http://platform.example:8000/", "my project", "o&wner")
                .unwrap();
        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.path(), "/websocket/heartbeat");
        assert!(url.as_str().contains("project=my+project"));
        assert!(url.as_str().contains("owner=o%26wner"));

        let url = HeartbeatLink::endpoint("https://platform.example", "p", "o").unwrap();
        assert_eq!(url.scheme(), "wss");
    }

    #[test]
    fn updates_serialize_with_command_tags() {
        let init = DeviceUpdate::Init {
            serial: "AAA".into(),
            endpoints: Endpoints::default(),
            properties: json!({"brand": "x"}),
        };
        let value = serde_json::to_value(&init).unwrap();
        assert_eq!(value["command"], "init");
        assert_eq!(value["serial"], "AAA");

        let delete = DeviceUpdate::Delete { serial: "AAA".into() };
        let value = serde_json::to_value(&delete).unwrap();
        assert_eq!(value["command"], "delete");
    }

    #[test]
    fn shadow_is_last_write_wins_per_serial() {
        let mut shadow: HashMap<String, DeviceUpdate> = HashMap::new();
        for update in [
            DeviceUpdate::Init {
                serial: "AAA".into(),
                endpoints: Endpoints::default(),
                properties: json!({}),
            },
            DeviceUpdate::Delete { serial: "AAA".into() },
            DeviceUpdate::Init {
                serial: "BBB".into(),
                endpoints: Endpoints::default(),
                properties: json!({}),
            },
        ] {
            shadow.insert(update.serial().to_string(), update);
        }
        assert_eq!(shadow.len(), 2);
        assert!(matches!(shadow["AAA"], DeviceUpdate::Delete { .. }));
        assert!(matches!(shadow["BBB"], DeviceUpdate::Init { .. }));
    }
}
