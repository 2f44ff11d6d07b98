//! Severing the heartbeat socket must replay the last state per serial
//! before any newer traffic drains.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use provider::{
    heartbeat::{DeviceUpdate, HeartbeatLink, UpdateSink},
    registry::Endpoints,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

fn init(serial: &str) -> DeviceUpdate {
    DeviceUpdate::Init {
        serial: serial.to_string(),
        endpoints: Endpoints {
            agent_url: Some(format!("10.0.0.1:2000{}", serial.len())),
            ..Default::default()
        },
        properties: json!({"system": "android"}),
    }
}

/// Accepts one connection, sends the agent-id frame, returns `count` JSON
/// frames (skipping control frames) and severs the connection.
async fn serve_one(listener: TcpListener, count: usize) -> (TcpListener, Vec<serde_json::Value>) {
    let (stream, _) = listener.accept().await.unwrap();
    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
    ws.send(Message::Text("agent-7".into())).await.unwrap();

    let mut frames = Vec::new();
    while frames.len() < count {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                frames.push(serde_json::from_str(&text).unwrap());
            }
            Some(Ok(_)) => {}
            Some(Err(_)) | None => break,
        }
    }
    drop(ws);
    (listener, frames)
}

#[tokio::test]
async fn reconnect_replays_last_state_per_serial() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let url = HeartbeatLink::endpoint(&format!("http://127.0.0.1:{port}"), "proj", "owner")
        .unwrap();
    let link = HeartbeatLink::connect(url, "Android", Box::new(|_| {}));

    // Two devices come up while the first connection is live.
    let first = tokio::spawn(serve_one(listener, 2));
    tokio::time::sleep(Duration::from_millis(300)).await;
    link.enqueue(init("AA"));
    link.enqueue(init("BBB"));

    let (listener, first_frames) = first.await.unwrap();
    assert_eq!(first_frames.len(), 2);
    assert_eq!(first_frames[0]["command"], "init");
    assert_eq!(first_frames[0]["serial"], "AA");
    assert_eq!(first_frames[1]["serial"], "BBB");

    // After the drop the link reconnects and must re-assert both serials
    // before anything newer drains.
    let second = tokio::spawn(serve_one(listener, 3));
    tokio::time::sleep(Duration::from_millis(1500)).await;
    link.enqueue(DeviceUpdate::Delete { serial: "AA".into() });

    let (_listener, frames) = second.await.unwrap();
    assert_eq!(frames.len(), 3);

    let mut replayed: Vec<(String, String)> = frames[..2]
        .iter()
        .map(|f| {
            (
                f["command"].as_str().unwrap().to_string(),
                f["serial"].as_str().unwrap().to_string(),
            )
        })
        .collect();
    replayed.sort();
    assert_eq!(
        replayed,
        vec![
            ("init".to_string(), "AA".to_string()),
            ("init".to_string(), "BBB".to_string()),
        ]
    );
    assert_eq!(frames[2]["command"], "delete");
    assert_eq!(frames[2]["serial"], "AA");

    link.drain(Duration::from_secs(2)).await;
}
