//! Screen-capture client.
//!
//! Deploys the on-device capture server, speaks its two-socket framing
//! protocol, fans the NAL-delimited video stream out to WebSocket
//! subscribers and owns the control socket used for input injection.

use std::{
    sync::{Arc, RwLock},
    time::Duration,
};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    net::{TcpListener, TcpStream},
    sync::{broadcast, Mutex},
};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::codec::FramedRead;

use crate::{
    adb::{AdbClient, AdbConnection},
    nal::{self, NalCodec, SpsInfo},
    utils::OwnedJoinHandle,
    ProviderError, Result,
};

mod control;
pub use control::{ControlMessage, InputController, MotionAction};

const SERVER_VERSION: &str = "1.24";
const SERVER_PATH: &str = "/data/local/tmp/scrcpy-server";
const SOCKET_NAME: &str = "localabstract:scrcpy";

const CONNECT_ATTEMPTS: u32 = 300;
const CONNECT_RETRY: Duration = Duration::from_millis(10);

const FRAME_BACKLOG: usize = 256;

#[derive(Debug, Clone, Copy)]
pub struct ScrcpyOptions {
    pub max_size: u32,
    pub bit_rate: u32,
    pub max_fps: u32,
}

impl Default for ScrcpyOptions {
    fn default() -> Self {
        Self { max_size: 720, bit_rate: 1_280_000, max_fps: 25 }
    }
}

impl ScrcpyOptions {
    /// The launch line executed through a held-open shell stream. The
    /// capture server exits when that stream (or its sockets) close.
    fn launch_command(&self) -> String {
        format!(
            "CLASSPATH={SERVER_PATH} app_process / com.genymobile.scrcpy.Server {SERVER_VERSION} \
             log_level=info max_size={} bit_rate={} max_fps={} lock_video_orientation=-1 \
             tunnel_forward=true control=true display_id=0 show_touches=true stay_awake=false \
             codec_options=profile=1,level=2 encoder_name=OMX.google.h264.encoder \
             power_off_on_close=false clipboard_autosync=false downsize_on_error=true \
             cleanup=true power_on=true send_device_meta=true send_frame_meta=false \
             send_dummy_byte=true raw_video_stream=false",
            self.max_size, self.bit_rate, self.max_fps
        )
    }
}

/// Write access to the control socket, serialized under a per-device mutex so
/// concurrent injections can never interleave their bytes.
#[derive(Clone)]
pub struct ControlHandle {
    socket: Arc<Mutex<TcpStream>>,
    resolution: Arc<RwLock<(u16, u16)>>,
}

impl ControlHandle {
    pub fn resolution(&self) -> (u16, u16) {
        *self.resolution.read().unwrap()
    }

    pub async fn write_frame(&self, frame: Bytes) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        let mut socket = self.socket.lock().await;
        socket.write_all(&frame).await?;
        Ok(())
    }

    /// Discards any pending device-to-host bytes on the control socket,
    /// returning as soon as a read times out.
    pub async fn drain(&self) -> Result<()> {
        let mut socket = self.socket.lock().await;
        let mut buf = [0u8; 4096];
        for _ in 0..10 {
            match tokio::time::timeout(Duration::from_millis(20), socket.read(&mut buf)).await {
                Ok(Ok(0)) => return Err(ProviderError::StreamClosed),
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => break,
            }
        }
        Ok(())
    }
}

/// A live capture session: the deploy shell, both device sockets and the
/// video pump task.
pub struct ScrcpyClient {
    pub device_name: String,
    resolution: Arc<RwLock<(u16, u16)>>,
    frames: broadcast::Sender<Bytes>,
    control: ControlHandle,
    video_task: OwnedJoinHandle<()>,
    // Held so the on-device server lives as long as the session.
    _deploy: AdbConnection,
}

impl ScrcpyClient {
    pub async fn start(adb: &AdbClient, serial: &str, options: ScrcpyOptions) -> Result<Self> {
        let deploy = adb.shell_stream(serial, &options.launch_command()).await?;

        let mut video = Self::connect_socket(adb, serial).await?;
        let dummy = video.read_exactly(1).await?;
        if dummy != [0u8] {
            return Err(ProviderError::MalformedFrame("missing dummy byte".into()));
        }
        let control = Self::connect_socket(adb, serial).await?;

        let name_raw = video.read_exactly(64).await?;
        let device_name = String::from_utf8_lossy(&name_raw)
            .trim_end_matches('\0')
            .to_string();
        if device_name.is_empty() {
            return Err(ProviderError::MalformedFrame("missing device name".into()));
        }
        let dims = video.read_exactly(4).await?;
        let width = u16::from_be_bytes([dims[0], dims[1]]);
        let height = u16::from_be_bytes([dims[2], dims[3]]);

        log::info!("[{}] capture started: {} {}x{}", serial, device_name, width, height);

        let resolution = Arc::new(RwLock::new((width, height)));
        let (frames, _) = broadcast::channel(FRAME_BACKLOG);
        let video_task = spawn_video_pump(
            video.into_inner(),
            resolution.clone(),
            frames.clone(),
            serial.to_string(),
        );

        let control = ControlHandle {
            socket: Arc::new(Mutex::new(control.into_inner())),
            resolution: resolution.clone(),
        };

        Ok(Self {
            device_name,
            resolution,
            frames,
            control,
            video_task,
            _deploy: deploy,
        })
    }

    async fn connect_socket(adb: &AdbClient, serial: &str) -> Result<AdbConnection> {
        for _ in 0..CONNECT_ATTEMPTS {
            if let Ok(conn) = adb.transport(serial, SOCKET_NAME).await {
                return Ok(conn);
            }
            tokio::time::sleep(CONNECT_RETRY).await;
        }
        Err(ProviderError::NotReady(CONNECT_RETRY * CONNECT_ATTEMPTS))
    }

    pub fn resolution(&self) -> (u16, u16) {
        *self.resolution.read().unwrap()
    }

    /// New subscribers join at the next frame boundary; there is no replay.
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.frames.subscribe()
    }

    pub fn controller(&self) -> InputController {
        InputController::new(self.control.clone())
    }

    pub fn control_handle(&self) -> ControlHandle {
        self.control.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.video_task.is_finished()
    }
}

/// Applies an SPS-decoded size onto the previously reported resolution:
/// the longer side becomes the landscape width when the new frame is wider
/// than tall.
pub fn reorient(previous: (u16, u16), sps: SpsInfo) -> (u16, u16) {
    let lo = previous.0.min(previous.1);
    let hi = previous.0.max(previous.1);
    if sps.width > sps.height {
        (hi, lo)
    } else {
        (lo, hi)
    }
}

fn spawn_video_pump<R>(
    reader: R,
    resolution: Arc<RwLock<(u16, u16)>>,
    frames: broadcast::Sender<Bytes>,
    serial: String,
) -> OwnedJoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    OwnedJoinHandle::new(tokio::spawn(async move {
        let mut stream = FramedRead::new(reader, NalCodec::default());
        while let Some(frame) = stream.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    log::info!("[{}] video stream error: {}", serial, e);
                    break;
                }
            };

            if nal::nal_type(&frame) == Some(nal::NAL_TYPE_SPS) {
                match nal::parse_sps(&frame[5..]) {
                    Ok(sps) => {
                        let mut res = resolution.write().unwrap();
                        let updated = reorient(*res, sps);
                        if *res != updated {
                            log::info!(
                                "[{}] resolution change: {}x{} -> {}x{}",
                                serial, res.0, res.1, updated.0, updated.1
                            );
                        }
                        *res = updated;
                    }
                    Err(e) => log::debug!("[{}] undecodable sps: {}", serial, e),
                }
            }

            // No subscribers is fine; frames are simply dropped.
            let _ = frames.send(frame);
        }
        log::info!("[{}] video stream closed", serial);
    }))
}

/// Per-device WebSocket endpoint streaming video frames out and accepting
/// JSON control messages in. The capture session starts lazily with the
/// first subscriber and is restarted if its stream died.
pub struct ScreenProxy {
    port: u16,
    _task: OwnedJoinHandle<()>,
}

struct ProxyShared {
    serial: String,
    adb: AdbClient,
    options: ScrcpyOptions,
    session: Mutex<Option<ScrcpyClient>>,
}

impl ScreenProxy {
    pub async fn start(
        port: u16,
        serial: String,
        adb: AdbClient,
        options: ScrcpyOptions,
    ) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let shared = Arc::new(ProxyShared {
            serial,
            adb,
            options,
            session: Mutex::new(None),
        });

        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        log::debug!("[{}] screen subscriber {}", shared.serial, peer);
                        tokio::spawn(subscriber_session(shared.clone(), stream));
                    }
                    Err(e) => {
                        log::warn!("screen listener accept error: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        })
        .into();

        Ok(Self { port, _task: task })
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

async fn subscriber_session(shared: Arc<ProxyShared>, stream: TcpStream) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            log::debug!("[{}] websocket handshake failed: {}", shared.serial, e);
            return;
        }
    };

    // Start (or restart) the capture session under the per-device lock.
    let (frames, controller) = {
        let mut session = shared.session.lock().await;
        if session.as_ref().map(|s| s.is_finished()).unwrap_or(true) {
            *session = None;
            match ScrcpyClient::start(&shared.adb, &shared.serial, shared.options).await {
                Ok(client) => *session = Some(client),
                Err(e) => {
                    log::warn!("[{}] capture start failed: {}", shared.serial, e);
                    return;
                }
            }
        }
        let client = session.as_ref().unwrap();
        (client.subscribe(), client.controller())
    };

    let (mut tx, mut rx) = ws.split();
    let mut frames = frames;
    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Ok(frame) => {
                    if tx.send(Message::Binary(frame.to_vec())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("[{}] subscriber lagging, {} frames dropped", shared.serial, n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            inbound = rx.next() => match inbound {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ControlMessage>(&text) {
                    Ok(message) => {
                        if let Err(e) = controller.dispatch(message).await {
                            log::debug!("[{}] input dispatch failed: {}", shared.serial, e);
                        }
                    }
                    Err(e) => log::debug!("[{}] bad control message: {}", shared.serial, e),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
        }
    }
}

#[cfg(test)]
mod test {
    use tokio::io::AsyncWriteExt;

    use super::*;

    #[test]
    fn sps_reorients_against_previous_resolution() {
        // Landscape SPS flips a portrait resolution.
        let flipped = reorient((720, 1280), SpsInfo { width: 1280, height: 720 });
        assert_eq!(flipped, (1280, 720));

        // Portrait SPS keeps it portrait.
        let kept = reorient((720, 1280), SpsInfo { width: 720, height: 1280 });
        assert_eq!(kept, (720, 1280));

        // And flips back from landscape.
        let back = reorient((1280, 720), SpsInfo { width: 544, height: 960 });
        assert_eq!(back, (720, 1280));
    }

    #[tokio::test]
    async fn concurrent_touches_never_interleave() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let client = TcpStream::connect(addr).await.unwrap();
        let mut device_side = accept.await.unwrap();

        let resolution = Arc::new(RwLock::new((720u16, 1280u16)));
        let handle = ControlHandle {
            socket: Arc::new(Mutex::new(client)),
            resolution: resolution.clone(),
        };
        let controller = InputController::new(handle);

        let count = 16usize;
        let tasks: Vec<_> = (0..count)
            .map(|i| {
                let controller = controller.clone();
                tokio::spawn(async move {
                    let x = i as f64 / 16.0;
                    controller.touch(x, 0.5, MotionAction::Move).await.unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        use tokio::io::AsyncReadExt;
        let mut buf = vec![0u8; count * 28];
        device_side.read_exact(&mut buf).await.unwrap();

        // Every 28-byte window must be exactly one of the encoded messages:
        // interleaved writes would tear the coordinate fields apart.
        let expected: Vec<Bytes> = (0..count)
            .map(|i| {
                control::touch_message(i as f64 / 16.0, 0.5, MotionAction::Move, (720, 1280))
            })
            .collect();
        let mut seen: Vec<&[u8]> = buf.chunks(28).collect();
        for message in &expected {
            let pos = seen
                .iter()
                .position(|chunk| *chunk == &message[..])
                .expect("message missing or torn");
            seen.remove(pos);
        }
        assert!(seen.is_empty());
    }

    #[tokio::test]
    async fn fan_out_survives_a_dropped_subscriber() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let resolution = Arc::new(RwLock::new((720u16, 1280u16)));
        let (frames, _) = broadcast::channel(16);
        let _pump = spawn_video_pump(reader, resolution, frames.clone(), "AAA".into());

        let mut keep = frames.subscribe();
        let drop_me = frames.subscribe();

        let first = [0u8, 0, 0, 1, 0x65, 0xaa];
        let second = [0u8, 0, 0, 1, 0x41, 0xbb];
        let third = [0u8, 0, 0, 1, 0x41, 0xcc];
        writer.write_all(&first).await.unwrap();
        writer.write_all(&second).await.unwrap();

        // The first frame is only complete once the second start code shows.
        let got = keep.recv().await.unwrap();
        assert_eq!(&got[..], &first);

        drop(drop_me);
        writer.write_all(&third).await.unwrap();
        let got = keep.recv().await.unwrap();
        assert_eq!(&got[..], &second);

        drop(writer);
        let got = keep.recv().await.unwrap();
        assert_eq!(&got[..], &third);
    }
}
