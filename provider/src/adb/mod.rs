//! Client side of the debug bridge wire protocol.
//!
//! Every command is framed as a four character hexadecimal length followed by
//! the ASCII payload; every reply starts with a four byte `OKAY`/`FAIL`
//! status. `FAIL` carries a length-prefixed error string which is surfaced as
//! [`ProviderError::Adb`].

use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use crate::{ProviderError, Result};

pub mod sync;

pub const DEFAULT_PORT: u16 = 5037;

/// One entry of the daemon's device table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceItem {
    pub serial: String,
    pub status: String,
}

/// Lifecycle event emitted by the device trackers. `status` is only carried
/// for Android devices; an event with `present == false` means removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEvent {
    pub present: bool,
    pub serial: String,
    pub status: Option<String>,
}

/// A forward rule owned by the adb daemon. Existing rules are reused before
/// new local ports are allocated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRule {
    pub serial: String,
    pub local: String,
    pub remote: String,
}

/// A single framed connection to the daemon.
pub struct AdbConnection {
    stream: TcpStream,
}

impl AdbConnection {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self { stream })
    }

    pub async fn send_cmd(&mut self, cmd: &str) -> Result<()> {
        let framed = format!("{:04x}{}", cmd.len(), cmd);
        self.stream.write_all(framed.as_bytes()).await?;
        Ok(())
    }

    pub async fn read_exactly(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        self.stream
            .read_exact(&mut buf)
            .await
            .map_err(|_| ProviderError::AdbConnectionClosed)?;
        Ok(buf)
    }

    /// Reads a `%04x` length prefix followed by that many bytes.
    pub async fn read_string(&mut self) -> Result<String> {
        let len_hex = self.read_exactly(4).await?;
        let len_hex = std::str::from_utf8(&len_hex)
            .map_err(|_| ProviderError::MalformedFrame("non-ascii length prefix".into()))?;
        let len = usize::from_str_radix(len_hex, 16).map_err(|_| {
            ProviderError::MalformedFrame(format!("bad length prefix {len_hex:?}"))
        })?;
        let payload = self.read_exactly(len).await?;
        String::from_utf8(payload)
            .map_err(|_| ProviderError::MalformedFrame("non-utf8 payload".into()))
    }

    pub async fn check_okay(&mut self) -> Result<()> {
        let status = self.read_exactly(4).await?;
        match &status[..] {
            b"OKAY" => Ok(()),
            b"FAIL" => Err(ProviderError::Adb(self.read_string().await?)),
            other => Err(ProviderError::MalformedFrame(format!(
                "unknown reply status {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    pub async fn read_to_end_string(&mut self) -> Result<String> {
        let mut out = Vec::new();
        self.stream.read_to_end(&mut out).await?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    pub fn into_inner(self) -> TcpStream {
        self.stream
    }

    pub(crate) fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }
}

/// Entry point for everything spoken over the daemon socket.
#[derive(Debug, Clone)]
pub struct AdbClient {
    addr: SocketAddr,
}

impl Default for AdbClient {
    fn default() -> Self {
        Self::new(SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::LOCALHOST,
            DEFAULT_PORT,
        )))
    }
}

impl AdbClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    pub async fn connect(&self) -> Result<AdbConnection> {
        AdbConnection::connect(self.addr).await
    }

    pub async fn server_version(&self) -> Result<u32> {
        let mut conn = self.connect().await?;
        conn.send_cmd("host:version").await?;
        conn.check_okay().await?;
        let version = conn.read_string().await?;
        u32::from_str_radix(&version, 16)
            .map_err(|_| ProviderError::MalformedFrame(format!("bad version {version:?}")))
    }

    /// Runs a shell command to completion and returns its combined output.
    pub async fn shell(&self, serial: &str, command: &str) -> Result<String> {
        let mut conn = self.transport(serial, &format!("shell:{command}")).await?;
        conn.read_to_end_string().await
    }

    /// Opens a shell service and hands back the live connection; used for
    /// on-device servers which must keep running (agent, screen capture).
    pub async fn shell_stream(&self, serial: &str, command: &str) -> Result<AdbConnection> {
        self.transport(serial, &format!("shell:{command}")).await
    }

    /// Connects a device-side service (e.g. `localabstract:scrcpy`) through
    /// `host:transport:<serial>`.
    pub async fn transport(&self, serial: &str, service: &str) -> Result<AdbConnection> {
        let mut conn = self.connect().await?;
        conn.send_cmd(&format!("host:transport:{serial}")).await?;
        conn.check_okay().await?;
        conn.send_cmd(service).await?;
        conn.check_okay().await?;
        Ok(conn)
    }

    pub async fn forward_list(&self) -> Result<Vec<ForwardRule>> {
        let mut conn = self.connect().await?;
        conn.send_cmd("host:list-forward").await?;
        conn.check_okay().await?;
        let content = conn.read_string().await?;
        Ok(content
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                match (parts.next(), parts.next(), parts.next(), parts.next()) {
                    (Some(serial), Some(local), Some(remote), None) => Some(ForwardRule {
                        serial: serial.to_string(),
                        local: local.to_string(),
                        remote: remote.to_string(),
                    }),
                    _ => None,
                }
            })
            .collect())
    }

    pub async fn forward(
        &self,
        serial: &str,
        local: &str,
        remote: &str,
        norebind: bool,
    ) -> Result<()> {
        let mut conn = self.connect().await?;
        let mut cmd = format!("host-serial:{serial}:forward");
        if norebind {
            cmd.push_str(":norebind");
        }
        cmd.push_str(&format!(":{local};{remote}"));
        conn.send_cmd(&cmd).await?;
        conn.check_okay().await?;
        Ok(())
    }

    /// Converts the daemon's `host:track-devices` stream into idempotent
    /// lifecycle events, invoking `emit` for every transition.
    ///
    /// `statuses` filters the table before diffing (empty keeps everything).
    /// On connection loss every previously present device is emitted as
    /// removed, the local daemon is restarted and the stream reconnects after
    /// a one second backoff.
    pub async fn track_devices(
        &self,
        statuses: &[&str],
        mut emit: impl FnMut(DeviceEvent),
    ) -> Result<()> {
        let mut known: Vec<DeviceItem> = Vec::new();
        loop {
            match self.track_devices_once(statuses, &mut known, &mut emit).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    for event in diff_devices(&known, &[]) {
                        emit(event);
                    }
                    known.clear();

                    let backoff = Duration::from_secs(1);
                    log::info!("adb connection is down ({}), retry after {:?}", e, backoff);
                    tokio::time::sleep(backoff).await;

                    let _ = tokio::process::Command::new("adb")
                        .arg("start-server")
                        .status()
                        .await;
                    match self.server_version().await {
                        Ok(version) => log::info!("adb server started, version: {}", version),
                        Err(e) => log::warn!("adb server not reachable yet: {}", e),
                    }
                }
            }
        }
    }

    async fn track_devices_once(
        &self,
        statuses: &[&str],
        known: &mut Vec<DeviceItem>,
        emit: &mut impl FnMut(DeviceEvent),
    ) -> Result<()> {
        let mut conn = self.connect().await?;
        conn.send_cmd("host:track-devices").await?;
        conn.check_okay().await?;
        loop {
            let content = conn.read_string().await?;
            let current = parse_device_list(&content, statuses);
            for event in diff_devices(known, &current) {
                emit(event);
            }
            *known = current;
        }
    }
}

/// Parses an `adb devices` style table (`serial\tstatus` per line), keeping
/// only the given statuses when the filter is non-empty.
pub fn parse_device_list(output: &str, statuses: &[&str]) -> Vec<DeviceItem> {
    output
        .lines()
        .filter_map(|line| {
            let (serial, status) = line.trim().split_once('\t')?;
            if !statuses.is_empty() && !statuses.contains(&status) {
                return None;
            }
            Some(DeviceItem {
                serial: serial.to_string(),
                status: status.to_string(),
            })
        })
        .collect()
}

/// Set difference on `(serial, status)` between two snapshots, removals first.
/// A device flipping status therefore shows up as one removal and one add.
pub fn diff_devices(previous: &[DeviceItem], current: &[DeviceItem]) -> Vec<DeviceEvent> {
    let mut events = Vec::new();
    for item in previous.iter().filter(|d| !current.contains(d)) {
        events.push(DeviceEvent {
            present: false,
            serial: item.serial.clone(),
            status: Some(item.status.clone()),
        });
    }
    for item in current.iter().filter(|d| !previous.contains(d)) {
        events.push(DeviceEvent {
            present: true,
            serial: item.serial.clone(),
            status: Some(item.status.clone()),
        });
    }
    events
}

#[cfg(test)]
mod test {
    use tokio::net::TcpListener;

    use super::*;

    fn item(serial: &str, status: &str) -> DeviceItem {
        DeviceItem {
            serial: serial.to_string(),
            status: status.to_string(),
        }
    }

    #[test]
    fn parses_device_table() {
        let parsed = parse_device_list("AAA\tdevice\nBBB\toffline\nmalformed\n", &[]);
        assert_eq!(parsed, vec![item("AAA", "device"), item("BBB", "offline")]);

        let filtered = parse_device_list("AAA\tdevice\nBBB\toffline\n", &["device"]);
        assert_eq!(filtered, vec![item("AAA", "device")]);
    }

    #[test]
    fn diff_emits_removals_first() {
        let events = diff_devices(&[item("AAA", "device")], &[item("BBB", "device")]);
        assert_eq!(events.len(), 2);
        assert!(!events[0].present);
        assert_eq!(events[0].serial, "AAA");
        assert!(events[1].present);
        assert_eq!(events[1].serial, "BBB");
    }

    #[test]
    fn status_flip_is_remove_then_add() {
        let events = diff_devices(&[item("AAA", "offline")], &[item("AAA", "device")]);
        assert_eq!(events.len(), 2);
        assert_eq!(
            (events[0].present, events[0].status.as_deref()),
            (false, Some("offline"))
        );
        assert_eq!(
            (events[1].present, events[1].status.as_deref()),
            (true, Some("device"))
        );
    }

    async fn fake_daemon(replies: Vec<Vec<u8>>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            // Swallow the request frame, then play back the scripted replies.
            let mut buf = [0u8; 256];
            let _ = sock.read(&mut buf).await;
            for reply in replies {
                sock.write_all(&reply).await.unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn command_roundtrip_decodes_version() {
        let addr = fake_daemon(vec![b"OKAY0004001d".to_vec()]).await;
        let version = AdbClient::new(addr).server_version().await.unwrap();
        assert_eq!(version, 29);
    }

    #[tokio::test]
    async fn fail_reply_surfaces_error_string() {
        let addr = fake_daemon(vec![b"FAIL000edevice offline".to_vec()]).await;
        match AdbClient::new(addr).server_version().await {
            Err(ProviderError::Adb(msg)) => assert_eq!(msg, "device offline"),
            other => panic!("expected adb error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn length_mismatch_is_a_decode_error() {
        // Length prefix promises 8 bytes but the stream closes after 4.
        let addr = fake_daemon(vec![b"OKAY0008001d".to_vec()]).await;
        match AdbClient::new(addr).server_version().await {
            Err(ProviderError::AdbConnectionClosed) => {}
            other => panic!("expected closed connection, got {other:?}"),
        }
    }
}
