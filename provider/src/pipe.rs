//! User-space TCP pipe forwarder.
//!
//! ADB forwards device ports to loopback only; the forwarder re-exposes such a
//! port on a bind-any address so the heartbeat can advertise it to remote
//! automation clients.

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
};

use crate::{utils::OwnedJoinHandle, Result};

/// Accepts on `0.0.0.0:local_port` and shuttles bytes to `127.0.0.1:target_port`
/// until either side closes. The listener task is aborted on drop.
#[derive(Debug)]
pub struct PortForwarder {
    local_port: u16,
    target_port: u16,
    task: OwnedJoinHandle<()>,
}

impl PortForwarder {
    pub async fn spawn(local_port: u16, target_port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", local_port)).await?;
        let task = tokio::spawn(accept_loop(listener, target_port)).into();
        Ok(Self { local_port, target_port, task })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn target_port(&self) -> u16 {
        self.target_port
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

async fn accept_loop(listener: TcpListener, target_port: u16) {
    loop {
        match listener.accept().await {
            Ok((client, peer)) => {
                log::trace!("pipe :{} accepted {}", target_port, peer);
                tokio::spawn(session(client, target_port));
            }
            Err(e) => {
                // Per-session failures must not take the listener down.
                log::warn!("pipe accept error: {}", e);
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

async fn session(client: TcpStream, target_port: u16) {
    let target = match TcpStream::connect(("127.0.0.1", target_port)).await {
        Ok(s) => s,
        Err(e) => {
            log::debug!("pipe dial 127.0.0.1:{} failed: {}", target_port, e);
            return;
        }
    };

    let (client_rx, client_tx) = client.into_split();
    let (target_rx, target_tx) = target.into_split();

    // Both sides close as soon as one direction ends: the losing copy loop is
    // dropped by the select, which drops its halves.
    tokio::select! {
        _ = copy(client_rx, target_tx) => {}
        _ = copy(target_rx, client_tx) => {}
    }
}

async fn copy(mut rx: OwnedReadHalf, mut tx: OwnedWriteHalf) {
    let mut buf = [0u8; 1024];
    loop {
        match rx.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = tx.shutdown().await;
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn shuttles_bytes_both_ways() {
        // Echo server standing in for the adb-forwarded loopback port.
        let echo = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let echo_port = echo.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (mut sock, _) = echo.accept().await.unwrap();
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    loop {
                        match sock.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => sock.write_all(&buf[..n]).await.unwrap(),
                        }
                    }
                });
            }
        });

        let local = crate::ports::PortAllocator::new(21700, 21750).get().unwrap();
        let fwd = PortForwarder::spawn(local, echo_port).await.unwrap();

        let mut conn = TcpStream::connect(("127.0.0.1", fwd.local_port())).await.unwrap();
        conn.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        conn.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ping");

        // A second concurrent session on the same forwarder.
        let mut conn2 = TcpStream::connect(("127.0.0.1", fwd.local_port())).await.unwrap();
        conn2.write_all(b"pong").await.unwrap();
        conn2.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");
    }
}
