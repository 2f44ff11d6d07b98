//! The `sync:` file service, used to push helper artifacts idempotently.
//!
//! Requests are a four byte id followed by a little-endian `u32` length and
//! the payload. `STAT` answers with mode/size/mtime (all zero when the path
//! does not exist), `SEND` streams `DATA` chunks and is closed by `DONE`
//! carrying the modification time.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{AdbClient, AdbConnection};
use crate::{ProviderError, Result};

const DATA_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub mode: u32,
    pub size: u32,
    pub mtime: u32,
}

impl FileStat {
    pub fn exists(&self) -> bool {
        self.mode != 0 || self.size != 0 || self.mtime != 0
    }
}

pub struct SyncConnection {
    conn: AdbConnection,
}

impl AdbClient {
    pub async fn sync(&self, serial: &str) -> Result<SyncConnection> {
        let conn = self.transport(serial, "sync:").await?;
        Ok(SyncConnection { conn })
    }
}

impl SyncConnection {
    pub async fn stat(&mut self, path: &str) -> Result<FileStat> {
        self.send_request(b"STAT", path.as_bytes()).await?;
        let id = self.read_id().await?;
        if &id != b"STAT" {
            return Err(ProviderError::MalformedFrame(format!(
                "unexpected sync reply {:?}",
                String::from_utf8_lossy(&id)
            )));
        }
        Ok(FileStat {
            mode: self.read_u32().await?,
            size: self.read_u32().await?,
            mtime: self.read_u32().await?,
        })
    }

    /// Uploads `data` to `path` with the given mode.
    pub async fn push(&mut self, path: &str, mode: u32, data: &[u8]) -> Result<()> {
        let target = format!("{path},{mode}");
        self.send_request(b"SEND", target.as_bytes()).await?;

        for chunk in data.chunks(DATA_CHUNK) {
            self.send_request(b"DATA", chunk).await?;
        }

        let mtime = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        let stream = self.conn.stream_mut();
        stream.write_all(b"DONE").await?;
        stream.write_all(&mtime.to_le_bytes()).await?;

        let id = self.read_id().await?;
        match &id {
            b"OKAY" => {
                // OKAY still carries a (zero) length word.
                let _ = self.read_u32().await?;
                Ok(())
            }
            b"FAIL" => {
                let len = self.read_u32().await? as usize;
                let msg = self.conn.read_exactly(len).await?;
                Err(ProviderError::Adb(String::from_utf8_lossy(&msg).into_owned()))
            }
            other => Err(ProviderError::MalformedFrame(format!(
                "unexpected sync reply {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    /// Pushes only when the remote size or mode differ; returns whether a
    /// transfer happened.
    pub async fn push_if_different(
        &mut self,
        path: &str,
        mode: u32,
        data: &[u8],
    ) -> Result<bool> {
        let stat = self.stat(path).await?;
        if stat.exists() && stat.size as usize == data.len() && stat.mode & mode == mode {
            return Ok(false);
        }
        self.push(path, mode, data).await?;
        Ok(true)
    }

    pub async fn quit(mut self) -> Result<()> {
        self.send_request(b"QUIT", &[]).await?;
        Ok(())
    }

    async fn send_request(&mut self, id: &[u8; 4], payload: &[u8]) -> Result<()> {
        let stream = self.conn.stream_mut();
        stream.write_all(id).await?;
        stream.write_all(&(payload.len() as u32).to_le_bytes()).await?;
        if !payload.is_empty() {
            stream.write_all(payload).await?;
        }
        Ok(())
    }

    async fn read_id(&mut self) -> Result<[u8; 4]> {
        let mut id = [0u8; 4];
        self.conn
            .stream_mut()
            .read_exact(&mut id)
            .await
            .map_err(|_| ProviderError::AdbConnectionClosed)?;
        Ok(id)
    }

    async fn read_u32(&mut self) -> Result<u32> {
        let mut word = [0u8; 4];
        self.conn
            .stream_mut()
            .read_exact(&mut word)
            .await
            .map_err(|_| ProviderError::AdbConnectionClosed)?;
        Ok(u32::from_le_bytes(word))
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;

    use tokio::net::TcpListener;

    use super::*;

    /// Fake daemon accepting the transport + sync handshake, then statting
    /// every path as `mode`/`size`.
    async fn fake_sync_daemon(mode: u32, size: u32) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 512];

            // host:transport:<serial> then sync:
            let _ = sock.read(&mut buf).await.unwrap();
            sock.write_all(b"OKAY").await.unwrap();
            let _ = sock.read(&mut buf).await.unwrap();
            sock.write_all(b"OKAY").await.unwrap();

            loop {
                let mut id = [0u8; 4];
                if sock.read_exact(&mut id).await.is_err() {
                    break;
                }
                // The word after the id is a payload length, except for DONE
                // where it is the modification time.
                let mut word = [0u8; 4];
                sock.read_exact(&mut word).await.unwrap();
                if &id == b"DONE" {
                    sock.write_all(b"OKAY").await.unwrap();
                    sock.write_all(&0u32.to_le_bytes()).await.unwrap();
                    continue;
                }
                let len = u32::from_le_bytes(word) as usize;
                let mut payload = vec![0u8; len];
                if len > 0 {
                    sock.read_exact(&mut payload).await.unwrap();
                }
                if &id == b"STAT" {
                    sock.write_all(b"STAT").await.unwrap();
                    sock.write_all(&mode.to_le_bytes()).await.unwrap();
                    sock.write_all(&size.to_le_bytes()).await.unwrap();
                    sock.write_all(&1u32.to_le_bytes()).await.unwrap();
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn second_push_is_skipped_when_size_and_mode_match() {
        let addr = fake_sync_daemon(0o100755, 4).await;
        let mut sync = AdbClient::new(addr).sync("AAA").await.unwrap();
        let pushed = sync
            .push_if_different("/data/local/tmp/agent", 0o755, b"abcd")
            .await
            .unwrap();
        assert!(!pushed);
    }

    #[tokio::test]
    async fn differing_size_triggers_a_push() {
        let addr = fake_sync_daemon(0o100755, 3).await;
        let mut sync = AdbClient::new(addr).sync("AAA").await.unwrap();
        let pushed = sync
            .push_if_different("/data/local/tmp/agent", 0o755, b"abcd")
            .await
            .unwrap();
        assert!(pushed);
    }
}
