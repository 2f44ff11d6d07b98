use std::{io, time::Duration};

use thiserror::Error;

/// Failure classes used to decide where an error is handled: transient errors
/// are retried by the operation that hit them, per-device errors abort that
/// device's preparation, infrastructure errors are retried forever with capped
/// backoff, and fatal errors exit the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    PerDevice,
    Infrastructure,
    Fatal,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    /// A `FAIL` reply from the debug bridge daemon, carrying its error string.
    #[error("adb: {0}")]
    Adb(String),

    #[error("adb connection closed")]
    AdbConnectionClosed,

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("no compatible abi in {0:?}")]
    NoCompatibleAbi(Vec<String>),

    #[error("helper process exited early: {0}")]
    HelperExited(String),

    #[error("install rejected: {0}")]
    InstallRejected(String),

    #[error("automation server not ready within {0:?}")]
    NotReady(Duration),

    #[error("port range {0}-{1} exhausted")]
    PortsExhausted(u16, u16),

    #[error("screen stream closed")]
    StreamClosed,

    #[error("platform link: {0}")]
    Heartbeat(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("http: {0}")]
    Http(#[from] hyper::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProviderError {
    pub fn kind(&self) -> ErrorKind {
        use ProviderError::*;
        match self {
            AdbConnectionClosed | StreamClosed => ErrorKind::Transient,
            Io(_) | Http(_) => ErrorKind::Transient,
            Adb(_) | MalformedFrame(_) | Json(_) => ErrorKind::PerDevice,
            NoCompatibleAbi(_) | HelperExited(_) | InstallRejected(_) | NotReady(_) => {
                ErrorKind::PerDevice
            }
            PortsExhausted(..) | Download(_) => ErrorKind::PerDevice,
            Heartbeat(_) => ErrorKind::Infrastructure,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ProviderError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ProviderError::Heartbeat(e.to_string())
    }
}

pub type Result<T, E = ProviderError> = std::result::Result<T, E>;
