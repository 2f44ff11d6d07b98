//! Device lifecycle core for the mobile device provider agent.
//!
//! A long-running host-side process discovers locally attached Android and
//! iOS devices, prepares each one for remote automation and mirrors the live
//! device table to an upstream platform. The pieces compose as follows: the
//! platform trackers ([`registry::android_tracker`], [`registry::ios_tracker`])
//! turn noisy attach/detach streams into supervisor lifecycles, each
//! [`supervisor::ManagedDevice`] runs its preparation pipeline and stays under
//! health probing, and every state change is announced over the
//! [`heartbeat::HeartbeatLink`].

use serde::{Deserialize, Serialize};

pub mod adb;
pub mod error;
pub mod heartbeat;
pub mod nal;
pub mod pipe;
pub mod ports;
pub mod registry;
pub mod scrcpy;
pub mod supervisor;
pub mod usbmux;
pub mod utils;
pub mod vendor;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use error::{ErrorKind, ProviderError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Android,
    Ios,
}

impl Platform {
    /// Directory name used for platform-scoped persisted state.
    pub fn dir_name(self) -> &'static str {
        match self {
            Platform::Android => "android",
            Platform::Ios => "apple",
        }
    }
}
