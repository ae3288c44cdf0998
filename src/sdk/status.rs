use crate::error::LastError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    /// Connecting for the first time or waiting to reconnect.
    Connecting,
    Connected,
    /// A fatal error ended the session; `start()` may be called again.
    Error,
    /// Stopped by the host.
    Terminated,
}

/// Observable session state, published on every change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub state: ConnectionState,
    pub connected: bool,
    /// Microphone audio is currently being transmitted.
    pub listening: bool,
    /// Model audio is currently playing.
    pub speaking: bool,
    pub muted: bool,
    pub pending_external_calls: usize,
    pub reconnect_attempts: u32,
    pub last_error: Option<LastError>,
}
