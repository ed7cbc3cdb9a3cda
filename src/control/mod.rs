//! Control Channel: a reliable in-order JSON message bus piggybacked on a
//! WebRTC data channel (named `text`) or the WebSocket.
//!
//! A serde-tagged enum with `to_json`/`from_json` helpers and constructor
//! functions, kept to a plain `{type, data}` shape rather than a richer
//! per-variant field set.

use serde::{Deserialize, Serialize};

use crate::error::ControlChannelError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMsg {
    SendInput,
    FetchOutput { data: serde_json::Value },
    Stopword { data: String },
    Error { data: String },
    Warning { data: String },
    Log { data: String },
    PauseDetected,
    ResponseStarting,
    ConnectionTimeout,
}

impl ControlMsg {
    pub fn to_json(&self) -> Result<String, ControlChannelError> {
        serde_json::to_string(self).map_err(ControlChannelError::from)
    }

    pub fn from_json(text: &str) -> Result<Self, ControlChannelError> {
        serde_json::from_str(text).map_err(ControlChannelError::from)
    }

    pub fn error(message: impl Into<String>) -> Self {
        ControlMsg::Error { data: message.into() }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        ControlMsg::Warning { data: message.into() }
    }
}

/// A send endpoint abstracting over "WebRTC data channel" vs "WebSocket
/// text frame" so the core stays free of any specific transport type.
#[async_trait::async_trait]
pub trait ControlChannel: Send + Sync {
    async fn send(&self, msg: ControlMsg) -> Result<(), ControlChannelError>;
    fn is_open(&self) -> bool;
}

/// An in-memory channel implementation used by tests and as the backbone
/// for both the WebRTC-data-channel and WebSocket adapters, which each wrap
/// a `tokio::sync::mpsc::UnboundedSender<ControlMsg>` the same way.
pub struct MpscControlChannel {
    sender: tokio::sync::mpsc::UnboundedSender<ControlMsg>,
}

impl MpscControlChannel {
    pub fn new(sender: tokio::sync::mpsc::UnboundedSender<ControlMsg>) -> Self {
        Self { sender }
    }
}

#[async_trait::async_trait]
impl ControlChannel for MpscControlChannel {
    async fn send(&self, msg: ControlMsg) -> Result<(), ControlChannelError> {
        self.sender.send(msg).map_err(|_| ControlChannelError::NotOpen)
    }

    fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }
}
