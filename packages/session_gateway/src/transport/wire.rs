//! What browsers see on the wire.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;

use crate::transport::framing;
use crate::update_cache::Update;

/// Text notices sent to clients alongside updates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notice {
    Connected,
    Disconnected { exit_code: Option<i32> },
    Reload,
    Clipboard(String),
    Terminal(String),
    PrintJob(String),
    Ack(i64),
}

impl Notice {
    pub fn to_wire(&self) -> String {
        match self {
            Notice::Connected => "connected".to_string(),
            Notice::Disconnected { exit_code } => match exit_code {
                Some(code) => format!("disconnected|{code}"),
                None => "disconnected|".to_string(),
            },
            Notice::Reload => "reload".to_string(),
            Notice::Clipboard(text) => format!("clipboard|{text}"),
            Notice::Terminal(text) => format!("term|{text}"),
            Notice::PrintJob(name) => format!("printjob|{name}"),
            Notice::Ack(timestamp) => format!("ack|{timestamp}"),
        }
    }

    /// Name used as the event type on event streams.
    pub fn event_name(&self) -> &'static str {
        match self {
            Notice::Connected => "connected",
            Notice::Disconnected { .. } => "disconnected",
            Notice::Reload => "reload",
            Notice::Clipboard(_) => "clipboard",
            Notice::Terminal(_) => "term",
            Notice::PrintJob(_) => "printjob",
            Notice::Ack(_) => "ack",
        }
    }
}

/// `idx,posX,posY,width,height,format,quality,fullscreen,base64`
pub fn update_to_text(update: &Update) -> String {
    format!(
        "{},{},{},{},{},{},{},{},{}",
        update.idx,
        update.pos_x,
        update.pos_y,
        update.width,
        update.height,
        update.format.code(),
        update.quality,
        u8::from(update.fullscreen),
        STANDARD.encode(&update.data)
    )
}

pub fn update_to_binary(update: &Update) -> Bytes {
    framing::encode_indexed(update)
}

/// One inbound websocket message: `data&idx&latency&timestamp`.
///
/// Only `data` is required; the trailing fields are the client's progress
/// report and may be absent or empty.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SocketInput {
    pub data: String,
    pub last_idx: Option<u64>,
    pub latency_ms: Option<u64>,
    pub timestamp: Option<i64>,
}

impl SocketInput {
    pub fn parse(message: &str) -> Self {
        let mut parts = message.split('&');
        let data = parts.next().unwrap_or_default().to_string();
        let last_idx = parts.next().and_then(|s| s.parse().ok());
        let latency_ms = parts.next().and_then(|s| s.parse().ok());
        let timestamp = parts.next().and_then(|s| s.parse().ok());
        Self {
            data,
            last_idx,
            latency_ms,
            timestamp,
        }
    }
}
