//! # Session Wire Protocol
//!
//! One JSON object per line in each direction. Client messages are tagged by
//! `messageType`; an empty object `{}` is a ping and is answered with `{}`.
//!
//! ```text
//! -> {"messageType":"hello","uaid":"...","use_webpush":true}
//! <- {"messageType":"hello","uaid":"...","status":200,"use_webpush":true}
//! -> {"messageType":"register","channelID":"..."}
//! <- {"messageType":"register","channelID":"...","status":200,"pushEndpoint":"..."}
//! <- {"messageType":"notification","channelID":"...","version":"7","ttl":60,"data":"aGk"}
//! -> {"messageType":"ack","updates":[{"channelID":"...","version":"7"}]}
//! -> {}
//! <- {}
//! ```

use crate::constants::message_types;
use crate::error::{RelayError, RelayResult};
use crate::models::Notification;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Frames longer than this are rejected as malformed.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckUpdate {
    #[serde(rename = "channelID")]
    pub channel_id: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u32>,
}

/// Messages a client may send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "messageType", rename_all = "lowercase")]
pub enum ClientMessage {
    Hello {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        uaid: Option<String>,
        #[serde(default)]
        use_webpush: bool,
    },
    Register {
        #[serde(rename = "channelID")]
        channel_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<String>,
    },
    Unregister {
        #[serde(rename = "channelID")]
        channel_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<u32>,
    },
    Ack {
        updates: Vec<AckUpdate>,
    },
    Nack {
        version: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<u32>,
    },
    /// Serialized as `{}`, never with a `messageType`.
    #[serde(skip)]
    Ping,
}

impl ClientMessage {
    /// Decode one frame.
    pub fn parse(frame: &str) -> RelayResult<Self> {
        let value: Value = serde_json::from_str(frame)
            .map_err(|e| RelayError::MalformedClientMessage(format!("invalid JSON: {e}")))?;
        match &value {
            Value::Object(map) if map.is_empty() => return Ok(Self::Ping),
            Value::Object(_) => {}
            _ => {
                return Err(RelayError::MalformedClientMessage(
                    "frame is not a JSON object".to_string(),
                ))
            }
        }
        serde_json::from_value(value).map_err(|e| RelayError::MalformedClientMessage(e.to_string()))
    }

    /// Encode one frame (used by clients and tests).
    pub fn to_frame(&self) -> String {
        match self {
            Self::Ping => "{}".to_string(),
            other => serde_json::to_string(other).unwrap_or_else(|_| "{}".to_string()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => message_types::HELLO,
            Self::Register { .. } => message_types::REGISTER,
            Self::Unregister { .. } => message_types::UNREGISTER,
            Self::Ack { .. } => message_types::ACK,
            Self::Nack { .. } => message_types::NACK,
            Self::Ping => message_types::PING,
        }
    }
}

/// Messages the relay sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "messageType", rename_all = "lowercase")]
pub enum ServerMessage {
    Hello {
        uaid: String,
        status: u16,
        use_webpush: bool,
    },
    Register {
        #[serde(rename = "channelID")]
        channel_id: String,
        status: u16,
        #[serde(rename = "pushEndpoint", default)]
        push_endpoint: String,
    },
    Unregister {
        #[serde(rename = "channelID")]
        channel_id: String,
        status: u16,
    },
    Notification {
        #[serde(rename = "channelID")]
        channel_id: String,
        version: String,
        ttl: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
    },
    /// Serialized as `{}`.
    #[serde(skip)]
    Ping,
}

impl ServerMessage {
    pub fn notification(notification: &Notification, now: DateTime<Utc>) -> Self {
        let data = if notification.payload.is_empty() {
            None
        } else {
            Some(URL_SAFE_NO_PAD.encode(&notification.payload))
        };
        Self::Notification {
            channel_id: notification.channel_id.to_string(),
            version: notification.version(),
            ttl: notification.remaining_ttl(now),
            data,
        }
    }

    pub fn to_frame(&self) -> RelayResult<String> {
        match self {
            Self::Ping => Ok("{}".to_string()),
            other => serde_json::to_string(other)
                .map_err(|e| RelayError::Transport(format!("encode failed: {e}"))),
        }
    }

    /// Decode one frame (used by clients and tests).
    pub fn parse(frame: &str) -> RelayResult<Self> {
        let value: Value = serde_json::from_str(frame)
            .map_err(|e| RelayError::Transport(format!("invalid JSON: {e}")))?;
        if matches!(&value, Value::Object(map) if map.is_empty()) {
            return Ok(Self::Ping);
        }
        serde_json::from_value(value).map_err(|e| RelayError::Transport(e.to_string()))
    }

    /// Payload bytes of a notification frame.
    pub fn decoded_data(&self) -> Option<Vec<u8>> {
        match self {
            Self::Notification { data: Some(data), .. } => URL_SAFE_NO_PAD.decode(data).ok(),
            Self::Notification { data: None, .. } => Some(Vec::new()),
            _ => None,
        }
    }
}

/// Outcome of reading one frame.
pub type InboundFrame = RelayResult<ClientMessage>;

/// Read frames on a dedicated task so the session loop only ever waits on a
/// channel. The channel closes at end of stream or after the first error.
pub fn spawn_reader<R>(reader: R, capacity: usize) -> (mpsc::Receiver<InboundFrame>, JoinHandle<()>)
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let handle = tokio::spawn(async move {
        let mut reader = reader;
        let mut buf = Vec::with_capacity(1024);
        let limit = MAX_FRAME_BYTES as u64 + 1;
        loop {
            buf.clear();
            let frame = match (&mut reader).take(limit).read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => match decode_line(&buf) {
                    Some(frame) => frame,
                    None => continue,
                },
                Err(e) => Err(RelayError::from(e)),
            };
            let fatal = frame.is_err();
            if tx.send(frame).await.is_err() || fatal {
                break;
            }
        }
    });
    (rx, handle)
}

/// Decode one raw line. `None` for blank keep-alive lines.
fn decode_line(raw: &[u8]) -> Option<InboundFrame> {
    let body = raw.strip_suffix(b"\n").unwrap_or(raw);
    if body.len() > MAX_FRAME_BYTES {
        return Some(Err(RelayError::MalformedClientMessage(format!(
            "frame exceeds {MAX_FRAME_BYTES} bytes"
        ))));
    }
    let text = match std::str::from_utf8(body) {
        Ok(text) => text.trim(),
        Err(e) => {
            return Some(Err(RelayError::MalformedClientMessage(format!(
                "frame is not UTF-8: {e}"
            ))))
        }
    };
    if text.is_empty() {
        None
    } else {
        Some(ClientMessage::parse(text))
    }
}

/// Line-oriented frame writer.
pub struct MessageWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn send(&mut self, message: &ServerMessage) -> RelayResult<()> {
        let mut frame = message.to_frame()?;
        frame.push('\n');
        self.inner.write_all(frame.as_bytes()).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn close(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}
