//! WebSocket types shared by the codec, connections, router and channels

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for WebSocket connections, never reused within a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// RFC 6455 close status codes used by the server
pub struct CloseCode;

impl CloseCode {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const UNSUPPORTED_DATA: u16 = 1003;
    pub const NO_STATUS: u16 = 1005;
    pub const ABNORMAL: u16 = 1006;
    pub const INVALID_PAYLOAD: u16 = 1007;
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    pub const INTERNAL_ERROR: u16 = 1011;
    pub const TLS_HANDSHAKE: u16 = 1015;

    /// Whether a code may appear on the wire; 1005, 1006 and 1015 are reserved
    /// for local reporting only
    pub fn is_sendable(code: u16) -> bool {
        !matches!(code, Self::NO_STATUS | Self::ABNORMAL | Self::TLS_HANDSHAKE)
            && (1000..5000).contains(&code)
    }
}

/// Frame opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

/// Kind of a complete logical data message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    Text,
    Binary,
}

impl From<DataKind> for OpCode {
    fn from(kind: DataKind) -> Self {
        match kind {
            DataKind::Text => OpCode::Text,
            DataKind::Binary => OpCode::Binary,
        }
    }
}

/// One wire-level frame with its payload already unmasked
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(fin: bool, opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin,
            opcode,
            payload: payload.into(),
        }
    }

    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Text, payload)
    }

    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Binary, payload)
    }

    pub fn continuation(fin: bool, payload: impl Into<Bytes>) -> Self {
        Self::new(fin, OpCode::Continuation, payload)
    }

    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Ping, payload)
    }

    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Pong, payload)
    }

    /// Close frame carrying a status code and a reason truncated to fit the
    /// 125 byte control frame limit
    pub fn close(code: u16, reason: &str) -> Self {
        let mut cut = reason.len().min(123);
        while !reason.is_char_boundary(cut) {
            cut -= 1;
        }

        let mut payload = BytesMut::with_capacity(2 + cut);
        payload.put_u16(code);
        payload.put_slice(&reason.as_bytes()[..cut]);
        Self::new(true, OpCode::Close, payload.freeze())
    }
}

/// Status carried by a close frame
#[derive(Debug, Clone, PartialEq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

impl CloseFrame {
    /// Parse a close frame body; an empty body means no status was given
    pub fn parse(payload: &[u8]) -> WebSocketResult<Option<Self>> {
        match payload.len() {
            0 => Ok(None),
            1 => Err(WebSocketError::Protocol(
                "close frame body of one byte".to_string(),
            )),
            _ => {
                let code = u16::from_be_bytes([payload[0], payload[1]]);
                let reason = std::str::from_utf8(&payload[2..])
                    .map_err(|_| WebSocketError::InvalidUtf8)?
                    .to_string();
                Ok(Some(Self { code, reason }))
            }
        }
    }
}

/// Routed message envelope: `{"name": "...", "data": <any JSON>}`
///
/// Decoding also accepts `body` in place of `data`; a missing payload decodes
/// as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub name: String,
    #[serde(default, alias = "body")]
    pub data: serde_json::Value,
}

impl Message {
    pub fn new<N, T>(name: N, data: T) -> WebSocketResult<Self>
    where
        N: Into<String>,
        T: Serialize,
    {
        Ok(Self {
            name: name.into(),
            data: serde_json::to_value(data)?,
        })
    }

    pub fn encode(&self) -> WebSocketResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(payload: &[u8]) -> WebSocketResult<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Deserialize the payload into a concrete type
    pub fn data_as<T: DeserializeOwned>(&self) -> WebSocketResult<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

/// WebSocket errors
#[derive(Debug, Error)]
pub enum WebSocketError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid UTF-8 in text message")]
    InvalidUtf8,

    #[error("Message too large: {size} bytes exceeds limit of {limit} bytes")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Write timed out")]
    WriteTimeout,

    #[error("Channel {0} is closed")]
    ChannelClosed(String),

    #[error("Channel {0} already exists")]
    ChannelExists(String),

    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    #[error("Connection {connection} is not a member of channel {channel}")]
    NotMember {
        channel: String,
        connection: ConnectionId,
    },

    #[error("Server is shut down")]
    ServerShutdown,

    #[error("Upgrade failed: {0}")]
    Upgrade(String),
}

impl WebSocketError {
    /// Close status sent to the peer when this error terminates a connection
    pub fn close_code(&self) -> u16 {
        match self {
            Self::Protocol(_) => CloseCode::PROTOCOL_ERROR,
            Self::InvalidUtf8 => CloseCode::INVALID_PAYLOAD,
            Self::MessageTooLarge { .. } => CloseCode::MESSAGE_TOO_BIG,
            Self::ServerShutdown => CloseCode::GOING_AWAY,
            _ => CloseCode::INTERNAL_ERROR,
        }
    }
}

/// Result type for WebSocket operations
pub type WebSocketResult<T> = Result<T, WebSocketError>;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Outcome of a channel broadcast
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BroadcastResult {
    /// Members the message was written to
    pub delivered: usize,
    /// Members whose write failed and were dropped from the channel
    pub failed: Vec<ConnectionId>,
}

impl BroadcastResult {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_accepts_body_alias() {
        let msg = Message::decode(br#"{"name":"chat","body":"hi"}"#).unwrap();
        assert_eq!(msg.name, "chat");
        assert_eq!(msg.data, json!("hi"));

        let msg = Message::decode(br#"{"name":"ping"}"#).unwrap();
        assert_eq!(msg.data, serde_json::Value::Null);

        assert!(Message::decode(b"Hello World").is_err());
        assert!(Message::decode(br#"{"data":1}"#).is_err());
    }

    #[test]
    fn test_envelope_encodes_data_field() {
        let msg = Message::new("echo", "hi").unwrap();
        let encoded = msg.encode().unwrap();
        assert_eq!(&encoded[..], br#"{"name":"echo","data":"hi"}"#);
        assert_eq!(Message::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_data_as() {
        #[derive(Deserialize, Debug, PartialEq)]
        struct Move {
            x: i32,
            y: i32,
        }

        let msg = Message::new("move", json!({"x": 1, "y": -2})).unwrap();
        assert_eq!(msg.data_as::<Move>().unwrap(), Move { x: 1, y: -2 });
        assert!(msg.data_as::<String>().is_err());
    }

    #[test]
    fn test_close_frame_payload() {
        let frame = Frame::close(CloseCode::INVALID_PAYLOAD, "bad text");
        assert_eq!(frame.opcode, OpCode::Close);

        let parsed = CloseFrame::parse(&frame.payload).unwrap().unwrap();
        assert_eq!(parsed.code, CloseCode::INVALID_PAYLOAD);
        assert_eq!(parsed.reason, "bad text");

        assert_eq!(CloseFrame::parse(&[]).unwrap(), None);
        assert!(CloseFrame::parse(&[0x03]).is_err());
    }

    #[test]
    fn test_close_reason_truncated_on_char_boundary() {
        let reason = "é".repeat(100);
        let frame = Frame::close(CloseCode::NORMAL, &reason);
        assert!(frame.payload.len() <= 125);
        assert!(std::str::from_utf8(&frame.payload[2..]).is_ok());
    }

    #[test]
    fn test_close_codes() {
        assert_eq!(
            WebSocketError::InvalidUtf8.close_code(),
            CloseCode::INVALID_PAYLOAD
        );
        assert_eq!(
            WebSocketError::Protocol("x".into()).close_code(),
            CloseCode::PROTOCOL_ERROR
        );
        assert!(CloseCode::is_sendable(CloseCode::NORMAL));
        assert!(!CloseCode::is_sendable(CloseCode::NO_STATUS));
        assert!(!CloseCode::is_sendable(999));
    }
}
