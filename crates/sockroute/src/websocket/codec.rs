//! RFC 6455 frame codec
//!
//! `FrameCodec` is a `tokio_util` codec that turns a byte stream into
//! [`Frame`]s and back. It validates every incoming header before the payload
//! is buffered, so an oversized frame is rejected on its length field alone.

use super::types::{Frame, OpCode, WebSocketError, WebSocketResult};
use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};
use tungstenite::protocol::frame::coding::{Control, Data, OpCode as WireOpCode};

const FIN_BIT: u8 = 0x80;
const RSV_BITS: u8 = 0x70;
const OPCODE_BITS: u8 = 0x0f;
const MASK_BIT: u8 = 0x80;
const LEN_BITS: u8 = 0x7f;
const MAX_CONTROL_PAYLOAD: u64 = 125;

/// Which end of the connection the codec speaks for
///
/// Servers require masked input and write unmasked frames; clients do the
/// opposite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

#[derive(Debug, Clone)]
pub struct FrameCodec {
    role: Role,
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(role: Role, max_frame_size: usize) -> Self {
        Self {
            role,
            max_frame_size,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = WebSocketError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, WebSocketError> {
        if src.len() < 2 {
            return Ok(None);
        }

        let first = src[0];
        let second = src[1];

        if first & RSV_BITS != 0 {
            return Err(WebSocketError::Protocol(
                "reserved bits set without a negotiated extension".to_string(),
            ));
        }

        let fin = first & FIN_BIT != 0;
        let opcode = decode_opcode(first & OPCODE_BITS)?;
        let masked = second & MASK_BIT != 0;

        match (self.role, masked) {
            (Role::Server, false) => {
                return Err(WebSocketError::Protocol(
                    "client frames must be masked".to_string(),
                ))
            }
            (Role::Client, true) => {
                return Err(WebSocketError::Protocol(
                    "server frames must not be masked".to_string(),
                ))
            }
            _ => {}
        }

        let (len, mut header_len) = match second & LEN_BITS {
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                (u64::from(u16::from_be_bytes([src[2], src[3]])), 4)
            }
            127 => {
                if src.len() < 10 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&src[2..10]);
                (u64::from_be_bytes(raw), 10)
            }
            n => (u64::from(n), 2),
        };

        if opcode.is_control() {
            if !fin {
                return Err(WebSocketError::Protocol(
                    "control frames must not be fragmented".to_string(),
                ));
            }
            if len > MAX_CONTROL_PAYLOAD {
                return Err(WebSocketError::Protocol(format!(
                    "control frame payload of {len} bytes"
                )));
            }
        }

        if len > self.max_frame_size as u64 {
            return Err(WebSocketError::MessageTooLarge {
                size: usize::try_from(len).unwrap_or(usize::MAX),
                limit: self.max_frame_size,
            });
        }
        let len = len as usize;

        let mask = if masked {
            if src.len() < header_len + 4 {
                return Ok(None);
            }
            let key = [
                src[header_len],
                src[header_len + 1],
                src[header_len + 2],
                src[header_len + 3],
            ];
            header_len += 4;
            Some(key)
        } else {
            None
        };

        if src.len() < header_len + len {
            src.reserve(header_len + len - src.len());
            return Ok(None);
        }

        src.advance(header_len);
        let mut payload = src.split_to(len);
        if let Some(key) = mask {
            apply_mask(&mut payload, key);
        }

        Ok(Some(Frame {
            fin,
            opcode,
            payload: payload.freeze(),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = WebSocketError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), WebSocketError> {
        let len = frame.payload.len();
        dst.reserve(14 + len);

        let fin = if frame.fin { FIN_BIT } else { 0 };
        dst.put_u8(fin | u8::from(WireOpCode::from(frame.opcode)));

        let mask_bit = match self.role {
            Role::Client => MASK_BIT,
            Role::Server => 0,
        };
        if len < 126 {
            dst.put_u8(mask_bit | len as u8);
        } else if len <= usize::from(u16::MAX) {
            dst.put_u8(mask_bit | 126);
            dst.put_u16(len as u16);
        } else {
            dst.put_u8(mask_bit | 127);
            dst.put_u64(len as u64);
        }

        match self.role {
            Role::Server => dst.put_slice(&frame.payload),
            Role::Client => {
                let key: [u8; 4] = rand::random();
                dst.put_slice(&key);
                let start = dst.len();
                dst.put_slice(&frame.payload);
                apply_mask(&mut dst[start..], key);
            }
        }

        Ok(())
    }
}

fn decode_opcode(bits: u8) -> WebSocketResult<OpCode> {
    match WireOpCode::from(bits) {
        WireOpCode::Data(Data::Continue) => Ok(OpCode::Continuation),
        WireOpCode::Data(Data::Text) => Ok(OpCode::Text),
        WireOpCode::Data(Data::Binary) => Ok(OpCode::Binary),
        WireOpCode::Control(Control::Close) => Ok(OpCode::Close),
        WireOpCode::Control(Control::Ping) => Ok(OpCode::Ping),
        WireOpCode::Control(Control::Pong) => Ok(OpCode::Pong),
        WireOpCode::Data(Data::Reserved(code)) | WireOpCode::Control(Control::Reserved(code)) => {
            Err(WebSocketError::Protocol(format!("reserved opcode {code:#x}")))
        }
    }
}

impl From<OpCode> for WireOpCode {
    fn from(opcode: OpCode) -> Self {
        match opcode {
            OpCode::Continuation => WireOpCode::Data(Data::Continue),
            OpCode::Text => WireOpCode::Data(Data::Text),
            OpCode::Binary => WireOpCode::Data(Data::Binary),
            OpCode::Close => WireOpCode::Control(Control::Close),
            OpCode::Ping => WireOpCode::Control(Control::Ping),
            OpCode::Pong => WireOpCode::Control(Control::Pong),
        }
    }
}

fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

/// Read half of a framed connection
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame from the peer, `None` once the stream has ended
    async fn read_frame(&mut self) -> WebSocketResult<Option<Frame>>;
}

/// Write half of a framed connection
#[async_trait]
pub trait FrameSink: Send {
    /// Encode and flush one frame
    async fn write_frame(&mut self, frame: Frame) -> WebSocketResult<()>;

    /// Flush and shut down the underlying writer
    async fn close(&mut self) -> WebSocketResult<()>;
}

#[async_trait]
impl<R> FrameSource for FramedRead<R, FrameCodec>
where
    R: AsyncRead + Unpin + Send,
{
    async fn read_frame(&mut self) -> WebSocketResult<Option<Frame>> {
        self.next().await.transpose()
    }
}

#[async_trait]
impl<W> FrameSink for FramedWrite<W, FrameCodec>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_frame(&mut self, frame: Frame) -> WebSocketResult<()> {
        self.send(frame).await
    }

    async fn close(&mut self) -> WebSocketResult<()> {
        SinkExt::close(self).await
    }
}

/// Split a duplex byte stream into boxed frame halves
pub fn split<S>(
    io: S,
    role: Role,
    max_frame_size: usize,
) -> (Box<dyn FrameSource>, Box<dyn FrameSink>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read, write) = tokio::io::split(io);
    let codec = FrameCodec::new(role, max_frame_size);
    (
        Box::new(FramedRead::new(read, codec.clone())),
        Box::new(FramedWrite::new(write, codec)),
    )
}
