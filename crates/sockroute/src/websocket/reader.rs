//! Per-connection read loop
//!
//! Frames are reassembled into complete messages by [`FrameAssembler`].
//! Control frames may arrive between the fragments of a data message and are
//! handled immediately. Any protocol violation closes the connection with the
//! matching status code.

use super::codec::FrameSource;
use super::connection::Connection;
use super::server::Server;
use super::types::{
    CloseCode, CloseFrame, DataKind, Frame, OpCode, WebSocketError, WebSocketResult,
};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    Idle,
    TextFragmented,
    BinaryFragmented,
    Closing,
}

/// What a completed frame sequence means to the connection
#[derive(Debug, Clone, PartialEq)]
pub enum ReadEvent {
    Message { kind: DataKind, payload: Bytes },
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<CloseFrame>),
}

/// Message reassembly state machine
#[derive(Debug)]
pub struct FrameAssembler {
    state: ReadState,
    buffer: BytesMut,
    max_message_size: usize,
}

impl FrameAssembler {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            state: ReadState::Idle,
            buffer: BytesMut::new(),
            max_message_size,
        }
    }

    pub fn state(&self) -> ReadState {
        self.state
    }

    /// Feed one frame, returning an event once a message or control frame is complete
    pub fn push(&mut self, frame: Frame) -> WebSocketResult<Option<ReadEvent>> {
        if self.state == ReadState::Closing {
            return Err(WebSocketError::Protocol(
                "frame received after close".to_string(),
            ));
        }

        match frame.opcode {
            OpCode::Ping => Ok(Some(ReadEvent::Ping(frame.payload))),
            OpCode::Pong => Ok(Some(ReadEvent::Pong(frame.payload))),
            OpCode::Close => {
                let close = CloseFrame::parse(&frame.payload)?;
                self.state = ReadState::Closing;
                self.buffer.clear();
                Ok(Some(ReadEvent::Close(close)))
            }
            OpCode::Text | OpCode::Binary => {
                if self.state != ReadState::Idle {
                    return Err(WebSocketError::Protocol(
                        "new data frame before the fragmented message finished".to_string(),
                    ));
                }

                let kind = if frame.opcode == OpCode::Text {
                    DataKind::Text
                } else {
                    DataKind::Binary
                };

                if frame.fin {
                    self.check_size(frame.payload.len())?;
                    return complete(kind, frame.payload).map(Some);
                }

                self.append(&frame.payload)?;
                self.state = match kind {
                    DataKind::Text => ReadState::TextFragmented,
                    DataKind::Binary => ReadState::BinaryFragmented,
                };
                Ok(None)
            }
            OpCode::Continuation => {
                let kind = match self.state {
                    ReadState::TextFragmented => DataKind::Text,
                    ReadState::BinaryFragmented => DataKind::Binary,
                    _ => {
                        return Err(WebSocketError::Protocol(
                            "continuation frame without a message in progress".to_string(),
                        ))
                    }
                };

                self.append(&frame.payload)?;
                if !frame.fin {
                    return Ok(None);
                }

                self.state = ReadState::Idle;
                let payload = self.buffer.split().freeze();
                complete(kind, payload).map(Some)
            }
        }
    }

    fn append(&mut self, chunk: &[u8]) -> WebSocketResult<()> {
        self.check_size(self.buffer.len() + chunk.len())?;
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    fn check_size(&self, size: usize) -> WebSocketResult<()> {
        if size > self.max_message_size {
            return Err(WebSocketError::MessageTooLarge {
                size,
                limit: self.max_message_size,
            });
        }
        Ok(())
    }
}

fn complete(kind: DataKind, payload: Bytes) -> WebSocketResult<ReadEvent> {
    if kind == DataKind::Text && std::str::from_utf8(&payload).is_err() {
        return Err(WebSocketError::InvalidUtf8);
    }
    Ok(ReadEvent::Message { kind, payload })
}

/// Drive one connection until the peer leaves, a protocol error occurs or the
/// connection is closed locally
pub(crate) async fn run(
    server: &Arc<Server>,
    conn: &Arc<Connection>,
    mut source: Box<dyn FrameSource>,
) {
    let mut assembler = FrameAssembler::new(server.config().max_message_size);

    loop {
        let frame = tokio::select! {
            _ = conn.closed() => return,
            frame = source.read_frame() => frame,
        };

        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("Connection {} reached end of stream", conn.id());
                return;
            }
            Err(e) => {
                debug!("Read error on connection {}: {}", conn.id(), e);
                conn.terminate(e.close_code(), &e.to_string()).await;
                return;
            }
        };

        let event = match assembler.push(frame) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(e) => {
                debug!("Protocol violation on connection {}: {}", conn.id(), e);
                conn.terminate(e.close_code(), &e.to_string()).await;
                return;
            }
        };

        match event {
            ReadEvent::Message { kind, payload } => {
                server.dispatch(conn, kind, payload).await;
            }
            ReadEvent::Ping(payload) => {
                if conn.pong(payload).await.is_err() {
                    return;
                }
            }
            ReadEvent::Pong(_) => debug!("Pong from connection {}", conn.id()),
            ReadEvent::Close(close) => {
                let code = close
                    .map(|frame| frame.code)
                    .filter(|code| CloseCode::is_sendable(*code))
                    .unwrap_or(CloseCode::NORMAL);
                debug!("Peer closed connection {} with status {}", conn.id(), code);
                conn.terminate(code, "").await;
                return;
            }
        }
    }
}
