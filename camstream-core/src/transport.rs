//! Outbound transport contract.
//!
//! Each connection has one [`FrameSink`]. Sends are best-effort; a failed
//! send is reported to the worker, which drops the frame and carries on.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::chunker::{Chunk, FrameEnvelope, WireMessage};
use crate::control::ServerEvent;
use crate::error::StreamError;

/// Per-connection push transport. Each method returns the number of
/// bytes put on the wire.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send_envelope(&self, envelope: &FrameEnvelope) -> Result<usize, StreamError>;

    async fn send_chunk(&self, chunk: &Chunk) -> Result<usize, StreamError>;

    /// An unchunked frame, carried together with its envelope.
    async fn send_raw_frame(&self, envelope: &FrameEnvelope, payload: Bytes) -> Result<usize, StreamError>;

    async fn send_event(&self, event: &ServerEvent) -> Result<usize, StreamError>;
}

// ── ChannelSink ──────────────────────────────────────────────────

/// A message ready for a message-oriented transport such as WebSocket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    Binary(Bytes),
    Text(String),
}

impl OutboundMessage {
    pub fn len(&self) -> usize {
        match self {
            OutboundMessage::Binary(b) => b.len(),
            OutboundMessage::Text(t) => t.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Encodes onto a bounded channel drained by the connection's writer.
///
/// The bound gives per-connection back-pressure: a slow client stalls
/// only its own worker.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<OutboundMessage>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<OutboundMessage>) -> Self {
        Self { tx }
    }

    /// A sink plus the receiving half, with room for `capacity` messages.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn push(&self, msg: OutboundMessage) -> Result<usize, StreamError> {
        let len = msg.len();
        self.tx
            .send(msg)
            .await
            .map_err(|_| StreamError::TransportFailure("connection closed".into()))?;
        Ok(len)
    }
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send_envelope(&self, envelope: &FrameEnvelope) -> Result<usize, StreamError> {
        let bytes = WireMessage::Envelope(envelope.clone()).encode();
        self.push(OutboundMessage::Binary(bytes)).await
    }

    async fn send_chunk(&self, chunk: &Chunk) -> Result<usize, StreamError> {
        let bytes = WireMessage::Chunk(chunk.clone()).encode();
        self.push(OutboundMessage::Binary(bytes)).await
    }

    async fn send_raw_frame(&self, envelope: &FrameEnvelope, payload: Bytes) -> Result<usize, StreamError> {
        let bytes = WireMessage::Frame(envelope.clone(), payload).encode();
        self.push(OutboundMessage::Binary(bytes)).await
    }

    async fn send_event(&self, event: &ServerEvent) -> Result<usize, StreamError> {
        self.push(OutboundMessage::Text(event.to_json()?)).await
    }
}

// ── Tests ────────────────────────────────────────────────────────
