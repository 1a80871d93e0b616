//! # camstream-core
//!
//! Per-client adaptive camera streaming engine.
//!
//! This crate contains:
//! - **Capture**: `SharedCapture` hands out reference-counted leases on one `FrameSource`
//! - **Codecs**: startup detection into a `CodecTable`, plus `FrameEncoder` with its fallback chain
//! - **Chunking**: `FrameChunker`, `Reassembler` and the client-side `FrameReceiver`, with blake3 integrity checks and a binary wire format
//! - **Bitrate**: `RateMeter` and the stepwise `BitrateController`
//! - **Workers**: one paced `StreamingWorker` per streaming client
//! - **Registry**: `ConnectionRegistry` routing control messages and collecting statistics
//! - **Error**: `StreamError`, a typed `thiserror` hierarchy with stable client codes

pub mod bitrate;
pub mod capture;
pub mod chunker;
pub mod codec;
pub mod config;
pub mod connection;
pub mod control;
pub mod encoder;
pub mod error;
pub mod frame;
pub mod registry;
pub mod transport;
pub mod worker;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use bitrate::{BitrateController, RateMeter};
pub use capture::{CaptureLease, CaptureRequest, FrameSource, SharedCapture, SyntheticSource};
pub use chunker::{
    AssembledFrame, Chunk, ContentHash, FrameChunker, FrameEnvelope, FrameId, FrameMeta,
    FrameReceiver, ReassemblyStats, Reassembler, WireMessage, spawn_janitor,
};
pub use codec::{
    CodecFactory, CodecFamily, CodecTable, CodecVariant, DefaultCodecFactory, FrameCodec,
    JpegCodec,
};
pub use config::{BitrateConfig, StreamingConfig};
pub use connection::{
    BitrateTarget, ChunkingPolicy, ConnectionId, EncodingMethod, PerformanceStats,
    StreamCapabilities, StreamSettings, WorkerPhase,
};
pub use control::{AggregateStats, ControlMessage, ServerEvent, StatsSnapshot};
pub use encoder::{CodecRequest, EncodedFrame, EncoderPhase, FrameEncoder};
pub use error::{ProbeError, StreamError};
pub use frame::{PixelFormat, RawFrame, Resolution};
pub use registry::{ConnectionRegistry, RegistryOptions};
pub use transport::{ChannelSink, FrameSink, OutboundMessage};
pub use worker::{Pacer, StreamingWorker, WorkerContext, WorkerExit};
