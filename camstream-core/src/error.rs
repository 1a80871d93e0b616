//! Domain-specific error types for the streaming engine.
//!
//! All fallible operations return `Result<T, StreamError>`.
//! Recoverable conditions are handled inside the worker loop; only the
//! variants that make continued streaming pointless reach the client as
//! a terminal `stream_error` event.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the streaming engine.
#[derive(Debug, Error)]
pub enum StreamError {
    // ── Capture ──────────────────────────────────────────────────
    /// The capture collaborator produced no frame (or could not start).
    #[error("capture unavailable: {0}")]
    CaptureUnavailable(String),

    /// No frame arrived for `attempts` consecutive reads.
    #[error("capture stalled after {attempts} consecutive empty reads ({idle:?} idle)")]
    CaptureStalled { attempts: u32, idle: Duration },

    // ── Codec ────────────────────────────────────────────────────
    /// A codec failed to encode a frame.
    #[error("encode failed ({codec}): {reason}")]
    EncodeFailure { codec: String, reason: String },

    /// A codec backend could not be initialised.
    #[error("codec init failed ({codec}): {reason}")]
    CodecInitFailure { codec: String, reason: String },

    // ── Transport ────────────────────────────────────────────────
    /// The outbound transport refused a message.
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    // ── Chunking ─────────────────────────────────────────────────
    /// A reassembled frame did not match its announced digest.
    #[error("reassembly mismatch for frame {frame_id}")]
    ReassemblyMismatch { frame_id: u64 },

    /// Malformed bytes on the wire.
    #[error("wire format: {0}")]
    Wire(String),

    // ── Registry ─────────────────────────────────────────────────
    /// A control message referenced a connection that does not exist.
    #[error("unknown connection {0}")]
    UnknownConnection(u64),

    /// A settings value was out of range.
    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    /// A state machine was asked for a transition it does not allow.
    #[error("invalid transition: {0}")]
    InvalidTransition(&'static str),

    // ── Plumbing ─────────────────────────────────────────────────
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl StreamError {
    /// Stable error code reported to clients in `stream_error` events.
    pub fn code(&self) -> &'static str {
        match self {
            StreamError::CaptureUnavailable(_) => "CAMERA_START_FAILED",
            StreamError::CaptureStalled { .. } => "CAPTURE_UNAVAILABLE",
            StreamError::EncodeFailure { .. } => "ENCODE_FAILED",
            StreamError::CodecInitFailure { .. } => "CODEC_INIT_FAILED",
            StreamError::TransportFailure(_) | StreamError::ChannelClosed => "TRANSPORT_FAILED",
            StreamError::ReassemblyMismatch { .. } | StreamError::Wire(_) => "PROTOCOL_ERROR",
            StreamError::UnknownConnection(_) => "UNKNOWN_CONNECTION",
            StreamError::InvalidSettings(_) => "INVALID_SETTINGS",
            StreamError::InvalidTransition(_)
            | StreamError::Io(_)
            | StreamError::Json(_)
            | StreamError::Other(_) => "STREAMING_ERROR",
        }
    }

    /// Whether a worker may drop the current frame and keep streaming.
    ///
    /// An `EncodeFailure` reaching the worker means the fallback codec
    /// failed too, so it is terminal along with a stalled capture.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            StreamError::EncodeFailure { .. }
                | StreamError::CaptureStalled { .. }
                | StreamError::ChannelClosed
                | StreamError::InvalidTransition(_)
        )
    }
}

// ── ProbeError ────────────────────────────────────────────────────

/// Failure of a single capability probe.
///
/// Never escapes [`crate::codec::detect`]; each probe failure is
/// recorded as "unavailable".
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The probe tool (e.g. `ffmpeg`) is not installed.
    #[error("probe tool not found: {0}")]
    ToolMissing(String),

    /// The tool ran but reported failure.
    #[error("probe exited unsuccessfully: {0}")]
    Rejected(String),

    /// The encode ran but produced no readable artifact.
    #[error("probe produced no output")]
    EmptyOutput,

    /// The tool did not finish in time and was killed.
    #[error("no answer within {0:?}, killed")]
    TimedOut(Duration),

    /// The probe panicked.
    #[error("probe panicked: {0}")]
    Panicked(String),

    #[error("probe io error: {0}")]
    Io(#[from] std::io::Error),
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for StreamError {
    fn from(s: String) -> Self {
        StreamError::Other(s)
    }
}

impl From<&str> for StreamError {
    fn from(s: &str) -> Self {
        StreamError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for StreamError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        StreamError::ChannelClosed
    }
}
