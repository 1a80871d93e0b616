//! Per-connection state: identity, stream settings, statistics and the
//! worker lifecycle.
//!
//! Settings are owned by the registry and pushed to the worker; stats
//! are owned by the worker and published back. Neither side mutates the
//! other's half.

use std::fmt;
use std::time::Instant;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::encoder::{CodecRequest, EncoderPhase, EncoderReport};
use crate::error::StreamError;
use crate::frame::Resolution;

// ── ConnectionId ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

// ── EncodingMethod ───────────────────────────────────────────────

/// Transformation applied to the encoded frame before hashing and
/// chunking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EncodingMethod {
    /// Bytes exactly as the codec produced them.
    #[default]
    #[serde(rename = "binary", alias = "raw-binary", alias = "raw_binary")]
    RawBinary,
    /// Standard-alphabet base64 text.
    #[serde(rename = "base64")]
    Base64,
    /// zstd-compressed codec output.
    #[serde(rename = "compressed", alias = "zstd")]
    Compressed,
}

impl EncodingMethod {
    const ZSTD_LEVEL: i32 = 1;

    pub fn apply(self, encoded: Vec<u8>) -> Result<Bytes, StreamError> {
        match self {
            EncodingMethod::RawBinary => Ok(Bytes::from(encoded)),
            EncodingMethod::Base64 => Ok(Bytes::from(STANDARD.encode(&encoded))),
            EncodingMethod::Compressed => zstd::encode_all(encoded.as_slice(), Self::ZSTD_LEVEL)
                .map(Bytes::from)
                .map_err(|e| StreamError::Other(format!("zstd encode failed: {e}"))),
        }
    }

    /// Invert [`apply`](Self::apply) on the receiving side.
    pub fn decode(self, payload: &[u8]) -> Result<Vec<u8>, StreamError> {
        match self {
            EncodingMethod::RawBinary => Ok(payload.to_vec()),
            EncodingMethod::Base64 => STANDARD
                .decode(payload)
                .map_err(|e| StreamError::Wire(format!("base64: {e}"))),
            EncodingMethod::Compressed => {
                zstd::decode_all(payload).map_err(|e| StreamError::Wire(format!("zstd: {e}")))
            }
        }
    }

    pub const fn wire_id(self) -> u8 {
        match self {
            EncodingMethod::RawBinary => 0,
            EncodingMethod::Base64 => 1,
            EncodingMethod::Compressed => 2,
        }
    }

    pub fn from_wire_id(id: u8) -> Result<Self, StreamError> {
        match id {
            0 => Ok(EncodingMethod::RawBinary),
            1 => Ok(EncodingMethod::Base64),
            2 => Ok(EncodingMethod::Compressed),
            other => Err(StreamError::Wire(format!("unknown encoding id {other}"))),
        }
    }
}

impl fmt::Display for EncodingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodingMethod::RawBinary => write!(f, "binary"),
            EncodingMethod::Base64 => write!(f, "base64"),
            EncodingMethod::Compressed => write!(f, "compressed"),
        }
    }
}

// ── Settings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingPolicy {
    pub enabled: bool,
    pub chunk_size: usize,
    pub max_unchunked: usize,
}

impl Default for ChunkingPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            chunk_size: 32 * 1024,
            max_unchunked: 500_000,
        }
    }
}

impl ChunkingPolicy {
    pub fn should_chunk(&self, frame_len: usize) -> bool {
        self.enabled && frame_len > self.max_unchunked
    }
}

/// Client-requested bitrate cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BitrateTarget {
    pub enabled: bool,
    pub target_kbps: u32,
}

impl BitrateTarget {
    /// `0` means unlimited and disables control.
    pub fn from_kbps(kbps: u32) -> Self {
        Self {
            enabled: kbps > 0,
            target_kbps: kbps,
        }
    }
}

/// Everything a client can configure about its stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSettings {
    pub camera_index: u32,
    pub target_fps: u32,
    /// Base quality, 1–100.
    pub quality: u8,
    pub resolution: Resolution,
    pub encoding_method: EncodingMethod,
    pub chunking: ChunkingPolicy,
    pub bitrate: BitrateTarget,
    pub codec: CodecRequest,
    /// Bumped on every explicit codec request, including repeats.
    pub codec_generation: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            camera_index: 0,
            target_fps: 30,
            quality: 85,
            resolution: Resolution::default(),
            encoding_method: EncodingMethod::default(),
            chunking: ChunkingPolicy::default(),
            bitrate: BitrateTarget::default(),
            codec: CodecRequest::Auto,
            codec_generation: 0,
        }
    }
}

impl StreamSettings {
    pub const MAX_FPS: u32 = 120;

    pub fn validate(&self) -> Result<(), StreamError> {
        if self.target_fps == 0 || self.target_fps > Self::MAX_FPS {
            return Err(StreamError::InvalidSettings(format!(
                "fps must be within 1..={}, got {}",
                Self::MAX_FPS,
                self.target_fps
            )));
        }
        if !(1..=100).contains(&self.quality) {
            return Err(StreamError::InvalidSettings(format!(
                "quality must be within 1..=100, got {}",
                self.quality
            )));
        }
        if !self.resolution.is_valid() {
            return Err(StreamError::InvalidSettings(format!(
                "invalid resolution {}",
                self.resolution
            )));
        }
        if self.chunking.chunk_size == 0 {
            return Err(StreamError::InvalidSettings("chunk size must be > 0".into()));
        }
        Ok(())
    }

    pub fn frame_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(1.0 / f64::from(self.target_fps.max(1)))
    }
}

// ── PerformanceStats ─────────────────────────────────────────────

/// Worker-maintained counters. Readers tolerate slightly stale values.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceStats {
    pub frames_sent: u64,
    pub frames_skipped: u64,
    pub frames_chunked: u64,
    pub chunks_sent: u64,
    pub total_bytes_sent: u64,
    pub rolling_bitrate_mbps: f64,
    pub avg_encode_time_ms: f64,
    pub avg_frame_size_bytes: f64,
    pub effective_quality: u8,
    pub quality_adjustment: i32,
    pub encoder_phase: EncoderPhase,
    pub codec: String,
    /// Latest encoder report; `None` before the first encode.
    pub encoder: Option<EncoderReport>,
}

// ── WorkerPhase ──────────────────────────────────────────────────

/// Lifecycle of one streaming worker.
///
/// ```text
///  Idle ──► Running ──► Draining ──► Stopped
///    │                                  ▲
///    └──────────────────────────────────┘
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum WorkerPhase {
    #[default]
    Idle,
    Running {
        since: Instant,
    },
    /// Streaming flag cleared; finishing the frame in flight.
    Draining,
    Stopped,
}

impl fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Running { .. } => write!(f, "Running"),
            Self::Draining => write!(f, "Draining"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

impl WorkerPhase {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    /// Valid from: `Idle`.
    pub fn start(&mut self) -> Result<(), StreamError> {
        match self {
            Self::Idle => {
                *self = Self::Running {
                    since: Instant::now(),
                };
                Ok(())
            }
            _ => Err(StreamError::InvalidTransition("cannot start: worker not Idle")),
        }
    }

    /// Valid from: `Running`.
    pub fn drain(&mut self) -> Result<(), StreamError> {
        match self {
            Self::Running { .. } => {
                *self = Self::Draining;
                Ok(())
            }
            _ => Err(StreamError::InvalidTransition("cannot drain: worker not Running")),
        }
    }

    /// Valid from: `Draining`, `Idle` (never started).
    pub fn finish(&mut self) -> Result<(), StreamError> {
        match self {
            Self::Draining | Self::Idle => {
                *self = Self::Stopped;
                Ok(())
            }
            _ => Err(StreamError::InvalidTransition(
                "cannot stop: worker must drain first",
            )),
        }
    }
}

// ── StreamCapabilities ───────────────────────────────────────────

/// What the server advertises to a client on connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamCapabilities {
    pub max_resolution: Resolution,
    pub max_fps: u32,
    pub chunk_support: bool,
    pub binary_support: bool,
    pub codecs: Vec<String>,
    pub hardware_acceleration: bool,
}

impl Default for StreamCapabilities {
    fn default() -> Self {
        Self {
            max_resolution: Resolution::new(1920, 1080),
            max_fps: 60,
            chunk_support: true,
            binary_support: true,
            codecs: vec!["JPEG".into()],
            hardware_acceleration: false,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
