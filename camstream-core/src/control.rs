//! Client→server control messages, server→client events and the
//! statistics snapshots they carry. All are JSON text on the wire.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::connection::{
    ConnectionId, EncodingMethod, PerformanceStats, StreamCapabilities, StreamSettings,
};
use crate::encoder::{CodecRequest, EncoderPhase, EncoderReport};
use crate::error::StreamError;
use crate::frame::Resolution;

// ── ControlMessage ───────────────────────────────────────────────

/// A request from the client. Omitted start-stream fields take the
/// host's defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    StartStream {
        #[serde(default)]
        camera_index: Option<u32>,
        #[serde(default)]
        resolution: Option<Resolution>,
        #[serde(default)]
        fps: Option<u32>,
        #[serde(default)]
        quality: Option<u8>,
        #[serde(default)]
        chunk_size: Option<usize>,
        #[serde(default)]
        enable_chunking: Option<bool>,
    },
    StopStream,
    UpdateQuality {
        quality: u8,
    },
    UpdateFps {
        fps: u32,
    },
    UpdateResolution {
        width: u32,
        height: u32,
    },
    SetEncodingMethod {
        method: EncodingMethod,
    },
    /// `0` means unlimited.
    SetMaxBitrate {
        max_bitrate_kbps: u32,
    },
    SetCodec {
        codec: CodecRequest,
    },
    GetStats,
}

impl ControlMessage {
    pub fn parse(text: &str) -> Result<Self, StreamError> {
        Ok(serde_json::from_str(text)?)
    }

    /// A start-stream request with every field left to defaults.
    pub fn start_default() -> Self {
        ControlMessage::StartStream {
            camera_index: None,
            resolution: None,
            fps: None,
            quality: None,
            chunk_size: None,
            enable_chunking: None,
        }
    }
}

// ── StatsSnapshot ────────────────────────────────────────────────

/// Per-connection statistics as reported to clients.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub streaming: bool,
    pub frame_count: u64,
    pub connection_age_seconds: f64,
    pub current_bitrate_mbps: f64,
    pub total_bytes_sent: u64,
    pub avg_frame_size_bytes: f64,
    pub encoding_method: EncodingMethod,
    pub bitrate_control_enabled: bool,
    pub quality_adjustment: i32,

    pub target_fps: u32,
    pub quality: u8,
    pub effective_quality: u8,
    pub resolution: Resolution,
    pub frames_skipped: u64,
    pub frames_chunked: u64,
    pub chunks_sent: u64,
    pub avg_encode_time_ms: f64,
    pub encoder_phase: EncoderPhase,
    pub codec: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoder: Option<EncoderReport>,
}

impl StatsSnapshot {
    pub fn from_parts(
        streaming: bool,
        connected_at: Instant,
        settings: &StreamSettings,
        stats: &PerformanceStats,
    ) -> Self {
        Self {
            streaming,
            frame_count: stats.frames_sent,
            connection_age_seconds: connected_at.elapsed().as_secs_f64(),
            current_bitrate_mbps: stats.rolling_bitrate_mbps,
            total_bytes_sent: stats.total_bytes_sent,
            avg_frame_size_bytes: stats.avg_frame_size_bytes,
            encoding_method: settings.encoding_method,
            bitrate_control_enabled: settings.bitrate.enabled,
            quality_adjustment: stats.quality_adjustment,
            target_fps: settings.target_fps,
            quality: settings.quality,
            effective_quality: stats.effective_quality,
            resolution: settings.resolution,
            frames_skipped: stats.frames_skipped,
            frames_chunked: stats.frames_chunked,
            chunks_sent: stats.chunks_sent,
            avg_encode_time_ms: stats.avg_encode_time_ms,
            encoder_phase: stats.encoder_phase,
            codec: stats.codec.clone(),
            encoder: stats.encoder.clone(),
        }
    }
}

/// One line of the registry-wide summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSummary {
    pub connection_id: ConnectionId,
    pub streaming: bool,
    pub frame_count: u64,
    pub current_bitrate_mbps: f64,
    pub connection_age_seconds: f64,
}

/// Registry-wide statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateStats {
    pub total_connections: usize,
    pub active_streams: usize,
    pub total_bytes_sent: u64,
    pub total_frames_sent: u64,
    pub connections: Vec<ConnectionSummary>,
}

// ── ServerEvent ──────────────────────────────────────────────────

/// A notification pushed to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Connected {
        connection_id: ConnectionId,
        capabilities: StreamCapabilities,
    },
    StreamStarted {
        camera_index: u32,
        resolution: Resolution,
        fps: u32,
        quality: u8,
        chunking: bool,
        chunk_size: usize,
        codec: CodecRequest,
    },
    StreamStopped {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    QualityUpdated {
        quality: u8,
    },
    FpsUpdated {
        fps: u32,
    },
    ResolutionUpdated {
        resolution: Resolution,
    },
    EncodingMethodUpdated {
        method: EncodingMethod,
    },
    MaxBitrateUpdated {
        max_bitrate_kbps: u32,
        enabled: bool,
    },
    CodecUpdated {
        codec: CodecRequest,
    },
    StreamStats(StatsSnapshot),
    StreamError {
        error: String,
        code: String,
    },
}

impl ServerEvent {
    pub fn error(err: &StreamError) -> Self {
        ServerEvent::StreamError {
            error: err.to_string(),
            code: err.code().to_string(),
        }
    }

    pub fn to_json(&self) -> Result<String, StreamError> {
        Ok(serde_json::to_string(self)?)
    }
}

// ── Tests ────────────────────────────────────────────────────────
