//! Configuration for the streaming server.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use camstream_core::{ChunkingPolicy, RegistryOptions, Resolution, StreamSettings, StreamingConfig};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Network settings.
    pub network: NetworkConfig,
    /// Capture source and per-client defaults.
    pub capture: CaptureConfig,
    /// Codec detection.
    pub codec: CodecConfig,
    /// Worker loop, bitrate control and reassembly tuning.
    pub streaming: StreamingConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the WebSocket listener binds to.
    pub bind: String,
    /// Concurrent clients accepted; further connections are closed.
    pub max_connections: usize,
    /// Outbound messages buffered per client before the worker waits.
    pub outbound_buffer: usize,
    /// Default chunk payload size for chunked frames.
    pub chunk_size: usize,
    /// Frames at or below this size are sent whole.
    pub max_unchunked: usize,
}

/// Capture configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Camera opened when a client does not name one.
    pub camera_index: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub quality: u8,
    /// Advertised to clients on connect.
    pub max_width: u32,
    pub max_height: u32,
    pub max_fps: u32,
    /// Test-pattern refresh period. `0` follows the requested fps.
    pub synthetic_period_ms: u64,
}

/// Codec detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Probe ffmpeg encoders at startup. When off only JPEG is offered.
    pub probe: bool,
    /// ffmpeg executable used for probing and non-JPEG codecs.
    pub ffmpeg: PathBuf,
    /// Rank hardware variants ahead of software ones.
    pub prefer_hardware: bool,
    /// Each ffmpeg run during detection is killed after this long.
    pub probe_timeout_ms: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or filter directive, e.g. "info" or "camstream_core=debug".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8765".into(),
            max_connections: 16,
            outbound_buffer: 256,
            chunk_size: 32 * 1024,
            max_unchunked: 500_000,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            camera_index: 0,
            width: 640,
            height: 480,
            fps: 30,
            quality: 85,
            max_width: 1920,
            max_height: 1080,
            max_fps: 60,
            synthetic_period_ms: 0,
        }
    }
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            probe: true,
            ffmpeg: PathBuf::from("ffmpeg"),
            prefer_hardware: true,
            probe_timeout_ms: 10_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".into() }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl ServerConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    /// Settings a freshly connected client starts with.
    pub fn default_settings(&self) -> StreamSettings {
        StreamSettings {
            camera_index: self.capture.camera_index,
            target_fps: self.capture.fps.clamp(1, StreamSettings::MAX_FPS),
            quality: self.capture.quality.clamp(1, 100),
            resolution: Resolution::new(self.capture.width.max(1), self.capture.height.max(1)),
            chunking: ChunkingPolicy {
                enabled: true,
                chunk_size: self.network.chunk_size.max(1),
                max_unchunked: self.network.max_unchunked,
            },
            ..StreamSettings::default()
        }
    }

    /// Convert into the registry's options.
    pub fn to_registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            streaming: self.streaming.clone(),
            defaults: self.default_settings(),
            prefer_hardware: self.codec.prefer_hardware,
            max_resolution: Resolution::new(self.capture.max_width, self.capture.max_height),
            max_fps: self.capture.max_fps,
            ..RegistryOptions::default()
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.codec.probe_timeout_ms.max(1))
    }

    /// Fixed refresh period for the test pattern, if configured.
    pub fn synthetic_period(&self) -> Option<Duration> {
        (self.capture.synthetic_period_ms > 0)
            .then(|| Duration::from_millis(self.capture.synthetic_period_ms))
    }
}

// ── Tests ────────────────────────────────────────────────────────
