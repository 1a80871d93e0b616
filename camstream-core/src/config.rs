//! Tunable constants for the streaming engine.
//!
//! Every hand-tuned threshold used by the worker loop and the bitrate
//! controller lives here with its default value, so a host can override
//! any of them from its own configuration file.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ── BitrateConfig ────────────────────────────────────────────────

/// Step function parameters for [`crate::bitrate::BitrateController`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BitrateConfig {
    /// Minimum spacing between two adjustments.
    pub adjust_interval_ms: u64,
    /// Deviation (%) that triggers the large step.
    pub major_threshold_pct: f64,
    /// Deviation (%) that triggers the small step.
    pub minor_threshold_pct: f64,
    pub major_step: i32,
    pub minor_step: i32,
    /// Deviation (%) inside which no correction is made.
    pub dead_band_pct: f64,
    /// Correction applied between the dead-band and the minor threshold.
    pub damping_step: i32,
    /// Bound on the accumulated adjustment, in both directions.
    pub max_adjustment: i32,
    pub min_quality: u8,
    pub max_quality: u8,
}

impl Default for BitrateConfig {
    fn default() -> Self {
        Self {
            adjust_interval_ms: 2000,
            major_threshold_pct: 20.0,
            minor_threshold_pct: 10.0,
            major_step: 10,
            minor_step: 5,
            dead_band_pct: 5.0,
            damping_step: 2,
            max_adjustment: 50,
            min_quality: 20,
            max_quality: 95,
        }
    }
}

impl BitrateConfig {
    pub fn adjust_interval(&self) -> Duration {
        Duration::from_millis(self.adjust_interval_ms)
    }
}

// ── StreamingConfig ──────────────────────────────────────────────

/// Worker-loop and reassembly parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// A frame is due once this fraction of the frame interval elapsed.
    pub pacing_tolerance: f64,
    /// Upper bound on a single pacing sleep. Also bounds stop latency.
    pub pacing_quantum_ms: u64,
    /// Weight of the newest sample in the encode-time / frame-size EMAs.
    pub ema_weight: f64,
    /// Byte-accumulator window for the rolling bitrate.
    pub stats_window_ms: u64,
    /// Maximum encode-duration samples kept by the encoder.
    pub encode_sample_window: usize,
    /// Oversized frames are skipped if the previous one finished within
    /// this many frame intervals.
    pub oversize_skip_intervals: f64,
    /// Frames with more chunks than this yield between chunk sends.
    pub large_frame_chunks: usize,
    pub capture_backoff_min_us: u64,
    pub capture_backoff_max_us: u64,
    /// Consecutive empty reads before the worker gives up. `None` retries forever.
    pub max_capture_failures: Option<u32>,
    /// Deadline for one codec subprocess. The worker abandons an encode
    /// that runs for twice this long and drops to the fallback codec.
    pub encode_timeout_ms: u64,
    /// Receiver side: partial frames older than this are dropped.
    pub reassembly_max_age_ms: u64,
    /// Receiver side: how often the janitor looks for stale partials.
    pub cleanup_interval_ms: u64,
    /// Receiver side: largest frame a chunk header may announce.
    pub max_frame_bytes: usize,
    /// Interval between periodic `stream_stats` pushes. 0 disables them.
    pub stats_push_interval_ms: u64,
    pub bitrate: BitrateConfig,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            pacing_tolerance: 0.8,
            pacing_quantum_ms: 5,
            ema_weight: 0.1,
            stats_window_ms: 1000,
            encode_sample_window: 100,
            oversize_skip_intervals: 2.0,
            large_frame_chunks: 20,
            capture_backoff_min_us: 100,
            capture_backoff_max_us: 10_000,
            max_capture_failures: None,
            encode_timeout_ms: 2000,
            reassembly_max_age_ms: 5000,
            cleanup_interval_ms: 1000,
            max_frame_bytes: 64 * 1024 * 1024,
            stats_push_interval_ms: 0,
            bitrate: BitrateConfig::default(),
        }
    }
}

impl StreamingConfig {
    pub fn pacing_quantum(&self) -> Duration {
        Duration::from_millis(self.pacing_quantum_ms.max(1))
    }

    pub fn stats_window(&self) -> Duration {
        Duration::from_millis(self.stats_window_ms.max(1))
    }

    pub fn encode_timeout(&self) -> Duration {
        Duration::from_millis(self.encode_timeout_ms.max(1))
    }

    pub fn reassembly_max_age(&self) -> Duration {
        Duration::from_millis(self.reassembly_max_age_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms.max(1))
    }

    /// Capture back-off after `idle` without a frame: a tenth of the
    /// idle time, clamped to the configured bounds.
    pub fn capture_backoff(&self, idle: Duration) -> Duration {
        let min = Duration::from_micros(self.capture_backoff_min_us);
        let max = Duration::from_micros(self.capture_backoff_max_us.max(self.capture_backoff_min_us));
        (idle / 10).clamp(min, max)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_tuned_values() {
        let cfg = StreamingConfig::default();
        assert_eq!(cfg.pacing_tolerance, 0.8);
        assert_eq!(cfg.encode_sample_window, 100);
        assert_eq!(cfg.large_frame_chunks, 20);
        assert_eq!(cfg.max_capture_failures, None);
        assert_eq!(cfg.encode_timeout(), Duration::from_secs(2));
        assert_eq!(cfg.max_frame_bytes, 64 * 1024 * 1024);
        assert_eq!(cfg.bitrate.adjust_interval(), Duration::from_secs(2));
        assert_eq!(cfg.bitrate.min_quality, 20);
        assert_eq!(cfg.bitrate.max_quality, 95);
    }

    #[test]
    fn backoff_grows_with_idle_and_is_bounded() {
        let cfg = StreamingConfig::default();
        assert_eq!(cfg.capture_backoff(Duration::ZERO), Duration::from_micros(100));
        assert_eq!(
            cfg.capture_backoff(Duration::from_millis(20)),
            Duration::from_millis(2)
        );
        assert_eq!(
            cfg.capture_backoff(Duration::from_secs(10)),
            Duration::from_millis(10)
        );
    }

    #[test]
    fn partial_json_uses_defaults() {
        let cfg: StreamingConfig =
            serde_json::from_str(r#"{"pacing_tolerance":0.5,"bitrate":{"major_step":8}}"#).unwrap();
        assert_eq!(cfg.pacing_tolerance, 0.5);
        assert_eq!(cfg.bitrate.major_step, 8);
        assert_eq!(cfg.bitrate.minor_step, 5);
        assert_eq!(cfg.stats_window_ms, 1000);
    }
}
