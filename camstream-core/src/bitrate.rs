//! Bitrate measurement and closed-loop quality control.
//!
//! [`RateMeter`] accumulates bytes sent and recomputes the rolling bitrate
//! once per window. [`BitrateController`] compares that measurement with
//! the client's target and nudges a persistent quality adjustment with a
//! tiered step function, at most once per guard interval.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::BitrateConfig;
use crate::connection::BitrateTarget;

// ── RateMeter ────────────────────────────────────────────────────

/// Byte-accumulator window producing a bitrate once per window.
#[derive(Debug, Clone)]
pub struct RateMeter {
    window: Duration,
    window_start: Option<Instant>,
    window_bytes: u64,
    /// Last completed measurement, bits per second.
    last_bps: Option<f64>,
}

impl RateMeter {
    /// Create a meter with a 1-second window.
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(1))
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            window_start: None,
            window_bytes: 0,
            last_bps: None,
        }
    }

    /// Record that `bytes` were transmitted at the current instant.
    pub fn record(&mut self, bytes: u64) {
        self.record_at(Instant::now(), bytes);
    }

    /// Record with an explicit timestamp (useful for testing).
    ///
    /// Returns `true` when this call closed a window and produced a new
    /// measurement.
    pub fn record_at(&mut self, when: Instant, bytes: u64) -> bool {
        let start = *self.window_start.get_or_insert(when);
        self.window_bytes += bytes;
        let elapsed = when.saturating_duration_since(start);
        if elapsed >= self.window {
            self.last_bps = Some(self.window_bytes as f64 * 8.0 / elapsed.as_secs_f64());
            self.window_bytes = 0;
            self.window_start = Some(when);
            true
        } else {
            false
        }
    }

    pub fn has_measurement(&self) -> bool {
        self.last_bps.is_some()
    }

    pub fn kbps(&self) -> Option<f64> {
        self.last_bps.map(|bps| bps / 1000.0)
    }

    /// Rolling bitrate in Mbps, `0.0` before the first window closes.
    pub fn mbps(&self) -> f64 {
        self.last_bps.map(|bps| bps / 1_000_000.0).unwrap_or(0.0)
    }
}

impl Default for RateMeter {
    fn default() -> Self {
        Self::new()
    }
}

// ── BitrateController ────────────────────────────────────────────

/// Per-connection quality controller.
#[derive(Debug, Clone)]
pub struct BitrateController {
    config: BitrateConfig,
    adjustment: i32,
    last_adjust: Option<Instant>,
}

impl BitrateController {
    pub fn new(config: BitrateConfig) -> Self {
        Self {
            config,
            adjustment: 0,
            last_adjust: None,
        }
    }

    /// Resolve the effective quality, adjusting toward `target` if the
    /// guard interval has passed.
    pub fn adjust(&mut self, base_quality: u8, target: &BitrateTarget, measured_kbps: Option<f64>) -> u8 {
        self.adjust_at(Instant::now(), base_quality, target, measured_kbps)
    }

    pub fn adjust_at(
        &mut self,
        now: Instant,
        base_quality: u8,
        target: &BitrateTarget,
        measured_kbps: Option<f64>,
    ) -> u8 {
        if !target.enabled || target.target_kbps == 0 {
            return self.effective_quality(base_quality);
        }
        if let Some(last) = self.last_adjust {
            if now.saturating_duration_since(last) < self.config.adjust_interval() {
                return self.effective_quality(base_quality);
            }
        }
        // Nothing measured yet; wait for the first window to close.
        let Some(measured) = measured_kbps else {
            return self.effective_quality(base_quality);
        };

        let target_kbps = f64::from(target.target_kbps);
        let diff_pct = (measured - target_kbps) / target_kbps * 100.0;
        let step = self.step_for(diff_pct);
        let limit = self.config.max_adjustment;
        self.adjustment = (self.adjustment + step).clamp(-limit, limit);
        self.last_adjust = Some(now);

        let effective = self.effective_quality(base_quality);
        debug!(
            measured_kbps = measured,
            target_kbps,
            diff_pct,
            step,
            adjustment = self.adjustment,
            effective,
            "bitrate adjustment"
        );
        effective
    }

    /// Tiered step for a deviation of `diff_pct` percent from target.
    pub fn step_for(&self, diff_pct: f64) -> i32 {
        let c = &self.config;
        if !diff_pct.is_finite() {
            return if diff_pct > 0.0 { -c.major_step } else { 0 };
        }
        if diff_pct >= c.major_threshold_pct {
            -c.major_step
        } else if diff_pct >= c.minor_threshold_pct {
            -c.minor_step
        } else if diff_pct <= -c.major_threshold_pct {
            c.major_step
        } else if diff_pct <= -c.minor_threshold_pct {
            c.minor_step
        } else if diff_pct > c.dead_band_pct {
            -c.damping_step
        } else if diff_pct < -c.dead_band_pct {
            c.damping_step
        } else {
            0
        }
    }

    pub fn effective_quality(&self, base_quality: u8) -> u8 {
        let q = i32::from(base_quality) + self.adjustment;
        q.clamp(i32::from(self.config.min_quality), i32::from(self.config.max_quality)) as u8
    }

    pub fn adjustment(&self) -> i32 {
        self.adjustment
    }

    /// Explicit disable by the client: forget the accumulated adjustment.
    pub fn reset(&mut self) {
        self.adjustment = 0;
        self.last_adjust = None;
    }
}

impl Default for BitrateController {
    fn default() -> Self {
        Self::new(BitrateConfig::default())
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn target(kbps: u32) -> BitrateTarget {
        BitrateTarget::from_kbps(kbps)
    }

    #[test]
    fn meter_has_no_measurement_before_window() {
        let mut m = RateMeter::new();
        let t0 = Instant::now();
        assert!(!m.record_at(t0, 10_000));
        assert!(!m.record_at(t0 + Duration::from_millis(500), 10_000));
        assert!(!m.has_measurement());
        assert_eq!(m.mbps(), 0.0);
    }

    #[test]
    fn meter_computes_bitrate_per_window() {
        let mut m = RateMeter::new();
        let t0 = Instant::now();
        m.record_at(t0, 125_000);
        m.record_at(t0 + Duration::from_millis(500), 125_000);
        assert!(m.record_at(t0 + Duration::from_secs(1), 0));
        // 250 kB over 1 s = 2 Mbps.
        assert!((m.mbps() - 2.0).abs() < 1e-9, "mbps = {}", m.mbps());
        assert!((m.kbps().unwrap() - 2000.0).abs() < 1e-6);
    }

    #[test]
    fn twenty_percent_over_steps_down_ten() {
        let mut c = BitrateController::default();
        let q = c.adjust_at(Instant::now(), 80, &target(2000), Some(2400.0));
        assert_eq!(c.adjustment(), -10);
        assert_eq!(q, 70);
    }

    #[test]
    fn tiers() {
        let c = BitrateController::default();
        assert_eq!(c.step_for(35.0), -10);
        assert_eq!(c.step_for(12.0), -5);
        assert_eq!(c.step_for(7.0), -2);
        assert_eq!(c.step_for(3.0), 0);
        assert_eq!(c.step_for(-3.0), 0);
        assert_eq!(c.step_for(-7.0), 2);
        assert_eq!(c.step_for(-15.0), 5);
        assert_eq!(c.step_for(-60.0), 10);
    }

    #[test]
    fn guard_interval_blocks_second_adjustment() {
        let mut c = BitrateController::default();
        let t0 = Instant::now();
        c.adjust_at(t0, 80, &target(2000), Some(4000.0));
        c.adjust_at(t0 + Duration::from_millis(1999), 80, &target(2000), Some(4000.0));
        assert_eq!(c.adjustment(), -10);
        c.adjust_at(t0 + Duration::from_secs(2), 80, &target(2000), Some(4000.0));
        assert_eq!(c.adjustment(), -20);
    }

    #[test]
    fn no_measurement_no_change() {
        let mut c = BitrateController::default();
        assert_eq!(c.adjust_at(Instant::now(), 80, &target(2000), None), 80);
        assert_eq!(c.adjustment(), 0);
    }

    #[test]
    fn disabled_target_leaves_adjustment() {
        let mut c = BitrateController::default();
        let t0 = Instant::now();
        c.adjust_at(t0, 80, &target(2000), Some(4000.0));
        let q = c.adjust_at(t0 + Duration::from_secs(5), 80, &target(0), Some(4000.0));
        assert_eq!(q, 70);
        c.reset();
        assert_eq!(c.effective_quality(80), 80);
    }

    #[test]
    fn adjustment_saturates() {
        let mut c = BitrateController::default();
        let t0 = Instant::now();
        for i in 0..20 {
            c.adjust_at(t0 + Duration::from_secs(2 * i), 90, &target(100), Some(100_000.0));
        }
        assert_eq!(c.adjustment(), -50);
        assert_eq!(c.effective_quality(90), 40);
        assert_eq!(c.effective_quality(50), 20);
    }

    proptest! {
        #[test]
        fn quality_always_in_range(
            base in 0u8..=255,
            measured in prop::option::of(0.0f64..1e9),
            kbps in 0u32..100_000,
            steps in 1usize..40,
        ) {
            let mut c = BitrateController::default();
            let t0 = Instant::now();
            for i in 0..steps {
                let q = c.adjust_at(t0 + Duration::from_secs(3 * i as u64), base, &target(kbps), measured);
                prop_assert!((20..=95).contains(&q));
                prop_assert!((-50..=50).contains(&c.adjustment()));
            }
        }

        #[test]
        fn at_most_one_change_per_window(offsets in prop::collection::vec(0u64..1999, 1..30)) {
            let mut c = BitrateController::default();
            let t0 = Instant::now();
            for off in offsets {
                c.adjust_at(t0 + Duration::from_millis(off), 80, &target(2000), Some(9000.0));
            }
            prop_assert_eq!(c.adjustment(), -10);
        }
    }
}
