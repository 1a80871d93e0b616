//! Per-connection streaming worker.
//!
//! One worker task per streaming client. Each iteration:
//!
//! 1. Exit if the connection's `streaming` flag was cleared.
//! 2. Wait until the next frame slot is due (deadline pacing).
//! 3. Resolve the effective quality through the [`BitrateController`].
//! 4. Pull a frame from the shared capture, backing off while none arrive.
//! 5. Drop the pull if the transport is still digesting a recent
//!    oversized frame.
//! 6. Resize, encode and apply the encoding method on the blocking pool,
//!    then send the frame unchunked or as envelope + chunks.
//! 7. Update the rolling bitrate and the moving averages.
//!
//! Stop is cooperative: every sleep is bounded by a short quantum and the
//! flag is checked at the top of each iteration.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bitrate::{BitrateController, RateMeter};
use crate::capture::CaptureLease;
use crate::chunker::{FrameChunker, FrameEnvelope, FrameId, FrameMeta};
use crate::codec::{CodecFactory, CodecFamily, CodecTable};
use crate::config::StreamingConfig;
use crate::connection::{ConnectionId, EncodingMethod, PerformanceStats, StreamSettings, WorkerPhase};
use crate::control::{ServerEvent, StatsSnapshot};
use crate::encoder::{CodecRequest, FrameEncoder};
use crate::error::StreamError;
use crate::frame::{RawFrame, Resolution};
use crate::transport::FrameSink;

// ── Pacer ────────────────────────────────────────────────────────

/// Deadline-based frame pacing.
///
/// A frame is due once `tolerance × interval` has passed since the
/// previous frame's slot. Slots advance by exactly one interval, so the
/// long-run rate equals the target even though individual frames may go
/// out early. A pacer more than one interval behind resynchronises
/// instead of bursting.
#[derive(Debug, Clone)]
pub struct Pacer {
    interval: Duration,
    tolerance: f64,
    slot: Option<Instant>,
}

impl Pacer {
    pub fn new(fps: u32, tolerance: f64) -> Self {
        Self {
            interval: interval_for(fps),
            tolerance: tolerance.clamp(0.0, 1.0),
            slot: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn set_fps(&mut self, fps: u32) {
        self.interval = interval_for(fps);
    }

    /// Time left until the next frame is due; zero if it is due now.
    pub fn wait_time(&self, now: Instant) -> Duration {
        match self.slot {
            None => Duration::ZERO,
            Some(slot) => (slot + self.interval.mul_f64(self.tolerance)).saturating_duration_since(now),
        }
    }

    /// Consume the current slot.
    pub fn commit(&mut self, now: Instant) {
        self.slot = Some(match self.slot {
            None => now,
            Some(slot) => {
                let next = slot + self.interval;
                if now.saturating_duration_since(next) > self.interval {
                    now
                } else {
                    next
                }
            }
        });
    }
}

fn interval_for(fps: u32) -> Duration {
    Duration::from_secs_f64(1.0 / f64::from(fps.max(1)))
}

// ── WorkerContext ────────────────────────────────────────────────

/// Collaborators handed to a worker by the registry.
#[derive(Clone)]
pub struct WorkerContext {
    pub connection_id: ConnectionId,
    pub connected_at: Instant,
    pub table: Arc<CodecTable>,
    pub factory: Arc<dyn CodecFactory>,
    pub sink: Arc<dyn FrameSink>,
    pub config: Arc<StreamingConfig>,
    pub prefer_hardware: bool,
}

/// Why a worker exited.
#[derive(Debug)]
pub enum WorkerExit {
    /// The streaming flag was cleared or the registry went away.
    Stopped,
    /// Streaming became pointless; the client was sent a `stream_error`.
    Failed(StreamError),
}

// ── StreamingWorker ──────────────────────────────────────────────

struct SendRecord {
    finished: Instant,
    took: Duration,
    oversized: bool,
}

struct Prepared {
    payload: Bytes,
    codec: CodecFamily,
    encode_time: Duration,
}

enum Step {
    Continue,
    Exit(WorkerExit),
}

pub struct StreamingWorker {
    ctx: WorkerContext,
    lease: CaptureLease,
    settings_rx: watch::Receiver<StreamSettings>,
    settings: StreamSettings,
    stats_tx: watch::Sender<PerformanceStats>,
    streaming: Arc<AtomicBool>,
    phase: WorkerPhase,
    /// `None` only while an encode is running on the blocking pool.
    encoder: Option<FrameEncoder>,
    controller: BitrateController,
    meter: RateMeter,
    pacer: Pacer,
    stats: PerformanceStats,
    next_frame_id: u64,
    last_send: Option<SendRecord>,
    last_frame_at: Instant,
    empty_reads: u32,
    last_stats_push: Instant,
}

impl StreamingWorker {
    pub fn new(
        ctx: WorkerContext,
        lease: CaptureLease,
        settings_rx: watch::Receiver<StreamSettings>,
        streaming: Arc<AtomicBool>,
    ) -> (Self, watch::Receiver<PerformanceStats>) {
        let settings = settings_rx.borrow().clone();
        let encoder = FrameEncoder::new(
            Arc::clone(&ctx.table),
            Arc::clone(&ctx.factory),
            settings.codec,
            ctx.prefer_hardware,
            ctx.config.encode_sample_window,
        );
        let stats = PerformanceStats {
            effective_quality: settings.quality,
            encoder_phase: encoder.phase(),
            codec: encoder.active_variant().to_string(),
            ..Default::default()
        };
        let (stats_tx, stats_rx) = watch::channel(stats.clone());
        let now = Instant::now();
        let worker = Self {
            pacer: Pacer::new(settings.target_fps, ctx.config.pacing_tolerance),
            controller: BitrateController::new(ctx.config.bitrate.clone()),
            meter: RateMeter::with_window(ctx.config.stats_window()),
            ctx,
            lease,
            settings_rx,
            settings,
            stats_tx,
            streaming,
            phase: WorkerPhase::Idle,
            encoder: Some(encoder),
            stats,
            next_frame_id: 1,
            last_send: None,
            last_frame_at: now,
            empty_reads: 0,
            last_stats_push: now,
        };
        (worker, stats_rx)
    }

    /// Spawn the worker onto the Tokio runtime.
    pub fn spawn(self) -> JoinHandle<WorkerExit> {
        tokio::spawn(self.run())
    }

    /// Run until stopped or a terminal error.
    pub async fn run(mut self) -> WorkerExit {
        let id = self.ctx.connection_id;
        if let Err(e) = self.phase.start() {
            warn!(connection = %id, "worker start: {e}");
        }
        info!(
            connection = %id,
            fps = self.settings.target_fps,
            quality = self.settings.quality,
            resolution = %self.settings.resolution,
            codec = %self.stats.codec,
            "streaming worker started"
        );

        let exit = loop {
            if !self.streaming.load(Ordering::SeqCst) {
                break WorkerExit::Stopped;
            }
            match self.step().await {
                Step::Continue => {}
                Step::Exit(exit) => break exit,
            }
        };

        if let Err(e) = self.phase.drain() {
            debug!(connection = %id, "worker drain: {e}");
        }
        if let WorkerExit::Failed(err) = &exit {
            self.streaming.store(false, Ordering::SeqCst);
            error!(connection = %id, code = err.code(), "stream failed: {err}");
            let _ = self.ctx.sink.send_event(&ServerEvent::error(err)).await;
            let _ = self
                .ctx
                .sink
                .send_event(&ServerEvent::StreamStopped {
                    reason: Some(err.code().to_string()),
                })
                .await;
        }
        self.publish();
        if let Err(e) = self.phase.finish() {
            debug!(connection = %id, "worker finish: {e}");
        }
        info!(
            connection = %id,
            frames_sent = self.stats.frames_sent,
            frames_skipped = self.stats.frames_skipped,
            bytes = self.stats.total_bytes_sent,
            "streaming worker stopped"
        );
        // Dropping `self` releases the capture lease.
        exit
    }

    async fn step(&mut self) -> Step {
        if !self.refresh_settings() {
            return Step::Exit(WorkerExit::Stopped);
        }

        // Pacing.
        let wait = self.pacer.wait_time(Instant::now());
        if !wait.is_zero() {
            tokio::time::sleep(wait.min(self.ctx.config.pacing_quantum())).await;
            return Step::Continue;
        }

        // Quality.
        let quality = if self.settings.bitrate.enabled {
            self.controller
                .adjust(self.settings.quality, &self.settings.bitrate, self.meter.kbps())
        } else {
            self.settings.quality
        };
        self.stats.effective_quality = quality;
        self.stats.quality_adjustment = self.controller.adjustment();

        // Capture.
        let Some(frame) = self.lease.read_frame() else {
            return self.capture_backoff().await;
        };
        let now = Instant::now();
        self.empty_reads = 0;
        self.last_frame_at = now;

        // Oversize skip.
        if self.should_skip(now) {
            debug!(connection = %self.ctx.connection_id, "skipping pull behind oversized frame");
            self.stats.frames_skipped += 1;
            self.pacer.commit(now);
            self.publish();
            return Step::Continue;
        }
        self.pacer.commit(now);

        // Encode.
        let prepared = match self.encode(frame, quality).await {
            Ok(Some(p)) => p,
            Ok(None) => {
                self.stats.frames_skipped += 1;
                self.publish();
                return Step::Continue;
            }
            Err(e) => return Step::Exit(WorkerExit::Failed(e)),
        };

        // Transmit.
        let meta = FrameMeta {
            quality,
            encoding: self.settings.encoding_method,
            codec: prepared.codec,
        };
        let frame_len = prepared.payload.len();
        let started = Instant::now();
        match self.transmit(prepared.payload, meta).await {
            Ok((bytes, chunks)) => {
                let finished = Instant::now();
                self.last_send = Some(SendRecord {
                    finished,
                    took: finished - started,
                    oversized: frame_len > self.settings.chunking.max_unchunked,
                });
                self.record_sent(bytes, chunks, frame_len, prepared.encode_time, finished);
            }
            Err(e) if e.is_recoverable() => {
                warn!(connection = %self.ctx.connection_id, "transport failure, frame dropped: {e}");
                self.stats.frames_skipped += 1;
            }
            Err(e) => return Step::Exit(WorkerExit::Failed(e)),
        }

        self.publish();
        self.maybe_push_stats().await;
        Step::Continue
    }

    // ── Settings ─────────────────────────────────────────────────

    /// Pull new settings if the registry published any. Returns `false`
    /// once the registry side has gone away.
    fn refresh_settings(&mut self) -> bool {
        match self.settings_rx.has_changed() {
            Ok(false) => true,
            Ok(true) => {
                let next = self.settings_rx.borrow_and_update().clone();
                self.apply_settings(next);
                true
            }
            Err(_) => false,
        }
    }

    fn apply_settings(&mut self, next: StreamSettings) {
        let prev = std::mem::replace(&mut self.settings, next);
        let next = &self.settings;
        if prev.target_fps != next.target_fps {
            self.pacer.set_fps(next.target_fps);
        }
        if prev.bitrate.enabled && !next.bitrate.enabled {
            self.controller.reset();
            self.stats.quality_adjustment = 0;
        }
        if prev.codec_generation != next.codec_generation {
            if let Some(encoder) = self.encoder.as_mut() {
                encoder.request_codec(next.codec);
                self.stats.encoder_phase = encoder.phase();
                self.stats.codec = encoder.active_variant().to_string();
            }
        }
        debug!(connection = %self.ctx.connection_id, settings = ?self.settings, "settings updated");
    }

    // ── Capture ──────────────────────────────────────────────────

    async fn capture_backoff(&mut self) -> Step {
        self.empty_reads = self.empty_reads.saturating_add(1);
        let idle = self.last_frame_at.elapsed();
        if let Some(limit) = self.ctx.config.max_capture_failures {
            if self.empty_reads >= limit {
                return Step::Exit(WorkerExit::Failed(StreamError::CaptureStalled {
                    attempts: self.empty_reads,
                    idle,
                }));
            }
        }
        tokio::time::sleep(self.ctx.config.capture_backoff(idle)).await;
        Step::Continue
    }

    /// The previous frame was oversized, its send outlasted a frame
    /// interval, and it finished within the skip window.
    fn should_skip(&self, now: Instant) -> bool {
        let Some(last) = &self.last_send else {
            return false;
        };
        let interval = self.pacer.interval();
        let window = interval.mul_f64(self.ctx.config.oversize_skip_intervals);
        last.oversized && last.took > interval && now.saturating_duration_since(last.finished) < window
    }

    // ── Encode ───────────────────────────────────────────────────

    /// Encode on the blocking pool. `Ok(None)` means the frame was
    /// dropped for a recoverable reason.
    async fn encode(&mut self, frame: RawFrame, quality: u8) -> Result<Option<Prepared>, StreamError> {
        let mut encoder = match self.encoder.take() {
            Some(encoder) => encoder,
            None => FrameEncoder::new(
                Arc::clone(&self.ctx.table),
                Arc::clone(&self.ctx.factory),
                self.settings.codec,
                self.ctx.prefer_hardware,
                self.ctx.config.encode_sample_window,
            ),
        };
        let resolution = self.settings.resolution;
        let codec = self.settings.codec;
        let method = self.settings.encoding_method;

        let task = tokio::task::spawn_blocking(move || {
            let result = prepare(&mut encoder, frame, resolution, quality, codec, method);
            (encoder, result)
        });
        // Backends bound their own work; this catches one that does not.
        let limit = self.ctx.config.encode_timeout() * 2;
        let joined = match tokio::time::timeout(limit, task).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!(
                    connection = %self.ctx.connection_id,
                    codec = %self.stats.codec,
                    "encode still running after {limit:?}, abandoning it for the fallback"
                );
                let mut encoder = FrameEncoder::new(
                    Arc::clone(&self.ctx.table),
                    Arc::clone(&self.ctx.factory),
                    self.settings.codec,
                    self.ctx.prefer_hardware,
                    self.ctx.config.encode_sample_window,
                );
                encoder.demote();
                self.install_encoder(encoder);
                return Ok(None);
            }
        };

        let (encoder, result) = joined.map_err(|e| StreamError::EncodeFailure {
            codec: self.stats.codec.clone(),
            reason: format!("encoder task failed: {e}"),
        })?;
        self.install_encoder(encoder);

        match result {
            Ok(prepared) => Ok(Some(prepared)),
            Err(e) if e.is_recoverable() => {
                warn!(connection = %self.ctx.connection_id, "frame dropped: {e}");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn install_encoder(&mut self, encoder: FrameEncoder) {
        self.stats.encoder_phase = encoder.phase();
        self.stats.codec = encoder.active_variant().to_string();
        self.stats.encoder = Some(encoder.report());
        self.encoder = Some(encoder);
    }

    // ── Transmit ─────────────────────────────────────────────────

    /// Send one frame. Returns `(bytes on the wire, chunk count)`.
    async fn transmit(&mut self, payload: Bytes, meta: FrameMeta) -> Result<(usize, usize), StreamError> {
        let frame_id = FrameId(self.next_frame_id);
        self.next_frame_id += 1;
        let policy = self.settings.chunking;

        if !policy.should_chunk(payload.len()) {
            let envelope = FrameEnvelope::new(&payload, frame_id, 1, meta);
            let bytes = self.ctx.sink.send_raw_frame(&envelope, payload).await?;
            return Ok((bytes, 0));
        }

        let (envelope, chunks) = FrameChunker::chunk_with(payload, frame_id, policy.chunk_size, meta)?;
        let pace_chunks = chunks.len() > self.ctx.config.large_frame_chunks;
        let mut bytes = self.ctx.sink.send_envelope(&envelope).await?;
        for chunk in &chunks {
            bytes += self.ctx.sink.send_chunk(chunk).await?;
            if pace_chunks {
                tokio::task::yield_now().await;
            }
        }
        debug!(
            connection = %self.ctx.connection_id,
            frame_id = %frame_id,
            chunks = chunks.len(),
            size = envelope.total_size,
            "chunked frame sent"
        );
        Ok((bytes, chunks.len()))
    }

    // ── Stats ────────────────────────────────────────────────────

    fn record_sent(&mut self, bytes: usize, chunks: usize, frame_len: usize, encode_time: Duration, now: Instant) {
        let alpha = self.ctx.config.ema_weight;
        let ema = |old: f64, new: f64, first: bool| if first { new } else { (1.0 - alpha) * old + alpha * new };
        let first = self.stats.frames_sent == 0;

        self.stats.frames_sent += 1;
        self.stats.total_bytes_sent += bytes as u64;
        if chunks > 0 {
            self.stats.frames_chunked += 1;
            self.stats.chunks_sent += chunks as u64;
        }
        self.stats.avg_encode_time_ms =
            ema(self.stats.avg_encode_time_ms, encode_time.as_secs_f64() * 1000.0, first);
        self.stats.avg_frame_size_bytes = ema(self.stats.avg_frame_size_bytes, frame_len as f64, first);

        if self.meter.record_at(now, bytes as u64) {
            self.stats.rolling_bitrate_mbps = self.meter.mbps();
        }
    }

    fn publish(&self) {
        self.stats_tx.send_replace(self.stats.clone());
    }

    async fn maybe_push_stats(&mut self) {
        let every = self.ctx.config.stats_push_interval_ms;
        if every == 0 || self.last_stats_push.elapsed() < Duration::from_millis(every) {
            return;
        }
        self.last_stats_push = Instant::now();
        let snapshot = StatsSnapshot::from_parts(true, self.ctx.connected_at, &self.settings, &self.stats);
        if let Err(e) = self.ctx.sink.send_event(&ServerEvent::StreamStats(snapshot)).await {
            debug!(connection = %self.ctx.connection_id, "stats push failed: {e}");
        }
    }
}

/// Resize → encode → encoding method. Runs on the blocking pool.
fn prepare(
    encoder: &mut FrameEncoder,
    frame: RawFrame,
    resolution: Resolution,
    quality: u8,
    codec: CodecRequest,
    method: EncodingMethod,
) -> Result<Prepared, StreamError> {
    let frame = frame.resized(resolution)?;
    let encoded = encoder.encode(&frame, quality, codec)?;
    let payload = method.apply(encoded.data)?;
    Ok(Prepared {
        payload,
        codec: encoded.codec,
        encode_time: encoded.encode_time,
    })
}

// ── Tests ────────────────────────────────────────────────────────
