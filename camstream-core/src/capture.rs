//! Capture collaborator contract and shared ownership.
//!
//! One [`FrameSource`] is shared by every worker. Workers hold a
//! [`CaptureLease`]; the first lease starts the source and dropping the
//! last one stops it, tracked by an explicit atomic reference count.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info};

use crate::error::StreamError;
use crate::frame::{PixelFormat, RawFrame, Resolution};

// ── FrameSource ──────────────────────────────────────────────────

/// Parameters the first lease starts the source with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRequest {
    pub camera_index: u32,
    pub resolution: Resolution,
    pub fps: u32,
}

impl Default for CaptureRequest {
    fn default() -> Self {
        Self {
            camera_index: 0,
            resolution: Resolution::default(),
            fps: 30,
        }
    }
}

/// A frame producer. Implementations synchronise internally; each
/// `read_frame` returns an independent frame value.
pub trait FrameSource: Send + Sync {
    fn start(&self, request: &CaptureRequest) -> Result<(), StreamError>;

    fn stop(&self);

    /// Non-blocking or short-blocking read. `None` if no frame is ready.
    fn read_frame(&self) -> Option<RawFrame>;

    fn is_active(&self) -> bool;
}

// ── SharedCapture ────────────────────────────────────────────────

pub struct SharedCapture {
    source: Arc<dyn FrameSource>,
    leases: AtomicUsize,
    /// Serialises the 0→1 start and 1→0 stop transitions.
    transition: Mutex<()>,
}

impl SharedCapture {
    pub fn new(source: Arc<dyn FrameSource>) -> Arc<Self> {
        Arc::new(Self {
            source,
            leases: AtomicUsize::new(0),
            transition: Mutex::new(()),
        })
    }

    /// Take a lease, starting the source if this is the first one.
    pub fn acquire(self: &Arc<Self>, request: &CaptureRequest) -> Result<CaptureLease, StreamError> {
        let _guard = self.transition.lock().unwrap_or_else(|e| e.into_inner());
        if self.leases.load(Ordering::Acquire) == 0 {
            self.source.start(request)?;
            info!(
                camera = request.camera_index,
                resolution = %request.resolution,
                fps = request.fps,
                "capture started"
            );
        }
        let held = self.leases.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(leases = held, "capture lease acquired");
        Ok(CaptureLease {
            capture: Arc::clone(self),
        })
    }

    /// Number of live leases.
    pub fn leases(&self) -> usize {
        self.leases.load(Ordering::Acquire)
    }

    pub fn is_active(&self) -> bool {
        self.source.is_active()
    }

    fn release(&self) {
        let _guard = self.transition.lock().unwrap_or_else(|e| e.into_inner());
        let previous = self.leases.fetch_sub(1, Ordering::AcqRel);
        if previous == 1 {
            self.source.stop();
            info!("capture released");
        } else {
            debug!(leases = previous - 1, "capture lease dropped");
        }
    }
}

/// A worker's claim on the shared capture source.
pub struct CaptureLease {
    capture: Arc<SharedCapture>,
}

impl CaptureLease {
    pub fn read_frame(&self) -> Option<RawFrame> {
        self.capture.source.read_frame()
    }

    pub fn is_active(&self) -> bool {
        self.capture.source.is_active()
    }
}

impl Drop for CaptureLease {
    fn drop(&mut self) {
        self.capture.release();
    }
}

// ── SyntheticSource ──────────────────────────────────────────────

struct SyntheticState {
    active: bool,
    request: CaptureRequest,
    sequence: u64,
    latest: Option<RawFrame>,
    last_generated: Option<Instant>,
}

/// Moving-gradient test pattern.
///
/// Produces a new frame once per period and hands out the latest frame
/// to every reader in between.
pub struct SyntheticSource {
    state: Mutex<SyntheticState>,
    period_override: Option<Duration>,
}

impl SyntheticSource {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SyntheticState {
                active: false,
                request: CaptureRequest::default(),
                sequence: 0,
                latest: None,
                last_generated: None,
            }),
            period_override: None,
        }
    }

    /// Generate frames every `period` regardless of the requested fps.
    pub fn with_period(period: Duration) -> Self {
        Self {
            period_override: Some(period),
            ..Self::new()
        }
    }

    fn period(&self, request: &CaptureRequest) -> Duration {
        self.period_override
            .unwrap_or_else(|| Duration::from_secs_f64(1.0 / f64::from(request.fps.max(1))))
    }

    /// Render frame `tick` of the pattern.
    pub fn render(resolution: Resolution, tick: u64) -> RawFrame {
        let (w, h) = (resolution.width as usize, resolution.height as usize);
        let shift = (tick * 4) as usize;
        let mut data = Vec::with_capacity(w * h * 3);
        for y in 0..h {
            let g = (y * 255 / h.max(1)) as u8;
            for x in 0..w {
                let r = ((x + shift) * 255 / w.max(1)) as u8;
                let b = ((x + y + shift / 2) % 256) as u8;
                data.extend_from_slice(&[r, g, b]);
            }
        }
        RawFrame {
            width: resolution.width,
            height: resolution.height,
            format: PixelFormat::Rgb8,
            data: Bytes::from(data),
            captured_at: Instant::now(),
            sequence: tick,
        }
    }
}

impl Default for SyntheticSource {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSource for SyntheticSource {
    fn start(&self, request: &CaptureRequest) -> Result<(), StreamError> {
        if !request.resolution.is_valid() {
            return Err(StreamError::CaptureUnavailable(format!(
                "cannot open camera {} at {}",
                request.camera_index, request.resolution
            )));
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.active = true;
        state.request = *request;
        state.latest = None;
        state.last_generated = None;
        Ok(())
    }

    fn stop(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.active = false;
        state.latest = None;
    }

    fn read_frame(&self) -> Option<RawFrame> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.active {
            return None;
        }
        let now = Instant::now();
        let due = state
            .last_generated
            .is_none_or(|last| now.duration_since(last) >= self.period(&state.request));
        if due {
            let frame = Self::render(state.request.resolution, state.sequence);
            state.sequence += 1;
            state.last_generated = Some(now);
            state.latest = Some(frame);
        }
        state.latest.clone()
    }

    fn is_active(&self) -> bool {
        self.state.lock().map(|s| s.active).unwrap_or(false)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[derive(Default)]
    struct CountingSource {
        starts: AtomicU32,
        stops: AtomicU32,
        active: std::sync::atomic::AtomicBool,
    }

    impl FrameSource for CountingSource {
        fn start(&self, _request: &CaptureRequest) -> Result<(), StreamError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            self.active.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.active.store(false, Ordering::SeqCst);
        }

        fn read_frame(&self) -> Option<RawFrame> {
            None
        }

        fn is_active(&self) -> bool {
            self.active.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn last_lease_releases_source() {
        let source = Arc::new(CountingSource::default());
        let shared = SharedCapture::new(source.clone());
        let req = CaptureRequest::default();

        let a = shared.acquire(&req).unwrap();
        let b = shared.acquire(&req).unwrap();
        assert_eq!(source.starts.load(Ordering::SeqCst), 1);
        assert_eq!(shared.leases(), 2);

        drop(a);
        assert!(source.active.load(Ordering::SeqCst));
        assert_eq!(source.stops.load(Ordering::SeqCst), 0);

        drop(b);
        assert_eq!(source.stops.load(Ordering::SeqCst), 1);
        assert_eq!(shared.leases(), 0);

        // A fresh lease restarts it.
        let _c = shared.acquire(&req).unwrap();
        assert_eq!(source.starts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_start_takes_no_lease() {
        let shared = SharedCapture::new(Arc::new(SyntheticSource::new()));
        let req = CaptureRequest {
            resolution: Resolution::new(0, 0),
            ..Default::default()
        };
        assert!(matches!(
            shared.acquire(&req).err(),
            Some(StreamError::CaptureUnavailable(_))
        ));
        assert_eq!(shared.leases(), 0);
    }

    #[test]
    fn synthetic_produces_requested_geometry() {
        let src = SyntheticSource::new();
        assert!(src.read_frame().is_none());
        src.start(&CaptureRequest {
            resolution: Resolution::new(32, 16),
            ..Default::default()
        })
        .unwrap();
        let f = src.read_frame().unwrap();
        assert_eq!(f.resolution(), Resolution::new(32, 16));
        assert_eq!(f.byte_len(), 32 * 16 * 3);
        src.stop();
        assert!(!src.is_active());
        assert!(src.read_frame().is_none());
    }

    #[test]
    fn synthetic_advances_once_per_period() {
        let src = SyntheticSource::with_period(Duration::from_millis(20));
        src.start(&CaptureRequest {
            resolution: Resolution::new(8, 8),
            ..Default::default()
        })
        .unwrap();
        let a = src.read_frame().unwrap();
        let b = src.read_frame().unwrap();
        assert_eq!(a.sequence, b.sequence);
        std::thread::sleep(Duration::from_millis(25));
        let c = src.read_frame().unwrap();
        assert_eq!(c.sequence, a.sequence + 1);
        assert_ne!(a.data, SyntheticSource::render(Resolution::new(8, 8), 5).data);
    }
}
