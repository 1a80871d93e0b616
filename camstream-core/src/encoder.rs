//! Frame encoder with hardware → software → JPEG fallback.
//!
//! A [`FrameEncoder`] resolves the requested codec against the host's
//! [`CodecTable`], opens a backend through a [`CodecFactory`], and walks
//! an explicit ordered chain of candidates until one initialises.
//!
//! ```text
//!  Uninitialized ──► HardwareActive ──► FallbackActive
//!        │                                   ▲
//!        └─────────► SoftwareActive ─────────┘
//! ```
//!
//! Runtime encode failures demote the encoder to `FallbackActive`,
//! which is stable: only [`FrameEncoder::request_codec`] moves it back up.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::codec::{CodecFactory, CodecFamily, CodecTable, CodecVariant, FrameCodec, JpegCodec};
use crate::error::StreamError;
use crate::frame::RawFrame;

// ── CodecRequest ─────────────────────────────────────────────────

/// What the client asked for: automatic selection or a named family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CodecRequest {
    #[default]
    Auto,
    Family(CodecFamily),
}

impl FromStr for CodecRequest {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("auto") {
            Ok(CodecRequest::Auto)
        } else {
            s.parse().map(CodecRequest::Family)
        }
    }
}

impl TryFrom<String> for CodecRequest {
    type Error = StreamError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<CodecRequest> for String {
    fn from(r: CodecRequest) -> Self {
        r.to_string()
    }
}

impl fmt::Display for CodecRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecRequest::Auto => f.write_str("auto"),
            CodecRequest::Family(family) => f.write_str(family.name()),
        }
    }
}

// ── EncoderPhase ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderPhase {
    #[default]
    Uninitialized,
    HardwareActive,
    SoftwareActive,
    FallbackActive,
}

impl fmt::Display for EncoderPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "Uninitialized"),
            Self::HardwareActive => write!(f, "HardwareActive"),
            Self::SoftwareActive => write!(f, "SoftwareActive"),
            Self::FallbackActive => write!(f, "FallbackActive"),
        }
    }
}

// ── EncodedFrame / EncoderReport ─────────────────────────────────

/// Output of one successful encode.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub data: Vec<u8>,
    pub codec: CodecFamily,
    pub encode_time: Duration,
    /// The primary codec failed and the fallback produced this frame.
    pub fell_back: bool,
}

/// Snapshot of encoder performance over the sample window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderReport {
    pub phase: EncoderPhase,
    pub codec: String,
    pub hardware_accelerated: bool,
    pub frames_encoded: u64,
    pub fallback_encodes: u64,
    pub avg_encode_ms: f64,
    /// Frames per second the encoder could sustain at `avg_encode_ms`.
    pub fps_capability: f64,
    pub samples: usize,
}

// ── FrameEncoder ─────────────────────────────────────────────────

pub struct FrameEncoder {
    table: Arc<CodecTable>,
    factory: Arc<dyn CodecFactory>,
    prefer_hardware: bool,
    requested: CodecRequest,
    phase: EncoderPhase,
    /// Primary backend. `None` while in `FallbackActive`.
    active: Option<Box<dyn FrameCodec>>,
    fallback: Box<dyn FrameCodec>,
    samples: VecDeque<Duration>,
    max_samples: usize,
    frames_encoded: u64,
    fallback_encodes: u64,
}

impl FrameEncoder {
    /// Build and initialise an encoder. Never fails: the worst outcome
    /// is an encoder committed to the universal fallback.
    pub fn new(
        table: Arc<CodecTable>,
        factory: Arc<dyn CodecFactory>,
        requested: CodecRequest,
        prefer_hardware: bool,
        max_samples: usize,
    ) -> Self {
        let fallback = factory.open(table.fallback()).unwrap_or_else(|e| {
            warn!("fallback backend unavailable from factory, using built-in JPEG: {e}");
            Box::new(JpegCodec::new())
        });
        let mut encoder = Self {
            table,
            factory,
            prefer_hardware,
            requested,
            phase: EncoderPhase::Uninitialized,
            active: None,
            fallback,
            samples: VecDeque::with_capacity(max_samples.max(1)),
            max_samples: max_samples.max(1),
            frames_encoded: 0,
            fallback_encodes: 0,
        };
        encoder.initialize();
        encoder
    }

    pub fn phase(&self) -> EncoderPhase {
        self.phase
    }

    pub fn requested(&self) -> CodecRequest {
        self.requested
    }

    /// The variant currently producing frames.
    pub fn active_variant(&self) -> &CodecVariant {
        match &self.active {
            Some(codec) => codec.variant(),
            None => self.fallback.variant(),
        }
    }

    /// Explicit codec (re-)request. The only way out of `FallbackActive`.
    pub fn request_codec(&mut self, requested: CodecRequest) {
        info!(codec = %requested, from = %self.phase, "codec re-requested");
        self.requested = requested;
        self.phase = EncoderPhase::Uninitialized;
        self.active = None;
        self.initialize();
    }

    /// Encode `frame` at `quality` with the `requested` codec.
    ///
    /// A change of `requested` counts as an explicit re-request. A primary
    /// codec failure is retried once against the fallback before the
    /// error is returned.
    pub fn encode(
        &mut self,
        frame: &RawFrame,
        quality: u8,
        requested: CodecRequest,
    ) -> Result<EncodedFrame, StreamError> {
        if requested != self.requested || self.phase == EncoderPhase::Uninitialized {
            self.request_codec(requested);
        }

        let start = Instant::now();
        let (result, fell_back) = match self.active.as_mut() {
            Some(primary) => match primary.encode(frame, quality) {
                Ok(data) => (Ok((data, primary.variant().family)), false),
                Err(e) => {
                    warn!(codec = %primary.variant(), "encode failed, demoting to fallback: {e}");
                    self.demote();
                    (self.encode_fallback(frame, quality), true)
                }
            },
            None => (self.encode_fallback(frame, quality), false),
        };
        let (data, codec) = result?;

        let encode_time = start.elapsed();
        self.record(encode_time);
        if fell_back {
            self.fallback_encodes += 1;
        }
        Ok(EncodedFrame {
            data,
            codec,
            encode_time,
            fell_back,
        })
    }

    /// Drop the primary backend and commit to the fallback.
    pub fn demote(&mut self) {
        self.active = None;
        self.phase = EncoderPhase::FallbackActive;
    }

    pub fn report(&self) -> EncoderReport {
        let avg = self.average_encode_time();
        let avg_ms = avg.as_secs_f64() * 1000.0;
        let variant = self.active_variant();
        EncoderReport {
            phase: self.phase,
            codec: variant.to_string(),
            hardware_accelerated: variant.hardware_accelerated,
            frames_encoded: self.frames_encoded,
            fallback_encodes: self.fallback_encodes,
            avg_encode_ms: avg_ms,
            fps_capability: if avg_ms > 0.0 { 1000.0 / avg_ms } else { 0.0 },
            samples: self.samples.len(),
        }
    }

    pub fn average_encode_time(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        self.samples.iter().sum::<Duration>() / self.samples.len() as u32
    }

    // ── Internal ─────────────────────────────────────────────────

    fn encode_fallback(
        &mut self,
        frame: &RawFrame,
        quality: u8,
    ) -> Result<(Vec<u8>, CodecFamily), StreamError> {
        self.fallback
            .encode(frame, quality)
            .map(|data| (data, self.fallback.variant().family))
    }

    fn record(&mut self, elapsed: Duration) {
        if self.samples.len() == self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(elapsed);
        self.frames_encoded += 1;
    }

    fn resolve_family(&self) -> CodecFamily {
        match self.requested {
            CodecRequest::Auto => self.table.get_best(self.prefer_hardware).family,
            CodecRequest::Family(family) => family,
        }
    }

    /// Ordered init candidates: hardware for the resolved family and its
    /// substitute, then software for both. When the host has neither,
    /// the automatically selected best family takes their place. The
    /// fallback is not part of the chain.
    pub fn init_chain(&self) -> Vec<CodecVariant> {
        let chain = self.chain_for(self.resolve_family());
        if !chain.is_empty() {
            return chain;
        }
        let best = self.table.get_best(self.prefer_hardware).family;
        debug!(requested = %self.requested, best = %best, "requested codec unavailable, using best");
        self.chain_for(best)
    }

    fn chain_for(&self, family: CodecFamily) -> Vec<CodecVariant> {
        let families: Vec<CodecFamily> = std::iter::once(family).chain(family.substitute()).collect();

        let mut chain = Vec::new();
        if self.prefer_hardware {
            chain.extend(families.iter().filter_map(|f| self.table.hardware_variant(*f)).cloned());
        }
        chain.extend(families.iter().filter_map(|f| self.table.software_variant(*f)).cloned());
        chain.retain(|v| v.family != CodecFamily::Jpeg);
        chain
    }

    fn initialize(&mut self) {
        for candidate in self.init_chain() {
            match self.factory.open(&candidate) {
                Ok(codec) => {
                    self.phase = if candidate.hardware_accelerated {
                        EncoderPhase::HardwareActive
                    } else {
                        EncoderPhase::SoftwareActive
                    };
                    info!(codec = %candidate, phase = %self.phase, "encoder initialised");
                    self.active = Some(codec);
                    return;
                }
                Err(e) => debug!(codec = %candidate, "codec init failed: {e}"),
            }
        }
        self.active = None;
        self.phase = EncoderPhase::FallbackActive;
        info!(codec = %self.fallback.variant(), "encoder committed to fallback");
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;
    use std::collections::HashSet;
    use std::sync::Mutex;

    struct FakeCodec {
        variant: CodecVariant,
        fail: bool,
    }

    impl FrameCodec for FakeCodec {
        fn variant(&self) -> &CodecVariant {
            &self.variant
        }

        fn encode(&mut self, _frame: &RawFrame, quality: u8) -> Result<Vec<u8>, StreamError> {
            if self.fail {
                return Err(StreamError::EncodeFailure {
                    codec: self.variant.encoder_tag.clone(),
                    reason: "scripted".into(),
                });
            }
            let mut out = self.variant.encoder_tag.clone().into_bytes();
            out.push(quality);
            Ok(out)
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        refuse_open: HashSet<&'static str>,
        fail_encode: HashSet<&'static str>,
        opened: Mutex<Vec<String>>,
    }

    impl CodecFactory for FakeFactory {
        fn open(&self, variant: &CodecVariant) -> Result<Box<dyn FrameCodec>, StreamError> {
            self.opened.lock().unwrap().push(variant.encoder_tag.clone());
            if self.refuse_open.contains(variant.encoder_tag.as_str()) {
                return Err(StreamError::CodecInitFailure {
                    codec: variant.encoder_tag.clone(),
                    reason: "scripted".into(),
                });
            }
            Ok(Box::new(FakeCodec {
                variant: variant.clone(),
                fail: self.fail_encode.contains(variant.encoder_tag.as_str()),
            }))
        }
    }

    fn table() -> Arc<CodecTable> {
        let mut t = CodecTable::fallback_only();
        t.insert(CodecVariant::new(CodecFamily::H264, "h264_nvenc", "mp4", true));
        t.insert(CodecVariant::new(CodecFamily::H264, "libx264", "mp4", false));
        t.insert(CodecVariant::new(CodecFamily::H265, "hevc_nvenc", "mp4", true));
        t.insert(CodecVariant::new(CodecFamily::H265, "libx265", "mp4", false));
        Arc::new(t)
    }

    fn frame() -> RawFrame {
        RawFrame::new(8, 8, PixelFormat::Rgb8, vec![0u8; 192], 0).unwrap()
    }

    fn encoder(factory: FakeFactory, req: CodecRequest) -> (FrameEncoder, Arc<FakeFactory>) {
        let factory = Arc::new(factory);
        let enc = FrameEncoder::new(table(), factory.clone(), req, true, 100);
        (enc, factory)
    }

    #[test]
    fn auto_picks_hardware() {
        let (enc, _) = encoder(FakeFactory::default(), CodecRequest::Auto);
        assert_eq!(enc.phase(), EncoderPhase::HardwareActive);
        assert_eq!(enc.active_variant().encoder_tag, "h264_nvenc");
    }

    #[test]
    fn h265_chain_order() {
        let (enc, _) = encoder(FakeFactory::default(), CodecRequest::Family(CodecFamily::H265));
        let tags: Vec<_> = enc.init_chain().into_iter().map(|v| v.encoder_tag).collect();
        assert_eq!(tags, vec!["hevc_nvenc", "h264_nvenc", "libx265", "libx264"]);
    }

    #[test]
    fn unavailable_family_uses_best_before_fallback() {
        for family in [CodecFamily::Mjpeg, CodecFamily::Vp9] {
            let (enc, _) = encoder(FakeFactory::default(), CodecRequest::Family(family));
            let tags: Vec<_> = enc.init_chain().into_iter().map(|v| v.encoder_tag).collect();
            assert_eq!(tags, vec!["h264_nvenc", "libx264"], "{family}");
            assert_eq!(enc.phase(), EncoderPhase::HardwareActive);
            assert_eq!(enc.active_variant().encoder_tag, "h264_nvenc");
        }
    }

    #[test]
    fn demote_sticks_until_re_requested() {
        let (mut enc, _) = encoder(FakeFactory::default(), CodecRequest::Auto);
        enc.demote();
        assert_eq!(enc.phase(), EncoderPhase::FallbackActive);
        let out = enc.encode(&frame(), 50, CodecRequest::Auto).unwrap();
        assert_eq!(out.codec, CodecFamily::Jpeg);
        assert!(!out.fell_back);
    }

    #[test]
    fn hardware_failure_falls_to_substitute_then_software() {
        let mut f = FakeFactory::default();
        f.refuse_open.extend(["hevc_nvenc", "h264_nvenc"]);
        let (enc, _) = encoder(f, CodecRequest::Family(CodecFamily::H265));
        assert_eq!(enc.phase(), EncoderPhase::SoftwareActive);
        assert_eq!(enc.active_variant().encoder_tag, "libx265");
    }

    #[test]
    fn everything_refused_commits_to_fallback() {
        let mut f = FakeFactory::default();
        f.refuse_open.extend(["hevc_nvenc", "h264_nvenc", "libx265", "libx264"]);
        let (mut enc, _) = encoder(f, CodecRequest::Family(CodecFamily::H265));
        assert_eq!(enc.phase(), EncoderPhase::FallbackActive);
        let out = enc.encode(&frame(), 70, CodecRequest::Family(CodecFamily::H265)).unwrap();
        assert_eq!(out.codec, CodecFamily::Jpeg);
        assert!(!out.fell_back);
    }

    #[test]
    fn runtime_failure_retries_fallback_and_stays_down() {
        let mut f = FakeFactory::default();
        f.fail_encode.insert("h264_nvenc");
        let (mut enc, _) = encoder(f, CodecRequest::Auto);

        let out = enc.encode(&frame(), 50, CodecRequest::Auto).unwrap();
        assert!(out.fell_back);
        assert_eq!(out.codec, CodecFamily::Jpeg);
        assert_eq!(enc.phase(), EncoderPhase::FallbackActive);

        // Subsequent frames do not climb back up on their own.
        let out = enc.encode(&frame(), 50, CodecRequest::Auto).unwrap();
        assert!(!out.fell_back);
        assert_eq!(enc.phase(), EncoderPhase::FallbackActive);
        assert_eq!(enc.report().fallback_encodes, 1);
    }

    #[test]
    fn explicit_request_moves_back_up() {
        let mut f = FakeFactory::default();
        f.fail_encode.insert("h264_nvenc");
        let (mut enc, _) = encoder(f, CodecRequest::Auto);
        enc.encode(&frame(), 50, CodecRequest::Auto).unwrap();
        assert_eq!(enc.phase(), EncoderPhase::FallbackActive);

        enc.request_codec(CodecRequest::Family(CodecFamily::H265));
        assert_eq!(enc.phase(), EncoderPhase::HardwareActive);
        let out = enc.encode(&frame(), 50, CodecRequest::Family(CodecFamily::H265)).unwrap();
        assert_eq!(out.codec, CodecFamily::H265);
    }

    #[test]
    fn changed_request_in_encode_reinitialises() {
        let (mut enc, factory) = encoder(FakeFactory::default(), CodecRequest::Auto);
        enc.encode(&frame(), 50, CodecRequest::Family(CodecFamily::H265)).unwrap();
        assert_eq!(enc.active_variant().encoder_tag, "hevc_nvenc");
        assert!(factory.opened.lock().unwrap().contains(&"hevc_nvenc".to_string()));
    }

    #[test]
    fn fallback_failure_surfaces_error() {
        let mut f = FakeFactory::default();
        f.fail_encode.extend(["h264_nvenc", "jpeg"]);
        let (mut enc, _) = encoder(f, CodecRequest::Auto);
        let err = enc.encode(&frame(), 50, CodecRequest::Auto).unwrap_err();
        assert!(matches!(err, StreamError::EncodeFailure { .. }));
    }

    #[test]
    fn sample_window_is_bounded() {
        let factory = Arc::new(FakeFactory::default());
        let mut enc = FrameEncoder::new(table(), factory, CodecRequest::Auto, false, 5);
        for _ in 0..12 {
            enc.encode(&frame(), 50, CodecRequest::Auto).unwrap();
        }
        let report = enc.report();
        assert_eq!(report.samples, 5);
        assert_eq!(report.frames_encoded, 12);
        assert_eq!(report.phase, EncoderPhase::SoftwareActive);
    }

    #[test]
    fn codec_request_serde() {
        let r: CodecRequest = serde_json::from_str("\"hevc\"").unwrap();
        assert_eq!(r, CodecRequest::Family(CodecFamily::H265));
        assert_eq!(serde_json::to_string(&CodecRequest::Auto).unwrap(), "\"auto\"");
        assert!(serde_json::from_str::<CodecRequest>("\"theora\"").is_err());
    }
}
