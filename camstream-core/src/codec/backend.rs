//! Codec backends.
//!
//! [`JpegCodec`] is the universal fallback: pure Rust, no hardware, and
//! it encodes any valid frame. [`FfmpegCodec`] drives an external
//! `ffmpeg` process per frame and emits one intra-coded access unit in
//! the family's elementary-stream format. A child that outlives its
//! deadline is killed and the frame counts as an encode failure.

use std::io::Cursor;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use image::codecs::jpeg::JpegEncoder;
use image::{ImageBuffer, RgbImage};

use super::process::run_with_deadline;
use super::{CodecFamily, CodecVariant};
use crate::error::StreamError;
use crate::frame::RawFrame;

// ── Traits ───────────────────────────────────────────────────────

/// An initialised encoder for one codec variant.
pub trait FrameCodec: Send {
    fn variant(&self) -> &CodecVariant;

    /// Encode `frame` at `quality` (1–100, higher is better).
    fn encode(&mut self, frame: &RawFrame, quality: u8) -> Result<Vec<u8>, StreamError>;
}

/// Opens a backend for a variant. Failure here is a codec init failure.
pub trait CodecFactory: Send + Sync {
    fn open(&self, variant: &CodecVariant) -> Result<Box<dyn FrameCodec>, StreamError>;
}

// ── JpegCodec ────────────────────────────────────────────────────

pub struct JpegCodec {
    variant: CodecVariant,
}

impl JpegCodec {
    pub fn new() -> Self {
        Self {
            variant: CodecVariant::jpeg_fallback(),
        }
    }
}

impl Default for JpegCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec for JpegCodec {
    fn variant(&self) -> &CodecVariant {
        &self.variant
    }

    fn encode(&mut self, frame: &RawFrame, quality: u8) -> Result<Vec<u8>, StreamError> {
        let fail = |reason: String| StreamError::EncodeFailure {
            codec: "JPEG".into(),
            reason,
        };
        let img: RgbImage = ImageBuffer::from_raw(frame.width, frame.height, frame.to_rgb8())
            .ok_or_else(|| fail(format!("invalid image dimensions {}", frame.resolution())))?;

        let mut buf = Cursor::new(Vec::with_capacity(frame.byte_len() / 8));
        let encoder = JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
        img.write_with_encoder(encoder)
            .map_err(|e| fail(e.to_string()))?;
        Ok(buf.into_inner())
    }
}

// ── FfmpegCodec ──────────────────────────────────────────────────

/// Per-frame encoder backed by an `ffmpeg` subprocess.
pub struct FfmpegCodec {
    variant: CodecVariant,
    binary: PathBuf,
    vaapi_device: PathBuf,
    timeout: Duration,
}

impl FfmpegCodec {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

    /// Check that `ffmpeg` exists and knows the variant's encoder.
    pub fn open(variant: &CodecVariant, binary: impl Into<PathBuf>) -> Result<Self, StreamError> {
        Self::open_with_timeout(variant, binary, Self::DEFAULT_TIMEOUT)
    }

    /// Like [`FfmpegCodec::open`], bounding the check and every later
    /// encode by `timeout`.
    pub fn open_with_timeout(
        variant: &CodecVariant,
        binary: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Result<Self, StreamError> {
        let binary = binary.into();
        let init_fail = |reason: String| StreamError::CodecInitFailure {
            codec: variant.to_string(),
            reason,
        };
        let child = Command::new(&binary)
            .arg("-hide_banner")
            .arg("-h")
            .arg(format!("encoder={}", variant.encoder_tag))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    init_fail(format!("{} not found", binary.display()))
                } else {
                    init_fail(e.to_string())
                }
            })?;
        let output = run_with_deadline(child, None, timeout)
            .map_err(|e| init_fail(e.to_string()))?
            .ok_or_else(|| init_fail(format!("no answer within {timeout:?}")))?;
        let text = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() || !text.contains("Encoder ") {
            return Err(init_fail(format!("encoder {} not available", variant.encoder_tag)));
        }
        Ok(Self {
            variant: variant.clone(),
            binary,
            vaapi_device: PathBuf::from("/dev/dri/renderD128"),
            timeout,
        })
    }

    fn args(&self, frame: &RawFrame, quality: u8) -> Vec<String> {
        let tag = self.variant.encoder_tag.as_str();
        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-nostdin"]
            .into_iter()
            .map(String::from)
            .collect();
        if tag.ends_with("_vaapi") {
            args.push("-vaapi_device".into());
            args.push(self.vaapi_device.display().to_string());
        }
        args.extend(
            [
                "-f".to_string(),
                "rawvideo".into(),
                "-pix_fmt".into(),
                "rgb24".into(),
                "-s".into(),
                format!("{}x{}", frame.width, frame.height),
                "-i".into(),
                "pipe:0".into(),
                "-frames:v".into(),
                "1".into(),
            ],
        );
        if tag.ends_with("_vaapi") {
            args.extend(["-vf".into(), "format=nv12,hwupload".into()]);
        } else if self.variant.family == CodecFamily::Mjpeg {
            args.extend(["-pix_fmt".into(), "yuvj420p".into()]);
        } else {
            args.extend(["-pix_fmt".into(), "yuv420p".into()]);
        }
        args.extend(["-c:v".into(), tag.to_string()]);
        args.extend(quality_args(&self.variant, quality));
        args.extend([
            "-f".into(),
            elementary_format(self.variant.family).into(),
            "pipe:1".into(),
        ]);
        args
    }
}

impl FrameCodec for FfmpegCodec {
    fn variant(&self) -> &CodecVariant {
        &self.variant
    }

    fn encode(&mut self, frame: &RawFrame, quality: u8) -> Result<Vec<u8>, StreamError> {
        let fail = |reason: String| StreamError::EncodeFailure {
            codec: self.variant.to_string(),
            reason,
        };
        let child = Command::new(&self.binary)
            .args(self.args(frame, quality))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| fail(e.to_string()))?;

        let output = run_with_deadline(child, Some(frame.to_rgb8()), self.timeout)
            .map_err(|e| fail(format!("stdin: {e}")))?
            .ok_or_else(|| fail(format!("timed out after {:?}", self.timeout)))?;
        if !output.status.success() {
            let err = String::from_utf8_lossy(&output.stderr);
            return Err(fail(err.trim().to_string()));
        }
        if output.stdout.is_empty() {
            return Err(fail("empty output".into()));
        }
        Ok(output.stdout)
    }
}

/// Output muxer producing a bare access unit for a family.
pub fn elementary_format(family: CodecFamily) -> &'static str {
    match family {
        CodecFamily::H264 => "h264",
        CodecFamily::H265 => "hevc",
        CodecFamily::Vp8 | CodecFamily::Vp9 | CodecFamily::Av1 => "ivf",
        CodecFamily::Mjpeg | CodecFamily::Jpeg => "mjpeg",
    }
}

/// Map a 1–100 quality onto the encoder's native quality knob.
pub fn quality_args(variant: &CodecVariant, quality: u8) -> Vec<String> {
    let q = u32::from(quality.clamp(1, 100));
    // Linear map of quality 100 → `best`, quality 1 → `worst`.
    let scale = |best: u32, worst: u32| worst - (q - 1) * (worst - best) / 99;
    let tag = variant.encoder_tag.as_str();
    let (flag, value) = if tag.contains("nvenc") {
        ("-cq", scale(1, 51))
    } else if tag.contains("qsv") {
        ("-global_quality", scale(1, 51))
    } else if tag.contains("vaapi") {
        ("-qp", scale(1, 51))
    } else {
        match variant.family {
            CodecFamily::H264 | CodecFamily::H265 => ("-crf", scale(0, 51)),
            CodecFamily::Vp8 => ("-crf", scale(4, 63)),
            CodecFamily::Vp9 | CodecFamily::Av1 => ("-crf", scale(0, 63)),
            CodecFamily::Mjpeg | CodecFamily::Jpeg => ("-q:v", scale(2, 31)),
        }
    };
    let mut args = vec![flag.to_string(), value.to_string()];
    if matches!(variant.family, CodecFamily::Vp8 | CodecFamily::Vp9) && !variant.hardware_accelerated {
        args.extend(["-b:v".into(), "0".into()]);
    }
    args
}

// ── DefaultCodecFactory ──────────────────────────────────────────

/// JPEG in-process, everything else through `ffmpeg`.
#[derive(Debug, Clone)]
pub struct DefaultCodecFactory {
    pub ffmpeg: PathBuf,
    /// Deadline for each `ffmpeg` child.
    pub encode_timeout: Duration,
}

impl Default for DefaultCodecFactory {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            encode_timeout: FfmpegCodec::DEFAULT_TIMEOUT,
        }
    }
}

impl CodecFactory for DefaultCodecFactory {
    fn open(&self, variant: &CodecVariant) -> Result<Box<dyn FrameCodec>, StreamError> {
        match variant.family {
            CodecFamily::Jpeg => Ok(Box::new(JpegCodec::new())),
            _ => Ok(Box::new(FfmpegCodec::open_with_timeout(
                variant,
                &self.ffmpeg,
                self.encode_timeout,
            )?)),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
