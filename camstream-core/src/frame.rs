//! Raw frame type handed from the capture collaborator to the workers.
//!
//! Each read from the capture source yields an independent [`RawFrame`];
//! the pixel buffer is a reference-counted [`Bytes`] so fanning a single
//! capture out to several workers never shares a mutable buffer.

use std::time::Instant;

use bytes::Bytes;
use image::{ImageBuffer, Rgb, imageops::FilterType};

use crate::error::StreamError;

// ── PixelFormat ──────────────────────────────────────────────────

/// Pixel layout for raw captured frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 3 bytes per pixel: Red, Green, Blue.
    Rgb8,
    /// 4 bytes per pixel: Blue, Green, Red, Alpha.
    Bgra8,
    /// 4 bytes per pixel: Red, Green, Blue, Alpha.
    Rgba8,
}

impl PixelFormat {
    /// Bytes consumed by a single pixel in this format.
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgra8 | PixelFormat::Rgba8 => 4,
            PixelFormat::Rgb8 => 3,
        }
    }
}

// ── Resolution ───────────────────────────────────────────────────

/// Width × height in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::new(640, 480)
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

// ── RawFrame ─────────────────────────────────────────────────────

/// An uncompressed frame obtained from the capture collaborator.
///
/// Rows are tightly packed: `data.len() == width * height * bpp`.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Bytes,
    /// Monotonic capture timestamp.
    pub captured_at: Instant,
    /// Capture-side sequence number.
    pub sequence: u64,
}

impl RawFrame {
    /// Build a frame, checking the buffer length against the geometry.
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        data: impl Into<Bytes>,
        sequence: u64,
    ) -> Result<Self, StreamError> {
        let data = data.into();
        let expected = width as usize * height as usize * format.bytes_per_pixel();
        if width == 0 || height == 0 || data.len() != expected {
            return Err(StreamError::InvalidSettings(format!(
                "frame {width}x{height} {format:?} needs {expected} bytes, got {}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            format,
            data,
            captured_at: Instant::now(),
            sequence,
        })
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Total byte size of the raw bitmap.
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Packed RGB24 copy of the pixel data.
    pub fn to_rgb8(&self) -> Vec<u8> {
        match self.format {
            PixelFormat::Rgb8 => self.data.to_vec(),
            PixelFormat::Rgba8 => self
                .data
                .chunks_exact(4)
                .flat_map(|px| [px[0], px[1], px[2]])
                .collect(),
            PixelFormat::Bgra8 => self
                .data
                .chunks_exact(4)
                .flat_map(|px| [px[2], px[1], px[0]])
                .collect(),
        }
    }

    /// Return a copy scaled to `target` (RGB8 output). A frame that
    /// already has the requested size is returned as a cheap clone.
    pub fn resized(&self, target: Resolution) -> Result<RawFrame, StreamError> {
        if !target.is_valid() {
            return Err(StreamError::InvalidSettings(format!(
                "cannot resize to {target}"
            )));
        }
        if self.resolution() == target {
            return Ok(self.clone());
        }
        let buf: ImageBuffer<Rgb<u8>, Vec<u8>> =
            ImageBuffer::from_raw(self.width, self.height, self.to_rgb8()).ok_or_else(|| {
                StreamError::InvalidSettings(format!("bad buffer for {}", self.resolution()))
            })?;
        let scaled = image::imageops::resize(&buf, target.width, target.height, FilterType::Triangle);
        Ok(RawFrame {
            width: target.width,
            height: target.height,
            format: PixelFormat::Rgb8,
            data: Bytes::from(scaled.into_raw()),
            captured_at: self.captured_at,
            sequence: self.sequence,
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32, format: PixelFormat, px: &[u8]) -> RawFrame {
        let data: Vec<u8> = px
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * format.bytes_per_pixel())
            .collect();
        RawFrame::new(width, height, format, data, 0).unwrap()
    }

    #[test]
    fn rejects_wrong_length() {
        let err = RawFrame::new(4, 4, PixelFormat::Rgb8, vec![0u8; 10], 0).unwrap_err();
        assert!(matches!(err, StreamError::InvalidSettings(_)));
    }

    #[test]
    fn bgra_to_rgb_swaps_channels() {
        let f = solid(2, 2, PixelFormat::Bgra8, &[10, 20, 30, 255]);
        let rgb = f.to_rgb8();
        assert_eq!(rgb.len(), 12);
        assert_eq!(&rgb[..3], &[30, 20, 10]);
    }

    #[test]
    fn rgba_to_rgb_drops_alpha() {
        let f = solid(1, 1, PixelFormat::Rgba8, &[1, 2, 3, 4]);
        assert_eq!(f.to_rgb8(), vec![1, 2, 3]);
    }

    #[test]
    fn resize_changes_geometry() {
        let f = solid(64, 48, PixelFormat::Rgb8, &[100, 150, 200]);
        let r = f.resized(Resolution::new(32, 24)).unwrap();
        assert_eq!(r.resolution(), Resolution::new(32, 24));
        assert_eq!(r.byte_len(), 32 * 24 * 3);
        // A solid colour survives bilinear scaling.
        assert_eq!(&r.data[..3], &[100, 150, 200]);
    }

    #[test]
    fn resize_to_same_size_is_identity() {
        let f = solid(8, 8, PixelFormat::Bgra8, &[0, 0, 0, 0]);
        let r = f.resized(Resolution::new(8, 8)).unwrap();
        assert_eq!(r.format, PixelFormat::Bgra8);
        assert_eq!(r.data, f.data);
    }

    #[test]
    fn resolution_display() {
        assert_eq!(Resolution::new(1920, 1080).to_string(), "1920x1080");
        assert!(!Resolution::new(0, 10).is_valid());
    }
}
