//! Codec capability table.
//!
//! A [`CodecTable`] maps each [`CodecFamily`] to the variants that were
//! verified to work on this host (hardware first, then software), and
//! always holds the universal JPEG fallback. Tables are built by
//! [`detect`] / [`detect_with`], which exercise every candidate with a
//! real encode instead of trusting a capability flag.

pub mod backend;
pub mod probe;
mod process;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StreamError;

pub use backend::{CodecFactory, DefaultCodecFactory, FfmpegCodec, FrameCodec, JpegCodec};
pub use probe::{CodecProbe, FfmpegProbe, detect, detect_with};

// ── CodecFamily ──────────────────────────────────────────────────

/// A compression standard, independent of the encoder implementing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CodecFamily {
    H264,
    H265,
    Vp9,
    Vp8,
    Av1,
    Mjpeg,
    Jpeg,
}

impl CodecFamily {
    /// Fixed auto-selection order, best first.
    pub const PRIORITY: [CodecFamily; 7] = [
        CodecFamily::H264,
        CodecFamily::H265,
        CodecFamily::Vp9,
        CodecFamily::Vp8,
        CodecFamily::Av1,
        CodecFamily::Mjpeg,
        CodecFamily::Jpeg,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            CodecFamily::H264 => "H264",
            CodecFamily::H265 => "H265",
            CodecFamily::Vp9 => "VP9",
            CodecFamily::Vp8 => "VP8",
            CodecFamily::Av1 => "AV1",
            CodecFamily::Mjpeg => "MJPEG",
            CodecFamily::Jpeg => "JPEG",
        }
    }

    /// The predecessor that delivers comparable quality when this family
    /// cannot be initialised.
    pub const fn substitute(self) -> Option<CodecFamily> {
        match self {
            CodecFamily::H265 => Some(CodecFamily::H264),
            CodecFamily::Vp9 => Some(CodecFamily::Vp8),
            CodecFamily::Av1 => Some(CodecFamily::Vp9),
            _ => None,
        }
    }
}

impl fmt::Display for CodecFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CodecFamily {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "H264" | "AVC" => Ok(CodecFamily::H264),
            "H265" | "HEVC" => Ok(CodecFamily::H265),
            "VP9" => Ok(CodecFamily::Vp9),
            "VP8" => Ok(CodecFamily::Vp8),
            "AV1" => Ok(CodecFamily::Av1),
            "MJPEG" | "MJPG" => Ok(CodecFamily::Mjpeg),
            "JPEG" | "JPG" => Ok(CodecFamily::Jpeg),
            other => Err(StreamError::InvalidSettings(format!("unknown codec {other:?}"))),
        }
    }
}

// ── CodecVariant ─────────────────────────────────────────────────

/// One concrete way of producing a codec family on this host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecVariant {
    pub family: CodecFamily,
    /// Encoder identifier understood by the backend (e.g. `h264_nvenc`).
    pub encoder_tag: String,
    /// Container the probe verified this encoder with.
    pub container_format: String,
    pub hardware_accelerated: bool,
}

impl CodecVariant {
    pub fn new(
        family: CodecFamily,
        encoder_tag: impl Into<String>,
        container_format: impl Into<String>,
        hardware_accelerated: bool,
    ) -> Self {
        Self {
            family,
            encoder_tag: encoder_tag.into(),
            container_format: container_format.into(),
            hardware_accelerated,
        }
    }

    /// The universal still-image fallback. Pure software, no probing.
    pub fn jpeg_fallback() -> Self {
        Self::new(CodecFamily::Jpeg, "jpeg", "jpg", false)
    }

    pub fn name(&self) -> &'static str {
        self.family.name()
    }
}

impl fmt::Display for CodecVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}/{}{})",
            self.family,
            self.encoder_tag,
            self.container_format,
            if self.hardware_accelerated { ", hw" } else { "" }
        )
    }
}

// ── CodecTable ───────────────────────────────────────────────────

/// Ranked mapping of codec family to verified variants.
#[derive(Debug, Clone)]
pub struct CodecTable {
    variants: HashMap<CodecFamily, Vec<CodecVariant>>,
    fallback: CodecVariant,
    gpu_matrix_path: bool,
}

impl CodecTable {
    /// A table holding only the universal fallback.
    pub fn fallback_only() -> Self {
        let fallback = CodecVariant::jpeg_fallback();
        let mut variants = HashMap::new();
        variants.insert(CodecFamily::Jpeg, vec![fallback.clone()]);
        Self {
            variants,
            fallback,
            gpu_matrix_path: false,
        }
    }

    /// Add a verified variant. Hardware variants are ranked ahead of
    /// software variants of the same family.
    pub fn insert(&mut self, variant: CodecVariant) {
        let list = self.variants.entry(variant.family).or_default();
        if list.contains(&variant) {
            return;
        }
        let pos = if variant.hardware_accelerated {
            list.iter()
                .position(|v| !v.hardware_accelerated)
                .unwrap_or(list.len())
        } else {
            list.len()
        };
        list.insert(pos, variant);
    }

    pub(crate) fn set_gpu_matrix_path(&mut self, available: bool) {
        self.gpu_matrix_path = available;
    }

    /// Whether the GPU colour-conversion path initialised during probing.
    pub fn gpu_matrix_path(&self) -> bool {
        self.gpu_matrix_path
    }

    /// Auto-selection over the fixed priority order.
    pub fn get_best(&self, prefer_hardware: bool) -> &CodecVariant {
        if prefer_hardware {
            if let Some(v) = CodecFamily::PRIORITY
                .iter()
                .find_map(|f| self.hardware_variant(*f))
            {
                return v;
            }
        }
        CodecFamily::PRIORITY
            .iter()
            .find_map(|f| self.codec_info(*f))
            .unwrap_or(&self.fallback)
    }

    /// First (best-ranked) variant of a family.
    pub fn codec_info(&self, family: CodecFamily) -> Option<&CodecVariant> {
        self.variants.get(&family).and_then(|v| v.first())
    }

    pub fn variants(&self, family: CodecFamily) -> &[CodecVariant] {
        self.variants.get(&family).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn hardware_variant(&self, family: CodecFamily) -> Option<&CodecVariant> {
        self.variants(family).iter().find(|v| v.hardware_accelerated)
    }

    pub fn software_variant(&self, family: CodecFamily) -> Option<&CodecVariant> {
        self.variants(family).iter().find(|v| !v.hardware_accelerated)
    }

    pub fn contains(&self, family: CodecFamily) -> bool {
        !self.variants(family).is_empty()
    }

    /// Families present, in priority order.
    pub fn families(&self) -> Vec<CodecFamily> {
        CodecFamily::PRIORITY
            .iter()
            .copied()
            .filter(|f| self.contains(*f))
            .collect()
    }

    pub fn has_hardware(&self) -> bool {
        self.variants.values().flatten().any(|v| v.hardware_accelerated)
    }

    /// The universal fallback variant; always present.
    pub fn fallback(&self) -> &CodecVariant {
        &self.fallback
    }
}

impl Default for CodecTable {
    fn default() -> Self {
        Self::fallback_only()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn hw(family: CodecFamily, tag: &str) -> CodecVariant {
        CodecVariant::new(family, tag, "mp4", true)
    }

    fn sw(family: CodecFamily, tag: &str) -> CodecVariant {
        CodecVariant::new(family, tag, "mkv", false)
    }

    #[test]
    fn fallback_only_table_returns_jpeg() {
        let t = CodecTable::fallback_only();
        let best = t.get_best(true);
        assert_eq!(best.family, CodecFamily::Jpeg);
        assert!(!best.hardware_accelerated);
        assert_eq!(t.families(), vec![CodecFamily::Jpeg]);
    }

    #[test]
    fn prefers_hardware_when_asked() {
        let mut t = CodecTable::fallback_only();
        t.insert(sw(CodecFamily::H264, "libx264"));
        t.insert(hw(CodecFamily::H265, "hevc_nvenc"));
        assert_eq!(t.get_best(true).encoder_tag, "hevc_nvenc");
        // Without hardware preference the top-priority family wins.
        assert_eq!(t.get_best(false).encoder_tag, "libx264");
    }

    #[test]
    fn hardware_ranked_before_software() {
        let mut t = CodecTable::fallback_only();
        t.insert(sw(CodecFamily::H264, "libx264"));
        t.insert(hw(CodecFamily::H264, "h264_qsv"));
        assert_eq!(t.codec_info(CodecFamily::H264).unwrap().encoder_tag, "h264_qsv");
        assert_eq!(t.software_variant(CodecFamily::H264).unwrap().encoder_tag, "libx264");
        assert!(t.has_hardware());
    }

    #[test]
    fn duplicate_insert_ignored() {
        let mut t = CodecTable::fallback_only();
        t.insert(sw(CodecFamily::Vp8, "libvpx"));
        t.insert(sw(CodecFamily::Vp8, "libvpx"));
        assert_eq!(t.variants(CodecFamily::Vp8).len(), 1);
    }

    #[test]
    fn substitutes() {
        assert_eq!(CodecFamily::H265.substitute(), Some(CodecFamily::H264));
        assert_eq!(CodecFamily::Av1.substitute(), Some(CodecFamily::Vp9));
        assert_eq!(CodecFamily::Jpeg.substitute(), None);
    }

    #[test]
    fn parse_family_names() {
        assert_eq!("hevc".parse::<CodecFamily>().unwrap(), CodecFamily::H265);
        assert_eq!("MJPG".parse::<CodecFamily>().unwrap(), CodecFamily::Mjpeg);
        assert!("theora".parse::<CodecFamily>().is_err());
    }

    #[test]
    fn family_serde_names() {
        assert_eq!(serde_json::to_string(&CodecFamily::Vp9).unwrap(), "\"VP9\"");
        let f: CodecFamily = serde_json::from_str("\"AV1\"").unwrap();
        assert_eq!(f, CodecFamily::Av1);
    }
}
