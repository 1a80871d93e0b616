//! Host codec probing.
//!
//! Detection walks an explicit ordered list of candidate variants and
//! keeps those whose probe returns `Ok`. Every probe failure (including
//! a panic) is recorded as "unavailable"; [`detect_with`] itself cannot
//! fail and always yields a table containing the JPEG fallback.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::process::run_with_deadline;
use super::{CodecFamily, CodecTable, CodecVariant};
use crate::error::ProbeError;

// ── CodecProbe ───────────────────────────────────────────────────

/// A way of verifying that an encoder actually works on this host.
pub trait CodecProbe: Send + Sync {
    /// Initialise the GPU colour-conversion path.
    fn gpu_matrix_path(&self) -> Result<(), ProbeError>;

    /// Encode a tiny test frame with `candidate` into a file under
    /// `scratch`, re-open it, and succeed only if it decodes.
    fn encode_round_trip(&self, candidate: &CodecVariant, scratch: &Path) -> Result<(), ProbeError>;
}

// ── Candidate lists ──────────────────────────────────────────────

/// Hardware encoders probed, per family, best first.
pub fn hardware_candidates() -> Vec<CodecVariant> {
    use CodecFamily::*;
    [
        (H264, "h264_nvenc"),
        (H264, "h264_qsv"),
        (H264, "h264_vaapi"),
        (H265, "hevc_nvenc"),
        (H265, "hevc_qsv"),
        (H265, "hevc_vaapi"),
        (Vp9, "vp9_qsv"),
        (Vp9, "vp9_vaapi"),
        (Av1, "av1_nvenc"),
        (Av1, "av1_qsv"),
        (Mjpeg, "mjpeg_qsv"),
        (Mjpeg, "mjpeg_vaapi"),
    ]
    .into_iter()
    .map(|(family, tag)| {
        let container = match family {
            Vp9 | Av1 => "mkv",
            Mjpeg => "avi",
            _ => "mp4",
        };
        CodecVariant::new(family, tag, container, true)
    })
    .collect()
}

/// Software encoder/container combinations probed, per family, in order.
pub fn software_candidates() -> Vec<CodecVariant> {
    use CodecFamily::*;
    [
        (H264, "libx264", "mp4"),
        (H264, "libx264", "mkv"),
        (H265, "libx265", "mp4"),
        (H265, "libx265", "mkv"),
        (Vp9, "libvpx-vp9", "webm"),
        (Vp9, "libvpx-vp9", "mkv"),
        (Vp8, "libvpx", "webm"),
        (Vp8, "libvpx", "mkv"),
        (Av1, "libaom-av1", "mkv"),
        (Av1, "libaom-av1", "webm"),
        (Av1, "libaom-av1", "mp4"),
        (Mjpeg, "mjpeg", "avi"),
        (Mjpeg, "mjpeg", "mov"),
        (Mjpeg, "mjpeg", "mkv"),
    ]
    .into_iter()
    .map(|(family, tag, container)| CodecVariant::new(family, tag, container, false))
    .collect()
}

// ── detect ───────────────────────────────────────────────────────

/// Probe the host with the ffmpeg-based probe.
pub fn detect() -> CodecTable {
    detect_with(&FfmpegProbe::default())
}

/// Build a [`CodecTable`] by running `probe` against every candidate.
///
/// Per family, the first working hardware variant and the first working
/// software combination are kept. Scratch artifacts live in a temporary
/// directory that is removed before returning.
pub fn detect_with(probe: &dyn CodecProbe) -> CodecTable {
    let mut table = CodecTable::fallback_only();

    let gpu = guarded(|| probe.gpu_matrix_path());
    if let Err(e) = &gpu {
        debug!("gpu matrix path unavailable: {e}");
    }
    table.set_gpu_matrix_path(gpu.is_ok());

    let scratch = match tempfile::Builder::new().prefix("camstream-probe-").tempdir() {
        Ok(dir) => dir,
        Err(e) => {
            warn!("cannot create probe directory, using fallback codec only: {e}");
            return table;
        }
    };

    for candidate in hardware_candidates() {
        if table.hardware_variant(candidate.family).is_some() {
            continue;
        }
        try_candidate(probe, &mut table, candidate, scratch.path());
    }

    for candidate in software_candidates() {
        if table.software_variant(candidate.family).is_some() {
            continue;
        }
        try_candidate(probe, &mut table, candidate, scratch.path());
    }

    if let Err(e) = scratch.close() {
        warn!("failed to remove probe directory: {e}");
    }

    info!(
        families = ?table.families(),
        hardware = table.has_hardware(),
        gpu_matrix = table.gpu_matrix_path(),
        "codec detection complete"
    );
    table
}

fn try_candidate(probe: &dyn CodecProbe, table: &mut CodecTable, candidate: CodecVariant, scratch: &Path) {
    match guarded(|| probe.encode_round_trip(&candidate, scratch)) {
        Ok(()) => {
            debug!(codec = %candidate, "probe ok");
            table.insert(candidate);
        }
        Err(e) => debug!(codec = %candidate, "probe failed: {e}"),
    }
}

fn guarded<F>(f: F) -> Result<(), ProbeError>
where
    F: FnOnce() -> Result<(), ProbeError>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            Err(ProbeError::Panicked(msg))
        }
    }
}

// ── FfmpegProbe ──────────────────────────────────────────────────

/// Probes encoders by driving the `ffmpeg` command-line tool.
#[derive(Debug, Clone)]
pub struct FfmpegProbe {
    pub binary: PathBuf,
    /// Edge length of the square test frame.
    pub test_size: u32,
    /// Render node used by VA-API encoders.
    pub vaapi_device: PathBuf,
    /// Deadline for each `ffmpeg` invocation.
    pub timeout: Duration,
}

impl Default for FfmpegProbe {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ffmpeg"),
            test_size: 64,
            vaapi_device: PathBuf::from("/dev/dri/renderD128"),
            timeout: Duration::from_secs(10),
        }
    }
}

impl FfmpegProbe {
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            ..Self::default()
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-hide_banner").arg("-loglevel").arg("error").arg("-nostdin");
        cmd
    }

    /// Spawn `cmd` and wait for it within [`FfmpegProbe::timeout`].
    /// A non-zero exit is a rejection.
    fn run(&self, cmd: &mut Command, input: Option<Vec<u8>>) -> Result<Output, ProbeError> {
        let stdin = if input.is_some() { Stdio::piped() } else { Stdio::null() };
        let child = cmd
            .stdin(stdin)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(&self.binary, e))?;
        let output = run_with_deadline(child, input, self.timeout)?.ok_or(ProbeError::TimedOut(self.timeout))?;
        if !output.status.success() {
            return Err(ProbeError::Rejected(stderr_tail(&output.stderr)));
        }
        Ok(output)
    }

    fn test_pattern(&self) -> Vec<u8> {
        let n = self.test_size as usize;
        let mut data = Vec::with_capacity(n * n * 3);
        for y in 0..n {
            for x in 0..n {
                data.extend_from_slice(&[(x * 255 / n) as u8, (y * 255 / n) as u8, 128]);
            }
        }
        data
    }

    fn encode(&self, candidate: &CodecVariant, out: &Path) -> Result<(), ProbeError> {
        let size = format!("{0}x{0}", self.test_size);
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-hide_banner").arg("-loglevel").arg("error").arg("-y");
        let tag = candidate.encoder_tag.as_str();
        if tag.ends_with("_vaapi") {
            cmd.arg("-vaapi_device").arg(&self.vaapi_device);
        }
        cmd.args(["-f", "rawvideo", "-pix_fmt", "rgb24", "-s", &size, "-r", "1", "-i", "-"]);
        if tag.ends_with("_vaapi") {
            cmd.args(["-vf", "format=nv12,hwupload"]);
        } else if candidate.family == CodecFamily::Mjpeg {
            cmd.args(["-pix_fmt", "yuvj420p"]);
        } else {
            cmd.args(["-pix_fmt", "yuv420p"]);
        }
        cmd.args(["-frames:v", "1", "-c:v", tag]).arg(out);

        self.run(&mut cmd, Some(self.test_pattern()))?;
        Ok(())
    }

    fn reopen(&self, path: &Path) -> Result<(), ProbeError> {
        let len = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        if len == 0 {
            return Err(ProbeError::EmptyOutput);
        }
        let mut cmd = self.command();
        cmd.arg("-i").arg(path).args(["-frames:v", "1", "-f", "null", "-"]);
        self.run(&mut cmd, None)?;
        Ok(())
    }
}

impl CodecProbe for FfmpegProbe {
    fn gpu_matrix_path(&self) -> Result<(), ProbeError> {
        let size = format!("nullsrc=s={0}x{0}", self.test_size);
        let mut cmd = self.command();
        cmd.args(["-init_hw_device", "cuda=gpu", "-filter_hw_device", "gpu"])
            .args(["-f", "lavfi", "-i", &size])
            .args(["-vf", "hwupload", "-frames:v", "1", "-f", "null", "-"]);
        self.run(&mut cmd, None)?;
        Ok(())
    }

    fn encode_round_trip(&self, candidate: &CodecVariant, scratch: &Path) -> Result<(), ProbeError> {
        let file = scratch.join(format!(
            "probe_{}.{}",
            candidate.encoder_tag.replace('-', "_"),
            candidate.container_format
        ));
        let result = self.encode(candidate, &file).and_then(|()| self.reopen(&file));
        let _ = std::fs::remove_file(&file);
        result
    }
}

fn spawn_error(binary: &Path, e: std::io::Error) -> ProbeError {
    if e.kind() == std::io::ErrorKind::NotFound {
        ProbeError::ToolMissing(binary.display().to_string())
    } else {
        ProbeError::Io(e)
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let trimmed = text.trim();
    let start = trimmed.len().saturating_sub(200);
    trimmed
        .char_indices()
        .find(|(i, _)| *i >= start)
        .map(|(i, _)| trimmed[i..].to_string())
        .unwrap_or_default()
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Scripted probe: succeeds for the listed tags, records what it saw.
    struct ScriptedProbe {
        gpu: bool,
        working: HashSet<&'static str>,
        panic_on: Option<&'static str>,
        seen: Mutex<Vec<String>>,
        scratch_seen: Mutex<Option<PathBuf>>,
    }

    impl ScriptedProbe {
        fn new(working: &[&'static str]) -> Self {
            Self {
                gpu: false,
                working: working.iter().copied().collect(),
                panic_on: None,
                seen: Mutex::new(Vec::new()),
                scratch_seen: Mutex::new(None),
            }
        }
    }

    impl CodecProbe for ScriptedProbe {
        fn gpu_matrix_path(&self) -> Result<(), ProbeError> {
            if self.gpu {
                Ok(())
            } else {
                Err(ProbeError::Rejected("no cuda".into()))
            }
        }

        fn encode_round_trip(&self, candidate: &CodecVariant, scratch: &Path) -> Result<(), ProbeError> {
            let key = format!("{}/{}", candidate.encoder_tag, candidate.container_format);
            self.seen.lock().unwrap().push(key);
            *self.scratch_seen.lock().unwrap() = Some(scratch.to_path_buf());
            std::fs::write(scratch.join("artifact.bin"), b"x").unwrap();
            if self.panic_on == Some(candidate.encoder_tag.as_str()) {
                panic!("driver crashed");
            }
            if self.working.contains(candidate.encoder_tag.as_str()) {
                Ok(())
            } else {
                Err(ProbeError::Rejected("unsupported".into()))
            }
        }
    }

    #[test]
    fn all_probes_fail_yields_fallback() {
        let probe = ScriptedProbe::new(&[]);
        let table = detect_with(&probe);
        let best = table.get_best(true);
        assert_eq!(best.family, CodecFamily::Jpeg);
        assert!(!best.hardware_accelerated);
        assert!(!table.gpu_matrix_path());
        assert_eq!(table.families(), vec![CodecFamily::Jpeg]);
    }

    #[test]
    fn panicking_probe_is_swallowed() {
        let mut probe = ScriptedProbe::new(&["libx264"]);
        probe.panic_on = Some("h264_nvenc");
        let table = detect_with(&probe);
        assert_eq!(table.get_best(true).encoder_tag, "libx264");
    }

    #[test]
    fn first_working_container_kept() {
        let probe = ScriptedProbe::new(&["libvpx"]);
        let table = detect_with(&probe);
        let vp8 = table.variants(CodecFamily::Vp8);
        assert_eq!(vp8.len(), 1);
        assert_eq!(vp8[0].container_format, "webm");
        // The second container was never tried once the first worked.
        let seen = probe.seen.lock().unwrap();
        assert!(!seen.contains(&"libvpx/mkv".to_string()));
    }

    #[test]
    fn hardware_and_software_both_kept() {
        let mut probe = ScriptedProbe::new(&["hevc_vaapi", "libx265", "libx264"]);
        probe.gpu = true;
        let table = detect_with(&probe);
        assert!(table.gpu_matrix_path());
        assert_eq!(table.get_best(true).encoder_tag, "hevc_vaapi");
        assert_eq!(table.get_best(false).encoder_tag, "libx264");
        assert_eq!(table.variants(CodecFamily::H265).len(), 2);
    }

    #[test]
    fn scratch_directory_removed() {
        let probe = ScriptedProbe::new(&["libx264"]);
        let _ = detect_with(&probe);
        let dir = probe.scratch_seen.lock().unwrap().clone().unwrap();
        assert!(!dir.exists());
    }

    #[test]
    fn missing_binary_reports_tool_missing() {
        let probe = FfmpegProbe::with_binary("/nonexistent/ffmpeg-binary");
        let dir = tempfile::tempdir().unwrap();
        let err = probe
            .encode_round_trip(&CodecVariant::new(CodecFamily::H264, "libx264", "mp4", false), dir.path())
            .unwrap_err();
        assert!(matches!(err, ProbeError::ToolMissing(_)));
        // And detection still produces a usable table.
        let table = detect_with(&probe);
        assert_eq!(table.get_best(true).family, CodecFamily::Jpeg);
    }

    #[cfg(unix)]
    #[test]
    fn hung_ffmpeg_times_out_instead_of_blocking_detection() {
        use std::os::unix::fs::PermissionsExt;
        use std::time::Instant;

        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("ffmpeg");
        std::fs::write(&binary, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();

        let ffmpeg = FfmpegProbe {
            timeout: Duration::from_millis(100),
            ..FfmpegProbe::with_binary(&binary)
        };
        let started = Instant::now();
        let err = ffmpeg
            .encode_round_trip(&CodecVariant::new(CodecFamily::H264, "libx264", "mp4", false), dir.path())
            .unwrap_err();
        assert!(matches!(err, ProbeError::TimedOut(_)), "{err}");
        assert!(matches!(ffmpeg.gpu_matrix_path(), Err(ProbeError::TimedOut(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn candidate_lists_cover_priority_families() {
        let sw: HashSet<_> = software_candidates().iter().map(|v| v.family).collect();
        for f in CodecFamily::PRIORITY {
            if f != CodecFamily::Jpeg {
                assert!(sw.contains(&f), "{f} missing from software candidates");
            }
        }
        assert!(hardware_candidates().iter().all(|v| v.hardware_accelerated));
    }
}
