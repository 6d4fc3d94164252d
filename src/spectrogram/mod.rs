//! Spectrogram generation
//!
//! Renders PNG spectrograms from retained PCM or from clip files through a
//! two-stage external pipeline: an optional codec bridge (ffmpeg) feeding
//! sox, which resamples to 24 kHz and draws the image. Natively-readable
//! files skip the bridge; any pipeline failure falls back to a
//! single-process codec-only render.
//!
//! Process hygiene is the hard part: the downstream is killed whenever the
//! upstream fails, every child is waited with a bounded reap, and the
//! codec-only fallback gets its own timeout budget so it never inherits an
//! almost-expired one.

pub mod duration;
pub mod prerender;

pub use duration::DurationCache;
pub use prerender::{PreRenderJob, PreRenderStats, PreRenderer};

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::config::SpectrogramSettings;

/// Bounded wait applied to every child before force-killing it.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SpectrogramError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("clip path has no extension: {0}")]
    MissingExtension(PathBuf),

    #[error("unknown spectrogram size: {0}")]
    UnknownSize(String),

    #[error("target path {path} escapes the export root {root}")]
    PathEscape { path: PathBuf, root: PathBuf },

    #[error("pre-render queue is full")]
    QueueFull,

    #[error("pre-renderer is stopped")]
    Stopped,

    #[error("{program} exited with {status}")]
    ProcessFailed { program: &'static str, status: String },

    #[error("spectrogram generation timed out")]
    Timeout,

    #[error("spectrogram generation cancelled")]
    Cancelled,

    #[error("spectrogram io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SpectrogramError {
    /// Operational failures (cancel, deadline, external kill) are logged at
    /// debug by the workers; everything else at error.
    pub fn is_operational(&self) -> bool {
        matches!(
            self,
            SpectrogramError::Timeout | SpectrogramError::Cancelled | SpectrogramError::Stopped
        )
    }
}

/// Output geometry, from a fixed small enumeration. Height is width/2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderSize {
    Sm,
    Md,
    Lg,
    Xl,
}

impl RenderSize {
    pub fn from_name(name: &str) -> Result<Self, SpectrogramError> {
        match name {
            "sm" => Ok(RenderSize::Sm),
            "md" => Ok(RenderSize::Md),
            "lg" => Ok(RenderSize::Lg),
            "xl" => Ok(RenderSize::Xl),
            other => Err(SpectrogramError::UnknownSize(other.to_string())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            RenderSize::Sm => "sm",
            RenderSize::Md => "md",
            RenderSize::Lg => "lg",
            RenderSize::Xl => "xl",
        }
    }

    pub fn pixels(self) -> u32 {
        match self {
            RenderSize::Sm => 400,
            RenderSize::Md => 800,
            RenderSize::Lg => 1000,
            RenderSize::Xl => 1200,
        }
    }

    pub fn from_pixels(pixels: u32) -> Option<Self> {
        match pixels {
            400 => Some(RenderSize::Sm),
            800 => Some(RenderSize::Md),
            1000 => Some(RenderSize::Lg),
            1200 => Some(RenderSize::Xl),
            _ => None,
        }
    }
}

/// The PNG path for a clip: the final extension replaced with `.png`.
pub fn build_spectrogram_path(clip: &Path) -> Result<PathBuf, SpectrogramError> {
    if clip.extension().map_or(true, |e| e.is_empty()) {
        return Err(SpectrogramError::MissingExtension(clip.to_path_buf()));
    }
    Ok(clip.with_extension("png"))
}

/// The PNG path for a parameterized variant. The default rendering
/// (`md`, legends on) keeps the plain `.png` name; any other combination
/// gets its own filename namespace (`name.sm.png`, `name.md.raw.png`).
pub fn build_variant_path(
    clip: &Path,
    size: RenderSize,
    raw: bool,
) -> Result<PathBuf, SpectrogramError> {
    if size == RenderSize::Md && !raw {
        return build_spectrogram_path(clip);
    }
    let stem = clip
        .file_stem()
        .filter(|s| !s.is_empty() && clip.extension().is_some())
        .ok_or_else(|| SpectrogramError::MissingExtension(clip.to_path_buf()))?;

    let mut name = stem.to_os_string();
    name.push(".");
    name.push(size.name());
    if raw {
        name.push(".raw");
    }
    name.push(".png");
    Ok(clip.with_file_name(name))
}

/// Renders PCM to a PNG on disk. The pre-renderer consumes this seam so
/// tests can substitute the external pipeline.
#[async_trait]
pub trait PcmRenderer: Send + Sync + 'static {
    async fn render_pcm(
        &self,
        pcm: &[u8],
        out_path: &Path,
        width: u32,
        raw: bool,
        cancel: &CancellationToken,
    ) -> Result<(), SpectrogramError>;
}

/// Two-stage sox/ffmpeg spectrogram generator.
pub struct SpectrogramGenerator {
    settings: SpectrogramSettings,
    capture_length_seconds: u64,
    duration_cache: DurationCache,
    ffmpeg_major: OnceCell<Option<u32>>,
}

impl SpectrogramGenerator {
    pub fn new(settings: SpectrogramSettings, capture_length_seconds: u64) -> Self {
        Self {
            settings,
            capture_length_seconds,
            duration_cache: DurationCache::default(),
            ffmpeg_major: OnceCell::new(),
        }
    }

    /// Render a clip file to `out_path`.
    ///
    /// Natively-readable extensions go straight to sox; everything else
    /// runs the codec bridge. Either failure falls back to the codec-only
    /// path with its own timeout budget.
    pub async fn generate_from_file(
        &self,
        audio_path: &Path,
        out_path: &Path,
        width: u32,
        raw: bool,
        cancel: &CancellationToken,
    ) -> Result<(), SpectrogramError> {
        validate_output(out_path, width)?;
        ensure_output_dir(out_path)?;

        let deadline = Instant::now() + Duration::from_secs(self.settings.generation_timeout_secs);

        let primary = if self.is_native(audio_path) {
            self.run_sox_file(audio_path, out_path, width, raw, deadline, cancel)
                .await
        } else {
            self.run_bridge_pipeline(audio_path, out_path, width, raw, deadline, cancel)
                .await
        };

        match primary {
            Ok(()) => Ok(()),
            Err(e) if e.is_operational() => Err(e),
            Err(e) => {
                tracing::debug!(
                    clip = %audio_path.display(),
                    error = %e,
                    "primary spectrogram path failed; trying codec-only fallback"
                );
                self.run_ffmpeg_fallback(audio_path, out_path, width, raw, deadline, cancel)
                    .await
            }
        }
    }

    /// Render raw s16le 48 kHz mono PCM to `out_path`, bypassing the codec
    /// bridge entirely.
    pub async fn generate_from_pcm(
        &self,
        pcm: &[u8],
        out_path: &Path,
        width: u32,
        raw: bool,
        cancel: &CancellationToken,
    ) -> Result<(), SpectrogramError> {
        if pcm.is_empty() {
            return Err(SpectrogramError::InvalidInput("empty PCM input".to_string()));
        }
        validate_output(out_path, width)?;
        ensure_output_dir(out_path)?;

        let deadline = Instant::now() + Duration::from_secs(self.settings.generation_timeout_secs);

        let mut cmd = Command::new(&self.settings.sox_path);
        cmd.args([
            "-t",
            "raw",
            "-r",
            "48000",
            "-e",
            "signed-integer",
            "-b",
            "16",
            "-c",
            "1",
            "-",
        ]);
        push_sox_render_args(&mut cmd, out_path, width, raw, None);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let mut sox = cmd.spawn()?;
        let mut stdin = sox
            .stdin
            .take()
            .ok_or_else(|| SpectrogramError::InvalidInput("sox stdin unavailable".to_string()))?;

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(SpectrogramError::Cancelled),
            r = tokio::time::timeout(remaining(deadline), async {
                stdin.write_all(pcm).await?;
                stdin.shutdown().await?;
                drop(stdin);
                let status = sox.wait().await?;
                status_to_result("sox", &status)
            }) => r.unwrap_or(Err(SpectrogramError::Timeout)),
        };

        if result.is_err() {
            kill_and_reap(&mut sox).await;
        }
        result
    }

    fn is_native(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .map_or(false, |ext| {
                self.settings
                    .native_extensions
                    .iter()
                    .any(|n| n.eq_ignore_ascii_case(&ext))
            })
    }

    /// Direct sox render for natively-readable files.
    async fn run_sox_file(
        &self,
        audio_path: &Path,
        out_path: &Path,
        width: u32,
        raw: bool,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<(), SpectrogramError> {
        let mut cmd = Command::new(&self.settings.sox_path);
        cmd.arg(audio_path);
        push_sox_render_args(&mut cmd, out_path, width, raw, None);
        cmd.stdout(Stdio::null()).stderr(Stdio::null());

        let mut sox = cmd.spawn()?;
        let result = wait_single(&mut sox, "sox", deadline, cancel).await;
        if result.is_err() {
            kill_and_reap(&mut sox).await;
        }
        result
    }

    /// ffmpeg decoding into sox over a pipe.
    async fn run_bridge_pipeline(
        &self,
        audio_path: &Path,
        out_path: &Path,
        width: u32,
        raw: bool,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<(), SpectrogramError> {
        // ffmpeg >= 7 stamps the duration correctly on the sox-format
        // bridge; older or unknown versions need it passed explicitly.
        let duration_arg = match self.ffmpeg_major().await {
            Some(major) if major >= 7 => None,
            _ => Some(self.probed_duration(audio_path).await),
        };

        let mut upstream = Command::new(&self.settings.ffmpeg_path)
            .args(["-hide_banner", "-loglevel", "error", "-i"])
            .arg(audio_path)
            .args(["-f", "sox", "-"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let upstream_stdout = upstream.stdout.take().ok_or_else(|| {
            SpectrogramError::InvalidInput("codec stdout unavailable".to_string())
        })?;
        let bridge: Stdio = upstream_stdout.try_into().map_err(|_| {
            SpectrogramError::InvalidInput("codec stdout not convertible".to_string())
        })?;

        let mut cmd = Command::new(&self.settings.sox_path);
        cmd.args(["-t", "sox", "-"]);
        push_sox_render_args(&mut cmd, out_path, width, raw, duration_arg);
        cmd.stdin(bridge).stdout(Stdio::null()).stderr(Stdio::null());

        let mut downstream = cmd.spawn()?;

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(SpectrogramError::Cancelled),
            r = tokio::time::timeout(remaining(deadline), async {
                let upstream_status = upstream.wait().await?;
                if !upstream_status.success() {
                    return status_to_result("ffmpeg", &upstream_status);
                }
                let downstream_status = downstream.wait().await?;
                status_to_result("sox", &downstream_status)
            }) => r.unwrap_or(Err(SpectrogramError::Timeout)),
        };

        if result.is_err() {
            // Upstream failure or timeout: the downstream must not linger.
            kill_and_reap(&mut downstream).await;
            kill_and_reap(&mut upstream).await;
        }
        result
    }

    /// Single-process codec-only render.
    ///
    /// Runs under `max(remaining, fallback)` so a nearly-expired sox budget
    /// does not starve the fallback.
    async fn run_ffmpeg_fallback(
        &self,
        audio_path: &Path,
        out_path: &Path,
        width: u32,
        raw: bool,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<(), SpectrogramError> {
        let fallback = Duration::from_secs(self.settings.fallback_timeout_secs);
        let budget = remaining(deadline).max(fallback);
        let fallback_deadline = Instant::now() + budget;

        let mut filter = format!("showspectrumpic=s={}x{}", width, width / 2);
        if raw {
            filter.push_str(":legend=0");
        }

        let mut child = Command::new(&self.settings.ffmpeg_path)
            .args(["-hide_banner", "-loglevel", "error", "-y", "-i"])
            .arg(audio_path)
            .args(["-lavfi", &filter])
            .arg(out_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        let result = wait_single(&mut child, "ffmpeg", fallback_deadline, cancel).await;
        if result.is_err() {
            kill_and_reap(&mut child).await;
        }
        result
    }

    async fn probed_duration(&self, audio_path: &Path) -> f64 {
        match duration::cached_duration(
            &self.duration_cache,
            &self.settings.ffprobe_path,
            audio_path,
        )
        .await
        {
            Some(d) => d,
            None => self.capture_length_seconds as f64,
        }
    }

    /// Major version of the external codec, probed once.
    async fn ffmpeg_major(&self) -> Option<u32> {
        *self
            .ffmpeg_major
            .get_or_init(|| async {
                let output = Command::new(&self.settings.ffmpeg_path)
                    .arg("-version")
                    .output()
                    .await
                    .ok()?;
                parse_ffmpeg_major(&String::from_utf8_lossy(&output.stdout))
            })
            .await
    }
}

#[async_trait]
impl PcmRenderer for SpectrogramGenerator {
    async fn render_pcm(
        &self,
        pcm: &[u8],
        out_path: &Path,
        width: u32,
        raw: bool,
        cancel: &CancellationToken,
    ) -> Result<(), SpectrogramError> {
        self.generate_from_pcm(pcm, out_path, width, raw, cancel).await
    }
}

/// Shared sox rendering tail: resample to 24 kHz and draw the spectrogram.
fn push_sox_render_args(
    cmd: &mut Command,
    out_path: &Path,
    width: u32,
    raw: bool,
    duration: Option<f64>,
) {
    cmd.args(["-n", "rate", "24k", "spectrogram"]);
    cmd.arg("-x").arg(width.to_string());
    cmd.arg("-y").arg((width / 2).to_string());
    if raw {
        cmd.arg("-r");
    }
    if let Some(d) = duration {
        cmd.arg("-d").arg(format!("{d:.1}"));
    }
    cmd.arg("-o").arg(out_path);
}

fn validate_output(out_path: &Path, width: u32) -> Result<(), SpectrogramError> {
    if out_path.as_os_str().is_empty() || !out_path.is_absolute() {
        return Err(SpectrogramError::InvalidInput(format!(
            "output path must be absolute, got {}",
            out_path.display()
        )));
    }
    if width == 0 {
        return Err(SpectrogramError::InvalidInput("width must be positive".to_string()));
    }
    Ok(())
}

fn ensure_output_dir(out_path: &Path) -> Result<(), SpectrogramError> {
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

fn status_to_result(
    program: &'static str,
    status: &std::process::ExitStatus,
) -> Result<(), SpectrogramError> {
    if status.success() {
        Ok(())
    } else {
        Err(SpectrogramError::ProcessFailed {
            program,
            status: status.to_string(),
        })
    }
}

async fn wait_single(
    child: &mut Child,
    program: &'static str,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<(), SpectrogramError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(SpectrogramError::Cancelled),
        r = tokio::time::timeout(remaining(deadline), child.wait()) => match r {
            Ok(Ok(status)) => status_to_result(program, &status),
            Ok(Err(e)) => Err(SpectrogramError::Io(e)),
            Err(_) => Err(SpectrogramError::Timeout),
        },
    }
}

/// Kill a child and reap it within a bound, force-killing on timeout.
async fn kill_and_reap(child: &mut Child) {
    let _ = child.start_kill();
    if tokio::time::timeout(REAP_TIMEOUT, child.wait()).await.is_err() {
        let _ = child.kill().await;
    }
}

fn parse_ffmpeg_major(version_output: &str) -> Option<u32> {
    let token = version_output
        .lines()
        .next()?
        .strip_prefix("ffmpeg version ")?
        .split_whitespace()
        .next()?;
    let digits: String = token.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_round_trip() {
        for size in [RenderSize::Sm, RenderSize::Md, RenderSize::Lg, RenderSize::Xl] {
            assert_eq!(RenderSize::from_pixels(size.pixels()), Some(size));
            assert_eq!(RenderSize::from_name(size.name()).expect("known"), size);
        }
        assert!(RenderSize::from_name("xxl").is_err());
        assert!(RenderSize::from_name("MD").is_err());
        assert_eq!(RenderSize::from_pixels(801), None);
    }

    #[test]
    fn spectrogram_path_swaps_final_extension() {
        assert_eq!(
            build_spectrogram_path(Path::new("/clips/robin.wav")).expect("path"),
            PathBuf::from("/clips/robin.png")
        );
        assert_eq!(
            build_spectrogram_path(Path::new("/clips/robin.2026.flac")).expect("path"),
            PathBuf::from("/clips/robin.2026.png")
        );
        assert!(build_spectrogram_path(Path::new("/clips/robin")).is_err());
    }

    #[test]
    fn variant_paths_use_separate_namespace() {
        let clip = Path::new("/clips/robin.wav");
        assert_eq!(
            build_variant_path(clip, RenderSize::Md, false).expect("path"),
            PathBuf::from("/clips/robin.png")
        );
        assert_eq!(
            build_variant_path(clip, RenderSize::Sm, false).expect("path"),
            PathBuf::from("/clips/robin.sm.png")
        );
        assert_eq!(
            build_variant_path(clip, RenderSize::Md, true).expect("path"),
            PathBuf::from("/clips/robin.md.raw.png")
        );
    }

    #[test]
    fn ffmpeg_major_parses_common_banners() {
        assert_eq!(
            parse_ffmpeg_major("ffmpeg version 6.1.1-3ubuntu5 Copyright"),
            Some(6)
        );
        assert_eq!(parse_ffmpeg_major("ffmpeg version 7.0 Copyright"), Some(7));
        assert_eq!(
            parse_ffmpeg_major("ffmpeg version n5.1.4 built"),
            None
        );
        assert_eq!(parse_ffmpeg_major("garbage"), None);
    }

    #[test]
    fn output_validation_rejects_relative_paths_and_zero_width() {
        assert!(validate_output(Path::new("relative.png"), 800).is_err());
        assert!(validate_output(Path::new("/abs/out.png"), 0).is_err());
        assert!(validate_output(Path::new("/abs/out.png"), 800).is_ok());
    }

    #[tokio::test]
    async fn pcm_input_must_be_non_empty() {
        let generator = SpectrogramGenerator::new(SpectrogramSettings::default(), 15);
        let cancel = CancellationToken::new();
        let err = generator
            .generate_from_pcm(&[], Path::new("/tmp/out.png"), 800, false, &cancel)
            .await
            .expect_err("empty pcm must fail");
        assert!(matches!(err, SpectrogramError::InvalidInput(_)));
    }
}
