//! Capture workers feeding PCM rings.
//!
//! Local devices are read through cpal on a dedicated thread (input streams
//! are not `Send`); streams and file replays run an external codec child
//! process emitting s16le 48 kHz mono on stdout. Codec children die
//! spontaneously (network hiccups, remote closes), so the worker re-launches
//! them under a bounded exponential back-off that resets after sustained
//! healthy operation.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::defaults::{
    CAPTURE_BACKOFF_INITIAL_SECS, CAPTURE_BACKOFF_MAX_SECS, CAPTURE_FAILURE_NOTIFY_AFTER,
    CAPTURE_HEALTHY_RESET_SECS,
};
use crate::notify::{self, Notification, NotificationType};
use crate::types::{Priority, SourceKind, SAMPLE_RATE};

use super::ring::PcmRing;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no capture device matching {0}")]
    DeviceNotFound(String),

    #[error("capture device error: {0}")]
    Device(String),

    #[error("codec spawn failed: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("codec exited with {0}")]
    CodecExit(String),
}

/// Bounded exponential back-off, doubling per attempt.
#[derive(Debug)]
pub struct Backoff {
    attempt: u32,
    initial: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            attempt: 0,
            initial,
            max,
        }
    }

    pub fn capture_default() -> Self {
        Self::new(
            Duration::from_secs(CAPTURE_BACKOFF_INITIAL_SECS),
            Duration::from_secs(CAPTURE_BACKOFF_MAX_SECS),
        )
    }

    /// Delay before the next attempt; doubles per call up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.attempt.min(16);
        self.attempt = self.attempt.saturating_add(1);
        let delay = self
            .initial
            .saturating_mul(2u32.saturating_pow(exp));
        delay.min(self.max)
    }

    /// Like [`next_delay`](Self::next_delay), with +-20% jitter so a fleet
    /// of failing sources does not reconnect in lockstep.
    pub fn next_delay_jittered(&mut self) -> Duration {
        use rand::Rng;
        let base = self.next_delay();
        base.mul_f64(rand::thread_rng().gen_range(0.8..1.2))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Average multi-channel frames down to mono i16.
pub fn downmix_i16(data: &[i16], channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks_exact(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| i32::from(s)).sum();
            (sum / channels as i32) as i16
        })
        .collect()
}

/// Convert float frames to mono i16 with clamping.
pub fn downmix_f32(data: &[f32], channels: usize) -> Vec<i16> {
    let channels = channels.max(1);
    data.chunks_exact(channels)
        .map(|frame| {
            let avg = frame.iter().sum::<f32>() / channels as f32;
            (avg.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16
        })
        .collect()
}

/// Interpret little-endian byte pairs as i16 samples; an odd trailing byte
/// is returned for the next chunk.
pub fn bytes_to_samples(bytes: &[u8]) -> (Vec<i16>, Option<u8>) {
    let pairs = bytes.len() / 2;
    let mut samples = Vec::with_capacity(pairs);
    for chunk in bytes.chunks_exact(2) {
        samples.push(i16::from_le_bytes([chunk[0], chunk[1]]));
    }
    let leftover = (bytes.len() % 2 == 1).then(|| bytes[bytes.len() - 1]);
    (samples, leftover)
}

/// Run a cpal input stream on the current (dedicated) thread until the
/// shutdown flag is raised. Returns on device failure so the caller can
/// back off and retry.
pub fn run_device_capture_once(
    input: &str,
    ring: &Arc<PcmRing>,
    shutdown: &Arc<AtomicBool>,
) -> Result<(), CaptureError> {
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

    let host = cpal::default_host();
    let device = if input == "default" {
        host.default_input_device()
    } else {
        host.input_devices()
            .map_err(|e| CaptureError::Device(e.to_string()))?
            .find(|d| d.name().map(|n| n == input).unwrap_or(false))
    }
    .ok_or_else(|| CaptureError::DeviceNotFound(input.to_string()))?;

    let supported = device
        .default_input_config()
        .map_err(|e| CaptureError::Device(e.to_string()))?;
    let channels = usize::from(supported.channels());
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();

    tracing::info!(
        device = %input,
        channels,
        rate = config.sample_rate.0,
        format = ?sample_format,
        "capture device opened"
    );

    let failed = Arc::new(AtomicBool::new(false));
    let err_flag = failed.clone();
    let err_fn = move |e: cpal::StreamError| {
        tracing::warn!(error = %e, "capture stream error");
        err_flag.store(true, Ordering::Release);
    };

    let stream = match sample_format {
        cpal::SampleFormat::I16 => {
            let ring = ring.clone();
            let stop = shutdown.clone();
            device
                .build_input_stream(
                    &config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        if !stop.load(Ordering::Acquire) {
                            ring.push(&downmix_i16(data, channels));
                        }
                    },
                    err_fn,
                    None,
                )
                .map_err(|e| CaptureError::Device(e.to_string()))?
        }
        cpal::SampleFormat::F32 => {
            let ring = ring.clone();
            let stop = shutdown.clone();
            device
                .build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        if !stop.load(Ordering::Acquire) {
                            ring.push(&downmix_f32(data, channels));
                        }
                    },
                    err_fn,
                    None,
                )
                .map_err(|e| CaptureError::Device(e.to_string()))?
        }
        other => {
            return Err(CaptureError::Device(format!(
                "unsupported sample format {other:?}"
            )))
        }
    };

    stream
        .play()
        .map_err(|e| CaptureError::Device(e.to_string()))?;

    while !shutdown.load(Ordering::Acquire) {
        if failed.load(Ordering::Acquire) {
            return Err(CaptureError::Device("stream reported an error".to_string()));
        }
        std::thread::sleep(Duration::from_millis(200));
    }
    Ok(())
}

/// How one codec run ended.
#[derive(Debug, PartialEq, Eq)]
pub enum CaptureEnd {
    Eof,
    Cancelled,
}

/// Launch the codec child once and pump its stdout into the ring.
pub async fn run_codec_capture_once(
    codec_path: &str,
    kind: SourceKind,
    input: &str,
    ring: &Arc<PcmRing>,
    cancel: &CancellationToken,
) -> Result<CaptureEnd, CaptureError> {
    let mut cmd = Command::new(codec_path);
    cmd.args(["-hide_banner", "-loglevel", "error"]);
    match kind {
        SourceKind::RtspStream => {
            cmd.args(["-rtsp_transport", "tcp"]);
        }
        SourceKind::FileReplay => {
            // Pace file replay at capture cadence.
            cmd.arg("-re");
        }
        SourceKind::LocalDevice => {}
    }
    cmd.args(["-i", input, "-f", "s16le", "-ar"])
        .arg(SAMPLE_RATE.to_string())
        .args(["-ac", "1", "-"])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .stdin(Stdio::null());

    let mut child = cmd.spawn()?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| CaptureError::Device("codec stdout unavailable".to_string()))?;

    let mut buf = vec![0u8; 8192];
    let mut carry: Option<u8> = None;

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
                return Ok(CaptureEnd::Cancelled);
            }
            r = stdout.read(&mut buf) => r?,
        };

        if read == 0 {
            break;
        }

        let chunk: Vec<u8> = match carry.take() {
            Some(byte) => {
                let mut joined = Vec::with_capacity(read + 1);
                joined.push(byte);
                joined.extend_from_slice(&buf[..read]);
                joined
            }
            None => buf[..read].to_vec(),
        };
        let (samples, leftover) = bytes_to_samples(&chunk);
        carry = leftover;
        ring.push(&samples);
    }

    let status = child.wait().await?;
    if status.success() {
        Ok(CaptureEnd::Eof)
    } else {
        Err(CaptureError::CodecExit(status.to_string()))
    }
}

/// Supervise one codec-backed source: relaunch with back-off, reset after
/// sustained health, notify on extended failure.
pub async fn supervise_codec_capture(
    codec_path: String,
    kind: SourceKind,
    source_id: String,
    input: String,
    ring: Arc<PcmRing>,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::capture_default();
    let mut consecutive_failures = 0u32;
    let healthy_span = Duration::from_secs(CAPTURE_HEALTHY_RESET_SECS);

    loop {
        if cancel.is_cancelled() {
            break;
        }
        let started = Instant::now();
        let outcome =
            run_codec_capture_once(&codec_path, kind, &input, &ring, &cancel).await;

        match outcome {
            Ok(CaptureEnd::Cancelled) => break,
            Ok(CaptureEnd::Eof) => {
                tracing::info!(source = %source_id, "capture stream ended; relaunching");
            }
            Err(ref e) => {
                tracing::warn!(source = %source_id, error = %e, "capture failed");
            }
        }

        if started.elapsed() >= healthy_span {
            backoff.reset();
            consecutive_failures = 0;
        }
        consecutive_failures = consecutive_failures.saturating_add(1);
        if consecutive_failures == CAPTURE_FAILURE_NOTIFY_AFTER {
            notify::publish(
                Notification::new(
                    NotificationType::Warning,
                    Priority::High,
                    format!("audio source {source_id} failing"),
                    format!(
                        "{consecutive_failures} consecutive capture failures on {input}"
                    ),
                )
                .with_component("audio-capture".to_string()),
            );
        }

        let delay = backoff.next_delay_jittered();
        tracing::debug!(source = %source_id, delay_secs = delay.as_secs(), "capture back-off");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    tracing::info!(source = %source_id, "capture worker exited");
}

/// Supervise one local-device source on its own thread.
pub fn supervise_device_capture(
    source_id: String,
    input: String,
    ring: Arc<PcmRing>,
    shutdown: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("capture-{source_id}"))
        .spawn(move || {
            let mut backoff = Backoff::capture_default();
            let mut consecutive_failures = 0u32;
            while !shutdown.load(Ordering::Acquire) {
                let started = Instant::now();
                match run_device_capture_once(&input, &ring, &shutdown) {
                    Ok(()) => break,
                    Err(e) => {
                        tracing::warn!(source = %source_id, error = %e, "device capture failed");
                    }
                }
                if started.elapsed() >= Duration::from_secs(CAPTURE_HEALTHY_RESET_SECS) {
                    backoff.reset();
                    consecutive_failures = 0;
                }
                consecutive_failures = consecutive_failures.saturating_add(1);
                if consecutive_failures == CAPTURE_FAILURE_NOTIFY_AFTER {
                    notify::publish(
                        Notification::new(
                            NotificationType::Warning,
                            Priority::High,
                            format!("audio source {source_id} failing"),
                            format!("{consecutive_failures} consecutive device failures"),
                        )
                        .with_component("audio-capture".to_string()),
                    );
                }
                let delay = backoff.next_delay();
                // Sleep in slices so shutdown stays responsive.
                let deadline = Instant::now() + delay;
                while Instant::now() < deadline && !shutdown.load(Ordering::Acquire) {
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        })
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to spawn capture thread");
            std::thread::spawn(|| {})
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut b = Backoff::new(Duration::from_secs(2), Duration::from_secs(60));
        assert_eq!(b.next_delay(), Duration::from_secs(2));
        assert_eq!(b.next_delay(), Duration::from_secs(4));
        assert_eq!(b.next_delay(), Duration::from_secs(8));
        for _ in 0..10 {
            b.next_delay();
        }
        assert_eq!(b.next_delay(), Duration::from_secs(60));

        b.reset();
        assert_eq!(b.next_delay(), Duration::from_secs(2));
    }

    #[test]
    fn downmix_averages_channels() {
        assert_eq!(downmix_i16(&[10, 20, 30, 40], 2), vec![15, 35]);
        assert_eq!(downmix_i16(&[1, 2, 3], 1), vec![1, 2, 3]);
    }

    #[test]
    fn f32_conversion_clamps() {
        let out = downmix_f32(&[1.5, -1.5], 1);
        assert_eq!(out, vec![i16::MAX, -i16::MAX]);
        let mixed = downmix_f32(&[0.5, -0.5], 2);
        assert_eq!(mixed, vec![0]);
    }

    #[test]
    fn byte_stream_handles_odd_remainders() {
        let (samples, carry) = bytes_to_samples(&[0x02, 0x01, 0xFF]);
        assert_eq!(samples, vec![0x0102]);
        assert_eq!(carry, Some(0xFF));

        let (samples, carry) = bytes_to_samples(&[0x02, 0x01, 0x04, 0x03]);
        assert_eq!(samples, vec![0x0102, 0x0304]);
        assert_eq!(carry, None);
    }
}
