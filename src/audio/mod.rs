//! Audio source manager
//!
//! One capture worker per configured source, each owning an exclusive PCM
//! ring sized to the analysis window plus a margin. Local devices capture
//! through cpal on a dedicated thread; streams and file replays run an
//! external codec child. Source identity survives reconnection: the worker
//! relaunches its input while the ring and the `AudioSource` stay put.

pub mod capture;
pub mod ring;

pub use capture::{Backoff, CaptureEnd, CaptureError};
pub use ring::{PcmRing, WindowRead};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::types::{AudioSource, SourceKind, SAMPLE_RATE};

/// A registered source with its capture-side state.
pub struct ManagedSource {
    pub source: AudioSource,
    pub ring: Arc<PcmRing>,
}

enum WorkerHandle {
    Task(tokio::task::JoinHandle<()>),
    Thread {
        handle: std::thread::JoinHandle<()>,
        shutdown: Arc<AtomicBool>,
    },
}

/// Owns every capture worker for the daemon's lifetime.
pub struct AudioSourceManager {
    sources: Vec<ManagedSource>,
    workers: Vec<WorkerHandle>,
    cancel: CancellationToken,
}

impl AudioSourceManager {
    /// Spawn one worker per configured source under `parent`'s scope.
    pub fn start(settings: &Settings, parent: &CancellationToken) -> Self {
        let cancel = parent.child_token();
        let window_seconds = settings.analysis.window_seconds;
        let margin_seconds = settings.audio.ring_margin_seconds;
        let ring_capacity =
            ((window_seconds + margin_seconds) * f64::from(SAMPLE_RATE)).ceil() as usize;

        let mut sources = Vec::new();
        let mut workers = Vec::new();

        for source_settings in &settings.audio.sources {
            let source = source_settings.to_source();
            let ring = Arc::new(PcmRing::new(ring_capacity));
            let input = source_settings.input().to_string();

            let handle = match source.kind {
                SourceKind::LocalDevice => {
                    let shutdown = Arc::new(AtomicBool::new(false));
                    let handle = capture::supervise_device_capture(
                        source.id.clone(),
                        input,
                        ring.clone(),
                        shutdown.clone(),
                    );
                    WorkerHandle::Thread { handle, shutdown }
                }
                SourceKind::RtspStream | SourceKind::FileReplay => {
                    let codec = settings.spectrogram.ffmpeg_path.clone();
                    let task = tokio::spawn(capture::supervise_codec_capture(
                        codec,
                        source.kind,
                        source.id.clone(),
                        input,
                        ring.clone(),
                        cancel.clone(),
                    ));
                    WorkerHandle::Task(task)
                }
            };

            tracing::info!(
                source = %source.id,
                kind = %source.kind,
                ring_capacity,
                "audio source registered"
            );
            sources.push(ManagedSource { source, ring });
            workers.push(handle);
        }

        Self {
            sources,
            workers,
            cancel,
        }
    }

    pub fn sources(&self) -> &[ManagedSource] {
        &self.sources
    }

    /// Registered source identities, for discovery publication.
    pub fn source_identities(&self) -> Vec<AudioSource> {
        self.sources.iter().map(|m| m.source.clone()).collect()
    }

    /// Cancel every worker and join them.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        for worker in self.workers.drain(..) {
            match worker {
                WorkerHandle::Task(task) => {
                    let _ = task.await;
                }
                WorkerHandle::Thread { handle, shutdown } => {
                    shutdown.store(true, Ordering::Release);
                    // Blocking join off the async runtime.
                    let _ = tokio::task::spawn_blocking(move || handle.join()).await;
                }
            }
        }
        tracing::info!("audio source manager stopped");
    }

    /// Total lost samples across sources, for statistics logging.
    pub fn lost_samples(&self) -> Vec<(String, u64)> {
        self.sources
            .iter()
            .map(|m| (m.source.id.clone(), m.ring.lost_samples()))
            .collect()
    }
}
