//! Spectrogram pre-renderer
//!
//! A bounded worker pool that turns retained PCM into PNG artifacts ahead
//! of demand. Two workers share a three-slot queue; when the queue is full
//! the job is dropped and generation falls back to on-demand. Submission is
//! always non-blocking and safe against shutdown races: the scope is
//! checked before the send, and a send against a closed queue is converted
//! into a counted failure.
//!
//! Duplicate work is suppressed at enqueue, again at job start, and by the
//! generator's idempotency on the same output path; the remaining TOCTOU
//! window is accepted.

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::defaults::{
    PRERENDER_QUEUE_CAPACITY, PRERENDER_SHUTDOWN_SECS, PRERENDER_WORKERS,
    SPECTROGRAM_TIMEOUT_SECS,
};

use super::{build_variant_path, PcmRenderer, RenderSize, SpectrogramError};

/// One queued pre-render unit. The PCM is owned; it is released as soon as
/// the job completes or is dropped.
#[derive(Debug)]
pub struct PreRenderJob {
    pub pcm: Vec<u8>,
    /// Absolute clip path the PNG derives from.
    pub clip_path: PathBuf,
    /// Correlating observation id.
    pub note_id: u64,
    pub submitted_at: DateTime<Utc>,
}

/// Counters tracked across the pool's lifetime.
#[derive(Debug, Default)]
pub struct PreRenderStats {
    queued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreRenderStatsSnapshot {
    pub queued: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl PreRenderStats {
    pub fn snapshot(&self) -> PreRenderStatsSnapshot {
        PreRenderStatsSnapshot {
            queued: self.queued.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

/// Bounded background pool rendering queued PCM into PNGs.
pub struct PreRenderer {
    tx: Mutex<Option<mpsc::Sender<PreRenderJob>>>,
    cancel: CancellationToken,
    export_root: PathBuf,
    size: RenderSize,
    raw: bool,
    stats: Arc<PreRenderStats>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PreRenderer {
    /// Spawn the worker pool under `parent`'s cancellation scope.
    pub fn start(
        renderer: Arc<dyn PcmRenderer>,
        export_root: PathBuf,
        size: RenderSize,
        raw: bool,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let cancel = parent.child_token();
        let (tx, rx) = mpsc::channel::<PreRenderJob>(PRERENDER_QUEUE_CAPACITY);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let stats = Arc::new(PreRenderStats::default());

        let pool = Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            cancel: cancel.clone(),
            export_root,
            size,
            raw,
            stats: stats.clone(),
            workers: Mutex::new(Vec::new()),
        });

        let mut handles = Vec::with_capacity(PRERENDER_WORKERS);
        for id in 0..PRERENDER_WORKERS {
            let rx = rx.clone();
            let renderer = renderer.clone();
            let pool_ref = pool.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                worker_loop(id, rx, renderer, pool_ref, cancel).await;
            }));
        }
        if let Ok(mut workers) = pool.workers.lock() {
            *workers = handles;
        }

        tracing::info!(
            workers = PRERENDER_WORKERS,
            queue = PRERENDER_QUEUE_CAPACITY,
            "Spectrogram pre-renderer started"
        );
        pool
    }

    /// Non-blocking submit. Returns:
    /// - `Ok(())` when queued or skipped (target already rendered),
    /// - [`SpectrogramError::PathEscape`] for targets outside the export root,
    /// - [`SpectrogramError::Stopped`] once the scope is cancelled,
    /// - [`SpectrogramError::QueueFull`] when the queue has no slot; the
    ///   caller treats that as deferred to on-demand generation.
    pub fn submit(&self, job: PreRenderJob) -> Result<(), SpectrogramError> {
        let target = match build_variant_path(&job.clip_path, self.size, self.raw) {
            Ok(t) => t,
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        if !path_within_root(&self.export_root, &target) {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            let err = SpectrogramError::PathEscape {
                path: target,
                root: self.export_root.clone(),
            };
            tracing::warn!(note_id = job.note_id, error = %err, "pre-render submit rejected");
            return Err(err);
        }

        if target.exists() {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        // Checked before the send: a cancelled scope must never race the
        // queue close below.
        if self.cancel.is_cancelled() {
            return Err(SpectrogramError::Stopped);
        }

        let tx = match self.tx.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        };
        let Some(tx) = tx else {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            return Err(SpectrogramError::Stopped);
        };

        match tx.try_send(job) {
            Ok(()) => {
                self.stats.queued.fetch_add(1, Ordering::Relaxed);
                let backlog = PRERENDER_QUEUE_CAPACITY.saturating_sub(tx.capacity());
                tracing::debug!(
                    event = "spectrogram_queued",
                    backlog,
                    "pre-render job queued"
                );
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                // Drop the job now so the PCM is reclaimed immediately.
                drop(dropped);
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                Err(SpectrogramError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(dropped)) => {
                drop(dropped);
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                Err(SpectrogramError::Stopped)
            }
        }
    }

    /// Cancel the scope, close the queue, and join workers within a bound.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }

        let handles: Vec<JoinHandle<()>> = match self.workers.lock() {
            Ok(mut workers) => workers.drain(..).collect(),
            Err(_) => Vec::new(),
        };

        let join_all = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(Duration::from_secs(PRERENDER_SHUTDOWN_SECS), join_all)
            .await
            .is_err()
        {
            tracing::warn!("pre-render workers did not finish within shutdown bound");
        }

        let stats = self.stats.snapshot();
        tracing::info!(
            queued = stats.queued,
            completed = stats.completed,
            failed = stats.failed,
            skipped = stats.skipped,
            "Spectrogram pre-renderer stopped"
        );
    }

    pub fn stats(&self) -> PreRenderStatsSnapshot {
        self.stats.snapshot()
    }
}

async fn worker_loop(
    id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<PreRenderJob>>>,
    renderer: Arc<dyn PcmRenderer>,
    pool: Arc<PreRenderer>,
    cancel: CancellationToken,
) {
    tracing::debug!(worker = id, "pre-render worker started");
    loop {
        let job = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => None,
                job = rx.recv() => job,
            }
        };
        let Some(mut job) = job else {
            break;
        };

        // Re-check existence: another worker or an on-demand request may
        // have produced the target while this job sat in the queue.
        let target = match build_variant_path(&job.clip_path, pool.size, pool.raw) {
            Ok(t) => t,
            Err(e) => {
                pool.stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(worker = id, note_id = job.note_id, error = %e, "pre-render failed");
                continue;
            }
        };
        if target.exists() {
            pool.stats.skipped.fetch_add(1, Ordering::Relaxed);
            drop(std::mem::take(&mut job.pcm));
            continue;
        }

        let width = pool.size.pixels();
        let render = tokio::time::timeout(
            Duration::from_secs(SPECTROGRAM_TIMEOUT_SECS),
            renderer.render_pcm(&job.pcm, &target, width, pool.raw, &cancel),
        )
        .await
        .unwrap_or(Err(SpectrogramError::Timeout));

        match render {
            Ok(()) => {
                pool.stats.completed.fetch_add(1, Ordering::Relaxed);
                // Release the PCM promptly; the job struct may outlive it.
                drop(std::mem::take(&mut job.pcm));
                tracing::debug!(worker = id, note_id = job.note_id, target = %target.display(), "pre-render complete");
            }
            Err(e) if e.is_operational() => {
                pool.stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(worker = id, note_id = job.note_id, error = %e, "pre-render stopped early");
            }
            Err(e) => {
                pool.stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(worker = id, note_id = job.note_id, error = %e, "pre-render failed");
            }
        }
    }
    tracing::debug!(worker = id, "pre-render worker exited");
}

/// Lexical containment check with absolute inputs: normalizes `.`/`..`
/// components, then requires the target to sit under the root. String
/// prefix matching is deliberately avoided.
fn path_within_root(root: &Path, target: &Path) -> bool {
    if !root.is_absolute() || !target.is_absolute() {
        return false;
    }
    let root = normalize(root);
    let target = normalize(target);
    target.starts_with(&root)
}

fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// PNG magic followed by nothing; enough for artifact checks.
    const PNG_MAGIC: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

    struct MagicRenderer;

    #[async_trait]
    impl PcmRenderer for MagicRenderer {
        async fn render_pcm(
            &self,
            _pcm: &[u8],
            out_path: &Path,
            _width: u32,
            _raw: bool,
            _cancel: &CancellationToken,
        ) -> Result<(), SpectrogramError> {
            tokio::fs::write(out_path, PNG_MAGIC).await?;
            Ok(())
        }
    }

    fn job(root: &Path, name: &str) -> PreRenderJob {
        PreRenderJob {
            pcm: vec![0u8; 96_000],
            clip_path: root.join(name),
            note_id: 1,
            submitted_at: Utc::now(),
        }
    }

    #[test]
    fn containment_rejects_escapes() {
        assert!(path_within_root(Path::new("/export"), Path::new("/export/a/b.png")));
        assert!(!path_within_root(
            Path::new("/export"),
            Path::new("/export/../etc/passwd.png")
        ));
        assert!(!path_within_root(Path::new("/export"), Path::new("/elsewhere/x.png")));
        assert!(!path_within_root(Path::new("/export"), Path::new("relative.png")));
    }

    #[tokio::test]
    async fn submit_escaping_export_root_counts_failed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let parent = CancellationToken::new();
        let pool = PreRenderer::start(
            Arc::new(MagicRenderer),
            dir.path().to_path_buf(),
            RenderSize::Md,
            false,
            &parent,
        );

        let mut escaping = job(dir.path(), "clip.wav");
        escaping.clip_path = PathBuf::from("/elsewhere/clip.wav");
        let err = pool.submit(escaping).expect_err("must reject");
        assert!(matches!(err, SpectrogramError::PathEscape { .. }));
        assert_eq!(pool.stats().failed, 1);
        pool.stop().await;
    }

    #[tokio::test]
    async fn submit_existing_target_skips_without_enqueue() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("clip.png"), PNG_MAGIC).expect("pre-existing png");

        let parent = CancellationToken::new();
        let pool = PreRenderer::start(
            Arc::new(MagicRenderer),
            dir.path().to_path_buf(),
            RenderSize::Md,
            false,
            &parent,
        );

        pool.submit(job(dir.path(), "clip.wav")).expect("skip is ok");
        let stats = pool.stats();
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.queued, 0);
        pool.stop().await;
    }

    #[tokio::test]
    async fn overflow_returns_queue_full_and_counters_balance() {
        let dir = tempfile::tempdir().expect("tempdir");
        let parent = CancellationToken::new();
        let pool = PreRenderer::start(
            Arc::new(MagicRenderer),
            dir.path().to_path_buf(),
            RenderSize::Md,
            false,
            &parent,
        );

        // Submitted back-to-back without yielding, so the queue fills
        // before any worker drains it.
        let mut accepted = 0u64;
        let mut rejected = 0u64;
        for i in 0..20 {
            match pool.submit(job(dir.path(), &format!("clip{i}.wav"))) {
                Ok(()) => accepted += 1,
                Err(SpectrogramError::QueueFull) => rejected += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert!(accepted >= PRERENDER_QUEUE_CAPACITY as u64);
        assert!(rejected > 0);
        assert_eq!(accepted + rejected, 20);
        assert_eq!(pool.stats().queued, accepted);

        // Queue-full drops count as failures; everything accepted must
        // eventually complete, so the counters converge on 20.
        for _ in 0..100 {
            let stats = pool.stats();
            if stats.completed + stats.skipped + stats.failed == 20 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let stats = pool.stats();
        assert_eq!(stats.completed, accepted);
        assert_eq!(stats.failed, rejected);
        assert_eq!(stats.completed + stats.skipped + stats.failed, 20);
        pool.stop().await;
    }

    #[tokio::test]
    async fn rendered_artifacts_start_with_png_magic() {
        let dir = tempfile::tempdir().expect("tempdir");
        let parent = CancellationToken::new();
        let pool = PreRenderer::start(
            Arc::new(MagicRenderer),
            dir.path().to_path_buf(),
            RenderSize::Md,
            false,
            &parent,
        );

        pool.submit(job(dir.path(), "robin.wav")).expect("queued");

        // Wait for the worker to drain the job.
        for _ in 0..50 {
            if pool.stats().completed == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let bytes = std::fs::read(dir.path().join("robin.png")).expect("artifact");
        assert_eq!(&bytes[..8], &PNG_MAGIC);
        pool.stop().await;
    }

    #[tokio::test]
    async fn submit_after_stop_errors_instead_of_panicking() {
        let dir = tempfile::tempdir().expect("tempdir");
        let parent = CancellationToken::new();
        let pool = PreRenderer::start(
            Arc::new(MagicRenderer),
            dir.path().to_path_buf(),
            RenderSize::Md,
            false,
            &parent,
        );
        pool.stop().await;

        let err = pool.submit(job(dir.path(), "late.wav")).expect_err("stopped");
        assert!(matches!(err, SpectrogramError::Stopped));
    }

    #[tokio::test]
    async fn cancelled_parent_scope_rejects_submissions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let parent = CancellationToken::new();
        let pool = PreRenderer::start(
            Arc::new(MagicRenderer),
            dir.path().to_path_buf(),
            RenderSize::Md,
            false,
            &parent,
        );
        parent.cancel();

        let err = pool.submit(job(dir.path(), "late.wav")).expect_err("cancelled");
        assert!(matches!(err, SpectrogramError::Stopped));
        pool.stop().await;
    }
}
