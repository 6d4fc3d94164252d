//! Sliding-window analyzer
//!
//! Runs one clocked loop per source. Each tick copies a fixed-length PCM
//! window from the source's ring, advances by the stride, and submits the
//! window to the classifier through a bounded pool of worker slots. When
//! every slot is busy the window is dropped and counted; real-time locality
//! beats completeness here.
//!
//! The classifier itself is a collaborator behind [`Classifier`]; windows
//! are delivered at the capture rate and any resampling is its concern.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::audio::PcmRing;
use crate::types::{AudioSource, Detection, PcmWindow, SAMPLE_RATE};

/// Bounded wait for in-flight classifier calls at shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// The neural classifier collaborator: a pure function from one PCM window
/// to scored species detections.
#[async_trait]
pub trait Classifier: Send + Sync + 'static {
    async fn classify(&self, window: &PcmWindow) -> anyhow::Result<Vec<Detection>>;
}

/// Consumer of classifier output; implemented by the observation pipeline.
#[async_trait]
pub trait DetectionSink: Send + Sync + 'static {
    async fn handle(&self, window: PcmWindow, detections: Vec<Detection>);
}

/// Placeholder classifier used when no model integration is wired in.
/// Produces no detections; the daemon logs a warning at startup.
pub struct NoopClassifier;

#[async_trait]
impl Classifier for NoopClassifier {
    async fn classify(&self, _window: &PcmWindow) -> anyhow::Result<Vec<Detection>> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Default)]
pub struct AnalyzerStats {
    windows_analyzed: AtomicU64,
    windows_dropped: AtomicU64,
    detections: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalyzerStatsSnapshot {
    pub windows_analyzed: u64,
    pub windows_dropped: u64,
    pub detections: u64,
}

impl AnalyzerStats {
    pub fn snapshot(&self) -> AnalyzerStatsSnapshot {
        AnalyzerStatsSnapshot {
            windows_analyzed: self.windows_analyzed.load(Ordering::Relaxed),
            windows_dropped: self.windows_dropped.load(Ordering::Relaxed),
            detections: self.detections.load(Ordering::Relaxed),
        }
    }
}

/// Clocked window extraction and bounded classifier dispatch.
pub struct SlidingWindowAnalyzer {
    classifier: Arc<dyn Classifier>,
    sink: Arc<dyn DetectionSink>,
    window_seconds: f64,
    stride_seconds: f64,
    slots: Arc<Semaphore>,
    slot_count: u32,
    stats: Arc<AnalyzerStats>,
}

impl SlidingWindowAnalyzer {
    /// `max_concurrency` of zero derives the pool size from the CPU count;
    /// either way concurrency stays below it.
    pub fn new(
        classifier: Arc<dyn Classifier>,
        sink: Arc<dyn DetectionSink>,
        window_seconds: f64,
        stride_seconds: f64,
        max_concurrency: usize,
    ) -> Self {
        let cpus = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(2);
        let slot_count = if max_concurrency == 0 {
            cpus.saturating_sub(1).max(1)
        } else {
            max_concurrency.min(cpus)
        } as u32;

        Self {
            classifier,
            sink,
            window_seconds,
            stride_seconds,
            slots: Arc::new(Semaphore::new(slot_count as usize)),
            slot_count,
            stats: Arc::new(AnalyzerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<AnalyzerStats> {
        self.stats.clone()
    }

    /// Run one extraction loop per source until cancelled, then drain
    /// in-flight classifier calls within a bound.
    pub async fn run(
        self: Arc<Self>,
        sources: Vec<(AudioSource, Arc<PcmRing>)>,
        cancel: CancellationToken,
    ) {
        let mut loops = Vec::with_capacity(sources.len());
        for (source, ring) in sources {
            let analyzer = self.clone();
            let cancel = cancel.clone();
            loops.push(tokio::spawn(async move {
                analyzer.source_loop(source, ring, cancel).await;
            }));
        }
        for task in loops {
            let _ = task.await;
        }

        // New work stopped; allow in-flight calls to complete up to a bound.
        let drained = tokio::time::timeout(
            DRAIN_TIMEOUT,
            self.slots.acquire_many(self.slot_count),
        )
        .await;
        match drained {
            Ok(Ok(permits)) => drop(permits),
            _ => tracing::warn!("classifier calls still in flight past drain bound"),
        }
        tracing::info!("analyzer stopped");
    }

    async fn source_loop(
        &self,
        source: AudioSource,
        ring: Arc<PcmRing>,
        cancel: CancellationToken,
    ) {
        let window_len = (self.window_seconds * f64::from(SAMPLE_RATE)).round() as usize;
        let stride_len = (self.stride_seconds * f64::from(SAMPLE_RATE)).round() as usize;
        let mut ticker =
            tokio::time::interval(Duration::from_secs_f64(self.stride_seconds.max(0.01)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(source = %source.id, window_len, stride_len, "analyzer loop started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(read) = ring.next_window(window_len, stride_len) else {
                continue;
            };

            let window = PcmWindow {
                source_id: source.id.clone(),
                start_time: Utc::now()
                    - chrono::Duration::milliseconds((self.window_seconds * 1000.0) as i64),
                duration_seconds: self.window_seconds,
                samples: read.samples,
            };

            // Excess windows are dropped, never queued.
            let permit = match self.slots.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    self.stats.windows_dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(source = %source.id, "classifier pool busy; window dropped");
                    continue;
                }
            };

            let classifier = self.classifier.clone();
            let sink = self.sink.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                let _permit = permit;
                match classifier.classify(&window).await {
                    Ok(detections) => {
                        stats.windows_analyzed.fetch_add(1, Ordering::Relaxed);
                        stats
                            .detections
                            .fetch_add(detections.len() as u64, Ordering::Relaxed);
                        if !detections.is_empty() {
                            sink.handle(window, detections).await;
                        }
                    }
                    Err(e) => {
                        stats.windows_analyzed.fetch_add(1, Ordering::Relaxed);
                        crate::errors::enhance(format!("classification failed: {e}"))
                            .component(crate::errors::Component::Analysis)
                            .context("source", window.source_id.clone())
                            .build_and_report();
                        tracing::warn!(source = %window.source_id, error = %e, "classifier call failed");
                    }
                }
            });
        }
        tracing::info!(source = %source.id, "analyzer loop exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FixedClassifier(Vec<Detection>);

    #[async_trait]
    impl Classifier for FixedClassifier {
        async fn classify(&self, _window: &PcmWindow) -> anyhow::Result<Vec<Detection>> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct CollectingSink {
        seen: Mutex<Vec<(String, usize)>>,
    }

    #[async_trait]
    impl DetectionSink for CollectingSink {
        async fn handle(&self, window: PcmWindow, detections: Vec<Detection>) {
            self.seen
                .lock()
                .expect("sink lock")
                .push((window.source_id, detections.len()));
        }
    }

    fn detection() -> Detection {
        Detection {
            species_scientific: "Erithacus rubecula".to_string(),
            species_common: "European Robin".to_string(),
            confidence: 0.9,
        }
    }

    #[tokio::test]
    async fn windows_flow_from_ring_to_sink() {
        let classifier = Arc::new(FixedClassifier(vec![detection()]));
        let sink = Arc::new(CollectingSink::default());
        // 10 ms windows with 10 ms stride keep the test fast.
        let analyzer = Arc::new(SlidingWindowAnalyzer::new(
            classifier,
            sink.clone(),
            0.01,
            0.01,
            2,
        ));

        let source = AudioSource::new("test", crate::types::SourceKind::FileReplay);
        let ring = Arc::new(PcmRing::new(48_000));
        ring.push(&vec![100i16; 4800]);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(
            analyzer
                .clone()
                .run(vec![(source, ring)], cancel.clone()),
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        let _ = handle.await;

        let stats = analyzer.stats().snapshot();
        assert!(stats.windows_analyzed > 0, "at least one window analyzed");
        let seen = sink.seen.lock().expect("sink lock");
        assert!(!seen.is_empty());
        assert_eq!(seen[0].0, "test");
        assert_eq!(seen[0].1, 1);
    }

    #[test]
    fn pool_size_respects_cpu_bound() {
        let classifier = Arc::new(FixedClassifier(Vec::new()));
        let sink = Arc::new(CollectingSink::default());
        let analyzer =
            SlidingWindowAnalyzer::new(classifier, sink, 3.0, 1.5, 10_000);
        let cpus = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(2);
        assert!(analyzer.slot_count as usize <= cpus);
        assert!(analyzer.slot_count >= 1);
    }
}
