//! Observation pipeline
//!
//! Consumes classifier detections, applies the global and per-species
//! confidence filters plus a per-species dedup window, assembles
//! [`Observation`] records with solar phase and weather context, and fans
//! them out to the configured sinks. Every sink is best-effort and
//! isolated: one failing or slow sink never stalls the others, and each
//! failure is wrapped through the error envelope with the sink's tag.

pub mod sinks;

pub use sinks::{ClipArchive, DashboardSink, NotificationSink, ObservationSink, ObservationStore};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};

use crate::analysis::DetectionSink;
use crate::errors::{enhance, Category, Component};
use crate::spectrogram::{PreRenderJob, PreRenderer, SpectrogramError};
use crate::sun::SunCalc;
use crate::types::{Detection, Observation, PcmWindow};
use crate::weather::WeatherProvider;

/// Bound applied to each sink emit so a stalled sink cannot wedge the
/// fan-out.
const SINK_TIMEOUT: Duration = Duration::from_secs(10);

/// Confidence thresholds: a per-species override wins over the global one.
#[derive(Debug, Clone, Default)]
pub struct ConfidenceFilters {
    pub global: f64,
    pub per_species: HashMap<String, f64>,
}

impl ConfidenceFilters {
    pub fn threshold_for(&self, species_scientific: &str) -> f64 {
        self.per_species
            .get(species_scientific)
            .copied()
            .unwrap_or(self.global)
    }

    pub fn passes(&self, detection: &Detection) -> bool {
        detection.confidence >= self.threshold_for(&detection.species_scientific)
    }
}

#[derive(Debug, Default)]
pub struct PipelineStats {
    emitted: AtomicU64,
    filtered: AtomicU64,
    deduplicated: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStatsSnapshot {
    pub emitted: u64,
    pub filtered: u64,
    pub deduplicated: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            emitted: self.emitted.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
        }
    }
}

/// Assembles observations and routes them to the sinks.
pub struct ObservationPipeline {
    filters: ConfidenceFilters,
    dedup_window: chrono::Duration,
    recent: Mutex<HashMap<String, DateTime<Utc>>>,
    sinks: Vec<Arc<dyn ObservationSink>>,
    clip_archive: Option<ClipArchive>,
    prerenderer: Option<Arc<PreRenderer>>,
    sun: Arc<SunCalc>,
    weather: Option<Arc<dyn WeatherProvider>>,
    next_id: AtomicU64,
    stats: Arc<PipelineStats>,
}

impl ObservationPipeline {
    pub fn new(filters: ConfidenceFilters, dedup_window_seconds: u64, sun: Arc<SunCalc>) -> Self {
        Self {
            filters,
            dedup_window: chrono::Duration::seconds(dedup_window_seconds as i64),
            recent: Mutex::new(HashMap::new()),
            sinks: Vec::new(),
            clip_archive: None,
            prerenderer: None,
            sun,
            weather: None,
            next_id: AtomicU64::new(1),
            stats: Arc::new(PipelineStats::default()),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ObservationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_clip_archive(mut self, archive: ClipArchive) -> Self {
        self.clip_archive = Some(archive);
        self
    }

    pub fn with_prerenderer(mut self, prerenderer: Arc<PreRenderer>) -> Self {
        self.prerenderer = Some(prerenderer);
        self
    }

    pub fn with_weather(mut self, weather: Arc<dyn WeatherProvider>) -> Self {
        self.weather = Some(weather);
        self
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    /// A species detection is suppressed when the same species was emitted
    /// within the dedup window.
    fn dedup_passes(&self, species: &str, now: DateTime<Utc>) -> bool {
        let Ok(mut recent) = self.recent.lock() else {
            return true;
        };
        match recent.get(species) {
            Some(last) if now - *last < self.dedup_window => false,
            _ => {
                recent.insert(species.to_string(), now);
                true
            }
        }
    }

    async fn assemble(&self, window: &PcmWindow, detection: Detection) -> Observation {
        let time: DateTime<Local> = window.start_time.with_timezone(&Local);
        let weather = match &self.weather {
            Some(provider) => provider.current().await,
            None => None,
        };
        Observation {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            source_id: window.source_id.clone(),
            time,
            solar_phase: self.sun.solar_phase(time),
            weather,
            detection,
            clip_path: None,
        }
    }

    /// Route one observation to every sink in parallel, best-effort.
    async fn fan_out(&self, observation: &Observation) {
        let emits = self.sinks.iter().map(|sink| {
            let sink = sink.clone();
            async move {
                let result =
                    tokio::time::timeout(SINK_TIMEOUT, sink.emit(observation)).await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        enhance(format!("sink emit failed: {e}"))
                            .component(Component::Observation)
                            .context("sink", sink.name())
                            .context("operation", "emit")
                            .build_and_report();
                        tracing::warn!(sink = sink.name(), error = %e, "sink emit failed");
                    }
                    Err(_) => {
                        enhance("sink emit timed out".to_string())
                            .component(Component::Observation)
                            .category(Category::Timeout)
                            .context("sink", sink.name())
                            .context("operation", "emit")
                            .build_and_report();
                        tracing::warn!(sink = sink.name(), "sink emit timed out");
                    }
                }
            }
        });
        futures::future::join_all(emits).await;
    }
}

#[async_trait]
impl DetectionSink for ObservationPipeline {
    async fn handle(&self, window: PcmWindow, detections: Vec<Detection>) {
        let now = Utc::now();
        for detection in detections {
            if !self.filters.passes(&detection) {
                self.stats.filtered.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if !self.dedup_passes(&detection.species_scientific, now) {
                self.stats.deduplicated.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let mut observation = self.assemble(&window, detection).await;

            // Archive the clip first so downstream consumers see the path.
            if let Some(ref archive) = self.clip_archive {
                match archive.write_clip(&observation, &window.samples) {
                    Ok(path) => observation.clip_path = Some(path),
                    Err(e) => {
                        enhance(format!("clip archive failed: {e}"))
                            .component(Component::Observation)
                            .context("operation", "archive-clip")
                            .build_and_report();
                    }
                }
            }

            // Retained PCM moves to the pre-renderer; a full queue defers
            // the PNG to on-demand generation.
            if let (Some(prerenderer), Some(clip_path)) =
                (&self.prerenderer, observation.clip_path.clone())
            {
                let job = PreRenderJob {
                    pcm: window.to_le_bytes(),
                    clip_path,
                    note_id: observation.id,
                    submitted_at: Utc::now(),
                };
                match prerenderer.submit(job) {
                    Ok(()) => {}
                    Err(SpectrogramError::QueueFull) => {
                        tracing::debug!(
                            note_id = observation.id,
                            "pre-render queue full; deferred to on-demand"
                        );
                    }
                    Err(e) => {
                        tracing::debug!(note_id = observation.id, error = %e, "pre-render submit failed");
                    }
                }
            }

            tracing::info!(
                source = %observation.source_id,
                species = %observation.detection.species_common,
                confidence = observation.detection.confidence,
                solar_phase = %observation.solar_phase,
                "detection"
            );

            self.fan_out(&observation).await;
            self.stats.emitted.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SolarPhase;
    use std::sync::Mutex as StdMutex;

    struct RecordingSink {
        name: &'static str,
        seen: StdMutex<Vec<u64>>,
        fail: bool,
    }

    #[async_trait]
    impl ObservationSink for RecordingSink {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn emit(&self, observation: &Observation) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("sink down");
            }
            self.seen.lock().expect("lock").push(observation.id);
            Ok(())
        }
    }

    fn window() -> PcmWindow {
        PcmWindow {
            source_id: "garden".to_string(),
            start_time: Utc::now(),
            duration_seconds: 3.0,
            samples: vec![0i16; 480],
        }
    }

    fn detection(species: &str, confidence: f64) -> Detection {
        Detection {
            species_scientific: species.to_string(),
            species_common: species.to_string(),
            confidence,
        }
    }

    fn pipeline_with(sink: Arc<RecordingSink>) -> ObservationPipeline {
        let filters = ConfidenceFilters {
            global: 0.7,
            per_species: HashMap::from([("Tyto alba".to_string(), 0.9)]),
        };
        ObservationPipeline::new(filters, 15, Arc::new(SunCalc::new(51.0, 3.7)))
            .with_sink(sink)
    }

    #[test]
    fn per_species_threshold_overrides_global() {
        let filters = ConfidenceFilters {
            global: 0.7,
            per_species: HashMap::from([("Tyto alba".to_string(), 0.9)]),
        };
        assert!(filters.passes(&detection("Erithacus rubecula", 0.75)));
        assert!(!filters.passes(&detection("Erithacus rubecula", 0.6)));
        assert!(!filters.passes(&detection("Tyto alba", 0.8)));
        assert!(filters.passes(&detection("Tyto alba", 0.95)));
    }

    #[tokio::test]
    async fn emitted_observations_reach_sinks_with_context() {
        let sink = Arc::new(RecordingSink {
            name: "recording",
            seen: StdMutex::new(Vec::new()),
            fail: false,
        });
        let pipeline = pipeline_with(sink.clone());

        pipeline
            .handle(window(), vec![detection("Erithacus rubecula", 0.95)])
            .await;

        assert_eq!(sink.seen.lock().expect("lock").len(), 1);
        assert_eq!(pipeline.stats().snapshot().emitted, 1);
    }

    #[tokio::test]
    async fn low_confidence_detections_are_filtered() {
        let sink = Arc::new(RecordingSink {
            name: "recording",
            seen: StdMutex::new(Vec::new()),
            fail: false,
        });
        let pipeline = pipeline_with(sink.clone());

        pipeline
            .handle(window(), vec![detection("Erithacus rubecula", 0.2)])
            .await;

        assert!(sink.seen.lock().expect("lock").is_empty());
        let stats = pipeline.stats().snapshot();
        assert_eq!(stats.filtered, 1);
        assert_eq!(stats.emitted, 0);
    }

    #[tokio::test]
    async fn repeat_species_within_window_is_suppressed() {
        let sink = Arc::new(RecordingSink {
            name: "recording",
            seen: StdMutex::new(Vec::new()),
            fail: false,
        });
        let pipeline = pipeline_with(sink.clone());

        pipeline
            .handle(window(), vec![detection("Erithacus rubecula", 0.95)])
            .await;
        pipeline
            .handle(window(), vec![detection("Erithacus rubecula", 0.95)])
            .await;

        assert_eq!(sink.seen.lock().expect("lock").len(), 1);
        assert_eq!(pipeline.stats().snapshot().deduplicated, 1);
    }

    #[tokio::test]
    async fn one_failing_sink_does_not_block_the_rest() {
        // The failing sink reports through the global telemetry slots.
        let _guard = crate::errors::telemetry::test_guard();
        let good = Arc::new(RecordingSink {
            name: "good",
            seen: StdMutex::new(Vec::new()),
            fail: false,
        });
        let bad = Arc::new(RecordingSink {
            name: "bad",
            seen: StdMutex::new(Vec::new()),
            fail: true,
        });
        let filters = ConfidenceFilters {
            global: 0.5,
            per_species: HashMap::new(),
        };
        let pipeline =
            ObservationPipeline::new(filters, 15, Arc::new(SunCalc::new(51.0, 3.7)))
                .with_sink(bad)
                .with_sink(good.clone());

        pipeline
            .handle(window(), vec![detection("Erithacus rubecula", 0.95)])
            .await;

        assert_eq!(good.seen.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn observations_carry_solar_phase() {
        let sink = Arc::new(RecordingSink {
            name: "recording",
            seen: StdMutex::new(Vec::new()),
            fail: false,
        });
        let pipeline = pipeline_with(sink);
        let obs = pipeline
            .assemble(&window(), detection("Erithacus rubecula", 0.9))
            .await;
        // Any phase is valid; the field must simply be populated coherently.
        assert!(matches!(
            obs.solar_phase,
            SolarPhase::Night
                | SolarPhase::AstronomicalTwilight
                | SolarPhase::NauticalTwilight
                | SolarPhase::CivilTwilight
                | SolarPhase::Day
        ));
        assert!(obs.weather.is_none());
    }
}
