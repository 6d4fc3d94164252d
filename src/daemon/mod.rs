//! Lifecycle supervisor
//!
//! Owns startup ordering, signal handling, and bounded reverse-order
//! shutdown for every long-lived component:
//!
//! config -> telemetry/bus -> resource monitor -> mqtt -> spectrogram
//! pre-renderer -> audio capture -> analyzer.
//!
//! SIGINT and SIGTERM both cancel the root scope; every component hangs
//! off a child token of it.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::analysis::{Classifier, SlidingWindowAnalyzer};
use crate::audio::AudioSourceManager;
use crate::config::{self, Settings};
use crate::monitor::ResourceMonitor;
use crate::mqtt::{self, DiscoveryConfig, MqttObservationSink, MqttPublisher};
use crate::notify::{BusErrorPublisher, NotificationBus};
use crate::observation::{
    ClipArchive, ConfidenceFilters, NotificationSink, ObservationPipeline,
};
use crate::observation::sinks::{JsonlStore, StoreSink};
use crate::spectrogram::{PreRenderer, RenderSize, SpectrogramGenerator};
use crate::sun::SunCalc;
use crate::weather::HttpWeatherProvider;

/// Everything the daemon keeps alive, in start order.
pub struct Daemon {
    root: CancellationToken,
    settings: &'static Settings,
}

impl Daemon {
    pub fn new(settings: &'static Settings) -> Self {
        Self {
            root: CancellationToken::new(),
            settings,
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.root.clone()
    }

    /// Run until a shutdown signal arrives, then stop components in
    /// reverse order with bounded waits.
    pub async fn run(self, classifier: Arc<dyn Classifier>) -> Result<()> {
        let settings = self.settings;
        let root = self.root.clone();

        info!("Starting AVIAN-OS bird detection daemon");
        let validation = config::validate(settings);
        crate::config::validation::log_warnings(&validation);

        // Notification bus + error event publisher.
        let bus = Arc::new(NotificationBus::new(
            std::time::Duration::from_secs(settings.notify.throttle_secs),
            settings.notify.subscriber_buffer,
        ));
        crate::notify::init(bus.clone());
        crate::errors::set_event_publisher(Some(Box::new(BusErrorPublisher::new(bus.clone()))));
        info!("Notification bus online");

        spawn_signal_handler(root.clone());

        // Resource monitor on its own clock.
        let monitor = Arc::new(ResourceMonitor::new(settings));
        let monitor_task = tokio::spawn(monitor.clone().run(root.child_token()));

        // MQTT connection and retained discovery.
        let discovery_cfg = DiscoveryConfig {
            prefix: settings.mqtt.discovery_prefix.clone(),
            node_id: settings.station.node_id.clone(),
            device_name: settings.station.device_name.clone(),
            base_topic: settings.mqtt.base_topic.clone(),
            expose_sound_level: settings.mqtt.expose_sound_level,
        };
        let mqtt = if settings.mqtt.enabled {
            let (publisher, connected_rx) = MqttPublisher::connect(
                &settings.mqtt,
                discovery_cfg.status_topic(),
                &root.child_token(),
            )
            .context("mqtt connect")?;
            info!(host = %settings.mqtt.host, "MQTT publisher online");
            Some((publisher, connected_rx))
        } else {
            None
        };

        // Spectrogram generator + pre-render pool.
        let generator = Arc::new(SpectrogramGenerator::new(
            settings.spectrogram.clone(),
            settings.export.capture_length_seconds,
        ));
        let render_size = RenderSize::from_name(&settings.export.spectrogram_size)
            .unwrap_or(RenderSize::Md);
        let prerenderer = PreRenderer::start(
            generator.clone(),
            settings.export.clip_root.clone(),
            render_size,
            settings.export.spectrogram_raw,
            &root,
        );

        // Audio capture.
        let mut audio = AudioSourceManager::start(settings, &root);
        if audio.sources().is_empty() {
            warn!("no audio sources configured; the analyzer will be idle");
        }

        // Discovery republication per connection bring-up.
        if let Some((publisher, mut connected_rx)) = mqtt {
            let sources = audio.source_identities();
            let cfg = discovery_cfg.clone();
            let publisher_for_discovery = publisher.clone();
            tokio::spawn(async move {
                while connected_rx.recv().await.is_some() {
                    if let Err(e) = mqtt::publish_discovery(
                        publisher_for_discovery.as_ref(),
                        &cfg,
                        &sources,
                    )
                    .await
                    {
                        warn!(error = %e, "discovery publish failed");
                    }
                }
            });

            // Observation pipeline with the full sink set.
            let pipeline = self
                .build_pipeline(settings, &root, prerenderer.clone())
                .with_sink(Arc::new(MqttObservationSink::new(
                    publisher.clone(),
                    discovery_cfg.clone(),
                )));
            let result = self
                .run_analysis(settings, classifier, Arc::new(pipeline), &mut audio, root.clone())
                .await;

            // Reverse-order shutdown: analyzer and audio stop inside
            // run_analysis, then spectrogram, mqtt, monitor.
            prerenderer.stop().await;
            publisher.disconnect().await;
            let _ = monitor_task.await;
            return result;
        }

        let pipeline = Arc::new(self.build_pipeline(settings, &root, prerenderer.clone()));
        let result = self
            .run_analysis(settings, classifier, pipeline, &mut audio, root.clone())
            .await;

        prerenderer.stop().await;
        let _ = monitor_task.await;
        result
    }

    fn build_pipeline(
        &self,
        settings: &Settings,
        root: &CancellationToken,
        prerenderer: Arc<PreRenderer>,
    ) -> ObservationPipeline {
        let filters = ConfidenceFilters {
            global: settings.analysis.confidence_threshold,
            per_species: settings.analysis.species_thresholds.clone(),
        };
        let sun = Arc::new(SunCalc::new(
            settings.station.latitude,
            settings.station.longitude,
        ));

        let mut pipeline =
            ObservationPipeline::new(filters, settings.analysis.dedup_window_seconds, sun)
                .with_clip_archive(ClipArchive::new(settings.export.clip_root.clone()))
                .with_prerenderer(prerenderer)
                .with_sink(Arc::new(StoreSink::new(Arc::new(JsonlStore::new(
                    settings.store.path.clone(),
                )))))
                .with_sink(Arc::new(NotificationSink));

        if settings.weather.enabled {
            pipeline = pipeline.with_weather(HttpWeatherProvider::new(
                settings.weather.url.clone(),
                settings.station.latitude,
                settings.station.longitude,
                settings.weather.interval_minutes,
                root.child_token(),
            ));
        }
        if !settings.dashboard.push_url.is_empty() {
            pipeline = pipeline.with_sink(Arc::new(crate::observation::DashboardSink::new(
                settings.dashboard.push_url.clone(),
                root.child_token(),
            )));
        }
        pipeline
    }

    async fn run_analysis(
        &self,
        settings: &Settings,
        classifier: Arc<dyn Classifier>,
        pipeline: Arc<ObservationPipeline>,
        audio: &mut AudioSourceManager,
        root: CancellationToken,
    ) -> Result<()> {
        let analyzer = Arc::new(SlidingWindowAnalyzer::new(
            classifier,
            pipeline.clone(),
            settings.analysis.window_seconds,
            settings.analysis.stride_seconds,
            settings.analysis.max_concurrency,
        ));
        let analyzer_stats = analyzer.stats();
        let pipeline_stats = pipeline.stats();

        let sources: Vec<_> = audio
            .sources()
            .iter()
            .map(|m| (m.source.clone(), m.ring.clone()))
            .collect();
        let analyzer_task =
            tokio::spawn(analyzer.clone().run(sources, root.child_token()));

        // Periodic statistics until shutdown.
        let mut stats_ticker =
            tokio::time::interval(std::time::Duration::from_secs(300));
        stats_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        stats_ticker.tick().await;
        loop {
            tokio::select! {
                _ = root.cancelled() => break,
                _ = stats_ticker.tick() => {
                    let a = analyzer_stats.snapshot();
                    let p = pipeline_stats.snapshot();
                    info!(
                        windows = a.windows_analyzed,
                        dropped = a.windows_dropped,
                        detections = a.detections,
                        emitted = p.emitted,
                        "pipeline statistics"
                    );
                }
            }
        }

        info!("Shutdown signal received");
        let _ = analyzer_task.await;
        audio.stop().await;

        // Final statistics.
        let a = analyzer_stats.snapshot();
        let p = pipeline_stats.snapshot();
        info!("FINAL STATISTICS");
        info!("   Windows analyzed:   {}", a.windows_analyzed);
        info!("   Windows dropped:    {}", a.windows_dropped);
        info!("   Raw detections:     {}", a.detections);
        info!("   Observations:       {}", p.emitted);
        info!("   Filtered:           {}", p.filtered);
        info!("   Deduplicated:       {}", p.deduplicated);
        for (source, lost) in audio.lost_samples() {
            info!("   Lost samples [{source}]: {lost}");
        }

        crate::errors::clear_telemetry();
        Ok(())
    }
}

/// Unify SIGINT and SIGTERM into the root cancellation scope.
fn spawn_signal_handler(root: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "SIGTERM handler unavailable");
                    let _ = ctrl_c.await;
                    root.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => info!("SIGINT received"),
                _ = sigterm.recv() => info!("SIGTERM received"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        root.cancel();
    });
}
