//! Settings structures deserialized from `avian.toml`.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::defaults;
use crate::types::{AudioSource, SourceKind};

/// Root settings document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub station: StationSettings,
    pub audio: AudioSettings,
    pub analysis: AnalysisSettings,
    pub export: ExportSettings,
    pub spectrogram: SpectrogramSettings,
    pub mqtt: MqttSettings,
    pub monitor: MonitorSettings,
    pub weather: WeatherSettings,
    pub dashboard: DashboardSettings,
    pub notify: NotifySettings,
    pub store: StoreSettings,
}

impl Settings {
    /// Load settings from `AVIAN_CONFIG`, `./avian.toml`, or defaults.
    pub fn load() -> Self {
        let path = std::env::var("AVIAN_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("avian.toml"));

        match std::fs::read_to_string(&path) {
            Ok(text) => match toml::from_str(&text) {
                Ok(settings) => {
                    tracing::info!(path = %path.display(), "Loaded configuration");
                    settings
                }
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Config file invalid; using built-in defaults"
                    );
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!("No config file found; using built-in defaults");
                Self::default()
            }
        }
    }
}

/// Station identity and geographic location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StationSettings {
    /// Node identifier used in MQTT topics and discovery unique IDs.
    pub node_id: String,
    /// Device name prefix for discovery entities.
    pub device_name: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl Default for StationSettings {
    fn default() -> Self {
        Self {
            node_id: "avian".to_string(),
            device_name: "AVIAN-OS".to_string(),
            latitude: 0.0,
            longitude: 0.0,
        }
    }
}

/// One configured audio input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSettings {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub kind: SourceKind,
    /// Device name (local-device), stream URL (rtsp-stream), or file path
    /// (file-replay). Defaults to `id` when omitted.
    #[serde(default)]
    pub input: Option<String>,
}

impl SourceSettings {
    pub fn to_source(&self) -> AudioSource {
        let mut source = AudioSource::new(self.id.clone(), self.kind);
        if let Some(ref name) = self.display_name {
            source = source.with_display_name(name.clone());
        }
        source
    }

    /// The capture input string handed to the device or codec layer.
    pub fn input(&self) -> &str {
        self.input.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    pub sources: Vec<SourceSettings>,
    pub ring_margin_seconds: f64,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            ring_margin_seconds: defaults::RING_MARGIN_SECONDS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisSettings {
    pub window_seconds: f64,
    pub stride_seconds: f64,
    /// Classifier pool size; 0 means derive from the CPU count.
    pub max_concurrency: usize,
    pub confidence_threshold: f64,
    /// Per-species overrides keyed by scientific name.
    pub species_thresholds: HashMap<String, f64>,
    pub dedup_window_seconds: u64,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            window_seconds: defaults::ANALYSIS_WINDOW_SECONDS,
            stride_seconds: defaults::ANALYSIS_STRIDE_SECONDS,
            max_concurrency: 0,
            confidence_threshold: defaults::GLOBAL_CONFIDENCE_THRESHOLD,
            species_thresholds: HashMap::new(),
            dedup_window_seconds: defaults::DEDUP_WINDOW_SECONDS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    /// Root directory for clips and their spectrogram PNGs.
    pub clip_root: PathBuf,
    pub spectrogram_size: String,
    pub spectrogram_raw: bool,
    pub capture_length_seconds: u64,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            clip_root: PathBuf::from("./clips"),
            spectrogram_size: "md".to_string(),
            spectrogram_raw: false,
            capture_length_seconds: defaults::CAPTURE_LENGTH_SECONDS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpectrogramSettings {
    pub sox_path: String,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    /// Extensions sox reads natively, skipping the codec bridge.
    pub native_extensions: Vec<String>,
    pub generation_timeout_secs: u64,
    pub fallback_timeout_secs: u64,
}

impl Default for SpectrogramSettings {
    fn default() -> Self {
        Self {
            sox_path: "sox".to_string(),
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            native_extensions: vec!["wav".to_string(), "flac".to_string()],
            generation_timeout_secs: defaults::SPECTROGRAM_TIMEOUT_SECS,
            fallback_timeout_secs: defaults::FFMPEG_FALLBACK_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: String,
    /// File path takes precedence over `password` (see `config::secrets`).
    pub username_file: String,
    pub password: String,
    pub password_file: String,
    pub base_topic: String,
    pub discovery_prefix: String,
    /// Expose the octave-band sound-level sensor per source.
    pub expose_sound_level: bool,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "localhost".to_string(),
            port: 1883,
            client_id: "avian-os".to_string(),
            username: String::new(),
            username_file: String::new(),
            password: String::new(),
            password_file: String::new(),
            base_topic: "avian".to_string(),
            discovery_prefix: "homeassistant".to_string(),
            expose_sound_level: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceThresholds {
    pub enabled: bool,
    pub warning: f64,
    pub critical: f64,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            enabled: true,
            warning: 80.0,
            critical: 90.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub interval_secs: u64,
    pub hysteresis: f64,
    pub critical_resend_minutes: i64,
    pub cpu: ResourceThresholds,
    pub memory: ResourceThresholds,
    pub disk: ResourceThresholds,
    /// Disk paths monitored in addition to the auto-detected critical set.
    pub disk_paths: Vec<PathBuf>,
    /// Suppress paths that are strict descendants of another monitored path.
    pub suppress_nested_paths: bool,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval_secs: defaults::MONITOR_INTERVAL_SECS,
            hysteresis: defaults::MONITOR_HYSTERESIS,
            critical_resend_minutes: defaults::CRITICAL_RESEND_MINUTES,
            cpu: ResourceThresholds::default(),
            memory: ResourceThresholds::default(),
            disk: ResourceThresholds {
                enabled: true,
                warning: 80.0,
                critical: 90.0,
            },
            disk_paths: Vec::new(),
            suppress_nested_paths: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WeatherSettings {
    pub enabled: bool,
    /// Locationforecast-compatible endpoint.
    pub url: String,
    pub interval_minutes: u64,
}

impl Default for WeatherSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "https://api.met.no/weatherapi/locationforecast/2.0/compact".to_string(),
            interval_minutes: defaults::WEATHER_INTERVAL_MINUTES,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardSettings {
    /// Observation push endpoint; empty disables the sink.
    pub push_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifySettings {
    pub throttle_secs: u64,
    pub subscriber_buffer: usize,
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            throttle_secs: defaults::NOTIFY_THROTTLE_SECS,
            subscriber_buffer: defaults::NOTIFY_SUBSCRIBER_BUFFER,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Relational store location; monitored for disk pressure.
    pub path: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/avian.db"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let settings = Settings::default();
        let text = toml::to_string(&settings).expect("serialize");
        let parsed: Settings = toml::from_str(&text).expect("parse");
        assert_eq!(parsed.analysis.window_seconds, 3.0);
        assert_eq!(parsed.mqtt.discovery_prefix, "homeassistant");
    }

    #[test]
    fn partial_config_fills_defaults() {
        let parsed: Settings = toml::from_str(
            r#"
[station]
node_id = "garden"
latitude = 51.1
longitude = 4.5

[[audio.sources]]
id = "hw:0,0"
kind = "local-device"
display_name = "Garden Mic"
"#,
        )
        .expect("parse");
        assert_eq!(parsed.station.node_id, "garden");
        assert_eq!(parsed.audio.sources.len(), 1);
        assert_eq!(parsed.audio.sources[0].input(), "hw:0,0");
        assert_eq!(parsed.analysis.stride_seconds, 1.5);
    }
}
