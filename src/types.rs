//! Core domain types shared across the daemon.
//!
//! Everything here is plain data: capture sources, PCM windows, classifier
//! detections, and the enriched observations that flow out to the sinks.

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

/// PCM sample rate for every capture path (Hz).
pub const SAMPLE_RATE: u32 = 48_000;

/// Kind of audio input backing a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    /// A capture device on this machine (microphone, line-in).
    LocalDevice,
    /// A remote RTSP stream decoded by an external codec process.
    RtspStream,
    /// An on-disk file replayed at capture cadence.
    FileReplay,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::LocalDevice => write!(f, "local-device"),
            SourceKind::RtspStream => write!(f, "rtsp-stream"),
            SourceKind::FileReplay => write!(f, "file-replay"),
        }
    }
}

/// Logical identity of an audio input.
///
/// The identity survives reconnection: a stream source that drops and comes
/// back keeps the same `id`, and all observations attribute to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioSource {
    /// Opaque identifier; may contain device-path or URL characters.
    pub id: String,
    /// Optional human label shown in dashboards and discovery entities.
    pub display_name: Option<String>,
    pub kind: SourceKind,
}

impl AudioSource {
    pub fn new(id: impl Into<String>, kind: SourceKind) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            kind,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// The label preferred for user-facing naming.
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }
}

/// A fixed-length slice of signed 16-bit little-endian mono samples at 48 kHz.
///
/// Ownership transfers exclusively from capture to the analyzer; after
/// inference the window may be retained for spectrogram pre-rendering.
#[derive(Debug, Clone)]
pub struct PcmWindow {
    pub source_id: String,
    /// Wall clock of the first sample in the window.
    pub start_time: DateTime<Utc>,
    pub duration_seconds: f64,
    pub samples: Vec<i16>,
}

impl PcmWindow {
    /// Raw little-endian byte view of the samples, suitable for piping to
    /// an external renderer's stdin.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.samples.len() * 2);
        for s in &self.samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        bytes
    }
}

/// One classifier result for one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub species_scientific: String,
    pub species_common: String,
    /// Classifier confidence in [0, 1].
    pub confidence: f64,
}

/// Phase of the solar day at observation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SolarPhase {
    Night,
    AstronomicalTwilight,
    NauticalTwilight,
    CivilTwilight,
    Day,
}

impl std::fmt::Display for SolarPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SolarPhase::Night => write!(f, "night"),
            SolarPhase::AstronomicalTwilight => write!(f, "astronomical-twilight"),
            SolarPhase::NauticalTwilight => write!(f, "nautical-twilight"),
            SolarPhase::CivilTwilight => write!(f, "civil-twilight"),
            SolarPhase::Day => write!(f, "day"),
        }
    }
}

/// Weather conditions sampled near the observation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherSnapshot {
    pub temperature_c: f64,
    pub wind_speed_ms: f64,
    pub humidity_percent: f64,
    pub cloud_cover_percent: f64,
    pub fetched_at: DateTime<Utc>,
}

/// The persisted and published record of one detection with context.
///
/// Invariants: `detection.confidence` met the per-species threshold at
/// emission time, and if `clip_path` is set the PCM that produced it is
/// retained until the spectrogram PNG is emitted or the job is dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    /// Monotonic per-process identifier.
    pub id: u64,
    pub source_id: String,
    pub time: DateTime<Local>,
    pub solar_phase: SolarPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weather: Option<WeatherSnapshot>,
    pub detection: Detection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clip_path: Option<std::path::PathBuf>,
}

/// Priority attached to notifications and escalated errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 0,
    Medium = 1,
    High = 2,
    Critical = 3,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_label_prefers_display_name() {
        let bare = AudioSource::new("hw:0,0", SourceKind::LocalDevice);
        assert_eq!(bare.label(), "hw:0,0");

        let named = bare.with_display_name("Garden Mic");
        assert_eq!(named.label(), "Garden Mic");
    }

    #[test]
    fn pcm_window_bytes_are_little_endian() {
        let window = PcmWindow {
            source_id: "test".to_string(),
            start_time: Utc::now(),
            duration_seconds: 0.0,
            samples: vec![0x0102, -2],
        };
        assert_eq!(window.to_le_bytes(), vec![0x02, 0x01, 0xFE, 0xFF]);
    }

    #[test]
    fn observation_elides_optional_fields() {
        let obs = Observation {
            id: 1,
            source_id: "s".to_string(),
            time: Local::now(),
            solar_phase: SolarPhase::Day,
            weather: None,
            detection: Detection {
                species_scientific: "Turdus merula".to_string(),
                species_common: "Eurasian Blackbird".to_string(),
                confidence: 0.91,
            },
            clip_path: None,
        };
        let json = serde_json::to_string(&obs).expect("serialize");
        assert!(!json.contains("weather"));
        assert!(!json.contains("clip_path"));
    }

    #[test]
    fn priority_parses_case_insensitively() {
        assert_eq!("CRITICAL".parse::<Priority>(), Ok(Priority::Critical));
        assert!("urgent".parse::<Priority>().is_err());
    }
}
