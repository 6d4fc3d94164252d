//! AVIAN-OS: Acoustic aVian Identification ANalysis
//!
//! Long-running bird-detection daemon: continuous multi-source audio
//! capture, sliding-window neural classification, and contextual
//! observation fan-out.
//!
//! ## Architecture
//!
//! - **Audio capture**: per-source workers feeding SPSC PCM rings
//! - **Analyzer**: clocked window extraction into a bounded classifier pool
//! - **Observation pipeline**: filters, dedup, and best-effort sink fan-out
//! - **Spectrogram pre-renderer**: bounded pool turning retained PCM into PNGs
//! - **Resource monitor**: CPU/memory/disk state machines with hysteresis
//! - **MQTT + discovery**: Home-Assistant integration over one connection

pub mod analysis;
pub mod audio;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod errors;
pub mod httpclient;
pub mod monitor;
pub mod mqtt;
pub mod notify;
pub mod observation;
pub mod spectrogram;
pub mod sun;
pub mod support;
pub mod types;
pub mod weather;

// Re-export the domain types used at most seams.
pub use types::{
    AudioSource, Detection, Observation, PcmWindow, Priority, SolarPhase, SourceKind,
    WeatherSnapshot, SAMPLE_RATE,
};

// Re-export the collaborator traits.
pub use analysis::{Classifier, DetectionSink};
pub use observation::{ObservationSink, ObservationStore};
pub use weather::WeatherProvider;
