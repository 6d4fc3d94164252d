//! Observation sinks: the store adapter, the notification feed, the
//! dashboard push, and the on-disk clip archive.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::httpclient::HttpClient;
use crate::notify::{self, MetadataValue, Notification, NotificationType};
use crate::types::{Observation, Priority, SAMPLE_RATE};

/// One downstream destination for observations. Emit errors are isolated
/// per sink by the pipeline.
#[async_trait]
pub trait ObservationSink: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    async fn emit(&self, observation: &Observation) -> anyhow::Result<()>;
}

/// The opaque relational store collaborator with transactional save.
#[async_trait]
pub trait ObservationStore: Send + Sync + 'static {
    async fn save(&self, observation: &Observation) -> anyhow::Result<()>;
}

/// Adapts the store collaborator into the sink fan-out.
pub struct StoreSink {
    store: Arc<dyn ObservationStore>,
}

impl StoreSink {
    pub fn new(store: Arc<dyn ObservationStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ObservationSink for StoreSink {
    fn name(&self) -> &'static str {
        "store"
    }

    async fn emit(&self, observation: &Observation) -> anyhow::Result<()> {
        self.store.save(observation).await
    }
}

/// Publishes each observation as a detection notification.
pub struct NotificationSink;

#[async_trait]
impl ObservationSink for NotificationSink {
    fn name(&self) -> &'static str {
        "notification"
    }

    async fn emit(&self, observation: &Observation) -> anyhow::Result<()> {
        let d = &observation.detection;
        notify::publish(
            Notification::new(
                NotificationType::Detection,
                Priority::Low,
                format!("{} detected", d.species_common),
                format!(
                    "{} ({}) at {:.0}% confidence on {}",
                    d.species_common,
                    d.species_scientific,
                    d.confidence * 100.0,
                    observation.source_id
                ),
            )
            .with_component("observation".to_string())
            .with_metadata("species", MetadataValue::Str(d.species_scientific.clone()))
            .with_metadata("confidence", MetadataValue::Number(d.confidence)),
        );
        Ok(())
    }
}

/// Best-effort JSON push of each observation to the dashboard endpoint.
pub struct DashboardSink {
    client: HttpClient,
    url: String,
    cancel: CancellationToken,
}

impl DashboardSink {
    pub fn new(url: String, cancel: CancellationToken) -> Self {
        Self {
            client: HttpClient::new(),
            url,
            cancel,
        }
    }
}

#[async_trait]
impl ObservationSink for DashboardSink {
    fn name(&self) -> &'static str {
        "dashboard"
    }

    async fn emit(&self, observation: &Observation) -> anyhow::Result<()> {
        self.client
            .post_json(&self.url, observation, &self.cancel)
            .await?;
        Ok(())
    }
}

/// Append-only JSONL stand-in for the external relational store. One line
/// per observation, flushed per save so a crash loses at most the line in
/// flight.
pub struct JsonlStore {
    path: PathBuf,
    file: tokio::sync::Mutex<Option<std::fs::File>>,
}

impl JsonlStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            file: tokio::sync::Mutex::new(None),
        }
    }
}

#[async_trait]
impl ObservationStore for JsonlStore {
    async fn save(&self, observation: &Observation) -> anyhow::Result<()> {
        use std::io::Write;

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            *guard = Some(
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)?,
            );
        }
        let file = guard.as_mut().ok_or_else(|| anyhow::anyhow!("store not open"))?;
        serde_json::to_writer(&mut *file, observation)?;
        file.write_all(b"\n")?;
        file.flush()?;
        Ok(())
    }
}

/// Writes each observation's PCM window as a WAV clip under the export
/// root, named by species and timestamp.
pub struct ClipArchive {
    root: PathBuf,
}

impl ClipArchive {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Write the clip and return its path.
    pub fn write_clip(
        &self,
        observation: &Observation,
        samples: &[i16],
    ) -> std::io::Result<PathBuf> {
        let month_dir = self.root.join(observation.time.format("%Y-%m").to_string());
        std::fs::create_dir_all(&month_dir)?;

        let species = crate::mqtt::discovery::sanitize_id(&observation.detection.species_scientific);
        let name = format!(
            "{}_{}_{}.wav",
            species,
            observation.time.format("%Y%m%dT%H%M%S"),
            observation.id
        );
        let path = month_dir.join(name);
        write_wav(&path, samples, SAMPLE_RATE)?;
        Ok(path)
    }
}

/// Minimal canonical PCM WAV writer: 44-byte RIFF header plus samples.
pub fn write_wav(path: &Path, samples: &[i16], sample_rate: u32) -> std::io::Result<()> {
    use std::io::Write;

    let data_len = (samples.len() * 2) as u32;
    let byte_rate = sample_rate * 2;

    let mut out = std::io::BufWriter::new(std::fs::File::create(path)?);
    out.write_all(b"RIFF")?;
    out.write_all(&(36 + data_len).to_le_bytes())?;
    out.write_all(b"WAVE")?;
    out.write_all(b"fmt ")?;
    out.write_all(&16u32.to_le_bytes())?;
    out.write_all(&1u16.to_le_bytes())?; // PCM
    out.write_all(&1u16.to_le_bytes())?; // mono
    out.write_all(&sample_rate.to_le_bytes())?;
    out.write_all(&byte_rate.to_le_bytes())?;
    out.write_all(&2u16.to_le_bytes())?; // block align
    out.write_all(&16u16.to_le_bytes())?; // bits per sample
    out.write_all(b"data")?;
    out.write_all(&data_len.to_le_bytes())?;
    for sample in samples {
        out.write_all(&sample.to_le_bytes())?;
    }
    out.flush()
}
