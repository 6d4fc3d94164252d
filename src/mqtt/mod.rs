//! MQTT publisher
//!
//! One broker connection for the daemon with reconnect under bounded
//! exponential back-off. Each connection bring-up republishes availability
//! and signals the supervisor so retained discovery can be re-issued.
//! Authentication refusals are classified separately: they reflect broker
//! configuration, stay out of external telemetry, and are surfaced locally.

pub mod discovery;

pub use discovery::{
    publish_discovery, remove_discovery, sanitize_id, shorten_display_name, DiscoveryConfig,
    DiscoveryPayload,
};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, LastWill, MqttOptions, Packet, QoS,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::audio::Backoff;
use crate::config::defaults::MQTT_BACKOFF_MAX_SECS;
use crate::config::{secrets, MqttSettings};
use crate::errors::{enhance, Category, Component};
use crate::observation::ObservationSink;
use crate::types::Observation;

#[derive(Debug, Error)]
pub enum MqttError {
    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("mqtt credential resolution failed: {0}")]
    Credentials(#[from] secrets::SecretError),

    #[error("mqtt payload error: {0}")]
    Payload(String),

    #[error("discovery partially failed: {}", .0.join("; "))]
    PartialDiscovery(Vec<String>),
}

/// Publish seam consumed by the discovery layer.
#[async_trait]
pub trait MqttPublish: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retained: bool)
        -> Result<(), MqttError>;
}

/// Broker connection handle.
pub struct MqttPublisher {
    client: AsyncClient,
    status_topic: String,
}

impl MqttPublisher {
    /// Build the connection and spawn its event-loop driver. The returned
    /// receiver fires once per successful (re)connection so the caller can
    /// republish retained discovery.
    pub fn connect(
        settings: &MqttSettings,
        status_topic: String,
        cancel: &CancellationToken,
    ) -> Result<(Arc<Self>, mpsc::Receiver<()>), MqttError> {
        let username = secrets::resolve(&settings.username_file, &settings.username)?;
        let password = secrets::resolve(&settings.password_file, &settings.password)?;

        let mut options =
            MqttOptions::new(settings.client_id.clone(), settings.host.clone(), settings.port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_last_will(LastWill::new(
            status_topic.clone(),
            "offline",
            QoS::AtLeastOnce,
            true,
        ));
        if !username.is_empty() {
            options.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(options, 16);
        let (connected_tx, connected_rx) = mpsc::channel(4);

        let publisher = Arc::new(Self {
            client: client.clone(),
            status_topic,
        });

        tokio::spawn(drive_event_loop(
            client,
            eventloop,
            publisher.status_topic.clone(),
            connected_tx,
            cancel.clone(),
        ));

        Ok((publisher, connected_rx))
    }

    /// Publish with explicit retention.
    pub async fn publish_with_retain(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retained: bool,
    ) -> Result<(), MqttError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, retained, payload)
            .await?;
        Ok(())
    }

    /// Publish without retention.
    pub async fn publish_plain(&self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError> {
        self.publish_with_retain(topic, payload, false).await
    }

    /// Mark the bridge offline and close the connection.
    pub async fn disconnect(&self) {
        let _ = self
            .client
            .publish(self.status_topic.as_str(), QoS::AtLeastOnce, true, "offline")
            .await;
        let _ = self.client.disconnect().await;
    }
}

#[async_trait]
impl MqttPublish for MqttPublisher {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retained: bool,
    ) -> Result<(), MqttError> {
        self.publish_with_retain(topic, payload, retained).await
    }
}

/// Drive the rumqttc event loop: reconnect with back-off, publish
/// availability on bring-up, classify failures.
async fn drive_event_loop(
    client: AsyncClient,
    mut eventloop: rumqttc::EventLoop,
    status_topic: String,
    connected_tx: mpsc::Sender<()>,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::new(
        Duration::from_secs(1),
        Duration::from_secs(MQTT_BACKOFF_MAX_SECS),
    );

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = client.disconnect().await;
                break;
            }
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack)))
                if ack.code == ConnectReturnCode::Success =>
            {
                backoff.reset();
                tracing::info!("mqtt connected");
                let _ = client
                    .publish(status_topic.as_str(), QoS::AtLeastOnce, true, "online")
                    .await;
                // Best-effort: a full channel means a republish is already
                // pending.
                let _ = connected_tx.try_send(());
            }
            Ok(_) => {}
            Err(e) => {
                report_connection_error(&e);
                let delay = backoff.next_delay_jittered();
                tracing::warn!(
                    error = %e,
                    retry_secs = delay.as_secs(),
                    "mqtt connection lost; reconnecting"
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    tracing::info!("mqtt event loop exited");
}

fn report_connection_error(error: &ConnectionError) {
    let category = match error {
        ConnectionError::ConnectionRefused(
            ConnectReturnCode::NotAuthorized | ConnectReturnCode::BadUserNamePassword,
        ) => Category::MqttAuthentication,
        _ => Category::MqttConnection,
    };
    enhance(format!("mqtt connection error: {error}"))
        .component(Component::Mqtt)
        .category(category)
        .context("operation", "connect")
        .build_and_report();
}

/// Publishes each observation to its source's detection state topic.
pub struct MqttObservationSink {
    publisher: Arc<MqttPublisher>,
    cfg: DiscoveryConfig,
}

impl MqttObservationSink {
    pub fn new(publisher: Arc<MqttPublisher>, cfg: DiscoveryConfig) -> Self {
        Self { publisher, cfg }
    }
}

#[async_trait]
impl ObservationSink for MqttObservationSink {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    async fn emit(&self, observation: &Observation) -> anyhow::Result<()> {
        let topic = self.cfg.detection_topic(&observation.source_id);
        let payload = serde_json::to_vec(&DetectionState::from(observation))
            .map_err(|e| MqttError::Payload(e.to_string()))?;
        self.publisher.publish_plain(&topic, payload).await?;
        Ok(())
    }
}

/// The state-topic document consumed by the discovery value templates.
#[derive(Debug, serde::Serialize)]
struct DetectionState<'a> {
    species_common: &'a str,
    species_scientific: &'a str,
    confidence: f64,
    source_id: &'a str,
    time: String,
    solar_phase: String,
}

impl<'a> From<&'a Observation> for DetectionState<'a> {
    fn from(o: &'a Observation) -> Self {
        Self {
            species_common: &o.detection.species_common,
            species_scientific: &o.detection.species_scientific,
            confidence: o.detection.confidence,
            source_id: &o.source_id,
            time: o.time.to_rfc3339(),
            solar_phase: o.solar_phase.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Detection, SolarPhase};
    use chrono::Local;

    #[test]
    fn detection_state_exposes_template_keys() {
        let observation = Observation {
            id: 1,
            source_id: "garden".to_string(),
            time: Local::now(),
            solar_phase: SolarPhase::CivilTwilight,
            weather: None,
            detection: Detection {
                species_scientific: "Erithacus rubecula".to_string(),
                species_common: "European Robin".to_string(),
                confidence: 0.87,
            },
            clip_path: None,
        };
        let json = serde_json::to_value(DetectionState::from(&observation)).expect("serialize");
        assert_eq!(json["species_common"], "European Robin");
        assert_eq!(json["species_scientific"], "Erithacus rubecula");
        assert_eq!(json["confidence"], 0.87);
        assert_eq!(json["solar_phase"], "civil-twilight");
    }
}
