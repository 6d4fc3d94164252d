//! Home-Assistant MQTT discovery.
//!
//! Builds the retained discovery payloads: one bridge device announcing
//! daemon connectivity, and per audio source a device entry (linked to the
//! bridge through `via_device`) with one sensor entity per exposed
//! attribute. Removal republishes every topic with an empty retained
//! payload.

use serde::Serialize;

use crate::types::AudioSource;

use super::{MqttError, MqttPublish};

/// Minimum kept length when shortening display names at a separator.
const SHORTEN_MIN_KEEP: usize = 8;

/// Maximum display-name length in characters.
const SHORTEN_MAX: usize = 32;

/// Discovery JSON, snake_case, omitted fields elided from serialization.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct DiscoveryPayload {
    pub name: String,
    pub unique_id: String,
    pub state_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub availability_topic: Option<String>,
    pub device: DeviceInfo,
    pub origin: OriginInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_on: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_off: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_available: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_not_available: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct DeviceInfo {
    pub identifiers: Vec<String>,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub sw_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub via_device: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct OriginInfo {
    pub name: String,
    pub sw_version: String,
    pub support_url: String,
}

/// Identity and topic layout for one discovery pass.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub prefix: String,
    pub node_id: String,
    pub device_name: String,
    pub base_topic: String,
    pub expose_sound_level: bool,
}

impl DiscoveryConfig {
    /// Availability/status topic carried by the bridge.
    pub fn status_topic(&self) -> String {
        format!("{}/status", self.base_topic)
    }

    /// Detection state topic for one source.
    pub fn detection_topic(&self, source_id: &str) -> String {
        format!("{}/detections/{}", self.base_topic, sanitize_id(source_id))
    }

    /// Sound-level state topic for one source.
    pub fn sound_level_topic(&self, source_id: &str) -> String {
        format!("{}/soundlevel/{}", self.base_topic, sanitize_id(source_id))
    }
}

/// Map any string into `[A-Za-z0-9_-]+`: everything else becomes `_`,
/// consecutive `_` collapse, boundary `_`/`-` are trimmed, and an empty
/// result becomes the literal `"unknown"`. Idempotent.
pub fn sanitize_id(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_was_underscore = false;
    for c in input.chars() {
        let mapped = if c.is_ascii_alphanumeric() || c == '-' {
            c
        } else {
            '_'
        };
        if mapped == '_' {
            if last_was_underscore {
                continue;
            }
            last_was_underscore = true;
        } else {
            last_was_underscore = false;
        }
        out.push(mapped);
    }
    let trimmed = out.trim_matches(|c| c == '_' || c == '-');
    if trimmed.is_empty() {
        "unknown".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Shorten an overly long display name at a separator boundary.
///
/// Names of at most 32 characters pass through. Longer names are cut at
/// the first `_`/`-` boundary past the first 8 characters (within the
/// first 32); with no such boundary, a hard character-boundary cut at 32.
/// Never splits inside a multi-byte code point.
pub fn shorten_display_name(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    if chars.len() <= SHORTEN_MAX {
        return name.to_string();
    }
    for (i, c) in chars.iter().enumerate().take(SHORTEN_MAX + 1) {
        if i >= SHORTEN_MIN_KEEP && (*c == '_' || *c == '-') {
            return chars[..i].iter().collect();
        }
    }
    chars[..SHORTEN_MAX].iter().collect()
}

fn sw_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn origin() -> OriginInfo {
    OriginInfo {
        name: "AVIAN-OS".to_string(),
        sw_version: sw_version(),
        support_url: "https://avian-os.example/support".to_string(),
    }
}

/// Discovery topic for the bridge device.
pub fn bridge_topic(cfg: &DiscoveryConfig) -> String {
    format!(
        "{}/binary_sensor/{}/status/config",
        cfg.prefix,
        sanitize_id(&cfg.node_id)
    )
}

/// Bridge payload: connectivity class, diagnostic category, availability
/// payloads on the bridge itself.
pub fn bridge_payload(cfg: &DiscoveryConfig) -> DiscoveryPayload {
    let node = sanitize_id(&cfg.node_id);
    DiscoveryPayload {
        name: format!("{} Status", cfg.device_name),
        unique_id: format!("{node}_status"),
        state_topic: cfg.status_topic(),
        device: DeviceInfo {
            identifiers: vec![node.clone()],
            name: cfg.device_name.clone(),
            manufacturer: "AVIAN-OS".to_string(),
            model: "bird-detection daemon".to_string(),
            sw_version: sw_version(),
            via_device: None,
        },
        origin: origin(),
        device_class: Some("connectivity".to_string()),
        entity_category: Some("diagnostic".to_string()),
        payload_on: Some("online".to_string()),
        payload_off: Some("offline".to_string()),
        ..DiscoveryPayload::default()
    }
}

/// One sensor entity attached to a source device.
struct SensorSpec {
    key: &'static str,
    name: &'static str,
    value_template: String,
    icon: Option<&'static str>,
    state_topic: String,
}

fn source_sensors(cfg: &DiscoveryConfig, source: &AudioSource) -> Vec<SensorSpec> {
    let detections = cfg.detection_topic(&source.id);
    let mut sensors = vec![
        SensorSpec {
            key: "species",
            name: "Species",
            value_template: "{{ value_json.species_common }}".to_string(),
            icon: Some("mdi:bird"),
            state_topic: detections.clone(),
        },
        SensorSpec {
            key: "confidence",
            name: "Confidence",
            value_template: "{{ value_json.confidence }}".to_string(),
            icon: None,
            state_topic: detections.clone(),
        },
        SensorSpec {
            key: "scientific_name",
            name: "Scientific Name",
            value_template: "{{ value_json.species_scientific }}".to_string(),
            icon: None,
            state_topic: detections,
        },
    ];
    if cfg.expose_sound_level {
        sensors.push(SensorSpec {
            key: "sound_level",
            name: "Sound Level",
            // The emitter keys octave bands as e.g. "1.0_kHz", not "1000".
            value_template: format!(
                "{{{{ value_json['{}'] }}}}",
                octave_band_key(1000.0)
            ),
            icon: Some("mdi:waveform"),
            state_topic: cfg.sound_level_topic(&source.id),
        });
    }
    sensors
}

/// Octave-band key in the emitter's format: center frequency in kHz with
/// one decimal, e.g. 1000 Hz -> "1.0_kHz".
pub fn octave_band_key(center_hz: f64) -> String {
    format!("{:.1}_kHz", center_hz / 1000.0)
}

/// Discovery topic for one sensor of one source.
pub fn sensor_topic(cfg: &DiscoveryConfig, source_id: &str, sensor_key: &str) -> String {
    let node = sanitize_id(&cfg.node_id);
    format!(
        "{}/sensor/{}/{}_{}_{}/config",
        cfg.prefix,
        node,
        node,
        sanitize_id(source_id),
        sensor_key
    )
}

fn source_device(cfg: &DiscoveryConfig, source: &AudioSource) -> DeviceInfo {
    let node = sanitize_id(&cfg.node_id);
    DeviceInfo {
        identifiers: vec![format!("{}_{}", node, sanitize_id(&source.id))],
        name: format!(
            "{} {}",
            cfg.device_name,
            shorten_display_name(source.label())
        ),
        manufacturer: "AVIAN-OS".to_string(),
        model: format!("{} source", source.kind),
        sw_version: sw_version(),
        via_device: Some(node),
    }
}

fn sensor_payload(
    cfg: &DiscoveryConfig,
    source: &AudioSource,
    sensor: &SensorSpec,
) -> DiscoveryPayload {
    let node = sanitize_id(&cfg.node_id);
    DiscoveryPayload {
        name: sensor.name.to_string(),
        unique_id: format!("{}_{}_{}", node, sanitize_id(&source.id), sensor.key),
        state_topic: sensor.state_topic.clone(),
        value_template: Some(sensor.value_template.clone()),
        icon: sensor.icon.map(str::to_string),
        // The bridge is the availability carrier; availability fields on
        // dependent entities stay unset.
        availability_topic: None,
        device: source_device(cfg, source),
        origin: origin(),
        ..DiscoveryPayload::default()
    }
}

/// Every discovery topic for one configuration, bridge first.
pub fn discovery_topics(cfg: &DiscoveryConfig, sources: &[AudioSource]) -> Vec<String> {
    let mut topics = vec![bridge_topic(cfg)];
    for source in sources {
        for sensor in source_sensors(cfg, source) {
            topics.push(sensor_topic(cfg, &source.id, sensor.key));
        }
    }
    topics
}

/// Publish the full retained discovery set: the bridge, then per-source
/// sensors. A bridge failure aborts the pass; per-source failures are
/// collected without aborting the remaining sources.
pub async fn publish_discovery(
    publisher: &dyn MqttPublish,
    cfg: &DiscoveryConfig,
    sources: &[AudioSource],
) -> Result<(), MqttError> {
    let bridge = serde_json::to_vec(&bridge_payload(cfg))
        .map_err(|e| MqttError::Payload(e.to_string()))?;
    publisher
        .publish(&bridge_topic(cfg), bridge, true)
        .await?;

    let mut failures = Vec::new();
    for source in sources {
        for sensor in source_sensors(cfg, source) {
            let topic = sensor_topic(cfg, &source.id, sensor.key);
            let payload = match serde_json::to_vec(&sensor_payload(cfg, source, &sensor)) {
                Ok(p) => p,
                Err(e) => {
                    failures.push(format!("{topic}: {e}"));
                    continue;
                }
            };
            if let Err(e) = publisher.publish(&topic, payload, true).await {
                failures.push(format!("{topic}: {e}"));
            }
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(MqttError::PartialDiscovery(failures))
    }
}

/// Remove every discovery entity by republishing empty retained payloads.
pub async fn remove_discovery(
    publisher: &dyn MqttPublish,
    cfg: &DiscoveryConfig,
    sources: &[AudioSource],
) -> Result<(), MqttError> {
    let mut failures = Vec::new();
    for topic in discovery_topics(cfg, sources) {
        if let Err(e) = publisher.publish(&topic, Vec::new(), true).await {
            failures.push(format!("{topic}: {e}"));
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(MqttError::PartialDiscovery(failures))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SourceKind;
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn cfg() -> DiscoveryConfig {
        DiscoveryConfig {
            prefix: "homeassistant".to_string(),
            node_id: "avian".to_string(),
            device_name: "AVIAN-OS".to_string(),
            base_topic: "avian".to_string(),
            expose_sound_level: false,
        }
    }

    #[test]
    fn sanitize_matches_contract_examples() {
        assert_eq!(sanitize_id("hw:0,0 USB Audio"), "hw_0_0_USB_Audio");
        assert_eq!(sanitize_id("@@@test"), "test");
        assert_eq!(sanitize_id("   "), "unknown");
        assert_eq!(sanitize_id(""), "unknown");
    }

    #[test]
    fn sanitize_is_idempotent() {
        for input in [
            "hw:0,0 USB Audio",
            "@@@test",
            "   ",
            "rtsp://user@host/stream",
            "äöü",
            "a__b---c",
        ] {
            let once = sanitize_id(input);
            assert_eq!(sanitize_id(&once), once, "not idempotent for {input:?}");
        }
    }

    #[test]
    fn sanitize_output_shape() {
        for input in ["hw:0,0", "---x---", "__", "ab", "a", "!?"] {
            let out = sanitize_id(input);
            if out != "unknown" {
                assert!(out.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
                let first = out.chars().next().expect("non-empty");
                let last = out.chars().last().expect("non-empty");
                assert!(first.is_ascii_alphanumeric(), "{out}");
                assert!(last.is_ascii_alphanumeric(), "{out}");
            }
        }
    }

    #[test]
    fn shorten_cuts_long_names_at_separator() {
        let long = "rtsp_a1b2c3d4-e5f6-7890-abcd-ef1234567890_stream_high_quality";
        assert_eq!(shorten_display_name(long), "rtsp_a1b2c3d4");
        assert!(shorten_display_name(long).chars().count() <= 32);

        assert_eq!(shorten_display_name("Garden Mic"), "Garden Mic");
    }

    #[test]
    fn shorten_never_splits_multibyte_codepoints() {
        let long: String = "ü".repeat(40);
        let short = shorten_display_name(&long);
        assert_eq!(short.chars().count(), 32);
        assert!(long.starts_with(&short));
    }

    #[test]
    fn octave_band_keys_are_khz_formatted() {
        assert_eq!(octave_band_key(1000.0), "1.0_kHz");
        assert_eq!(octave_band_key(500.0), "0.5_kHz");
        assert_eq!(octave_band_key(8000.0), "8.0_kHz");
    }

    #[test]
    fn bridge_payload_has_connectivity_shape() {
        let payload = bridge_payload(&cfg());
        assert_eq!(payload.device_class.as_deref(), Some("connectivity"));
        assert_eq!(payload.entity_category.as_deref(), Some("diagnostic"));
        assert_eq!(payload.payload_on.as_deref(), Some("online"));
        assert!(payload.device.via_device.is_none());

        let json = serde_json::to_string(&payload).expect("serialize");
        // Omitted fields must not serialize as nulls.
        assert!(!json.contains("null"));
        assert!(!json.contains("availability_topic"));
    }

    #[test]
    fn sensor_payloads_link_to_bridge_and_omit_availability() {
        let source = AudioSource::new("source1", SourceKind::RtspStream)
            .with_display_name("Source 1");
        let sensors = source_sensors(&cfg(), &source);
        assert_eq!(sensors.len(), 3);

        let payload = sensor_payload(&cfg(), &source, &sensors[0]);
        assert_eq!(payload.device.via_device.as_deref(), Some("avian"));
        assert_eq!(payload.device.name, "AVIAN-OS Source 1");
        assert!(payload.availability_topic.is_none());
        assert_eq!(payload.unique_id, "avian_source1_species");
    }

    #[test]
    fn sound_level_template_uses_octave_band_key() {
        let mut config = cfg();
        config.expose_sound_level = true;
        let source = AudioSource::new("source1", SourceKind::LocalDevice);
        let sensors = source_sensors(&config, &source);
        let sound = sensors.last().expect("sound level sensor");
        assert_eq!(sound.value_template, "{{ value_json['1.0_kHz'] }}");
    }

    struct RecordingPublisher {
        published: Mutex<Vec<(String, usize, bool)>>,
        fail_on: Option<String>,
    }

    #[async_trait]
    impl MqttPublish for RecordingPublisher {
        async fn publish(
            &self,
            topic: &str,
            payload: Vec<u8>,
            retained: bool,
        ) -> Result<(), MqttError> {
            if self.fail_on.as_deref() == Some(topic) {
                return Err(MqttError::Payload("forced failure".to_string()));
            }
            self.published
                .lock()
                .expect("lock")
                .push((topic.to_string(), payload.len(), retained));
            Ok(())
        }
    }

    fn sources() -> Vec<AudioSource> {
        vec![
            AudioSource::new("source1", SourceKind::RtspStream).with_display_name("Source 1"),
            AudioSource::new("source2", SourceKind::RtspStream).with_display_name("Source 2"),
        ]
    }

    #[tokio::test]
    async fn removal_publishes_empty_retained_payloads() {
        let publisher = RecordingPublisher {
            published: Mutex::new(Vec::new()),
            fail_on: None,
        };
        remove_discovery(&publisher, &cfg(), &sources())
            .await
            .expect("removal");

        let published = publisher.published.lock().expect("lock");
        // Bridge + 3 sensors per source.
        assert_eq!(published.len(), 7);
        assert!(published
            .iter()
            .any(|(t, _, _)| t == "homeassistant/binary_sensor/avian/status/config"));
        assert!(published
            .iter()
            .any(|(t, _, _)| t == "homeassistant/sensor/avian/avian_source1_species/config"));
        for (_, len, retained) in published.iter() {
            assert_eq!(*len, 0);
            assert!(*retained);
        }
    }

    #[tokio::test]
    async fn bridge_failure_aborts_discovery_pass() {
        let publisher = RecordingPublisher {
            published: Mutex::new(Vec::new()),
            fail_on: Some("homeassistant/binary_sensor/avian/status/config".to_string()),
        };
        let err = publish_discovery(&publisher, &cfg(), &sources())
            .await
            .expect_err("bridge failure aborts");
        assert!(matches!(err, MqttError::Payload(_)));
        assert!(publisher.published.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn source_failures_are_collected_not_aborting() {
        let publisher = RecordingPublisher {
            published: Mutex::new(Vec::new()),
            fail_on: Some("homeassistant/sensor/avian/avian_source1_species/config".to_string()),
        };
        let err = publish_discovery(&publisher, &cfg(), &sources())
            .await
            .expect_err("partial failure reported");
        match err {
            MqttError::PartialDiscovery(failures) => assert_eq!(failures.len(), 1),
            other => panic!("unexpected error {other}"),
        }
        // Bridge + remaining 5 sensors still published.
        assert_eq!(publisher.published.lock().expect("lock").len(), 6);
    }
}
