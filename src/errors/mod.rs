//! Enhanced error envelope
//!
//! Every fallible path in the daemon wraps its failures in an
//! [`EnhancedError`]: the underlying error plus a component tag, a routing
//! category, optional priority, and a scrubbed context map. Reporting fans
//! out asynchronously through the telemetry layer (see [`telemetry`]) and
//! never propagates its own failures.
//!
//! The builder has a fast path: when no telemetry sink or hook is attached,
//! component/category auto-detection is skipped entirely and the envelope is
//! tagged `Component::Unknown` / `Category::Generic`.

pub mod scrubber;
pub mod telemetry;

pub use scrubber::{scrub, set_privacy_scrubber, Scrubber};
pub use telemetry::{
    add_error_hook, clear_telemetry, has_active_reporting, set_event_publisher,
    set_telemetry_sink, ErrorEventPublisher, Severity, TelemetryEvent, TelemetrySink,
};

use std::collections::BTreeMap;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};

use crate::types::Priority;

/// Daemon component an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    AudioCapture,
    Analysis,
    Spectrogram,
    Prerender,
    Mqtt,
    Monitor,
    Notification,
    Observation,
    Weather,
    HttpClient,
    Config,
    Support,
    Sun,
    Daemon,
    Unknown,
}

impl Component {
    /// Kebab-case slug used in logs and telemetry grouping.
    pub fn slug(self) -> &'static str {
        match self {
            Component::AudioCapture => "audio-capture",
            Component::Analysis => "analysis",
            Component::Spectrogram => "spectrogram",
            Component::Prerender => "prerender",
            Component::Mqtt => "mqtt",
            Component::Monitor => "monitor",
            Component::Notification => "notification",
            Component::Observation => "observation",
            Component::Weather => "weather",
            Component::HttpClient => "http-client",
            Component::Config => "config",
            Component::Support => "support",
            Component::Sun => "sun",
            Component::Daemon => "daemon",
            Component::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.slug())
    }
}

/// Source-path fragments mapped to components.
///
/// Auto-detection is a convenience; production code paths should tag their
/// component explicitly. The registry is matched against the caller's file
/// path captured through `#[track_caller]`.
const COMPONENT_REGISTRY: &[(&str, Component)] = &[
    ("src/audio", Component::AudioCapture),
    ("src/analysis", Component::Analysis),
    ("src/spectrogram/prerender", Component::Prerender),
    ("src/spectrogram", Component::Spectrogram),
    ("src/mqtt", Component::Mqtt),
    ("src/monitor", Component::Monitor),
    ("src/notify", Component::Notification),
    ("src/observation", Component::Observation),
    ("src/weather", Component::Weather),
    ("src/httpclient", Component::HttpClient),
    ("src/config", Component::Config),
    ("src/support", Component::Support),
    ("src/sun", Component::Sun),
    ("src/daemon", Component::Daemon),
    ("src/main", Component::Daemon),
];

fn detect_component(caller_file: &str) -> Component {
    // Normalize Windows separators once; the registry uses forward slashes.
    let file = caller_file.replace('\\', "/");
    COMPONENT_REGISTRY
        .iter()
        .find(|(fragment, _)| file.contains(fragment))
        .map_or(Component::Unknown, |(_, c)| *c)
}

/// Routing category for grouping and propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    ModelInit,
    ModelLoad,
    LabelLoad,
    Validation,
    FileIo,
    Network,
    AudioProcessing,
    AudioSource,
    RtspConnection,
    Database,
    HttpRequest,
    Configuration,
    SystemResource,
    DiskUsage,
    DiskCleanup,
    FileParsing,
    PolicyConfig,
    MqttConnection,
    MqttPublish,
    MqttAuthentication,
    ImageFetch,
    ImageCache,
    ImageProvider,
    Generic,
    NotFound,
    Conflict,
    Processing,
    State,
    Limit,
    Resource,
    AudioAnalysis,
    AudioBuffer,
    WorkerPool,
    JobQueue,
    ThresholdMgmt,
    EventTracking,
    SpeciesTracking,
    SoundLevel,
    CommandExecution,
    Timeout,
    Cancellation,
    Retry,
    Broadcast,
    Integration,
}

impl Category {
    pub fn slug(self) -> &'static str {
        match self {
            Category::ModelInit => "model-init",
            Category::ModelLoad => "model-load",
            Category::LabelLoad => "label-load",
            Category::Validation => "validation",
            Category::FileIo => "file-io",
            Category::Network => "network",
            Category::AudioProcessing => "audio-processing",
            Category::AudioSource => "audio-source",
            Category::RtspConnection => "rtsp-connection",
            Category::Database => "database",
            Category::HttpRequest => "http-request",
            Category::Configuration => "configuration",
            Category::SystemResource => "system-resource",
            Category::DiskUsage => "disk-usage",
            Category::DiskCleanup => "disk-cleanup",
            Category::FileParsing => "file-parsing",
            Category::PolicyConfig => "policy-config",
            Category::MqttConnection => "mqtt-connection",
            Category::MqttPublish => "mqtt-publish",
            Category::MqttAuthentication => "mqtt-authentication",
            Category::ImageFetch => "image-fetch",
            Category::ImageCache => "image-cache",
            Category::ImageProvider => "image-provider",
            Category::Generic => "generic",
            Category::NotFound => "not-found",
            Category::Conflict => "conflict",
            Category::Processing => "processing",
            Category::State => "state",
            Category::Limit => "limit",
            Category::Resource => "resource",
            Category::AudioAnalysis => "audio-analysis",
            Category::AudioBuffer => "audio-buffer",
            Category::WorkerPool => "worker-pool",
            Category::JobQueue => "job-queue",
            Category::ThresholdMgmt => "threshold-mgmt",
            Category::EventTracking => "event-tracking",
            Category::SpeciesTracking => "species-tracking",
            Category::SoundLevel => "sound-level",
            Category::CommandExecution => "command-execution",
            Category::Timeout => "timeout",
            Category::Cancellation => "cancellation",
            Category::Retry => "retry",
            Category::Broadcast => "broadcast",
            Category::Integration => "integration",
        }
    }

    /// Human-readable words for telemetry titles.
    pub fn human(self) -> String {
        self.slug().replace('-', " ")
    }

    /// Severity at the external sink, keyed off category.
    pub fn severity(self) -> Severity {
        match self {
            Category::Network
            | Category::RtspConnection
            | Category::FileIo
            | Category::AudioProcessing
            | Category::AudioSource
            | Category::AudioAnalysis
            | Category::AudioBuffer
            | Category::HttpRequest => Severity::Warning,
            Category::NotFound => Severity::Info,
            _ => Severity::Error,
        }
    }

    /// True for message-broker authentication/authorization failures, which
    /// reflect user misconfiguration and are kept out of external telemetry.
    pub fn is_broker_auth(self) -> bool {
        self == Category::MqttAuthentication
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.slug())
    }
}

/// Heuristic category detection over the underlying message and the
/// already-assigned component. Explicit `category()` always wins.
fn detect_category(message: &str, component: Component) -> Category {
    let msg = message.to_ascii_lowercase();

    if msg.contains("mqtt") && (msg.contains("auth") || msg.contains("not authorized")) {
        return Category::MqttAuthentication;
    }
    if msg.contains("mqtt") {
        return Category::MqttConnection;
    }
    if msg.contains("rtsp") {
        return Category::RtspConnection;
    }
    if msg.contains("timed out") || msg.contains("timeout") {
        return Category::Timeout;
    }
    if msg.contains("not found") || msg.contains("no such file") {
        return Category::NotFound;
    }
    if msg.contains("permission denied") || msg.contains("read-only file system") {
        return Category::FileIo;
    }
    if msg.contains("connection") || msg.contains("dns") || msg.contains("network") {
        return Category::Network;
    }
    if msg.contains("disk") || msg.contains("no space left") {
        return Category::DiskUsage;
    }
    if msg.contains("config") {
        return Category::Configuration;
    }

    match component {
        Component::AudioCapture => Category::AudioSource,
        Component::Analysis => Category::AudioAnalysis,
        Component::Spectrogram | Component::Prerender => Category::AudioProcessing,
        Component::Mqtt => Category::MqttConnection,
        Component::Monitor => Category::SystemResource,
        Component::HttpClient | Component::Weather => Category::HttpRequest,
        Component::Config => Category::Configuration,
        Component::Observation => Category::Database,
        _ => Category::Generic,
    }
}

/// A scalar context value attached to an error.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl std::fmt::Display for ContextValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContextValue::Str(s) => f.write_str(s),
            ContextValue::Int(i) => write!(f, "{i}"),
            ContextValue::Float(v) => write!(f, "{v}"),
            ContextValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<&str> for ContextValue {
    fn from(s: &str) -> Self {
        ContextValue::Str(s.to_string())
    }
}

impl From<String> for ContextValue {
    fn from(s: String) -> Self {
        ContextValue::Str(s)
    }
}

impl From<i64> for ContextValue {
    fn from(v: i64) -> Self {
        ContextValue::Int(v)
    }
}

impl From<f64> for ContextValue {
    fn from(v: f64) -> Self {
        ContextValue::Float(v)
    }
}

impl From<bool> for ContextValue {
    fn from(v: bool) -> Self {
        ContextValue::Bool(v)
    }
}

/// Tagged error value carrying component, category, and context.
#[derive(Debug)]
pub struct EnhancedError {
    source: Box<dyn std::error::Error + Send + Sync>,
    pub component: Component,
    pub category: Category,
    pub priority: Option<Priority>,
    pub context: BTreeMap<String, ContextValue>,
    pub timestamp: DateTime<Utc>,
    reported: AtomicBool,
}

impl EnhancedError {
    /// Messages of the wrapped error chain, outermost first.
    pub fn chain_messages(&self) -> Vec<String> {
        let mut messages = vec![self.source.to_string()];
        let mut current: Option<&(dyn std::error::Error + 'static)> = self.source.source();
        while let Some(err) = current {
            messages.push(err.to_string());
            current = err.source();
        }
        messages
    }

    /// The `operation` context value, when a handler set one.
    pub fn operation(&self) -> Option<&str> {
        match self.context.get("operation") {
            Some(ContextValue::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Telemetry title used for grouping at the external sink.
    pub fn title(&self) -> String {
        let mut title = format!(
            "{} {}",
            title_case(self.component.slug()),
            self.category.human()
        );
        if let Some(op) = self.operation() {
            title.push(' ');
            title.push_str(&title_case(op));
        }
        title
    }

    /// Whether this error has been handed to the reporting path.
    pub fn is_reported(&self) -> bool {
        self.reported.load(Ordering::Acquire)
    }

    /// Report through the telemetry layer. Idempotent; failures in the
    /// telemetry path are swallowed and never propagate.
    pub fn report(&self) {
        if self.reported.swap(true, Ordering::AcqRel) {
            return;
        }
        telemetry::dispatch(self);
    }
}

impl std::fmt::Display for EnhancedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}/{}] {}", self.component, self.category, self.source)
    }
}

impl std::error::Error for EnhancedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// Equality follows the wrapped error chain, not the envelope metadata.
impl PartialEq for EnhancedError {
    fn eq(&self, other: &Self) -> bool {
        self.chain_messages() == other.chain_messages()
    }
}

/// Start building an envelope around an underlying error.
///
/// The caller's source location is captured here for component
/// auto-detection; call sites should still tag explicitly.
#[track_caller]
pub fn enhance<E>(err: E) -> ErrorBuilder
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    ErrorBuilder {
        source: err.into(),
        component: None,
        category: None,
        priority: None,
        context: BTreeMap::new(),
        caller_file: Location::caller().file(),
    }
}

/// Fluent builder for [`EnhancedError`].
pub struct ErrorBuilder {
    source: Box<dyn std::error::Error + Send + Sync>,
    component: Option<Component>,
    category: Option<Category>,
    priority: Option<Priority>,
    context: BTreeMap<String, ContextValue>,
    caller_file: &'static str,
}

impl ErrorBuilder {
    pub fn component(mut self, component: Component) -> Self {
        self.component = Some(component);
        self
    }

    pub fn category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn context(mut self, key: impl Into<String>, value: impl Into<ContextValue>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Typed helper: classifier model identity.
    pub fn model_context(self, model: &str) -> Self {
        self.context("model", model)
    }

    /// Typed helper: file path and optional size.
    pub fn file_context(self, path: &std::path::Path, size: Option<u64>) -> Self {
        let builder = self.context("file", path.display().to_string());
        match size {
            Some(s) => builder.context("file_size", s as i64),
            None => builder,
        }
    }

    /// Typed helper: remote host and the operation against it.
    pub fn network_context(self, host: &str, operation: &str) -> Self {
        self.context("host", host).context("operation", operation)
    }

    /// Typed helper: operation name plus elapsed time.
    pub fn timing(self, operation: &str, elapsed: std::time::Duration) -> Self {
        self.context("operation", operation)
            .context("elapsed_ms", elapsed.as_millis() as i64)
    }

    /// Finalize the envelope.
    ///
    /// Fast path: with no active reporting, detection is skipped and the
    /// envelope is tagged unknown/generic unless explicitly set.
    pub fn build(self) -> EnhancedError {
        let (component, category) = if telemetry::has_active_reporting() {
            let component = self
                .component
                .unwrap_or_else(|| detect_component(self.caller_file));
            let category = self
                .category
                .unwrap_or_else(|| detect_category(&self.source.to_string(), component));
            (component, category)
        } else {
            (
                self.component.unwrap_or(Component::Unknown),
                self.category.unwrap_or(Category::Generic),
            )
        };

        EnhancedError {
            source: self.source,
            component,
            category,
            priority: self.priority,
            context: self.context,
            timestamp: Utc::now(),
            reported: AtomicBool::new(false),
        }
    }

    /// Build and immediately hand to the reporting path.
    pub fn build_and_report(self) -> EnhancedError {
        let err = self.build();
        err.report();
        err
    }
}

/// Title-case a slug or operation name ("audio-capture" -> "Audio Capture").
fn title_case(s: &str) -> String {
    s.split(['-', '_', ' '])
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn fast_path_skips_detection() {
        let _guard = telemetry::test_guard();
        telemetry::clear_telemetry();
        let err = enhance(io::Error::new(io::ErrorKind::Other, "mqtt broke")).build();
        assert_eq!(err.component, Component::Unknown);
        assert_eq!(err.category, Category::Generic);
    }

    #[test]
    fn explicit_tags_survive_fast_path() {
        let _guard = telemetry::test_guard();
        telemetry::clear_telemetry();
        let err = enhance("boom")
            .component(Component::Mqtt)
            .category(Category::MqttPublish)
            .build();
        assert_eq!(err.component, Component::Mqtt);
        assert_eq!(err.category, Category::MqttPublish);
    }

    #[test]
    fn category_heuristic_prefers_message_keywords() {
        assert_eq!(
            detect_category("MQTT broker not authorized", Component::Unknown),
            Category::MqttAuthentication
        );
        assert_eq!(
            detect_category("operation timed out", Component::Mqtt),
            Category::Timeout
        );
        assert_eq!(
            detect_category("something odd", Component::AudioCapture),
            Category::AudioSource
        );
    }

    #[test]
    fn component_registry_matches_path_fragments() {
        assert_eq!(
            detect_component("src/spectrogram/prerender.rs"),
            Component::Prerender
        );
        assert_eq!(detect_component("src/spectrogram/mod.rs"), Component::Spectrogram);
        assert_eq!(detect_component("src/elsewhere.rs"), Component::Unknown);
    }

    #[test]
    fn equality_uses_wrapped_chain() {
        let a = enhance("same underlying").component(Component::Mqtt).build();
        let b = enhance("same underlying").component(Component::Monitor).build();
        assert_eq!(a, b);

        let c = enhance("different").build();
        assert_ne!(a, c);
    }

    #[test]
    fn title_includes_operation_context() {
        let err = enhance("refused")
            .component(Component::Mqtt)
            .category(Category::MqttConnection)
            .context("operation", "publish-discovery")
            .build();
        assert_eq!(err.title(), "Mqtt mqtt connection Publish Discovery");
    }

    #[test]
    fn severity_mapping_follows_category() {
        assert_eq!(Category::ModelInit.severity(), Severity::Error);
        assert_eq!(Category::Network.severity(), Severity::Warning);
        assert_eq!(Category::RtspConnection.severity(), Severity::Warning);
        assert_eq!(Category::NotFound.severity(), Severity::Info);
        assert_eq!(Category::Database.severity(), Severity::Error);
    }

    #[test]
    fn report_is_idempotent() {
        let _guard = telemetry::test_guard();
        telemetry::clear_telemetry();
        let err = enhance("once").build();
        err.report();
        assert!(err.is_reported());
        // Second call is a no-op rather than a double dispatch.
        err.report();
    }
}
