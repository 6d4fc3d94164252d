//! Notification bus
//!
//! Process-wide fan-out of typed notifications. Publishing never blocks:
//! each subscriber gets its own bounded channel and slow subscribers lose
//! messages rather than backpressuring producers. Identical
//! `(component, title)` pairs are throttled to one per interval with a
//! suppressed-repeat counter.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::errors::{EnhancedError, ErrorEventPublisher, Severity};
use crate::types::Priority;

/// Notification class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationType {
    Info,
    Warning,
    Error,
    Detection,
    System,
}

impl std::str::FromStr for NotificationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "info" => Ok(NotificationType::Info),
            "warning" => Ok(NotificationType::Warning),
            "error" => Ok(NotificationType::Error),
            "detection" => Ok(NotificationType::Detection),
            "system" => Ok(NotificationType::System),
            other => Err(format!("unknown notification type: {other}")),
        }
    }
}

/// A metadata scalar. User-supplied strings are coerced numeric-first,
/// then boolean, otherwise kept as strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Number(f64),
    Bool(bool),
    Str(String),
}

impl MetadataValue {
    /// Coercion order is part of the public contract: number, bool, string.
    pub fn coerce(raw: &str) -> Self {
        if let Ok(n) = raw.parse::<f64>() {
            return MetadataValue::Number(n);
        }
        match raw.to_ascii_lowercase().as_str() {
            "true" => MetadataValue::Bool(true),
            "false" => MetadataValue::Bool(false),
            _ => MetadataValue::Str(raw.to_string()),
        }
    }
}

impl std::fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetadataValue::Number(n) => write!(f, "{n}"),
            MetadataValue::Bool(b) => write!(f, "{b}"),
            MetadataValue::Str(s) => f.write_str(s),
        }
    }
}

/// A typed notification delivered to every subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub kind: NotificationType,
    pub priority: Priority,
    pub title: String,
    pub message: String,
    pub component: String,
    pub metadata: BTreeMap<String, MetadataValue>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
}

impl Notification {
    pub fn new(
        kind: NotificationType,
        priority: Priority,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            priority,
            title: title.into(),
            message: message.into(),
            component: String::new(),
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
            expiry: None,
        }
    }

    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = component.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: MetadataValue) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_expiry(mut self, expiry: DateTime<Utc>) -> Self {
        self.expiry = Some(expiry);
        self
    }
}

struct Subscriber {
    name: String,
    tx: mpsc::Sender<Notification>,
    dropped: Arc<AtomicU64>,
}

struct ThrottleEntry {
    last_emitted: Instant,
    suppressed: u64,
}

/// Fan-out bus with per-subscriber bounded channels.
pub struct NotificationBus {
    subscribers: Mutex<Vec<Subscriber>>,
    throttle: Mutex<HashMap<(String, String), ThrottleEntry>>,
    throttle_interval: Duration,
    buffer: usize,
}

impl NotificationBus {
    pub fn new(throttle_interval: Duration, buffer: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            throttle: Mutex::new(HashMap::new()),
            throttle_interval,
            buffer: buffer.max(1),
        }
    }

    /// Register a subscriber; returns its receiving end.
    pub fn subscribe(&self, name: impl Into<String>) -> mpsc::Receiver<Notification> {
        let (tx, rx) = mpsc::channel(self.buffer);
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(Subscriber {
                name: name.into(),
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            });
        }
        rx
    }

    /// Publish to all subscribers. Returns false when the notification was
    /// collapsed by throttling.
    pub fn publish(&self, mut notification: Notification) -> bool {
        if !self.pass_throttle(&mut notification) {
            return false;
        }

        let mut subs = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(_) => return false,
        };
        // Compact subscribers whose receiver is gone.
        subs.retain(|s| !s.tx.is_closed());

        for sub in subs.iter() {
            match sub.tx.try_send(notification.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let dropped = sub.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::warn!(
                        subscriber = %sub.name,
                        dropped_total = dropped,
                        "subscriber channel full; notification dropped"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        true
    }

    /// Throttle identical (component, title) pairs. When a suppressed run
    /// ends, the outgoing notification carries the suppressed count.
    fn pass_throttle(&self, notification: &mut Notification) -> bool {
        if self.throttle_interval.is_zero() {
            return true;
        }
        let key = (
            notification.component.clone(),
            notification.title.clone(),
        );
        let mut throttle = match self.throttle.lock() {
            Ok(guard) => guard,
            Err(_) => return true,
        };
        let now = Instant::now();
        if let Some(entry) = throttle.get_mut(&key) {
            if now.duration_since(entry.last_emitted) < self.throttle_interval {
                entry.suppressed += 1;
                tracing::debug!(
                    component = %key.0,
                    title = %key.1,
                    suppressed = entry.suppressed,
                    "notification throttled"
                );
                return false;
            }
            if entry.suppressed > 0 {
                notification.metadata.insert(
                    "suppressed_repeats".to_string(),
                    MetadataValue::Number(entry.suppressed as f64),
                );
            }
            entry.last_emitted = now;
            entry.suppressed = 0;
            return true;
        }
        throttle.insert(
            key,
            ThrottleEntry {
                last_emitted: now,
                suppressed: 0,
            },
        );
        true
    }

    /// Dropped-notification counts per subscriber (for final statistics).
    pub fn dropped_counts(&self) -> Vec<(String, u64)> {
        self.subscribers
            .lock()
            .map(|subs| {
                subs.iter()
                    .map(|s| (s.name.clone(), s.dropped.load(Ordering::Relaxed)))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Process-wide bus slot.
static BUS: OnceLock<Arc<NotificationBus>> = OnceLock::new();

/// Install the process-wide bus. A second call is ignored.
pub fn init(bus: Arc<NotificationBus>) {
    if BUS.set(bus).is_err() {
        tracing::warn!("notify::init() called more than once; ignoring");
    }
}

/// The process-wide bus, if installed.
pub fn bus() -> Option<Arc<NotificationBus>> {
    BUS.get().cloned()
}

/// Publish through the process-wide bus; silently a no-op before init.
pub fn publish(notification: Notification) {
    if let Some(bus) = bus() {
        bus.publish(notification);
    }
}

/// Adapter that lets the error envelope publish through the bus without
/// the envelope importing this module.
pub struct BusErrorPublisher {
    bus: Arc<NotificationBus>,
}

impl BusErrorPublisher {
    pub fn new(bus: Arc<NotificationBus>) -> Self {
        Self { bus }
    }
}

impl ErrorEventPublisher for BusErrorPublisher {
    fn publish_error(&self, error: &EnhancedError) -> bool {
        let kind = match error.category.severity() {
            Severity::Info => NotificationType::Info,
            Severity::Warning => NotificationType::Warning,
            Severity::Error => NotificationType::Error,
        };
        let priority = error.priority.unwrap_or(match error.category.severity() {
            Severity::Info => Priority::Low,
            Severity::Warning => Priority::Medium,
            Severity::Error => Priority::High,
        });
        let notification = Notification::new(
            kind,
            priority,
            error.title(),
            crate::errors::scrub(&error.chain_messages().join(": ")),
        )
        .with_component(error.component.slug().to_string())
        .with_metadata(
            "category".to_string(),
            MetadataValue::Str(error.category.slug().to_string()),
        );
        self.bus.publish(notification)
    }
}
