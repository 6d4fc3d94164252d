//! Telemetry fan-out for enhanced errors.
//!
//! Global slots (sink, event publisher, hooks) are process-wide and
//! lock-free on the read path. A single atomic flag gates all reporting
//! work so the builder fast path costs one load when telemetry is off.
//!
//! The event-publisher indirection breaks the cycle between this module and
//! the notification bus: the bus implements [`ErrorEventPublisher`] and
//! registers itself here; this module never imports the bus.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};

use super::scrubber::scrub;
use super::EnhancedError;

/// Severity at the external sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// A scrubbed, sink-ready view of one error.
#[derive(Debug, Clone)]
pub struct TelemetryEvent {
    pub title: String,
    pub severity: Severity,
    pub message: String,
    pub component: &'static str,
    pub category: &'static str,
    pub context: Vec<(String, String)>,
    pub timestamp: DateTime<Utc>,
}

/// External telemetry destination (Sentry-style).
pub trait TelemetrySink: Send + Sync {
    fn capture(&self, event: &TelemetryEvent);
}

/// Asynchronous error-event publisher, implemented by the notification bus.
///
/// Returns false when the publisher cannot accept the event, in which case
/// dispatch falls back to the synchronous sink path.
pub trait ErrorEventPublisher: Send + Sync {
    fn publish_error(&self, error: &EnhancedError) -> bool;
}

/// Synchronous observer invoked on every reported error.
pub type ErrorHook = Box<dyn Fn(&EnhancedError) + Send + Sync>;

static SINK: ArcSwapOption<Box<dyn TelemetrySink>> = ArcSwapOption::const_empty();
static PUBLISHER: ArcSwapOption<Box<dyn ErrorEventPublisher>> = ArcSwapOption::const_empty();
static HOOKS: RwLock<Vec<Arc<ErrorHook>>> = RwLock::new(Vec::new());
static ACTIVE: AtomicBool = AtomicBool::new(false);

/// Whether any telemetry destination is attached.
pub fn has_active_reporting() -> bool {
    ACTIVE.load(Ordering::Acquire)
}

fn refresh_active() {
    let hooks_attached = HOOKS.read().map(|h| !h.is_empty()).unwrap_or(false);
    let active =
        SINK.load().is_some() || PUBLISHER.load().is_some() || hooks_attached;
    ACTIVE.store(active, Ordering::Release);
}

/// Attach (or detach, with `None`) the external telemetry sink.
pub fn set_telemetry_sink(sink: Option<Box<dyn TelemetrySink>>) {
    SINK.store(sink.map(Arc::new));
    refresh_active();
}

/// Attach (or detach) the asynchronous event publisher.
pub fn set_event_publisher(publisher: Option<Box<dyn ErrorEventPublisher>>) {
    PUBLISHER.store(publisher.map(Arc::new));
    refresh_active();
}

/// Register a synchronous error hook.
pub fn add_error_hook(hook: ErrorHook) {
    if let Ok(mut hooks) = HOOKS.write() {
        hooks.push(Arc::new(hook));
    }
    refresh_active();
}

/// Detach every destination. Used at teardown and between tests.
pub fn clear_telemetry() {
    SINK.store(None);
    PUBLISHER.store(None);
    if let Ok(mut hooks) = HOOKS.write() {
        hooks.clear();
    }
    refresh_active();
}

/// Build the sink-ready event, scrubbing the message and every string
/// context value exactly once.
pub fn to_event(error: &EnhancedError) -> TelemetryEvent {
    let context = error
        .context
        .iter()
        .map(|(k, v)| {
            let rendered = match v {
                super::ContextValue::Str(s) => scrub(s),
                other => other.to_string(),
            };
            (k.clone(), rendered)
        })
        .collect();

    TelemetryEvent {
        title: error.title(),
        severity: error.category.severity(),
        message: scrub(&error.chain_messages().join(": ")),
        component: error.component.slug(),
        category: error.category.slug(),
        context,
        timestamp: error.timestamp,
    }
}

/// Fan an error out to the attached destinations.
///
/// Called once per error from `EnhancedError::report()`. Failures here are
/// swallowed: telemetry must never take the daemon down with it.
pub(super) fn dispatch(error: &EnhancedError) {
    if !has_active_reporting() {
        return;
    }

    // Broker auth failures reflect user misconfiguration, not bugs. They
    // stay local (the caller still logs them) and are marked reported.
    if error.category.is_broker_auth() {
        tracing::debug!(
            category = error.category.slug(),
            "broker authentication failure kept out of telemetry"
        );
        return;
    }

    // Preferred path: hand off to the asynchronous publisher and return.
    if let Some(publisher) = PUBLISHER.load_full() {
        if publisher.publish_error(error) {
            return;
        }
    }

    // Fallback: synchronous dispatch to the sink plus hooks.
    if let Some(sink) = SINK.load_full() {
        let event = to_event(error);
        sink.capture(&event);
    }

    let hooks: Vec<Arc<ErrorHook>> = match HOOKS.read() {
        Ok(guard) => guard.clone(),
        Err(_) => return,
    };
    for hook in hooks {
        // A panicking hook must not poison the reporting path.
        let result = catch_unwind(AssertUnwindSafe(|| hook(error)));
        if result.is_err() {
            tracing::warn!("error hook panicked; continuing");
        }
    }
}

/// Serializes tests that mutate the process-wide telemetry and scrubber
/// slots; without it parallel test threads observe each other's sinks.
#[cfg(test)]
pub(crate) fn test_guard() -> std::sync::MutexGuard<'static, ()> {
    static TEST_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());
    TEST_MUTEX.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{enhance, Category, Component};
    use std::sync::atomic::AtomicUsize;

    struct CountingSink(Arc<AtomicUsize>);

    impl TelemetrySink for CountingSink {
        fn capture(&self, _event: &TelemetryEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct RefusingPublisher;

    impl ErrorEventPublisher for RefusingPublisher {
        fn publish_error(&self, _error: &EnhancedError) -> bool {
            false
        }
    }

    #[test]
    fn sink_receives_scrubbed_event() {
        let _guard = test_guard();
        clear_telemetry();
        let count = Arc::new(AtomicUsize::new(0));
        set_telemetry_sink(Some(Box::new(CountingSink(count.clone()))));

        let err = enhance("publish failed: password=topsecret")
            .component(Component::Mqtt)
            .category(Category::MqttPublish)
            .context("url", "mqtt://broker?token=abc123")
            .build();
        let event = to_event(&err);
        assert!(!event.message.contains("topsecret"));
        let (_, url) = event
            .context
            .iter()
            .find(|(k, _)| k == "url")
            .expect("url context present");
        assert!(!url.contains("abc123"));

        err.report();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        clear_telemetry();
    }

    #[test]
    fn publisher_refusal_falls_back_to_sink() {
        let _guard = test_guard();
        clear_telemetry();
        let count = Arc::new(AtomicUsize::new(0));
        set_telemetry_sink(Some(Box::new(CountingSink(count.clone()))));
        set_event_publisher(Some(Box::new(RefusingPublisher)));

        enhance("transient").build_and_report();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        clear_telemetry();
    }

    #[test]
    fn broker_auth_failures_stay_local() {
        let _guard = test_guard();
        clear_telemetry();
        let count = Arc::new(AtomicUsize::new(0));
        set_telemetry_sink(Some(Box::new(CountingSink(count.clone()))));

        let err = enhance("mqtt broker not authorized")
            .component(Component::Mqtt)
            .category(Category::MqttAuthentication)
            .build();
        err.report();
        assert!(err.is_reported());
        assert_eq!(count.load(Ordering::SeqCst), 0);
        clear_telemetry();
    }

    #[test]
    fn panicking_hook_does_not_block_reporting() {
        let _guard = test_guard();
        clear_telemetry();
        add_error_hook(Box::new(|_| panic!("bad hook")));
        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = count.clone();
            add_error_hook(Box::new(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }
        enhance("hooked").build_and_report();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        clear_telemetry();
    }
}
