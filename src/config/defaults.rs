//! Named defaults shared between the settings layer and the components.

/// Analysis window length fed to the classifier (seconds).
pub const ANALYSIS_WINDOW_SECONDS: f64 = 3.0;

/// Stride between consecutive analysis windows (seconds).
pub const ANALYSIS_STRIDE_SECONDS: f64 = 1.5;

/// Extra ring-buffer headroom beyond one analysis window (seconds).
pub const RING_MARGIN_SECONDS: f64 = 2.0;

/// Global confidence threshold applied when a species has no override.
pub const GLOBAL_CONFIDENCE_THRESHOLD: f64 = 0.7;

/// Window within which a repeated species detection is suppressed (seconds).
pub const DEDUP_WINDOW_SECONDS: u64 = 15;

/// Retained clip length used when duration probing fails (seconds).
pub const CAPTURE_LENGTH_SECONDS: u64 = 15;

/// Resource-monitor sampling interval (seconds). Minimum pragmatic value
/// for tests is 1.
pub const MONITOR_INTERVAL_SECS: u64 = 30;

/// Hysteresis between threshold entry and exit (percentage points).
pub const MONITOR_HYSTERESIS: f64 = 5.0;

/// Re-send interval for persistent disk-critical alerts (minutes).
pub const CRITICAL_RESEND_MINUTES: i64 = 30;

/// Per-job spectrogram generation timeout (seconds).
pub const SPECTROGRAM_TIMEOUT_SECS: u64 = 60;

/// Dedicated budget for the codec-only fallback path (seconds).
pub const FFMPEG_FALLBACK_TIMEOUT_SECS: u64 = 60;

/// Audio-duration cache TTL (seconds).
pub const DURATION_CACHE_TTL_SECS: u64 = 600;

/// Audio-duration cache entry cap.
pub const DURATION_CACHE_MAX_ENTRIES: usize = 1000;

/// Pre-render worker count.
pub const PRERENDER_WORKERS: usize = 2;

/// Pre-render queue capacity (workers + 1 waiting).
pub const PRERENDER_QUEUE_CAPACITY: usize = 3;

/// Bounded wait for pre-render workers at shutdown (seconds).
pub const PRERENDER_SHUTDOWN_SECS: u64 = 10;

/// Default HTTP request timeout (seconds).
pub const HTTP_TIMEOUT_SECS: u64 = 30;

/// Notification throttle interval for identical (component, title) pairs.
pub const NOTIFY_THROTTLE_SECS: u64 = 60;

/// Per-subscriber notification channel capacity.
pub const NOTIFY_SUBSCRIBER_BUFFER: usize = 64;

/// Capture reconnect back-off: initial delay (seconds), doubling per attempt.
pub const CAPTURE_BACKOFF_INITIAL_SECS: u64 = 2;

/// Capture reconnect back-off cap (seconds).
pub const CAPTURE_BACKOFF_MAX_SECS: u64 = 60;

/// Healthy-operation span after which capture back-off resets (seconds).
pub const CAPTURE_HEALTHY_RESET_SECS: u64 = 120;

/// Consecutive capture failures before the extended-failure notification.
pub const CAPTURE_FAILURE_NOTIFY_AFTER: u32 = 5;

/// Weather cache refresh interval (minutes).
pub const WEATHER_INTERVAL_MINUTES: u64 = 30;

/// Secret files larger than this are rejected (bytes).
pub const SECRET_MAX_BYTES: u64 = 64 * 1024;

/// MQTT reconnect back-off cap (seconds).
pub const MQTT_BACKOFF_MAX_SECS: u64 = 120;
