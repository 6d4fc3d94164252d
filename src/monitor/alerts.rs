//! Per-resource alert state machine with hysteresis.
//!
//! The tracker is pure: it takes samples with explicit timestamps and
//! returns the transitions they cause, so the full alert lifecycle is
//! testable without a clock or a sampler.

use chrono::{DateTime, Duration, Utc};

/// Thresholds and pacing for one tracked resource.
#[derive(Debug, Clone)]
pub struct AlertThresholds {
    pub warning: f64,
    pub critical: f64,
    /// Gap between threshold entry and exit (percentage points).
    pub hysteresis: f64,
    /// Re-send interval while a critical condition persists. `None`
    /// disables re-sending (only disk uses it).
    pub critical_resend: Option<Duration>,
}

/// A transition produced by one sample.
#[derive(Debug, Clone, PartialEq)]
pub enum AlertTransition {
    Warning,
    Critical,
    /// Still critical after the re-send interval elapsed.
    CriticalResend,
    /// Left the critical band; carries the elapsed critical duration.
    CriticalRecovery { critical_duration: Duration },
    /// Fully recovered below the warning band. Carries the total time spent
    /// critical during this episode, when any.
    WarningRecovery { critical_duration: Option<Duration> },
}

/// Mutable state for one `(resource, path)` tuple.
///
/// Mutated only under the monitor's single-writer discipline.
#[derive(Debug)]
pub struct AlertTracker {
    pub in_warning: bool,
    pub in_critical: bool,
    pub last_sample: f64,
    pub last_check_at: Option<DateTime<Utc>>,
    pub last_notification_at: Option<DateTime<Utc>>,
    pub critical_since: Option<DateTime<Utc>>,
    /// Accumulated critical time in the current warning episode.
    total_critical: Duration,
}

impl Default for AlertTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertTracker {
    pub fn new() -> Self {
        Self {
            in_warning: false,
            in_critical: false,
            last_sample: 0.0,
            last_check_at: None,
            last_notification_at: None,
            critical_since: None,
            total_critical: Duration::zero(),
        }
    }

    /// Feed one sample and collect the transitions it causes.
    pub fn observe(
        &mut self,
        value: f64,
        now: DateTime<Utc>,
        thresholds: &AlertThresholds,
    ) -> Vec<AlertTransition> {
        let mut transitions = Vec::new();
        self.last_sample = value;
        self.last_check_at = Some(now);

        if self.in_critical {
            if value < thresholds.critical - thresholds.hysteresis {
                let critical_duration = self
                    .critical_since
                    .map_or_else(Duration::zero, |since| now - since);
                self.total_critical = self.total_critical + critical_duration;
                self.in_critical = false;
                self.critical_since = None;
                transitions.push(AlertTransition::CriticalRecovery { critical_duration });
            } else if let Some(resend) = thresholds.critical_resend {
                let due = self
                    .last_notification_at
                    .map_or(true, |last| now - last >= resend);
                if due {
                    self.last_notification_at = Some(now);
                    transitions.push(AlertTransition::CriticalResend);
                }
            }
        } else if value >= thresholds.critical {
            self.in_critical = true;
            self.in_warning = true;
            self.critical_since = Some(now);
            self.last_notification_at = Some(now);
            transitions.push(AlertTransition::Critical);
        }

        if !self.in_critical {
            if !self.in_warning && value >= thresholds.warning {
                self.in_warning = true;
                self.last_notification_at = Some(now);
                transitions.push(AlertTransition::Warning);
            } else if self.in_warning && value < thresholds.warning - thresholds.hysteresis {
                self.in_warning = false;
                let critical_duration = (self.total_critical > Duration::zero())
                    .then_some(self.total_critical);
                self.total_critical = Duration::zero();
                transitions.push(AlertTransition::WarningRecovery { critical_duration });
            }
        }

        transitions
    }
}
