//! Startup sanity checks over the loaded settings.
//!
//! Violations are warnings, not fatal errors: the daemon starts with the
//! values as given, and the operator sees exactly which knob is suspect.

use super::Settings;

/// A single validation finding.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
}

/// Validate threshold ordering and value ranges. Returns all findings.
pub fn validate(settings: &Settings) -> Vec<ValidationWarning> {
    let mut warnings = Vec::new();
    let mut warn = |field: &str, message: String| {
        warnings.push(ValidationWarning {
            field: field.to_string(),
            message,
        });
    };

    for (name, t) in [
        ("monitor.cpu", &settings.monitor.cpu),
        ("monitor.memory", &settings.monitor.memory),
        ("monitor.disk", &settings.monitor.disk),
    ] {
        if t.warning >= t.critical {
            warn(
                name,
                format!(
                    "warning threshold {} is not below critical threshold {}",
                    t.warning, t.critical
                ),
            );
        }
        if !(0.0..=100.0).contains(&t.warning) || !(0.0..=100.0).contains(&t.critical) {
            warn(name, "thresholds must be percentages in [0, 100]".to_string());
        }
    }

    if settings.monitor.hysteresis < 0.0 {
        warn(
            "monitor.hysteresis",
            format!("hysteresis {} must be non-negative", settings.monitor.hysteresis),
        );
    }

    if !(0.0..=1.0).contains(&settings.analysis.confidence_threshold) {
        warn(
            "analysis.confidence_threshold",
            format!(
                "confidence {} outside [0, 1]",
                settings.analysis.confidence_threshold
            ),
        );
    }
    for (species, threshold) in &settings.analysis.species_thresholds {
        if !(0.0..=1.0).contains(threshold) {
            warn(
                "analysis.species_thresholds",
                format!("threshold {threshold} for {species} outside [0, 1]"),
            );
        }
    }

    if settings.analysis.stride_seconds <= 0.0
        || settings.analysis.window_seconds <= 0.0
        || settings.analysis.stride_seconds > settings.analysis.window_seconds
    {
        warn(
            "analysis",
            format!(
                "window {}s / stride {}s must be positive with stride <= window",
                settings.analysis.window_seconds, settings.analysis.stride_seconds
            ),
        );
    }

    if !(-90.0..=90.0).contains(&settings.station.latitude)
        || !(-180.0..=180.0).contains(&settings.station.longitude)
    {
        warn("station", "latitude/longitude out of range".to_string());
    }

    warnings
}

/// Log every finding at warn level.
pub fn log_warnings(warnings: &[ValidationWarning]) {
    for w in warnings {
        tracing::warn!(field = %w.field, "{}", w.message);
    }
}
