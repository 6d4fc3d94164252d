//! Resource monitor
//!
//! A single periodic loop samples CPU, memory, and a set of disk paths, and
//! drives per-`(resource, path)` alert state machines with hysteresis (see
//! [`alerts`]). Threshold crossings become notification-bus events; while a
//! disk stays critical the alert is re-emitted on a fixed interval.
//!
//! Disk paths combine the configured list with an auto-detected critical
//! set (store path, clip-export root, config directory, and standard
//! container volumes when a container runtime is detected). Auto-detected
//! paths are never persisted back to configuration.

pub mod alerts;
pub mod mounts;

pub use alerts::{AlertThresholds, AlertTracker, AlertTransition};
pub use mounts::{group_paths_by_mount_point, sample_mounts, MountGroup, MountInfo};

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use sysinfo::{Disks, System};
use tokio_util::sync::CancellationToken;

use crate::config::{MonitorSettings, ResourceThresholds, Settings};
use crate::notify::{self, MetadataValue, Notification, NotificationType};
use crate::types::Priority;

/// Sampled resource kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Cpu,
    Memory,
    Disk,
}

impl Resource {
    pub fn slug(self) -> &'static str {
        match self {
            Resource::Cpu => "cpu",
            Resource::Memory => "memory",
            Resource::Disk => "disk",
        }
    }
}

/// Severity of one resource event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSeverity {
    Warning,
    Critical,
    Recovery,
}

impl EventSeverity {
    pub fn slug(self) -> &'static str {
        match self {
            EventSeverity::Warning => "warning",
            EventSeverity::Critical => "critical",
            EventSeverity::Recovery => "recovery",
        }
    }
}

/// One threshold crossing or recovery.
#[derive(Debug, Clone)]
pub struct ResourceEvent {
    pub resource: Resource,
    pub path: Option<PathBuf>,
    pub current: f64,
    pub threshold: f64,
    pub severity: EventSeverity,
    pub metadata: BTreeMap<String, MetadataValue>,
}

type StateKey = (Resource, Option<PathBuf>);

/// Periodic CPU/memory/disk monitor.
pub struct ResourceMonitor {
    settings: MonitorSettings,
    store_path: PathBuf,
    clip_root: PathBuf,
    states: Mutex<HashMap<StateKey, AlertTracker>>,
    path_validity: Mutex<HashMap<PathBuf, bool>>,
    system: Mutex<System>,
}

impl ResourceMonitor {
    pub fn new(settings: &Settings) -> Self {
        Self {
            settings: settings.monitor.clone(),
            store_path: settings.store.path.clone(),
            clip_root: settings.export.clip_root.clone(),
            states: Mutex::new(HashMap::new()),
            path_validity: Mutex::new(HashMap::new()),
            system: Mutex::new(System::new()),
        }
    }

    /// Run the sampling loop until cancelled.
    pub async fn run(self: std::sync::Arc<Self>, cancel: CancellationToken) {
        let interval_secs = self.settings.interval_secs.max(1);
        let mut ticker = tokio::time::interval(StdDuration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(interval_secs, "Resource monitor started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Resource monitor stopping");
                    break;
                }
                _ = ticker.tick() => {
                    for event in self.evaluate_tick(Utc::now()) {
                        publish_event(&event);
                    }
                }
            }
        }
    }

    /// Sample every enabled resource and collect the resulting events.
    ///
    /// Sampling happens outside the state lock; the lock covers only the
    /// mutate step per tuple.
    pub fn evaluate_tick(&self, now: DateTime<Utc>) -> Vec<ResourceEvent> {
        let mut samples: Vec<(Resource, Option<PathBuf>, f64, AlertThresholds)> = Vec::new();

        if self.settings.cpu.enabled {
            if let Some(cpu) = self.sample_cpu() {
                samples.push((Resource::Cpu, None, cpu, self.thresholds(&self.settings.cpu, false)));
            }
        }
        if self.settings.memory.enabled {
            if let Some(mem) = self.sample_memory() {
                samples.push((
                    Resource::Memory,
                    None,
                    mem,
                    self.thresholds(&self.settings.memory, false),
                ));
            }
        }
        if self.settings.disk.enabled {
            let disks = Disks::new_with_refreshed_list();
            for path in self.monitored_disk_paths() {
                if !self.path_is_valid(&path) {
                    continue;
                }
                if let Some(usage) = disk_usage_percent(&disks, &path) {
                    samples.push((
                        Resource::Disk,
                        Some(path),
                        usage,
                        self.thresholds(&self.settings.disk, true),
                    ));
                }
            }
        }

        let mut events = Vec::new();
        let mut states = match self.states.lock() {
            Ok(guard) => guard,
            Err(_) => return events,
        };
        for (resource, path, value, thresholds) in samples {
            let tracker = states
                .entry((resource, path.clone()))
                .or_insert_with(AlertTracker::new);
            for transition in tracker.observe(value, now, &thresholds) {
                events.push(transition_to_event(
                    resource,
                    path.clone(),
                    value,
                    &thresholds,
                    &transition,
                ));
            }
        }
        events
    }

    fn thresholds(&self, t: &ResourceThresholds, resend: bool) -> AlertThresholds {
        AlertThresholds {
            warning: t.warning,
            critical: t.critical,
            hysteresis: self.settings.hysteresis,
            critical_resend: resend
                .then(|| Duration::minutes(self.settings.critical_resend_minutes)),
        }
    }

    fn sample_cpu(&self) -> Option<f64> {
        let mut system = self.system.lock().ok()?;
        system.refresh_cpu_usage();
        Some(f64::from(system.global_cpu_usage()))
    }

    /// Used percentage of virtual memory, swap included.
    fn sample_memory(&self) -> Option<f64> {
        let mut system = self.system.lock().ok()?;
        system.refresh_memory();
        let total = system.total_memory() + system.total_swap();
        if total == 0 {
            return None;
        }
        let used = system.used_memory() + system.used_swap();
        Some(used as f64 / total as f64 * 100.0)
    }

    /// Configured plus auto-detected disk paths, deduplicated, with strict
    /// descendants of another monitored path suppressed when configured.
    pub fn monitored_disk_paths(&self) -> Vec<PathBuf> {
        let mut paths = self.settings.disk_paths.clone();
        paths.extend(self.auto_detected_paths());
        dedupe_paths(paths, self.settings.suppress_nested_paths)
    }

    /// Critical paths derived from the current configuration. Never
    /// persisted.
    fn auto_detected_paths(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(parent) = self.store_path.parent() {
            if !parent.as_os_str().is_empty() {
                paths.push(parent.to_path_buf());
            }
        }
        paths.push(self.clip_root.clone());
        paths.push(config_directory());
        if container_runtime_detected() {
            paths.push(PathBuf::from("/data"));
            paths.push(PathBuf::from("/config"));
        }
        paths
    }

    /// Existence check, cached so paths are not re-statted every tick.
    fn path_is_valid(&self, path: &Path) -> bool {
        let mut cache = match self.path_validity.lock() {
            Ok(guard) => guard,
            Err(_) => return false,
        };
        *cache
            .entry(path.to_path_buf())
            .or_insert_with(|| path.exists())
    }
}

/// Directory holding the active config file.
fn config_directory() -> PathBuf {
    std::env::var("AVIAN_CONFIG")
        .ok()
        .and_then(|p| PathBuf::from(p).parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn container_runtime_detected() -> bool {
    Path::new("/.dockerenv").exists() || Path::new("/run/.containerenv").exists()
}

/// Deduplicate and (optionally) suppress strict descendants.
pub fn dedupe_paths(paths: Vec<PathBuf>, suppress_nested: bool) -> Vec<PathBuf> {
    let mut unique: Vec<PathBuf> = Vec::new();
    for path in paths {
        if !unique.contains(&path) {
            unique.push(path);
        }
    }
    if !suppress_nested {
        unique.sort();
        return unique;
    }
    let survivors: Vec<PathBuf> = unique
        .iter()
        .filter(|p| {
            !unique
                .iter()
                .any(|other| *p != other && p.starts_with(other))
        })
        .cloned()
        .collect();
    let mut survivors = survivors;
    survivors.sort();
    survivors
}

/// Usage percentage of the filesystem backing `path`, by longest-prefix
/// mount match.
fn disk_usage_percent(disks: &Disks, path: &Path) -> Option<f64> {
    let resolved = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let disk = disks
        .iter()
        .filter(|d| resolved.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())?;
    let total = disk.total_space();
    if total == 0 {
        return None;
    }
    let used = total.saturating_sub(disk.available_space());
    Some(used as f64 / total as f64 * 100.0)
}

fn transition_to_event(
    resource: Resource,
    path: Option<PathBuf>,
    current: f64,
    thresholds: &AlertThresholds,
    transition: &AlertTransition,
) -> ResourceEvent {
    let mut metadata = BTreeMap::new();
    metadata.insert(
        "resource".to_string(),
        MetadataValue::Str(resource.slug().to_string()),
    );
    if let Some(ref p) = path {
        metadata.insert(
            "path".to_string(),
            MetadataValue::Str(p.display().to_string()),
        );
    }

    let (severity, threshold) = match transition {
        AlertTransition::Warning => (EventSeverity::Warning, thresholds.warning),
        AlertTransition::Critical | AlertTransition::CriticalResend => {
            (EventSeverity::Critical, thresholds.critical)
        }
        AlertTransition::CriticalRecovery { critical_duration } => {
            metadata.insert(
                "critical_duration_secs".to_string(),
                MetadataValue::Number(critical_duration.num_seconds() as f64),
            );
            (EventSeverity::Recovery, thresholds.critical)
        }
        AlertTransition::WarningRecovery { critical_duration } => {
            if let Some(d) = critical_duration {
                metadata.insert(
                    "total_critical_duration_secs".to_string(),
                    MetadataValue::Number(d.num_seconds() as f64),
                );
            }
            (EventSeverity::Recovery, thresholds.warning)
        }
    };

    ResourceEvent {
        resource,
        path,
        current,
        threshold,
        severity,
        metadata,
    }
}

/// Publish one event to the notification bus, falling back to a direct log
/// line when the bus is unavailable.
fn publish_event(event: &ResourceEvent) {
    let location = event
        .path
        .as_ref()
        .map(|p| format!(" ({})", p.display()))
        .unwrap_or_default();
    let title = format!(
        "{} usage {}{}",
        event.resource.slug(),
        event.severity.slug(),
        location
    );
    let message = format!(
        "{} at {:.1}% (threshold {:.1}%)",
        event.resource.slug(),
        event.current,
        event.threshold
    );

    let (kind, priority) = match event.severity {
        EventSeverity::Warning => (NotificationType::Warning, Priority::Medium),
        EventSeverity::Critical => (NotificationType::Error, Priority::Critical),
        EventSeverity::Recovery => (NotificationType::Info, Priority::Low),
    };

    match notify::bus() {
        Some(bus) => {
            let mut notification = Notification::new(kind, priority, title, message)
                .with_component("monitor".to_string());
            notification.metadata.extend(event.metadata.clone());
            bus.publish(notification);
        }
        None => {
            // Direct fallback keeps threshold crossings visible even when
            // the bus is not up yet.
            match event.severity {
                EventSeverity::Critical => tracing::error!("{title}: {message}"),
                EventSeverity::Warning => tracing::warn!("{title}: {message}"),
                EventSeverity::Recovery => tracing::info!("{title}: {message}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedupe_suppresses_strict_descendants() {
        let paths = vec![
            PathBuf::from("/data"),
            PathBuf::from("/data/clips"),
            PathBuf::from("/data"),
            PathBuf::from("/archive"),
        ];
        assert_eq!(
            dedupe_paths(paths.clone(), true),
            vec![PathBuf::from("/archive"), PathBuf::from("/data")]
        );
        assert_eq!(
            dedupe_paths(paths, false),
            vec![
                PathBuf::from("/archive"),
                PathBuf::from("/data"),
                PathBuf::from("/data/clips"),
            ]
        );
    }

    #[test]
    fn transition_events_carry_recovery_metadata() {
        let thresholds = AlertThresholds {
            warning: 80.0,
            critical: 90.0,
            hysteresis: 5.0,
            critical_resend: None,
        };
        let event = transition_to_event(
            Resource::Disk,
            Some(PathBuf::from("/data")),
            84.0,
            &thresholds,
            &AlertTransition::CriticalRecovery {
                critical_duration: Duration::minutes(7),
            },
        );
        assert_eq!(event.severity, EventSeverity::Recovery);
        assert_eq!(
            event.metadata.get("critical_duration_secs"),
            Some(&MetadataValue::Number(420.0))
        );
    }

    #[test]
    fn monitored_paths_include_auto_detected_set() {
        let mut settings = Settings::default();
        settings.monitor.disk_paths = vec![PathBuf::from("/tmp")];
        let monitor = ResourceMonitor::new(&settings);
        let paths = monitor.monitored_disk_paths();
        assert!(paths.contains(&PathBuf::from("/tmp")));
        // The default store/clip paths live under the config directory ".",
        // which subsumes them once nested suppression runs.
        assert!(paths.contains(&PathBuf::from(".")));
    }
}
