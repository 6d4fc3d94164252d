//! Disk alert lifecycle and path grouping, end to end over the public API.

use std::path::PathBuf;

use avian_os::monitor::{
    dedupe_paths, group_paths_by_mount_point, AlertThresholds, AlertTracker, AlertTransition,
    MountInfo,
};
use chrono::{Duration, TimeZone, Utc};

fn disk_thresholds() -> AlertThresholds {
    AlertThresholds {
        warning: 80.0,
        critical: 90.0,
        hysteresis: 5.0,
        critical_resend: Some(Duration::minutes(30)),
    }
}

#[test]
fn disk_alert_lifecycle_scenario() {
    let t = disk_thresholds();
    let mut tracker = AlertTracker::new();
    let base = Utc
        .with_ymd_and_hms(2026, 8, 1, 0, 0, 0)
        .single()
        .expect("timestamp");
    let at = |m: i64| base + Duration::minutes(m);

    // Samples over time: 70, 85, 92, 91, 91 (+30 min), 84, 74.
    assert!(tracker.observe(70.0, at(0), &t).is_empty());
    assert_eq!(tracker.observe(85.0, at(1), &t), vec![AlertTransition::Warning]);
    assert_eq!(tracker.observe(92.0, at(2), &t), vec![AlertTransition::Critical]);
    assert!(tracker.critical_since.is_some());
    assert!(tracker.observe(91.0, at(3), &t).is_empty());
    assert_eq!(
        tracker.observe(91.0, at(32), &t),
        vec![AlertTransition::CriticalResend]
    );

    let recovery = tracker.observe(84.0, at(35), &t);
    match recovery.as_slice() {
        [AlertTransition::CriticalRecovery { critical_duration }] => {
            assert_eq!(*critical_duration, Duration::minutes(33));
        }
        other => panic!("expected critical recovery, got {other:?}"),
    }
    assert!(tracker.in_warning, "still in warning after critical recovery");

    let recovery = tracker.observe(74.0, at(36), &t);
    match recovery.as_slice() {
        [AlertTransition::WarningRecovery { critical_duration }] => {
            assert_eq!(*critical_duration, Some(Duration::minutes(33)));
        }
        other => panic!("expected warning recovery, got {other:?}"),
    }
}

#[test]
fn hysteresis_prevents_flapping_at_the_boundary() {
    let t = disk_thresholds();
    let mut tracker = AlertTracker::new();
    let base = Utc
        .with_ymd_and_hms(2026, 8, 1, 0, 0, 0)
        .single()
        .expect("timestamp");

    let mut events = 0;
    events += tracker.observe(80.5, base, &t).len();
    for minute in 1..20 {
        // Oscillate within epsilon < hysteresis around the threshold.
        let value = if minute % 2 == 0 { 80.5 } else { 79.5 };
        events += tracker
            .observe(value, base + Duration::minutes(minute), &t)
            .len();
    }
    assert_eq!(events, 1, "only the initial warning fires");
}

#[test]
fn mount_grouping_longest_prefix_and_ordering() {
    let partitions = vec![
        MountInfo {
            mount_point: PathBuf::from("/"),
            device: "/dev/sda1".to_string(),
            fstype: "ext4".to_string(),
        },
        MountInfo {
            mount_point: PathBuf::from("/data"),
            device: "/dev/sdb1".to_string(),
            fstype: "xfs".to_string(),
        },
    ];
    let paths = vec![
        PathBuf::from("/data/clips"),
        PathBuf::from("/var/log"),
        PathBuf::from("/data/db"),
    ];

    let groups = group_paths_by_mount_point(&paths, &partitions);
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].mount_point, PathBuf::from("/"));
    assert_eq!(groups[0].paths, vec![PathBuf::from("/var/log")]);
    assert_eq!(groups[1].mount_point, PathBuf::from("/data"));
    assert_eq!(
        groups[1].paths,
        vec![PathBuf::from("/data/clips"), PathBuf::from("/data/db")]
    );
}

#[test]
fn monitored_path_dedup_suppresses_descendants() {
    let paths = vec![
        PathBuf::from("/data"),
        PathBuf::from("/data/clips/2026"),
        PathBuf::from("/backup"),
        PathBuf::from("/data"),
    ];
    assert_eq!(
        dedupe_paths(paths, true),
        vec![PathBuf::from("/backup"), PathBuf::from("/data")]
    );
}
