//! Filesystem mount grouping for monitored paths.
//!
//! The mount table is sampled once per grouping call; each monitored path is
//! assigned to the mount with the longest prefix match after symlink
//! resolution. Paths with no matching mount are dropped. Groups and the
//! paths within them are sorted so output is deterministic.

use std::path::{Path, PathBuf};

use sysinfo::Disks;

/// One entry from the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    pub mount_point: PathBuf,
    pub device: String,
    pub fstype: String,
}

/// Monitored paths sharing one filesystem mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountGroup {
    pub mount_point: PathBuf,
    pub device: String,
    pub fstype: String,
    pub paths: Vec<PathBuf>,
}

/// Sample the current mount table.
pub fn sample_mounts() -> Vec<MountInfo> {
    let disks = Disks::new_with_refreshed_list();
    disks
        .iter()
        .map(|disk| MountInfo {
            mount_point: disk.mount_point().to_path_buf(),
            device: disk.name().to_string_lossy().into_owned(),
            fstype: disk.file_system().to_string_lossy().into_owned(),
        })
        .collect()
}

/// Group paths by their longest-prefix mount among `partitions`.
pub fn group_paths_by_mount_point(paths: &[PathBuf], partitions: &[MountInfo]) -> Vec<MountGroup> {
    let mut groups: Vec<MountGroup> = Vec::new();

    for path in paths {
        let resolved = resolve_symlinks(path);
        let Some(mount) = longest_prefix_mount(&resolved, partitions) else {
            tracing::debug!(path = %path.display(), "no mount matches path; dropped");
            continue;
        };

        match groups
            .iter_mut()
            .find(|g| g.mount_point == mount.mount_point)
        {
            Some(group) => group.paths.push(path.clone()),
            None => groups.push(MountGroup {
                mount_point: mount.mount_point.clone(),
                device: mount.device.clone(),
                fstype: mount.fstype.clone(),
                paths: vec![path.clone()],
            }),
        }
    }

    for group in &mut groups {
        group.paths.sort();
        group.paths.dedup();
    }
    groups.sort_by(|a, b| a.mount_point.cmp(&b.mount_point));
    groups
}

/// The partition whose mount point is the longest prefix of `path`.
pub fn longest_prefix_mount<'a>(
    path: &Path,
    partitions: &'a [MountInfo],
) -> Option<&'a MountInfo> {
    partitions
        .iter()
        .filter(|m| path.starts_with(&m.mount_point))
        .max_by_key(|m| m.mount_point.as_os_str().len())
}

fn resolve_symlinks(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mounts() -> Vec<MountInfo> {
        vec![
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
            MountInfo {
                mount_point: PathBuf::from("/data/clips"),
                device: "/dev/sdc1".to_string(),
                fstype: "xfs".to_string(),
            },
        ]
    }

    #[test]
    fn longest_prefix_wins() {
        let mounts = mounts();
        let hit = longest_prefix_mount(Path::new("/data/clips/2025"), &mounts)
            .expect("match");
        assert_eq!(hit.mount_point, PathBuf::from("/data/clips"));

        let hit = longest_prefix_mount(Path::new("/data/db"), &mounts).expect("match");
        assert_eq!(hit.mount_point, PathBuf::from("/data"));
    }

    #[test]
    fn groups_are_sorted_and_unmatched_paths_dropped() {
        let mounts = vec![
            MountInfo {
                mount_point: PathBuf::from("/data"),
                device: "/dev/sdb1".to_string(),
                fstype: "xfs".to_string(),
            },
            MountInfo {
                mount_point: PathBuf::from("/archive"),
                device: "/dev/sdd1".to_string(),
                fstype: "ext4".to_string(),
            },
        ];
        let paths = vec![
            PathBuf::from("/data/z"),
            PathBuf::from("/data/a"),
            PathBuf::from("/archive/x"),
            PathBuf::from("/elsewhere/y"),
        ];
        let groups = group_paths_by_mount_point(&paths, &mounts);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].mount_point, PathBuf::from("/archive"));
        assert_eq!(groups[1].mount_point, PathBuf::from("/data"));
        assert_eq!(
            groups[1].paths,
            vec![PathBuf::from("/data/a"), PathBuf::from("/data/z")]
        );
    }

    #[test]
    fn empty_partitions_drop_everything() {
        let groups = group_paths_by_mount_point(&[PathBuf::from("/data")], &[]);
        assert!(groups.is_empty());
    }
}
