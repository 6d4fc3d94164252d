//! Audio-duration probing with a bounded, invalidating cache.
//!
//! This is the authoritative duration cache for the spectrogram pipeline.
//! Entries are keyed by path and invalidated when the file's size or mtime
//! changes or the entry outlives the TTL. The cache is bounded by evicting
//! the oldest-inserted entry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{Duration, Instant, SystemTime};

use tokio::process::Command;

use crate::config::defaults::{DURATION_CACHE_MAX_ENTRIES, DURATION_CACHE_TTL_SECS};

#[derive(Debug, Clone)]
struct CacheEntry {
    duration_seconds: f64,
    inserted_at: Instant,
    file_size: u64,
    mod_time: SystemTime,
}

/// Bounded TTL cache of probed audio durations.
pub struct DurationCache {
    entries: RwLock<HashMap<PathBuf, CacheEntry>>,
    ttl: Duration,
    max_entries: usize,
}

impl Default for DurationCache {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(DURATION_CACHE_TTL_SECS),
            DURATION_CACHE_MAX_ENTRIES,
        )
    }
}

impl DurationCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Cached duration for `path`, if still valid against the file's
    /// current (size, mtime) and the TTL.
    pub fn get(&self, path: &Path) -> Option<f64> {
        let (size, mtime) = stat_key(path)?;
        let entries = self.entries.read().ok()?;
        let entry = entries.get(path)?;
        if entry.file_size != size
            || entry.mod_time != mtime
            || entry.inserted_at.elapsed() > self.ttl
        {
            return None;
        }
        Some(entry.duration_seconds)
    }

    /// Insert a probed duration, evicting the oldest entry at capacity.
    pub fn insert(&self, path: &Path, duration_seconds: f64) {
        let Some((file_size, mod_time)) = stat_key(path) else {
            return;
        };
        let Ok(mut entries) = self.entries.write() else {
            return;
        };

        if entries.len() >= self.max_entries && !entries.contains_key(path) {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(p, _)| p.clone())
            {
                entries.remove(&oldest);
            }
        }

        entries.insert(
            path.to_path_buf(),
            CacheEntry {
                duration_seconds,
                inserted_at: Instant::now(),
                file_size,
                mod_time,
            },
        );
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }
}

fn stat_key(path: &Path) -> Option<(u64, SystemTime)> {
    let metadata = std::fs::metadata(path).ok()?;
    Some((metadata.len(), metadata.modified().ok()?))
}

/// Probe a file's duration with ffprobe.
pub async fn probe_duration(ffprobe_path: &str, path: &Path) -> Option<f64> {
    let output = Command::new(ffprobe_path)
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "csv=p=0",
        ])
        .arg(path)
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        tracing::debug!(
            path = %path.display(),
            status = ?output.status.code(),
            "ffprobe duration probe failed"
        );
        return None;
    }

    String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|d| *d > 0.0)
}

/// Cached duration, probing on miss.
pub async fn cached_duration(
    cache: &DurationCache,
    ffprobe_path: &str,
    path: &Path,
) -> Option<f64> {
    if let Some(duration) = cache.get(path) {
        return Some(duration);
    }
    let duration = probe_duration(ffprobe_path, path).await?;
    cache.insert(path, duration);
    Some(duration)
}
