//! Support-dump packager.
//!
//! Collects scrubbed diagnostics into a zip archive: a manifest with the
//! dump identity, the sanitized configuration, log excerpts, and optional
//! system information. Archive naming is deterministic for a given
//! `(system_id, timestamp)` pair, and the file is written mode 0600.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use zip::write::FileOptions;

use crate::config::Settings;
use crate::errors::scrub;

/// Trailing bytes taken from each log file.
const LOG_EXCERPT_BYTES: u64 = 64 * 1024;

#[derive(Debug, Error)]
pub enum SupportError {
    #[error("support archive io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("support archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("support manifest error: {0}")]
    Manifest(#[from] serde_json::Error),
}

/// Archive file name for a dump identity.
pub fn archive_name(system_id: &str, timestamp: DateTime<Utc>) -> String {
    format!(
        "birdnet-go-support-{}-{}.zip",
        system_id,
        timestamp.format("%Y%m%dT%H%M%SZ")
    )
}

#[derive(Debug, Serialize)]
struct Manifest {
    dump_id: String,
    host: String,
    version: String,
    created_at: String,
    log_files: Vec<String>,
}

/// Inputs for one collection run.
pub struct DumpRequest {
    pub system_id: String,
    pub timestamp: DateTime<Utc>,
    pub output_dir: PathBuf,
    pub log_paths: Vec<PathBuf>,
}

/// Collect diagnostics into a scrubbed archive; returns its path.
pub fn collect(request: &DumpRequest, settings: &Settings) -> Result<PathBuf, SupportError> {
    let archive_path = request
        .output_dir
        .join(archive_name(&request.system_id, request.timestamp));

    let file = std::fs::File::create(&archive_path)?;
    let mut zip = zip::ZipWriter::new(file);
    let options = FileOptions::default().unix_permissions(0o600);

    let manifest = Manifest {
        dump_id: format!(
            "{}-{}",
            request.system_id,
            request.timestamp.format("%Y%m%dT%H%M%SZ")
        ),
        host: hostname(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        created_at: request.timestamp.to_rfc3339(),
        log_files: request
            .log_paths
            .iter()
            .map(|p| p.display().to_string())
            .collect(),
    };
    zip.start_file("manifest.json", options)?;
    zip.write_all(&serde_json::to_vec_pretty(&manifest)?)?;

    zip.start_file("config.toml", options)?;
    zip.write_all(sanitized_config(settings).as_bytes())?;

    for log_path in &request.log_paths {
        match log_excerpt(log_path) {
            Ok(Some(excerpt)) => {
                let name = log_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "log".to_string());
                zip.start_file(format!("logs/{name}"), options)?;
                zip.write_all(excerpt.as_bytes())?;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(path = %log_path.display(), error = %e, "log excerpt skipped");
            }
        }
    }

    zip.start_file("system.txt", options)?;
    zip.write_all(system_info().as_bytes())?;

    zip.finish()?;
    restrict_permissions(&archive_path)?;
    Ok(archive_path)
}

/// Serialized settings with credential values redacted, then scrubbed.
fn sanitized_config(settings: &Settings) -> String {
    let mut sanitized = settings.clone();
    if !sanitized.mqtt.password.is_empty() {
        sanitized.mqtt.password = "[REDACTED]".to_string();
    }
    if !sanitized.mqtt.username.is_empty() {
        sanitized.mqtt.username = "[REDACTED]".to_string();
    }
    let text = toml::to_string_pretty(&sanitized)
        .unwrap_or_else(|e| format!("# serialization failed: {e}"));
    scrub(&text)
}

/// Trailing slice of one log file, scrubbed line by line.
fn log_excerpt(path: &Path) -> std::io::Result<Option<String>> {
    use std::io::{Read, Seek, SeekFrom};

    if !path.is_file() {
        return Ok(None);
    }
    let mut file = std::fs::File::open(path)?;
    let len = file.metadata()?.len();
    let start = len.saturating_sub(LOG_EXCERPT_BYTES);
    file.seek(SeekFrom::Start(start))?;
    let mut raw = String::new();
    file.read_to_string(&mut raw)?;
    Ok(Some(scrub(&raw)))
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

fn system_info() -> String {
    format!(
        "os: {}\narch: {}\nversion: {}\n",
        std::env::consts::OS,
        std::env::consts::ARCH,
        env!("CARGO_PKG_VERSION")
    )
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
