//! Credential resolution from files or template-expanded values.
//!
//! Callers hand in a `(file_path, value)` pair. A non-empty file path wins:
//! the file is read with size and permission checks. Otherwise `${VAR}` and
//! `${VAR:-default}` references in `value` are expanded from the
//! environment. An empty pair resolves to an empty string; [`must_resolve`]
//! additionally rejects that.

use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

use super::defaults::SECRET_MAX_BYTES;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("failed to read secret file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("secret file {path} is not a regular file")]
    NotRegular { path: String },

    #[error("secret file {path} is {size} bytes, larger than the {limit} byte cap")]
    TooLarge { path: String, size: u64, limit: u64 },

    #[error("secret file {path} is empty after trimming")]
    EmptyFile { path: String },

    #[error("missing required environment variables: {}", .0.join(", "))]
    MissingVariables(Vec<String>),

    #[error("secret resolved to an empty value")]
    EmptyResult,
}

/// Resolve a secret from `(file_path, value)` with file-first precedence.
pub fn resolve(file_path: &str, value: &str) -> Result<String, SecretError> {
    if !file_path.is_empty() {
        return read_secret_file(Path::new(file_path));
    }
    if !value.is_empty() {
        return expand_template(value);
    }
    Ok(String::new())
}

/// Like [`resolve`], but an empty result is an error.
pub fn must_resolve(file_path: &str, value: &str) -> Result<String, SecretError> {
    let resolved = resolve(file_path, value)?;
    if resolved.is_empty() {
        return Err(SecretError::EmptyResult);
    }
    Ok(resolved)
}

fn read_secret_file(path: &Path) -> Result<String, SecretError> {
    let display = path.display().to_string();

    let metadata = fs::symlink_metadata(path).map_err(|source| SecretError::Io {
        path: display.clone(),
        source,
    })?;

    if !metadata.file_type().is_file() {
        return Err(SecretError::NotRegular { path: display });
    }

    if metadata.len() > SECRET_MAX_BYTES {
        return Err(SecretError::TooLarge {
            path: display,
            size: metadata.len(),
            limit: SECRET_MAX_BYTES,
        });
    }

    warn_on_wide_permissions(path, &metadata);

    let contents = fs::read_to_string(path).map_err(|source| SecretError::Io {
        path: display.clone(),
        source,
    })?;

    let trimmed = contents.trim_end();
    if trimmed.is_empty() {
        return Err(SecretError::EmptyFile { path: display });
    }
    Ok(trimmed.to_string())
}

#[cfg(unix)]
fn warn_on_wide_permissions(path: &Path, metadata: &fs::Metadata) {
    use std::os::unix::fs::PermissionsExt;

    let mode = metadata.permissions().mode() & 0o777;
    if mode & 0o177 != 0 {
        tracing::warn!(
            path = %path.display(),
            mode = format!("{mode:03o}"),
            "secret file permissions are wider than 0600"
        );
    }
}

#[cfg(not(unix))]
fn warn_on_wide_permissions(_path: &Path, _metadata: &fs::Metadata) {}

#[allow(clippy::expect_used)]
fn template_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("template pattern is a compile-time constant")
    })
}

/// Expand `${VAR}` and `${VAR:-default}` references from the environment.
/// All missing required variables are collected into one error.
fn expand_template(value: &str) -> Result<String, SecretError> {
    let mut missing = Vec::new();
    let expanded = template_regex().replace_all(value, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        match std::env::var(name) {
            Ok(v) => v,
            Err(_) => match caps.get(2) {
                Some(default) => default.as_str().to_string(),
                None => {
                    missing.push(name.to_string());
                    String::new()
                }
            },
        }
    });

    if missing.is_empty() {
        Ok(expanded.into_owned())
    } else {
        Err(SecretError::MissingVariables(missing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_takes_precedence_over_value() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "file-secret").expect("write");
        let path = file.path().to_str().expect("utf8 path");

        std::env::set_var("AVIAN_SECRET_PRECEDENCE", "env-token");
        let resolved = resolve(path, "${AVIAN_SECRET_PRECEDENCE}").expect("resolve");
        assert_eq!(resolved, "file-secret");
        std::env::remove_var("AVIAN_SECRET_PRECEDENCE");
    }

    #[test]
    fn value_expands_environment_references() {
        std::env::set_var("AVIAN_SECRET_TOKEN", "env-token");
        assert_eq!(
            resolve("", "${AVIAN_SECRET_TOKEN}").expect("resolve"),
            "env-token"
        );
        std::env::remove_var("AVIAN_SECRET_TOKEN");
    }

    #[test]
    fn missing_variables_are_listed() {
        let err = resolve("", "${AVIAN_SECRET_DEFINITELY_MISSING}").expect_err("must fail");
        match err {
            SecretError::MissingVariables(names) => {
                assert_eq!(names, vec!["AVIAN_SECRET_DEFINITELY_MISSING".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn default_fills_missing_variable() {
        assert_eq!(
            resolve("", "${AVIAN_SECRET_ABSENT:-fallback}").expect("resolve"),
            "fallback"
        );
    }

    #[test]
    fn literal_value_passes_through() {
        assert_eq!(resolve("", "literal").expect("resolve"), "literal");
    }

    #[test]
    fn empty_pair_resolves_empty_and_must_resolve_rejects() {
        assert_eq!(resolve("", "").expect("resolve"), "");
        assert!(matches!(must_resolve("", ""), Err(SecretError::EmptyResult)));
    }

    #[test]
    fn oversized_file_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        let blob = vec![b'x'; (SECRET_MAX_BYTES + 1) as usize];
        file.write_all(&blob).expect("write");
        let err = resolve(file.path().to_str().expect("utf8"), "").expect_err("must fail");
        assert!(matches!(err, SecretError::TooLarge { .. }));
    }

    #[test]
    fn empty_file_is_rejected() {
        let file = tempfile::NamedTempFile::new().expect("tempfile");
        let err = resolve(file.path().to_str().expect("utf8"), "").expect_err("must fail");
        assert!(matches!(err, SecretError::EmptyFile { .. }));
    }

    #[test]
    fn non_regular_file_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = resolve(dir.path().to_str().expect("utf8"), "").expect_err("must fail");
        assert!(matches!(err, SecretError::NotRegular { .. }));
    }

    #[test]
    fn trailing_whitespace_is_trimmed() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(file, "  spaced-secret  \n\n").expect("write");
        let resolved = resolve(file.path().to_str().expect("utf8"), "").expect("resolve");
        assert_eq!(resolved, "  spaced-secret");
    }
}
