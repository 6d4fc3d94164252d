//! Secret resolution precedence and file handling, end to end.

use std::io::Write;

use avian_os::config::secrets::{must_resolve, resolve, SecretError};

#[test]
fn file_wins_over_template_value() {
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    write!(file, "file-secret\n").expect("write");
    let path = file.path().to_str().expect("utf8 path");

    std::env::set_var("AVIAN_IT_TOKEN", "env-token");

    assert_eq!(
        resolve(path, "${AVIAN_IT_TOKEN}").expect("file branch"),
        "file-secret"
    );
    assert_eq!(
        resolve("", "${AVIAN_IT_TOKEN}").expect("env branch"),
        "env-token"
    );
    assert_eq!(resolve("", "literal").expect("literal"), "literal");

    std::env::remove_var("AVIAN_IT_TOKEN");
}

#[test]
fn missing_variable_error_names_it() {
    let err = resolve("", "${AVIAN_IT_NOT_SET}").expect_err("missing var");
    let message = err.to_string();
    assert!(message.contains("AVIAN_IT_NOT_SET"), "got: {message}");

    match err {
        SecretError::MissingVariables(names) => {
            assert_eq!(names, vec!["AVIAN_IT_NOT_SET".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn multiple_missing_variables_all_listed() {
    let err = resolve("", "${AVIAN_IT_A}:${AVIAN_IT_B}").expect_err("missing vars");
    match err {
        SecretError::MissingVariables(names) => {
            assert_eq!(
                names,
                vec!["AVIAN_IT_A".to_string(), "AVIAN_IT_B".to_string()]
            );
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn mixed_literal_and_reference_expands_in_place() {
    std::env::set_var("AVIAN_IT_HOST", "broker.local");
    assert_eq!(
        resolve("", "mqtt://${AVIAN_IT_HOST}:1883").expect("expand"),
        "mqtt://broker.local:1883"
    );
    std::env::remove_var("AVIAN_IT_HOST");
}

#[test]
fn must_resolve_rejects_empty() {
    assert!(matches!(
        must_resolve("", ""),
        Err(SecretError::EmptyResult)
    ));
    assert_eq!(must_resolve("", "x").expect("non-empty"), "x");
}

#[cfg(unix)]
#[test]
fn wide_permissions_warn_but_succeed() {
    use std::os::unix::fs::PermissionsExt;

    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    write!(file, "secret").expect("write");
    std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o644))
        .expect("chmod");

    // Wider-than-0600 permissions are a warning, not a failure.
    let resolved =
        resolve(file.path().to_str().expect("utf8"), "").expect("still resolves");
    assert_eq!(resolved, "secret");
}
