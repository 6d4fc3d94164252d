//! Daemon configuration
//!
//! Settings are loaded once from a TOML file and installed into a
//! process-wide slot; every component reads through [`get()`].
//!
//! ## Loading order
//!
//! 1. `AVIAN_CONFIG` environment variable (path to TOML file)
//! 2. `avian.toml` in the current working directory
//! 3. Built-in defaults
//!
//! ## Usage
//!
//! ```ignore
//! // In main():
//! config::init(Settings::load());
//!
//! // Anywhere in the codebase:
//! let stride = config::get().analysis.stride_seconds;
//! ```

pub mod defaults;
pub mod secrets;
mod settings;
pub mod validation;

pub use settings::*;
pub use validation::validate;

use std::sync::OnceLock;

/// Global settings, initialized once at startup.
static SETTINGS: OnceLock<Settings> = OnceLock::new();

/// Initialize the global settings.
///
/// Must be called exactly once before any call to `get()`. A second call
/// is ignored with a warning.
pub fn init(settings: Settings) {
    if SETTINGS.set(settings).is_err() {
        tracing::warn!("config::init() called more than once; ignoring");
    }
}

/// Get a reference to the global settings.
///
/// Panics if `init()` has not been called; a missing config is a fatal
/// startup error, not a recoverable condition.
#[allow(clippy::expect_used)]
pub fn get() -> &'static Settings {
    SETTINGS
        .get()
        .expect("config::get() called before config::init()")
}

/// Whether the global settings slot has been filled.
///
/// Useful for tests and optional config paths.
pub fn is_initialized() -> bool {
    SETTINGS.get().is_some()
}
