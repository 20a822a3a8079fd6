//! Environment-backed configuration loading.
//!
//! The process environment is read exactly once per command; validation
//! itself lives in `domain::config` so it can be tested with explicit pairs.

use crate::domain::{BuildConfig, CleanupConfig, ConfigError};

/// UTF-8 environment pairs. Non-UTF-8 entries cannot be configuration and
/// are skipped instead of aborting the process.
fn environment() -> impl Iterator<Item = (String, String)> {
    std::env::vars_os().filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
}

/// Loads and validates the build configuration.
///
/// # Errors
///
/// Returns [`ConfigError`] when a required variable is missing or invalid.
pub fn load_build_config() -> Result<BuildConfig, ConfigError> {
    let config = BuildConfig::from_vars(environment())?;
    tracing::debug!(?config, "configuration loaded");
    Ok(config)
}

/// Loads the reduced configuration of `burnbox cleanup`.
///
/// # Errors
///
/// Returns [`ConfigError`] when a variable is malformed.
pub fn load_cleanup_config() -> Result<CleanupConfig, ConfigError> {
    CleanupConfig::from_vars(environment())
}
