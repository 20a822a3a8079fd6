//! Typed domain error enums.
//!
//! This module has zero imports from `crate::infra`, `crate::commands`,
//! `crate::application`, `tokio`, `std::fs`, `std::process`, or `std::net`.
//! All error types implement `thiserror::Error` and convert to `anyhow::Error`
//! via the `?` operator.

use std::time::Duration;

use thiserror::Error;

// ── Config errors ─────────────────────────────────────────────────────────────

/// Invalid or missing configuration. Surfaces as exit code 2.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("Invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },

    #[error("Set exactly one of BUILD_SOURCE_DIR or BUILD_REPO_URL")]
    AmbiguousSource,

    #[error("Failed to read configuration from the environment: {0}")]
    Unreadable(String),

    #[error(
        "KEEP_SERVER_ON_FAILURE is set; refusing to delete the preserved server. \
         Unset it to clean up."
    )]
    PreservationRequested,
}

// ── Provider errors ───────────────────────────────────────────────────────────

/// Failures reported by the cloud resource provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("{op} rejected by provider (HTTP {status}, {code}): {message}")]
    Api {
        op: &'static str,
        status: u16,
        code: String,
        message: String,
    },

    #[error("{op} request failed: {message}")]
    Transport { op: &'static str, message: String },

    #[error("{op} returned an unusable response: {message}")]
    Malformed { op: &'static str, message: String },
}

impl ProviderError {
    /// True when the provider reports that the resource does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True for failures worth retrying (network trouble, not API rejections).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            Self::NotFound { .. } | Self::Malformed { .. } => false,
        }
    }
}

// ── Transport errors ──────────────────────────────────────────────────────────

/// Failures of the remote shell channel itself, as opposed to a remote
/// command that ran and exited non-zero.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("cannot reach {addr}: {detail}")]
    Dial { addr: String, detail: String },

    #[error("ssh handshake with {addr} failed: {detail}")]
    Handshake { addr: String, detail: String },

    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{op} failed: {source}")]
    Io {
        op: String,
        #[source]
        source: std::io::Error,
    },

    #[error("remote {op} failed (exit code {}): {stderr}", exit_code_label(.code))]
    Remote {
        op: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("host key for {host} rejected: {reason}")]
    HostKey { host: String, reason: String },

    #[error("operation cancelled")]
    Cancelled,
}

// ── Readiness errors ──────────────────────────────────────────────────────────

/// Outcome of a bounded wait that did not succeed.
#[derive(Debug, Error)]
pub enum ReadinessError {
    #[error("timed out after {}s waiting for {what} (last: {last})", .waited.as_secs())]
    Timeout {
        what: String,
        waited: Duration,
        last: String,
    },

    #[error("gave up waiting for {what}: {reason}")]
    Aborted { what: String, reason: String },

    #[error("cancelled while waiting for {what}")]
    Cancelled { what: String },
}

// ── Build errors ──────────────────────────────────────────────────────────────

/// Failures on the remote build host.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("failed to stage source: {0}")]
    Staging(String),

    #[error("build failed: remote build exited with code {}", exit_code_label(.code))]
    Failed { code: Option<i32> },

    #[error("build failed: timed out after {} minutes", .0.as_secs() / 60)]
    TimedOut(Duration),

    #[error("build cancelled")]
    Cancelled,

    #[error("no artifacts matched {dir}/{pattern}")]
    NoArtifacts { dir: String, pattern: String },

    #[error("failed to list artifacts: {0}")]
    ListArtifacts(String),

    #[error("failed to download artifact {remote}: {source}")]
    Download {
        remote: String,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

// ── Cleanup errors ────────────────────────────────────────────────────────────

/// Teardown failures. Instance deletion failures are reported to the caller;
/// credential and state-file failures are logged and tolerated.
#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("failed to delete server {id}: {source}")]
    DeleteInstance {
        id: u64,
        #[source]
        source: ProviderError,
    },

    #[error("failed to delete ssh key {id}: {source}")]
    DeleteCredential {
        id: u64,
        #[source]
        source: ProviderError,
    },
}

fn exit_code_label(code: &Option<i32>) -> String {
    code.map_or_else(|| "none, killed by signal".to_string(), |c| c.to_string())
}
