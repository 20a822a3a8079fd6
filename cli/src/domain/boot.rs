//! Boot stability classification.
//!
//! A freshly created cloud server may briefly run an installer (rescue)
//! system before rebooting into its final OS. The [`StabilityTracker`] only
//! declares a host stable once it has answered as the same non-installer
//! system for a full observation window.

use std::fmt;
use std::time::Duration;

/// Hostname used by the provider's rescue system.
const RESCUE_HOSTNAME: &str = "rescue";

/// True when `hostname` identifies an installer or rescue environment.
#[must_use]
pub fn is_installer_hostname(hostname: &str) -> bool {
    let h = hostname.trim().to_ascii_lowercase();
    h == RESCUE_HOSTNAME || h.starts_with("rescue-")
}

/// True when `df -T /` output shows the root filesystem living in memory.
///
/// Only the row mounted on `/` is considered; its second column is the
/// filesystem type.
#[must_use]
pub fn is_memory_root_filesystem(df_output: &str) -> bool {
    df_output.lines().skip(1).any(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        fields.len() >= 2
            && fields.last() == Some(&"/")
            && matches!(fields[1], "tmpfs" | "ramfs" | "rootfs")
    })
}

/// One probe of the remote host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootObservation {
    /// The host did not answer over the shell channel.
    Unreachable { reason: String },
    /// The host answered.
    Reachable {
        hostname: String,
        installer_signals: bool,
    },
}

impl BootObservation {
    /// Builds an observation from the output of `hostname` and `df -T /`.
    #[must_use]
    pub fn from_probe(hostname: &str, df_output: &str) -> Self {
        let hostname = hostname.trim().to_string();
        let installer_signals =
            is_installer_hostname(&hostname) || is_memory_root_filesystem(df_output);
        Self::Reachable {
            hostname,
            installer_signals,
        }
    }
}

/// Where the host is in its boot sequence, as far as we can tell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootPhase {
    Unreachable,
    InstallerPhase,
    /// Answering as `identity` since `since` (offset from the start of the wait).
    Stabilizing { identity: String, since: Duration },
    Stable { identity: String },
    Failed,
}

impl fmt::Display for BootPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unreachable => f.write_str("unreachable"),
            Self::InstallerPhase => f.write_str("installer system still running"),
            Self::Stabilizing { identity, .. } => write!(f, "stabilizing as {identity}"),
            Self::Stable { identity } => write!(f, "stable as {identity}"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// Tracks consecutive observations until the host has been steady for `window`.
///
/// Any unreachable probe, installer signal, or identity change restarts the
/// window. A tracker with a timeout moves to `Failed` once an observation
/// arrives at or after it without the host being stable; `Failed` is terminal.
#[derive(Debug, Clone)]
pub struct StabilityTracker {
    window: Duration,
    timeout: Option<Duration>,
    phase: BootPhase,
}

impl StabilityTracker {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            timeout: None,
            phase: BootPhase::Unreachable,
        }
    }

    /// Gives up on observations taken `timeout` or later after the start.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn phase(&self) -> &BootPhase {
        &self.phase
    }

    /// Records an observation taken `at` after the wait started.
    pub fn observe(&mut self, observation: BootObservation, at: Duration) -> &BootPhase {
        if self.phase == BootPhase::Failed {
            return &self.phase;
        }
        self.phase = match observation {
            BootObservation::Unreachable { .. } => BootPhase::Unreachable,
            BootObservation::Reachable {
                installer_signals: true,
                ..
            } => BootPhase::InstallerPhase,
            BootObservation::Reachable { hostname, .. } => self.advance(hostname, at),
        };
        let expired = self.timeout.is_some_and(|timeout| at >= timeout);
        if expired && !matches!(self.phase, BootPhase::Stable { .. }) {
            self.phase = BootPhase::Failed;
        }
        &self.phase
    }

    fn advance(&self, hostname: String, at: Duration) -> BootPhase {
        let since = match &self.phase {
            BootPhase::Stable { identity } if *identity == hostname => {
                return BootPhase::Stable { identity: hostname };
            }
            BootPhase::Stabilizing { identity, since } if *identity == hostname => *since,
            _ => at,
        };
        if at.saturating_sub(since) >= self.window {
            BootPhase::Stable { identity: hostname }
        } else {
            BootPhase::Stabilizing {
                identity: hostname,
                since,
            }
        }
    }
}
