//! Port trait definitions for the Application layer.
//!
//! Ports are the interfaces (contracts) that infrastructure must fulfill.
//! This file imports only from `crate::domain`, never from `crate::infra`,
//! `crate::commands`, or `crate::output`.

use std::path::{Path, PathBuf};

use anyhow::Result;
use burnbox_common::ServerState;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use crate::domain::{
    CreatedInstance, Credential, InstanceRequest, InstanceStatus, ProviderError, ReleaseSettings,
    Secret, SourceLocation, TransportError,
};

// ── Remote Shell Ports ────────────────────────────────────────────────────────

/// How a remote command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStatus {
    Success,
    /// Non-zero exit; `None` when killed by a signal.
    Failed(Option<i32>),
    /// The cancellation token fired before the command finished.
    Cancelled,
}

/// Captured result of a remote command. Output is lossily decoded as UTF-8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: RemoteStatus,
}

impl RemoteOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.status == RemoteStatus::Success
    }

    /// Exit code for failed commands.
    #[must_use]
    pub fn code(&self) -> Option<i32> {
        match self.status {
            RemoteStatus::Success => Some(0),
            RemoteStatus::Failed(code) => code,
            RemoteStatus::Cancelled => None,
        }
    }
}

/// An authenticated command channel to one build host.
///
/// Each operation is independent; there is no remote session state between
/// calls. Cancellation stops the remote command, not just the local wait.
#[allow(async_fn_in_trait)]
pub trait RemoteShell {
    /// Run `command` through the remote login shell and capture its output.
    ///
    /// A command that runs and exits non-zero is `Ok` with
    /// [`RemoteStatus::Failed`]; `Err` means the channel itself failed.
    async fn run(
        &self,
        cancel: &CancellationToken,
        command: &str,
    ) -> Result<RemoteOutput, TransportError>;

    /// Stream `content` into `remote_path`, then set its permission bits.
    async fn upload<R>(
        &self,
        cancel: &CancellationToken,
        remote_path: &str,
        content: R,
        mode: u32,
    ) -> Result<(), TransportError>
    where
        R: AsyncRead + Unpin;

    /// Stream `remote_path` into `local_path` (created with mode 0600).
    async fn download(
        &self,
        cancel: &CancellationToken,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<(), TransportError>;
}

/// Network address and login user of a build host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
}

impl SshTarget {
    #[must_use]
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Host key verification applied when connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Accept whatever key the host presents. Only for boot probes, where the
    /// host is still allowed to change identity.
    Unverified,
    /// Require the key recorded in `known_hosts`.
    Pinned { known_hosts: PathBuf },
}

/// Opens [`RemoteShell`]s.
#[allow(async_fn_in_trait)]
pub trait ShellConnector {
    type Shell: RemoteShell;

    /// Prepare a channel authenticated with `private_key`.
    async fn connect(
        &self,
        target: &SshTarget,
        private_key: &Secret,
        policy: HostKeyPolicy,
    ) -> Result<Self::Shell, TransportError>;

    /// Record the host's current ed25519 key and return the `known_hosts` path
    /// to use with [`HostKeyPolicy::Pinned`].
    async fn pin_host_key(&self, target: &SshTarget) -> Result<PathBuf, TransportError>;
}

// ── Network Probe Port ────────────────────────────────────────────────────────

/// Abstracts network connectivity checks so application services can be tested
/// without real network access.
#[allow(async_fn_in_trait)]
pub trait NetworkProbe {
    /// Check TCP connectivity to the given host and port.
    async fn check_tcp_connectivity(&self, host: &str, port: u16) -> Result<bool>;
}

// ── Cloud Provider Port ───────────────────────────────────────────────────────

/// Cloud resources the orchestrator creates and destroys.
#[allow(async_fn_in_trait)]
pub trait ResourceProvider {
    /// Register a public key. An identical existing key is looked up and
    /// returned with `reused = true`.
    async fn create_credential(
        &self,
        name: &str,
        public_key: &str,
    ) -> Result<Credential, ProviderError>;

    async fn delete_credential(&self, id: u64) -> Result<(), ProviderError>;

    async fn create_instance(
        &self,
        request: &InstanceRequest<'_>,
    ) -> Result<CreatedInstance, ProviderError>;

    async fn instance_status(&self, id: u64) -> Result<InstanceStatus, ProviderError>;

    async fn delete_instance(&self, id: u64) -> Result<(), ProviderError>;
}

// ── Source and Artifact Ports ─────────────────────────────────────────────────

/// Produces the compressed source archive uploaded to the build host.
#[allow(async_fn_in_trait)]
pub trait ArchivePreparer {
    /// Returns `(path, guard)` where `path` is a `.tar.gz` file and `guard`
    /// removes it and any scratch files when dropped.
    async fn prepare(
        &self,
        source: &SourceLocation,
    ) -> Result<(PathBuf, Box<dyn std::any::Any + Send>)>;
}

/// Publishes downloaded artifacts to a release.
#[allow(async_fn_in_trait)]
pub trait ArtifactPublisher {
    async fn publish(&self, release: &ReleaseSettings, files: &[PathBuf]) -> Result<()>;
}

// ── Progress Reporting Port ───────────────────────────────────────────────────

/// Abstracts progress reporting so services can emit events without
/// depending on the Presentation layer. Sync trait.
pub trait ProgressReporter {
    /// Emit an in-progress step message.
    fn step(&self, message: &str);
    /// Emit a success message.
    fn success(&self, message: &str);
    /// Emit a warning message.
    fn warn(&self, message: &str);
}

// ── State Port ────────────────────────────────────────────────────────────────

/// Persisted record of the server a run is responsible for.
#[allow(async_fn_in_trait)]
pub trait ServerStateStore {
    /// Load the record, returning `None` if no state file exists.
    async fn load_async(&self) -> Result<Option<ServerState>>;
    /// Persist the record (owner-only permissions).
    async fn save_async(&self, state: &ServerState) -> Result<()>;
    /// Remove the record. Succeeds when it is already absent.
    async fn clear_async(&self) -> Result<()>;
}
