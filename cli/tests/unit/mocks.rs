//! Shared mock infrastructure for unit tests.
//!
//! Every port has a hand-written fake here. Fakes record what they were asked
//! to do so scenario tests can assert on side effects (deleted servers,
//! cleared state, reporter messages) without touching the network.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::Result;
use burnbox_cli::application::ports::{
    ArchivePreparer, ArtifactPublisher, HostKeyPolicy, NetworkProbe, ProgressReporter,
    RemoteOutput, RemoteShell, RemoteStatus, ResourceProvider, ServerStateStore, ShellConnector,
    SshTarget,
};
use burnbox_cli::domain::{
    CreatedInstance, Credential, InstanceRequest, InstanceStatus, ProviderError, ReleaseSettings,
    Secret, SourceLocation, TransportError,
};
use burnbox_common::ServerState;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

pub const SERVER_ID: u64 = 4711;
pub const SERVER_IP: &str = "203.0.113.7";
pub const PROVIDER_TOKEN: &str = "tok-secret-123";

fn unexpected<T>() -> Result<T> {
    anyhow::bail!("not expected in this test")
}

// ── Provider ──────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct ProviderLog {
    pub calls: u32,
    pub created_credentials: Vec<String>,
    pub deleted_credentials: Vec<u64>,
    pub created_instances: Vec<String>,
    pub attached_credentials: Vec<u64>,
    pub deleted_instances: Vec<u64>,
}

/// In-memory provider. Keys whose text contains `reused` come back as
/// already registered.
#[derive(Clone, Default)]
pub struct MockProvider {
    pub log: Rc<RefCell<ProviderLog>>,
    /// The server no longer exists: status and delete report not found.
    pub instance_gone: bool,
    /// Server deletion fails with an API error.
    pub delete_fails: bool,
    pub next_id: Rc<Cell<u64>>,
}

impl MockProvider {
    pub fn gone() -> Self {
        Self {
            instance_gone: true,
            ..Self::default()
        }
    }

    pub fn failing_delete() -> Self {
        Self {
            delete_fails: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> u32 {
        self.log.borrow().calls
    }

    pub fn deleted_instances(&self) -> Vec<u64> {
        self.log.borrow().deleted_instances.clone()
    }

    pub fn deleted_credentials(&self) -> Vec<u64> {
        self.log.borrow().deleted_credentials.clone()
    }

    fn not_found(kind: &'static str, id: u64) -> ProviderError {
        ProviderError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

impl ResourceProvider for MockProvider {
    async fn create_credential(
        &self,
        name: &str,
        public_key: &str,
    ) -> Result<Credential, ProviderError> {
        let mut log = self.log.borrow_mut();
        log.calls += 1;
        log.created_credentials.push(name.to_string());
        if public_key.contains("reused") {
            return Ok(Credential {
                id: 900,
                reused: true,
            });
        }
        self.next_id.set(self.next_id.get() + 1);
        Ok(Credential {
            id: 100 + self.next_id.get(),
            reused: false,
        })
    }

    async fn delete_credential(&self, id: u64) -> Result<(), ProviderError> {
        let mut log = self.log.borrow_mut();
        log.calls += 1;
        log.deleted_credentials.push(id);
        Ok(())
    }

    async fn create_instance(
        &self,
        request: &InstanceRequest<'_>,
    ) -> Result<CreatedInstance, ProviderError> {
        let mut log = self.log.borrow_mut();
        log.calls += 1;
        log.created_instances.push(request.name.to_string());
        log.attached_credentials = request.credential_ids.to_vec();
        Ok(CreatedInstance {
            id: SERVER_ID,
            name: request.name.to_string(),
            ip: SERVER_IP.to_string(),
            datacenter: "fsn1-dc14".to_string(),
        })
    }

    async fn instance_status(&self, id: u64) -> Result<InstanceStatus, ProviderError> {
        self.log.borrow_mut().calls += 1;
        if self.instance_gone {
            return Err(Self::not_found("server", id));
        }
        Ok(InstanceStatus::Running)
    }

    async fn delete_instance(&self, id: u64) -> Result<(), ProviderError> {
        let mut log = self.log.borrow_mut();
        log.calls += 1;
        log.deleted_instances.push(id);
        if self.instance_gone {
            return Err(Self::not_found("server", id));
        }
        if self.delete_fails {
            return Err(ProviderError::Api {
                op: "delete server",
                status: 500,
                code: "server_error".to_string(),
                message: "try again later".to_string(),
            });
        }
        Ok(())
    }
}

// ── Remote shell ──────────────────────────────────────────────────────────────

/// How the scripted build host behaves.
#[derive(Clone)]
pub struct HostScript {
    /// Answers to successive `hostname` calls; the last one repeats.
    /// Empty means `builder-01` throughout.
    pub hostnames: Vec<String>,
    /// Number of leading `df -T /` calls that report a tmpfs root.
    pub tmpfs_probes: usize,
    /// `df -T /` exits non-zero.
    pub df_fails: bool,
    /// Exit code of the compose build.
    pub build_exit: i32,
    /// The build never finishes on its own; it ends when its token fires.
    pub build_hangs: bool,
    /// Cancelled as soon as the build starts, like a Ctrl-C mid-build.
    pub interrupt_on_build: Option<CancellationToken>,
    /// Lines printed by the artifact `find`.
    pub artifacts: Vec<String>,
    /// Printed by the build; contains a secret to exercise redaction.
    pub build_output: String,
}

impl Default for HostScript {
    fn default() -> Self {
        Self {
            hostnames: Vec::new(),
            tmpfs_probes: 0,
            df_fails: false,
            build_exit: 0,
            build_hangs: false,
            interrupt_on_build: None,
            artifacts: vec!["burnbox-build/out/app.zip".to_string()],
            build_output: format!("step 1/3\nHETZNER_TOKEN={PROVIDER_TOKEN}\nbuilt ok\n"),
        }
    }
}

impl HostScript {
    /// A host that answers as each of `names` in turn.
    pub fn booting_through(names: &[&str]) -> Self {
        Self {
            hostnames: names.iter().map(|n| (*n).to_string()).collect(),
            ..Self::default()
        }
    }
}

pub struct ScriptedShell {
    script: HostScript,
    hostname_calls: Cell<usize>,
    df_calls: Cell<usize>,
    pub commands: Rc<RefCell<Vec<String>>>,
    pub uploads: Rc<RefCell<Vec<(String, usize, u32)>>>,
}

impl ScriptedShell {
    pub fn new(script: HostScript) -> Self {
        Self {
            script,
            hostname_calls: Cell::new(0),
            df_calls: Cell::new(0),
            commands: Rc::default(),
            uploads: Rc::default(),
        }
    }

    pub fn hostname_calls(&self) -> usize {
        self.hostname_calls.get()
    }

    fn next_hostname(&self) -> String {
        let n = self.hostname_calls.get();
        self.hostname_calls.set(n + 1);
        let names = &self.script.hostnames;
        match names.get(n).or_else(|| names.last()) {
            Some(name) => format!("{name}\n"),
            None => "builder-01\n".to_string(),
        }
    }

    fn next_df(&self) -> RemoteOutput {
        let n = self.df_calls.get();
        self.df_calls.set(n + 1);
        if self.script.df_fails {
            let mut out = output(RemoteStatus::Failed(Some(1)), "");
            out.stderr = "df: /: Input/output error\n".to_string();
            out
        } else if n < self.script.tmpfs_probes {
            output(RemoteStatus::Success, DF_TMPFS)
        } else {
            output(RemoteStatus::Success, DF_EXT4)
        }
    }
}

fn output(status: RemoteStatus, stdout: &str) -> RemoteOutput {
    RemoteOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        status,
    }
}

const DF_EXT4: &str = "Filesystem Type 1K-blocks Used Available Use% Mounted on\n\
                       /dev/sda1 ext4 39987708 1795044 36519080 5% /\n";
const DF_TMPFS: &str = "Filesystem Type 1K-blocks Used Available Use% Mounted on\n\
                        tmpfs tmpfs 4030972 12345 4018627 1% /\n";

impl RemoteShell for ScriptedShell {
    async fn run(
        &self,
        cancel: &CancellationToken,
        command: &str,
    ) -> Result<RemoteOutput, TransportError> {
        self.commands.borrow_mut().push(command.to_string());
        if cancel.is_cancelled() {
            return Ok(output(RemoteStatus::Cancelled, ""));
        }
        let out = if command == "hostname" {
            output(RemoteStatus::Success, &self.next_hostname())
        } else if command == "df -T /" {
            self.next_df()
        } else if command.contains("--exit-code-from") {
            if let Some(interrupt) = &self.script.interrupt_on_build {
                interrupt.cancel();
            }
            if self.script.build_hangs {
                cancel.cancelled().await;
                return Ok(output(RemoteStatus::Cancelled, "step 1/3\n"));
            }
            let status = if self.script.build_exit == 0 {
                RemoteStatus::Success
            } else {
                RemoteStatus::Failed(Some(self.script.build_exit))
            };
            output(status, &self.script.build_output)
        } else if command.starts_with("find ") {
            let mut listing = self.script.artifacts.join("\n");
            listing.push('\n');
            output(RemoteStatus::Success, &listing)
        } else if command.contains("logs --no-color") {
            output(RemoteStatus::Success, "build-1  | compiling\n")
        } else {
            output(RemoteStatus::Success, "")
        };
        Ok(out)
    }

    async fn upload<R>(
        &self,
        _cancel: &CancellationToken,
        remote_path: &str,
        mut content: R,
        mode: u32,
    ) -> Result<(), TransportError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = Vec::new();
        content
            .read_to_end(&mut buf)
            .await
            .map_err(|source| TransportError::Io {
                op: "read upload".to_string(),
                source,
            })?;
        self.uploads
            .borrow_mut()
            .push((remote_path.to_string(), buf.len(), mode));
        Ok(())
    }

    async fn download(
        &self,
        _cancel: &CancellationToken,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<(), TransportError> {
        self.commands
            .borrow_mut()
            .push(format!("download {remote_path}"));
        tokio::fs::write(local_path, b"artifact bytes")
            .await
            .map_err(|source| TransportError::Io {
                op: "write download".to_string(),
                source,
            })
    }
}

#[derive(Default)]
pub struct MockConnector {
    pub script: HostScript,
    pub commands: Rc<RefCell<Vec<String>>>,
    pub uploads: Rc<RefCell<Vec<(String, usize, u32)>>>,
    pub policies: RefCell<Vec<HostKeyPolicy>>,
}

impl MockConnector {
    pub fn with_script(script: HostScript) -> Self {
        Self {
            script,
            ..Self::default()
        }
    }

    pub fn ran(&self, needle: &str) -> bool {
        self.commands.borrow().iter().any(|c| c.contains(needle))
    }
}

impl ShellConnector for MockConnector {
    type Shell = ScriptedShell;

    async fn connect(
        &self,
        target: &SshTarget,
        private_key: &Secret,
        policy: HostKeyPolicy,
    ) -> Result<ScriptedShell, TransportError> {
        assert_eq!(target.host, SERVER_IP);
        assert!(private_key.expose().contains("OPENSSH PRIVATE KEY"));
        self.policies.borrow_mut().push(policy);
        Ok(ScriptedShell {
            commands: Rc::clone(&self.commands),
            uploads: Rc::clone(&self.uploads),
            ..ScriptedShell::new(self.script.clone())
        })
    }

    async fn pin_host_key(&self, _target: &SshTarget) -> Result<PathBuf, TransportError> {
        Ok(PathBuf::from("/tmp/burnbox-test/known_hosts"))
    }
}

// ── Network ───────────────────────────────────────────────────────────────────

pub struct PortOpen;

impl NetworkProbe for PortOpen {
    async fn check_tcp_connectivity(&self, host: &str, _port: u16) -> Result<bool> {
        assert_eq!(host, SERVER_IP);
        Ok(true)
    }
}

/// Panics on the first port check, standing in for a bug mid-pipeline.
pub struct PanickingNetwork;

impl NetworkProbe for PanickingNetwork {
    async fn check_tcp_connectivity(&self, _host: &str, _port: u16) -> Result<bool> {
        panic!("port check blew up");
    }
}

// ── State store ───────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryState {
    pub record: RefCell<Option<ServerState>>,
    pub saves: Cell<u32>,
    pub clears: Cell<u32>,
}

impl MemoryState {
    pub fn with(state: ServerState) -> Self {
        Self {
            record: RefCell::new(Some(state)),
            ..Self::default()
        }
    }
}

impl ServerStateStore for MemoryState {
    async fn load_async(&self) -> Result<Option<ServerState>> {
        Ok(self.record.borrow().clone())
    }

    async fn save_async(&self, state: &ServerState) -> Result<()> {
        self.saves.set(self.saves.get() + 1);
        *self.record.borrow_mut() = Some(state.clone());
        Ok(())
    }

    async fn clear_async(&self) -> Result<()> {
        self.clears.set(self.clears.get() + 1);
        *self.record.borrow_mut() = None;
        Ok(())
    }
}

pub fn persisted_state() -> ServerState {
    ServerState {
        server_id: SERVER_ID,
        server_name: "burnbox-builder-1a2b3c4d".to_string(),
        server_ip: SERVER_IP.to_string(),
        ssh_port: 22,
        ssh_key_id: 101,
        extra_credential_ids: vec![102],
        datacenter: "fsn1-dc14".to_string(),
        created_at: "2026-02-17T14:30:00Z".parse().unwrap(),
        provider_token: PROVIDER_TOKEN.to_string(),
    }
}

// ── Archiver and publisher ────────────────────────────────────────────────────

pub struct FakeArchiver;

impl ArchivePreparer for FakeArchiver {
    async fn prepare(
        &self,
        _source: &SourceLocation,
    ) -> Result<(PathBuf, Box<dyn std::any::Any + Send>)> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("source.tar.gz");
        std::fs::write(&path, b"not really gzip")?;
        Ok((path, Box::new(dir)))
    }
}

pub struct FailingArchiver;

impl ArchivePreparer for FailingArchiver {
    async fn prepare(
        &self,
        _source: &SourceLocation,
    ) -> Result<(PathBuf, Box<dyn std::any::Any + Send>)> {
        anyhow::bail!("git clone failed: repository not found")
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    pub published: RefCell<Vec<(String, Vec<PathBuf>)>>,
}

impl ArtifactPublisher for RecordingPublisher {
    async fn publish(&self, release: &ReleaseSettings, files: &[PathBuf]) -> Result<()> {
        self.published
            .borrow_mut()
            .push((release.tag.clone(), files.to_vec()));
        Ok(())
    }
}

pub struct UnusedPublisher;

impl ArtifactPublisher for UnusedPublisher {
    async fn publish(&self, _: &ReleaseSettings, _: &[PathBuf]) -> Result<()> {
        unexpected()
    }
}

// ── Reporter ──────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingReporter {
    pub steps: RefCell<Vec<String>>,
    pub successes: RefCell<Vec<String>>,
    pub warnings: RefCell<Vec<String>>,
}

impl RecordingReporter {
    pub fn warned(&self, needle: &str) -> bool {
        self.warnings.borrow().iter().any(|w| w.contains(needle))
    }

    pub fn succeeded(&self, needle: &str) -> bool {
        self.successes.borrow().iter().any(|s| s.contains(needle))
    }
}

impl ProgressReporter for RecordingReporter {
    fn step(&self, message: &str) {
        self.steps.borrow_mut().push(message.to_string());
    }

    fn success(&self, message: &str) {
        self.successes.borrow_mut().push(message.to_string());
    }

    fn warn(&self, message: &str) {
        self.warnings.borrow_mut().push(message.to_string());
    }
}
