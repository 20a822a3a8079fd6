//! Remote shell transport over the OpenSSH client.
//!
//! Each operation spawns one `ssh` process. The ephemeral private key lives
//! only in a private `ssh-agent` owned by the session; it is handed over on
//! stdin and never written to disk. Host keys are either ignored (boot
//! probes) or pinned to a `known_hosts` file captured with `ssh-keyscan`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::application::ports::{
    HostKeyPolicy, RemoteOutput, RemoteShell, RemoteStatus, ShellConnector, SshTarget,
};
use crate::domain::remote;
use crate::domain::ssh::{SshFailure, classify_ssh_failure, is_valid_host, parse_keyscan_output};
use crate::domain::{Secret, TransportError};
use crate::infra::command_runner::{Supervised, TokioCommandRunner, run_cancellable};

/// How long a best-effort remote kill may take after cancellation.
const REMOTE_KILL_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound for `ssh-keyscan`.
const KEYSCAN_TIMEOUT: Duration = Duration::from_secs(30);
/// Upper bound for the agent socket to appear.
const AGENT_START_TIMEOUT: Duration = Duration::from_secs(5);

// ── known_hosts ───────────────────────────────────────────────────────────────

/// Manages the pinned `known_hosts` file for one build host.
pub struct KnownHostsManager {
    path: PathBuf,
}

impl KnownHostsManager {
    #[must_use]
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `lines` to the `known_hosts` file, creating parent dirs as needed.
    ///
    /// Sets file permissions to 600 and parent directory to 700 on Unix.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or permissions cannot be set.
    pub fn update(&self, lines: &[String]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create dir {}", parent.display()))?;
            set_permissions(parent, 0o700)?;
        }
        let mut content = lines.join("\n");
        content.push('\n');
        std::fs::write(&self.path, content)
            .with_context(|| format!("write {}", self.path.display()))?;
        set_permissions(&self.path, 0o600)?;
        Ok(())
    }

}

#[cfg(unix)]
fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .with_context(|| format!("set permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn set_permissions(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

// ── ssh-agent ─────────────────────────────────────────────────────────────────

/// A private `ssh-agent` holding one key. Killed when dropped.
pub struct SshAgent {
    socket: PathBuf,
    _process: Child,
    _dir: TempDir,
}

impl SshAgent {
    /// Starts an agent on a fresh socket and loads `private_key` into it.
    ///
    /// # Errors
    ///
    /// Returns an error if the agent cannot be started or rejects the key.
    pub async fn start(
        runner: &TokioCommandRunner,
        private_key: &Secret,
    ) -> Result<Self, TransportError> {
        let dir = tempfile::Builder::new()
            .prefix("burnbox-agent-")
            .tempdir()
            .map_err(|source| TransportError::Io {
                op: "create agent directory".to_string(),
                source,
            })?;
        let socket = dir.path().join("agent.sock");
        let process = Command::new("ssh-agent")
            .arg("-D")
            .arg("-a")
            .arg(&socket)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TransportError::Spawn {
                program: "ssh-agent".to_string(),
                source,
            })?;

        let waited = tokio::time::timeout(AGENT_START_TIMEOUT, async {
            while !socket.exists() {
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        })
        .await;
        if waited.is_err() {
            return Err(agent_error("ssh-agent socket did not appear"));
        }

        let output = runner
            .run_with_stdin(
                "ssh-add",
                &["-q", "-"],
                &[("SSH_AUTH_SOCK", socket.as_os_str())],
                private_key.expose().as_bytes(),
            )
            .await
            .map_err(|e| agent_error(&format!("{e:#}")))?;
        if !output.status.success() {
            return Err(agent_error(&format!(
                "ssh-add rejected the key: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(Self {
            socket,
            _process: process,
            _dir: dir,
        })
    }

    #[must_use]
    pub fn socket(&self) -> &Path {
        &self.socket
    }
}

fn agent_error(detail: &str) -> TransportError {
    TransportError::Io {
        op: "load key into ssh-agent".to_string(),
        source: std::io::Error::other(detail.to_string()),
    }
}

// ── Command line ──────────────────────────────────────────────────────────────

/// Arguments for one non-interactive `ssh` invocation.
#[must_use]
pub fn build_ssh_args(
    target: &SshTarget,
    agent_socket: &Path,
    policy: &HostKeyPolicy,
    dial_timeout: Duration,
    remote_command: &str,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-F".into(),
        "/dev/null".into(),
        "-T".into(),
        "-o".into(),
        "BatchMode=yes".into(),
        "-o".into(),
        format!("IdentityAgent={}", agent_socket.display()),
        "-o".into(),
        format!("ConnectTimeout={}", dial_timeout.as_secs().max(1)),
        "-o".into(),
        "ServerAliveInterval=15".into(),
        "-o".into(),
        "ServerAliveCountMax=4".into(),
        "-o".into(),
        "LogLevel=ERROR".into(),
        "-o".into(),
        "GlobalKnownHostsFile=/dev/null".into(),
    ];
    match policy {
        HostKeyPolicy::Unverified => args.extend([
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            "UserKnownHostsFile=/dev/null".into(),
        ]),
        HostKeyPolicy::Pinned { known_hosts } => args.extend([
            "-o".into(),
            "StrictHostKeyChecking=yes".into(),
            "-o".into(),
            format!("UserKnownHostsFile={}", known_hosts.display()),
        ]),
    }
    args.extend([
        "-p".into(),
        target.port.to_string(),
        "-l".into(),
        target.user.clone(),
        "--".into(),
        target.host.clone(),
        remote_command.to_string(),
    ]);
    args
}

// ── Connector ─────────────────────────────────────────────────────────────────

/// Production [`ShellConnector`] backed by the `ssh` binary.
pub struct OpenSshConnector {
    runner: TokioCommandRunner,
    scratch: TempDir,
    dial_timeout: Duration,
}

impl OpenSshConnector {
    /// # Errors
    ///
    /// Returns an error if the scratch directory cannot be created.
    pub fn new(dial_timeout: Duration) -> Result<Self> {
        let scratch = tempfile::Builder::new()
            .prefix("burnbox-ssh-")
            .tempdir()
            .context("creating ssh scratch directory")?;
        Ok(Self {
            runner: TokioCommandRunner::default(),
            scratch,
            dial_timeout,
        })
    }
}

fn check_host(target: &SshTarget) -> Result<(), TransportError> {
    if is_valid_host(&target.host) {
        Ok(())
    } else {
        Err(TransportError::Dial {
            addr: target.address(),
            detail: "refusing to connect to an invalid host name".to_string(),
        })
    }
}

impl ShellConnector for OpenSshConnector {
    type Shell = OpenSshSession;

    async fn connect(
        &self,
        target: &SshTarget,
        private_key: &Secret,
        policy: HostKeyPolicy,
    ) -> Result<OpenSshSession, TransportError> {
        check_host(target)?;
        let agent = SshAgent::start(&self.runner, private_key).await?;
        tracing::debug!(addr = %target.address(), ?policy, "ssh session ready");
        Ok(OpenSshSession {
            target: target.clone(),
            agent,
            policy,
            dial_timeout: self.dial_timeout,
        })
    }

    async fn pin_host_key(&self, target: &SshTarget) -> Result<PathBuf, TransportError> {
        check_host(target)?;
        let port = target.port.to_string();
        let output = self
            .runner
            .run_with_timeout(
                "ssh-keyscan",
                &["-T", "10", "-t", "ed25519", "-p", &port, &target.host],
                KEYSCAN_TIMEOUT,
            )
            .await
            .map_err(|e| TransportError::HostKey {
                host: target.host.clone(),
                reason: format!("{e:#}"),
            })?;
        let lines = parse_keyscan_output(&String::from_utf8_lossy(&output.stdout)).map_err(
            |e| TransportError::HostKey {
                host: target.host.clone(),
                reason: e.to_string(),
            },
        )?;

        let manager = KnownHostsManager::with_path(self.scratch.path().join("known_hosts"));
        manager
            .update(&lines)
            .map_err(|e| TransportError::HostKey {
                host: target.host.clone(),
                reason: format!("{e:#}"),
            })?;
        tracing::info!(host = %target.host, "host key pinned");
        Ok(manager.path().to_path_buf())
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

/// One authenticated build host. Every call spawns a fresh `ssh` process.
pub struct OpenSshSession {
    target: SshTarget,
    agent: SshAgent,
    policy: HostKeyPolicy,
    dial_timeout: Duration,
}

impl OpenSshSession {
    fn command(&self, remote_command: &str) -> Command {
        let mut command = Command::new("ssh");
        command
            .args(build_ssh_args(
                &self.target,
                self.agent.socket(),
                &self.policy,
                self.dial_timeout,
                remote_command,
            ))
            .kill_on_drop(true);
        command
    }

    fn spawn(&self, mut command: Command) -> Result<Child, TransportError> {
        command.spawn().map_err(|source| TransportError::Spawn {
            program: "ssh".to_string(),
            source,
        })
    }

    /// Maps the `ssh` client's own failure (exit 255 with a recognizable
    /// message) to a transport error. Remote exits pass through as `None`.
    fn client_failure(&self, code: Option<i32>, stderr: &str) -> Option<TransportError> {
        if code != Some(255) {
            return None;
        }
        let detail = stderr.trim().to_string();
        let addr = self.target.address();
        match classify_ssh_failure(stderr)? {
            SshFailure::Dial => Some(TransportError::Dial { addr, detail }),
            SshFailure::Handshake => Some(TransportError::Handshake { addr, detail }),
        }
    }

    /// Kills the process group recorded in `pid_file` through a new connection.
    async fn kill_remote(&self, pid_file: &str) {
        let mut command = self.command(&remote::kill_tracked(pid_file));
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        match tokio::time::timeout(REMOTE_KILL_TIMEOUT, command.status()).await {
            Ok(Ok(status)) => tracing::debug!(?status, "remote command killed"),
            Ok(Err(e)) => tracing::warn!(error = %e, "could not kill remote command"),
            Err(_) => tracing::warn!("timed out killing remote command"),
        }
    }
}

async fn read_into<R: AsyncRead + Unpin>(handle: Option<&mut R>, buf: &mut Vec<u8>) {
    if let Some(h) = handle {
        let _ = h.read_to_end(buf).await;
    }
}

fn io_error(op: &str, source: std::io::Error) -> TransportError {
    TransportError::Io {
        op: op.to_string(),
        source,
    }
}

impl RemoteShell for OpenSshSession {
    async fn run(
        &self,
        cancel: &CancellationToken,
        command: &str,
    ) -> Result<RemoteOutput, TransportError> {
        let pid_file = format!("/tmp/burnbox-{}.pid", Uuid::new_v4());
        let mut ssh = self.command(&remote::tracked(command, &pid_file));
        ssh.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = self.spawn(ssh)?;

        let mut out_handle = child.stdout.take();
        let mut err_handle = child.stderr.take();
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let outcome = run_cancellable(&mut child, cancel, async {
            tokio::join!(
                read_into(out_handle.as_mut(), &mut stdout),
                read_into(err_handle.as_mut(), &mut stderr),
            );
        })
        .await
        .map_err(|e| io_error("waiting for ssh", e))?;

        let stdout = String::from_utf8_lossy(&stdout).into_owned();
        let stderr = String::from_utf8_lossy(&stderr).into_owned();
        let status = match outcome {
            Supervised::Cancelled => {
                self.kill_remote(&pid_file).await;
                RemoteStatus::Cancelled
            }
            Supervised::Finished { status, .. } if status.success() => RemoteStatus::Success,
            Supervised::Finished { status, .. } => {
                if let Some(err) = self.client_failure(status.code(), &stderr) {
                    return Err(err);
                }
                RemoteStatus::Failed(status.code())
            }
        };
        Ok(RemoteOutput {
            stdout,
            stderr,
            status,
        })
    }

    async fn upload<R>(
        &self,
        cancel: &CancellationToken,
        remote_path: &str,
        mut content: R,
        mode: u32,
    ) -> Result<(), TransportError>
    where
        R: AsyncRead + Unpin,
    {
        let mut ssh = self.command(&remote::upload(remote_path, mode));
        ssh.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        let mut child = self.spawn(ssh)?;

        let stdin = child.stdin.take();
        let mut err_handle = child.stderr.take();
        let mut stderr = Vec::new();
        let outcome = run_cancellable(&mut child, cancel, async {
            let copy = async {
                let Some(mut stdin) = stdin else {
                    return Ok(0);
                };
                let copied = tokio::io::copy(&mut content, &mut stdin).await;
                let _ = stdin.shutdown().await;
                copied
            };
            let (copied, ()) = tokio::join!(copy, read_into(err_handle.as_mut(), &mut stderr));
            copied
        })
        .await
        .map_err(|e| io_error("waiting for ssh", e))?;

        let stderr = String::from_utf8_lossy(&stderr).into_owned();
        match outcome {
            Supervised::Cancelled => Err(TransportError::Cancelled),
            Supervised::Finished { status, io } => {
                if let Some(err) = self.client_failure(status.code(), &stderr) {
                    return Err(err);
                }
                if !status.success() {
                    return Err(TransportError::Remote {
                        op: format!("upload to {remote_path}"),
                        code: status.code(),
                        stderr: stderr.trim().to_string(),
                    });
                }
                let bytes = io.map_err(|e| io_error("streaming upload", e))?;
                tracing::debug!(remote_path, bytes, "uploaded");
                Ok(())
            }
        }
    }

    async fn download(
        &self,
        cancel: &CancellationToken,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<(), TransportError> {
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options
            .open(local_path)
            .await
            .map_err(|e| io_error(&format!("create {}", local_path.display()), e))?;

        let mut ssh = self.command(&remote::download(remote_path));
        ssh.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = self.spawn(ssh)?;

        let mut out_handle = child.stdout.take();
        let mut err_handle = child.stderr.take();
        let mut stderr = Vec::new();
        let outcome = run_cancellable(&mut child, cancel, async {
            let copy = async {
                let Some(out) = out_handle.as_mut() else {
                    return Ok::<u64, std::io::Error>(0);
                };
                let copied = tokio::io::copy(out, &mut file).await?;
                file.flush().await?;
                Ok::<u64, std::io::Error>(copied)
            };
            let (copied, ()) = tokio::join!(copy, read_into(err_handle.as_mut(), &mut stderr));
            copied
        })
        .await
        .map_err(|e| io_error("waiting for ssh", e));

        let stderr = String::from_utf8_lossy(&stderr).into_owned();
        let result = match outcome {
            Err(e) => Err(e),
            Ok(Supervised::Cancelled) => Err(TransportError::Cancelled),
            Ok(Supervised::Finished { status, io }) => {
                if let Some(err) = self.client_failure(status.code(), &stderr) {
                    Err(err)
                } else if !status.success() {
                    Err(TransportError::Remote {
                        op: format!("download of {remote_path}"),
                        code: status.code(),
                        stderr: stderr.trim().to_string(),
                    })
                } else {
                    io.map(|bytes| tracing::debug!(remote_path, bytes, "downloaded"))
                        .map_err(|e| io_error("streaming download", e))
                }
            }
        };
        if result.is_err() {
            let _ = tokio::fs::remove_file(local_path).await;
        }
        result
    }
}
