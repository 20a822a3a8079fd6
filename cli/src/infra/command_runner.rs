//! Local process execution for the infra layer.
//!
//! `TokioCommandRunner` runs short-lived helpers (`git`, `ssh-keyscan`,
//! `ssh-add`) with a hard timeout. [`run_cancellable`] supervises long-lived
//! children (`ssh` sessions) that must stop when a cancellation token fires.

use std::ffi::OsStr;
use std::future::Future;
use std::process::{ExitStatus, Output, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

/// Default timeout for helper commands.
pub const DEFAULT_CMD_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs helper programs with guaranteed timeout and kill.
///
/// `tokio::time::timeout` around `.output().await` only drops the future; the
/// OS process keeps running. This runner uses `tokio::select!` with an
/// explicit `child.kill()` so the process is terminated.
pub struct TokioCommandRunner {
    timeout: Duration,
}

impl Default for TokioCommandRunner {
    fn default() -> Self {
        Self::new(DEFAULT_CMD_TIMEOUT)
    }
}

impl TokioCommandRunner {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run `program` with a custom timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be spawned or exceeds `timeout`.
    /// On timeout the child is killed.
    pub async fn run_with_timeout<S: AsRef<OsStr>>(
        &self,
        program: &str,
        args: &[S],
        timeout: Duration,
    ) -> Result<Output> {
        let mut command = Command::new(program);
        command.args(args);
        self.execute(program, command, None, timeout).await
    }

    /// Run `program` with extra environment and a custom timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be spawned or exceeds `timeout`.
    pub async fn run_with_env<S: AsRef<OsStr>>(
        &self,
        program: &str,
        args: &[S],
        envs: &[(&str, &OsStr)],
        timeout: Duration,
    ) -> Result<Output> {
        let mut command = Command::new(program);
        command.args(args);
        for (key, value) in envs {
            command.env(key, value);
        }
        self.execute(program, command, None, timeout).await
    }

    /// Run `program` with extra environment and `input` written to stdin.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be spawned or times out.
    pub async fn run_with_stdin<S: AsRef<OsStr>>(
        &self,
        program: &str,
        args: &[S],
        envs: &[(&str, &OsStr)],
        input: &[u8],
    ) -> Result<Output> {
        let mut command = Command::new(program);
        command.args(args);
        for (key, value) in envs {
            command.env(key, value);
        }
        self.execute(program, command, Some(input), self.timeout)
            .await
    }

    async fn execute(
        &self,
        program: &str,
        mut command: Command,
        input: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<Output> {
        let mut child = command
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {program}"))?;

        let stdin = child.stdin.take();
        let mut stdout_handle = child.stdout.take();
        let mut stderr_handle = child.stderr.take();

        tokio::select! {
            result = async {
                let (status, stdout, stderr, ()) = tokio::join!(
                    child.wait(),
                    read_all(stdout_handle.as_mut()),
                    read_all(stderr_handle.as_mut()),
                    async {
                        if let (Some(mut stdin), Some(input)) = (stdin, input) {
                            let _ = stdin.write_all(input).await;
                        }
                    },
                );
                Ok(Output {
                    status: status.with_context(|| format!("waiting for {program}"))?,
                    stdout,
                    stderr,
                })
            } => result,
            () = tokio::time::sleep(timeout) => {
                let _ = child.kill().await;
                anyhow::bail!("{program} timed out after {}s", timeout.as_secs())
            }
        }
    }
}

async fn read_all<R: AsyncRead + Unpin>(handle: Option<&mut R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(h) = handle {
        let _ = h.read_to_end(&mut buf).await;
    }
    buf
}

/// How a supervised child ended.
#[derive(Debug)]
pub enum Supervised<T> {
    Finished { status: ExitStatus, io: T },
    /// The token fired; the child has been killed.
    Cancelled,
}

/// Waits for `child` while `io` drives its pipes. If `cancel` fires first
/// the child is killed and [`Supervised::Cancelled`] is returned.
///
/// `io` should write any output it reads into buffers owned by the caller so
/// that partial output survives cancellation.
///
/// # Errors
///
/// Returns an error if waiting on the child fails.
pub async fn run_cancellable<F, T>(
    child: &mut Child,
    cancel: &CancellationToken,
    io: F,
) -> std::io::Result<Supervised<T>>
where
    F: Future<Output = T>,
{
    let finished = tokio::select! {
        biased;
        () = cancel.cancelled() => None,
        (status, io) = async { tokio::join!(child.wait(), io) } => Some((status, io)),
    };
    match finished {
        Some((status, io)) => Ok(Supervised::Finished {
            status: status?,
            io,
        }),
        None => {
            let _ = child.kill().await;
            Ok(Supervised::Cancelled)
        }
    }
}
