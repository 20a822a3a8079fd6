//! Remote build steps run over an established [`RemoteShell`].
//!
//! The driver keeps a combined log of every command it ran and what came
//! back, which the orchestrator persists (redacted) when a build fails.

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::application::ports::{RemoteOutput, RemoteShell, RemoteStatus};
use crate::domain::remote::{EXIT_NO_CURL, EXIT_NO_PRIVILEGE, EXIT_NO_SHA256SUM, RemoteCommands};
use crate::domain::shell::remote_basename;
use crate::domain::{BuildError, BuildSettings, TransportError};

/// Permission bits of the uploaded source archive.
const ARCHIVE_MODE: u32 = 0o600;

pub struct BuildDriver<'a, S> {
    shell: &'a S,
    settings: &'a BuildSettings,
    commands: RemoteCommands<'a>,
    log: Vec<String>,
}

impl<'a, S: RemoteShell> BuildDriver<'a, S> {
    #[must_use]
    pub fn new(shell: &'a S, settings: &'a BuildSettings) -> Self {
        Self {
            shell,
            settings,
            commands: RemoteCommands::new(settings),
            log: Vec::new(),
        }
    }

    /// Everything recorded so far, unredacted.
    #[must_use]
    pub fn log_text(&self) -> String {
        self.log.join("\n")
    }

    fn record(&mut self, label: &str, output: &RemoteOutput) {
        self.log.push(format!("==> {label} ({:?})", output.status));
        if !output.stdout.is_empty() {
            self.log.push(output.stdout.trim_end().to_string());
        }
        if !output.stderr.is_empty() {
            self.log.push(output.stderr.trim_end().to_string());
        }
    }

    async fn run(
        &mut self,
        cancel: &CancellationToken,
        label: &str,
        command: &str,
    ) -> Result<RemoteOutput, BuildError> {
        tracing::debug!(step = label, "running remote command");
        let output = self.shell.run(cancel, command).await?;
        self.record(label, &output);
        if output.status == RemoteStatus::Cancelled {
            return Err(BuildError::Cancelled);
        }
        Ok(output)
    }

    /// Makes sure docker with compose is present, installing it when missing.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::RuntimeUnavailable`] when the host lacks what the
    /// installer needs or installation does not yield a working runtime.
    pub async fn ensure_runtime_present(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<(), BuildError> {
        let probe = self.commands.runtime_probe();
        if self.run(cancel, "check container runtime", &probe).await?.success() {
            return Ok(());
        }

        let prereq = self.commands.runtime_prerequisites();
        let out = self.run(cancel, "check installer prerequisites", &prereq).await?;
        match out.code() {
            Some(0) => {}
            Some(EXIT_NO_PRIVILEGE) => {
                return Err(BuildError::RuntimeUnavailable(
                    "login user is not root and cannot use passwordless sudo".to_string(),
                ));
            }
            Some(EXIT_NO_CURL) => {
                return Err(BuildError::RuntimeUnavailable(
                    "curl is not installed on the build host".to_string(),
                ));
            }
            Some(EXIT_NO_SHA256SUM) => {
                return Err(BuildError::RuntimeUnavailable(
                    "sha256sum is not installed on the build host".to_string(),
                ));
            }
            _ => {
                return Err(BuildError::RuntimeUnavailable(format!(
                    "prerequisite check failed: {}",
                    out.stderr.trim()
                )));
            }
        }

        tracing::info!(url = %self.settings.docker_install_url, "installing container runtime");
        let install = self.commands.runtime_install();
        let out = self.run(cancel, "install container runtime", &install).await?;
        if !out.success() {
            return Err(BuildError::RuntimeUnavailable(format!(
                "installer exited with {:?}: {}",
                out.code(),
                out.stderr.trim()
            )));
        }

        if self.run(cancel, "verify container runtime", &probe).await?.success() {
            Ok(())
        } else {
            Err(BuildError::RuntimeUnavailable(
                "docker compose still unavailable after installation".to_string(),
            ))
        }
    }

    /// Uploads the archive and unpacks it into a fresh work directory.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Staging`] on upload or extraction failure.
    pub async fn stage_source(
        &mut self,
        cancel: &CancellationToken,
        archive: &Path,
    ) -> Result<(), BuildError> {
        let remote_archive = format!("/tmp/burnbox-source-{}.tar.gz", Uuid::new_v4());
        let file = tokio::fs::File::open(archive).await.map_err(|e| {
            BuildError::Staging(format!("cannot open {}: {e}", archive.display()))
        })?;
        self.shell
            .upload(cancel, &remote_archive, file, ARCHIVE_MODE)
            .await
            .map_err(|e| match e {
                TransportError::Cancelled => BuildError::Cancelled,
                other => BuildError::Staging(format!("upload failed: {other}")),
            })?;
        self.log.push(format!("==> uploaded source to {remote_archive}"));

        let stage = self.commands.stage(&remote_archive);
        let out = self.run(cancel, "unpack source", &stage).await?;
        if out.success() {
            Ok(())
        } else {
            Err(BuildError::Staging(format!(
                "extracting archive exited with {:?}: {}",
                out.code(),
                out.stderr.trim()
            )))
        }
    }

    /// Runs the compose build. Success only when the build service exits 0.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Failed`] with the exit code, or
    /// [`BuildError::Cancelled`].
    pub async fn run_build(&mut self, cancel: &CancellationToken) -> Result<(), BuildError> {
        let build = self.commands.build();
        let out = self.run(cancel, "docker compose build", &build).await?;
        if out.success() {
            Ok(())
        } else {
            Err(BuildError::Failed { code: out.code() })
        }
    }

    /// Lists remote artifact paths.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::NoArtifacts`] when nothing matched.
    pub async fn collect_artifacts(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, BuildError> {
        let list = self.commands.list_artifacts();
        let out = self.run(cancel, "list artifacts", &list).await?;
        if !out.success() {
            return Err(BuildError::ListArtifacts(out.stderr.trim().to_string()));
        }
        let paths = parse_artifact_list(&out.stdout);
        if paths.is_empty() {
            return Err(BuildError::NoArtifacts {
                dir: self.commands.artifact_root(),
                pattern: self.settings.artifact_pattern.clone(),
            });
        }
        Ok(paths)
    }

    /// Downloads each remote path into `local_dir`, keeping file names.
    /// Stops at the first failure.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Download`] naming the failed artifact.
    pub async fn download_artifacts(
        &mut self,
        cancel: &CancellationToken,
        remote_paths: &[String],
        local_dir: &Path,
    ) -> Result<Vec<PathBuf>, BuildError> {
        tokio::fs::create_dir_all(local_dir).await.map_err(|e| BuildError::Download {
            remote: remote_paths.first().cloned().unwrap_or_default(),
            source: TransportError::Io {
                op: format!("create {}", local_dir.display()),
                source: e,
            },
        })?;
        let mut local = Vec::with_capacity(remote_paths.len());
        for remote in remote_paths {
            let target = local_dir.join(remote_basename(remote));
            self.shell
                .download(cancel, remote, &target)
                .await
                .map_err(|source| BuildError::Download {
                    remote: remote.clone(),
                    source,
                })?;
            tracing::info!(artifact = %target.display(), "downloaded");
            local.push(target);
        }
        Ok(local)
    }

    /// Fetches container logs for diagnostics. Never fails.
    pub async fn collect_remote_logs(&mut self, cancel: &CancellationToken) -> String {
        let logs = self.commands.compose_logs();
        match self.shell.run(cancel, &logs).await {
            Ok(out) => {
                let mut text = out.stdout;
                if !out.stderr.is_empty() {
                    text.push('\n');
                    text.push_str(&out.stderr);
                }
                text
            }
            Err(e) => format!("(container logs unavailable: {e})"),
        }
    }
}

/// One absolute or work-dir-relative path per non-empty line.
fn parse_artifact_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}
