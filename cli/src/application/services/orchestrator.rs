//! The build pipeline: create a server, build on it, bring artifacts home,
//! and always account for the server afterwards.
//!
//! Once a server exists it is owned by a [`ResourceGuard`]. Every exit path
//! out of [`Orchestrator::run`] ends in exactly one teardown decision:
//! delete, or (on failure with `keep_server_on_failure`) preserve.

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::application::ports::{
    ArchivePreparer, ArtifactPublisher, HostKeyPolicy, NetworkProbe, ProgressReporter,
    RemoteShell, ResourceProvider, ServerStateStore, ShellConnector, SshTarget,
};
use crate::application::services::build_driver::BuildDriver;
use crate::application::services::cleanup_service::{delete_credentials, release_resources};
use crate::application::services::readiness::{
    Deadline, wait_for_port, wait_for_running, wait_for_stable_boot,
};
use crate::domain::redact::sanitize_with_secrets;
use crate::domain::{
    BuildConfig, BuildError, CleanupError, EphemeralKeypair, Instance, InstanceRequest, Stage,
    TransportError,
};

/// Name of the failure log written to the local artifact directory.
pub const BUILD_LOG_FILE: &str = "build.log";

/// Upper bound for fetching container logs after a failed build.
const LOG_COLLECTION_TIMEOUT: Duration = Duration::from_secs(120);

/// What a successful run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    pub server_id: u64,
    pub artifacts: Vec<PathBuf>,
    /// Release tag the artifacts were attached to, if publishing was enabled.
    pub published: Option<String>,
}

/// Tracks a live server until teardown has been decided.
///
/// Dropping an undecided guard (the run future dropped before teardown) logs
/// the server so the persisted state file can be used to reclaim it.
struct ResourceGuard {
    server_id: u64,
    ip: String,
    credentials: Vec<u64>,
    decided: bool,
}

impl ResourceGuard {
    fn new(instance: &Instance) -> Self {
        Self {
            server_id: instance.id,
            ip: instance.ip.clone(),
            credentials: instance.owned_credentials(),
            decided: false,
        }
    }

    fn decide(&mut self) {
        self.decided = true;
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        if !self.decided {
            tracing::error!(
                server_id = self.server_id,
                ip = %self.ip,
                "server was not torn down; run `burnbox cleanup`"
            );
        }
    }
}

fn stage_failed(stage: Stage) -> String {
    format!("{stage} failed")
}

/// Runs one build end to end against the given collaborators.
pub struct Orchestrator<'a, P, A, C, N, S, U, R> {
    pub config: &'a BuildConfig,
    pub provider: &'a P,
    pub archiver: &'a A,
    pub connector: &'a C,
    pub network: &'a N,
    pub state: &'a S,
    pub publisher: &'a U,
    pub reporter: &'a R,
}

impl<P, A, C, N, S, U, R> Orchestrator<'_, P, A, C, N, S, U, R>
where
    P: ResourceProvider,
    A: ArchivePreparer,
    C: ShellConnector,
    N: NetworkProbe,
    S: ServerStateStore,
    U: ArtifactPublisher,
    R: ProgressReporter,
{
    fn total_stages(&self) -> usize {
        if self.config.release.is_some() {
            Stage::ALL.len()
        } else {
            Stage::ALL.len() - 1
        }
    }

    fn enter(&self, stage: Stage) {
        tracing::info!(stage = %stage, number = stage.number(), "entering stage");
        self.reporter.step(&stage.progress_line(self.total_stages()));
    }

    /// Executes the pipeline.
    ///
    /// # Errors
    ///
    /// Returns the first stage failure, with the stage name as context. When
    /// the pipeline succeeded but the server could not be deleted, returns
    /// the teardown error instead.
    ///
    /// # Panics
    ///
    /// A panic raised after the server was created is resumed once teardown
    /// has run.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<PipelineReport> {
        self.enter(Stage::PrepareArchive);
        let (archive, _archive_guard) = self
            .archiver
            .prepare(&self.config.source)
            .await
            .context(stage_failed(Stage::PrepareArchive))?;
        if cancel.is_cancelled() {
            anyhow::bail!("cancelled before creating a server");
        }

        self.enter(Stage::CreateInstance);
        let instance = self
            .provision()
            .await
            .context(stage_failed(Stage::CreateInstance))?;
        let guard = ResourceGuard::new(&instance);
        self.reporter.success(&format!(
            "server {} ({}) created in {}",
            instance.id, instance.ip, instance.datacenter
        ));

        let state = instance.to_state(&self.config.provider_token, Utc::now());
        if let Err(e) = self.state.save_async(&state).await {
            tracing::warn!(error = %e, "could not persist server state");
            self.reporter.warn(&format!(
                "could not write {}: {e:#}",
                self.config.state_file.display()
            ));
        }

        let driven = AssertUnwindSafe(self.drive(cancel, &instance, &archive)).catch_unwind();
        let (outcome, panicked) = match driven.await {
            Ok(outcome) => (outcome, None),
            Err(payload) => {
                tracing::error!(server_id = instance.id, "pipeline panicked, tearing down");
                (Err(anyhow::anyhow!("pipeline panicked")), Some(payload))
            }
        };
        let teardown = self.teardown(guard, outcome.is_err()).await;

        let result = match (outcome, teardown) {
            (Ok(report), Ok(())) => Ok(report),
            (Ok(_), Err(e)) => Err(anyhow::Error::new(e).context("teardown failed")),
            (Err(e), Err(cleanup)) => {
                tracing::error!(error = %cleanup, "teardown after failure also failed");
                self.reporter.warn(&format!(
                    "{cleanup}; state kept in {}, run `burnbox cleanup` to retry",
                    self.config.state_file.display()
                ));
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
        };
        if let Some(payload) = panicked {
            std::panic::resume_unwind(payload);
        }
        result
    }

    /// Registers credentials and creates the server. Credentials created here
    /// are deleted again if server creation fails.
    async fn provision(&self) -> Result<Instance> {
        let server = &self.config.server;
        let user_data = match &server.user_data_path {
            Some(path) => Some(
                tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("reading user data {}", path.display()))?,
            ),
            None => None,
        };

        let run_id = Uuid::new_v4().simple().to_string();
        let run_id = &run_id[..8];

        let keypair = EphemeralKeypair::generate()?;
        let main = self
            .provider
            .create_credential(&format!("burnbox-{run_id}"), &keypair.public_key)
            .await
            .context("registering ephemeral ssh key")?;

        let mut attached = vec![main.id];
        let mut extra_owned = Vec::new();
        for (i, key) in self.config.debug_keys.iter().enumerate() {
            let name = format!("burnbox-{run_id}-debug-{}", i + 1);
            match self.provider.create_credential(&name, key).await {
                Ok(cred) => {
                    attached.push(cred.id);
                    if !cred.reused {
                        extra_owned.push(cred.id);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, index = i + 1, "debug ssh key not registered");
                    self.reporter
                        .warn(&format!("skipping debug ssh key #{}: {e}", i + 1));
                }
            }
        }
        let main_owned = if main.reused { 0 } else { main.id };

        let name = format!("{}-{run_id}", server.name);
        let request = InstanceRequest {
            name: &name,
            server_type: &server.server_type,
            image: &server.image,
            location: server.location.as_deref(),
            user_data: user_data.as_deref(),
            credential_ids: &attached,
        };
        tracing::info!(name = %name, server_type = %server.server_type, image = %server.image, "creating server");

        let created = match self.provider.create_instance(&request).await {
            Ok(created) => created,
            Err(e) => {
                let owned: Vec<u64> = std::iter::once(main_owned)
                    .chain(extra_owned.iter().copied())
                    .filter(|id| *id != 0)
                    .collect();
                delete_credentials(self.provider, self.reporter, &owned).await;
                return Err(e).context("creating server");
            }
        };

        Ok(Instance {
            id: created.id,
            name: created.name,
            ip: created.ip,
            datacenter: created.datacenter,
            ssh_user: server.ssh_user.clone(),
            ssh_port: server.ssh_port,
            private_key: keypair.private_key,
            credential_id: main_owned,
            extra_credential_ids: extra_owned,
        })
    }

    /// Everything between server creation and teardown.
    async fn drive(
        &self,
        cancel: &CancellationToken,
        instance: &Instance,
        archive: &Path,
    ) -> Result<PipelineReport> {
        let readiness = &self.config.readiness;

        self.enter(Stage::WaitRunning);
        wait_for_running(cancel, readiness.running, self.provider, instance.id)
            .await
            .context(stage_failed(Stage::WaitRunning))?;

        self.enter(Stage::WaitPortOpen);
        wait_for_port(cancel, readiness.port, self.network, &instance.ip, instance.ssh_port)
            .await
            .context(stage_failed(Stage::WaitPortOpen))?;

        self.enter(Stage::WaitStable);
        let target = SshTarget {
            host: instance.ip.clone(),
            port: instance.ssh_port,
            user: instance.ssh_user.clone(),
        };
        let hostname = {
            let probe_shell = self
                .connector
                .connect(&target, &instance.private_key, HostKeyPolicy::Unverified)
                .await
                .context(stage_failed(Stage::WaitStable))?;
            wait_for_stable_boot(
                cancel,
                readiness.stable,
                &probe_shell,
                readiness.stability_window,
                readiness.probe_timeout,
            )
            .await
            .context(stage_failed(Stage::WaitStable))?
        };
        tracing::info!(%hostname, "host finished booting");

        let known_hosts = self
            .connector
            .pin_host_key(&target)
            .await
            .context("pinning host key")
            .context(stage_failed(Stage::WaitStable))?;
        let shell = self
            .connector
            .connect(
                &target,
                &instance.private_key,
                HostKeyPolicy::Pinned { known_hosts },
            )
            .await
            .context(stage_failed(Stage::StageSource))?;

        let mut driver = BuildDriver::new(&shell, &self.config.build);
        self.build(cancel, &mut driver, archive).await?;

        self.enter(Stage::CollectArtifacts);
        let remote = driver
            .collect_artifacts(cancel)
            .await
            .context(stage_failed(Stage::CollectArtifacts))?;

        self.enter(Stage::DownloadArtifacts);
        let artifacts = driver
            .download_artifacts(cancel, &remote, &self.config.local_artifact_dir)
            .await
            .context(stage_failed(Stage::DownloadArtifacts))?;
        self.reporter.success(&format!(
            "downloaded {} artifact(s) to {}",
            artifacts.len(),
            self.config.local_artifact_dir.display()
        ));

        let published = match &self.config.release {
            Some(release) => {
                self.enter(Stage::PublishArtifacts);
                self.publisher
                    .publish(release, &artifacts)
                    .await
                    .context(stage_failed(Stage::PublishArtifacts))?;
                self.reporter.success(&format!(
                    "published to {}/{} release {}",
                    release.owner, release.repo, release.tag
                ));
                Some(release.tag.clone())
            }
            None => None,
        };

        Ok(PipelineReport {
            server_id: instance.id,
            artifacts,
            published,
        })
    }

    /// Installs the runtime, stages the source, and runs the build under the
    /// build timeout. On failure the combined log is saved before returning.
    async fn build<T: RemoteShell>(
        &self,
        cancel: &CancellationToken,
        driver: &mut BuildDriver<'_, T>,
        archive: &Path,
    ) -> Result<()> {
        let timeout = self.config.build.timeout;
        let deadline = Deadline::new(cancel, timeout);

        self.enter(Stage::StageSource);
        let mut stage = Stage::StageSource;
        let mut result = driver.ensure_runtime_present(deadline.token()).await;
        if result.is_ok() {
            result = driver.stage_source(deadline.token(), archive).await;
        }
        if result.is_ok() {
            self.enter(Stage::RunBuild);
            stage = Stage::RunBuild;
            result = driver.run_build(deadline.token()).await;
        }

        let Err(err) = result else {
            return Ok(());
        };
        let err = match err {
            BuildError::Cancelled | BuildError::Transport(TransportError::Cancelled)
                if deadline.expired() =>
            {
                BuildError::TimedOut(timeout)
            }
            other => other,
        };
        drop(deadline);

        self.save_failure_log(cancel, driver).await;
        Err(anyhow::Error::new(err).context(stage_failed(stage)))
    }

    async fn save_failure_log<T: RemoteShell>(
        &self,
        cancel: &CancellationToken,
        driver: &mut BuildDriver<'_, T>,
    ) {
        let logs_deadline = Deadline::new(cancel, LOG_COLLECTION_TIMEOUT);
        let container_logs = driver.collect_remote_logs(logs_deadline.token()).await;
        let text = format!(
            "{}\n\n==> docker compose logs\n{container_logs}\n",
            driver.log_text()
        );
        let redacted = sanitize_with_secrets(&text, &self.config.secrets());

        let path = self.config.local_artifact_dir.join(BUILD_LOG_FILE);
        match write_private_file(&path, redacted.as_bytes()).await {
            Ok(()) => {
                tracing::info!(path = %path.display(), "build log saved");
                self.reporter
                    .warn(&format!("build log saved to {}", path.display()));
            }
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "could not save build log");
            }
        }
    }

    /// Deletes the server and owned credentials, or preserves them when the
    /// run failed and preservation was requested.
    async fn teardown(&self, mut guard: ResourceGuard, failed: bool) -> Result<(), CleanupError> {
        if failed && self.config.keep_server_on_failure {
            guard.decide();
            tracing::warn!(server_id = guard.server_id, ip = %guard.ip, "server preserved for debugging");
            self.reporter.warn(&format!(
                "KEEP_SERVER_ON_FAILURE is set: server {} ({}) left running; \
                 state kept in {}. Run `burnbox cleanup` when done.",
                guard.server_id,
                guard.ip,
                self.config.state_file.display()
            ));
            return Ok(());
        }

        self.reporter
            .step(&format!("deleting build server {}", guard.server_id));
        let result =
            release_resources(self.provider, self.reporter, guard.server_id, &guard.credentials)
                .await;
        guard.decide();
        result?;

        if let Err(e) = self.state.clear_async().await {
            tracing::warn!(error = %e, "could not remove server state");
            self.reporter.warn(&format!(
                "server deleted but {} could not be removed: {e:#}",
                self.config.state_file.display()
            ));
        }
        self.reporter
            .success(&format!("build server {} deleted", guard.server_id));
        Ok(())
    }
}

/// Writes `contents` to `path` readable by the owner only, creating parent
/// directories as needed.
async fn write_private_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(path).await?;
    file.write_all(contents).await?;
    file.flush().await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(())
}
