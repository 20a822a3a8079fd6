//! End-to-end pipeline scenarios against fake collaborators.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use burnbox_cli::application::ports::HostKeyPolicy;
use burnbox_cli::application::services::orchestrator::{BUILD_LOG_FILE, Orchestrator};
use burnbox_cli::domain::{BuildConfig, BuildError, PollPolicy};
use futures_util::FutureExt;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::mocks::{
    FailingArchiver, FakeArchiver, HostScript, MemoryState, MockConnector, MockProvider,
    PROVIDER_TOKEN, PanickingNetwork, PortOpen, RecordingPublisher, RecordingReporter, SERVER_ID,
    SERVER_IP, UnusedPublisher,
};

fn fast(timeout_ms: u64) -> PollPolicy {
    PollPolicy {
        timeout: Duration::from_millis(timeout_ms),
        interval: Duration::from_millis(5),
    }
}

fn config(artifacts: &TempDir, extra: &[(&str, &str)]) -> BuildConfig {
    let mut vars = vec![
        ("HETZNER_TOKEN".to_string(), PROVIDER_TOKEN.to_string()),
        ("BUILD_SOURCE_DIR".to_string(), "/src".to_string()),
        (
            "LOCAL_ARTIFACT_DIR".to_string(),
            artifacts.path().display().to_string(),
        ),
    ];
    vars.extend(extra.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())));
    let mut config = BuildConfig::from_vars(vars).expect("valid config");
    config.readiness.running = fast(2_000);
    config.readiness.port = fast(2_000);
    config.readiness.stable = fast(5_000);
    config.readiness.stability_window = Duration::from_millis(20);
    config
}

struct Harness {
    provider: MockProvider,
    connector: MockConnector,
    state: MemoryState,
    reporter: RecordingReporter,
}

impl Harness {
    fn new(script: HostScript) -> Self {
        Self {
            provider: MockProvider::default(),
            connector: MockConnector::with_script(script),
            state: MemoryState::default(),
            reporter: RecordingReporter::default(),
        }
    }

    async fn run(
        &self,
        config: &BuildConfig,
    ) -> anyhow::Result<burnbox_cli::application::services::orchestrator::PipelineReport> {
        self.run_until(config, &CancellationToken::new()).await
    }

    async fn run_until(
        &self,
        config: &BuildConfig,
        cancel: &CancellationToken,
    ) -> anyhow::Result<burnbox_cli::application::services::orchestrator::PipelineReport> {
        let orchestrator = Orchestrator {
            config,
            provider: &self.provider,
            archiver: &FakeArchiver,
            connector: &self.connector,
            network: &PortOpen,
            state: &self.state,
            publisher: &UnusedPublisher,
            reporter: &self.reporter,
        };
        orchestrator.run(cancel).await
    }
}

#[tokio::test]
async fn successful_build_downloads_artifacts_and_deletes_server() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, &[]);
    let h = Harness::new(HostScript::default());

    let report = h.run(&config).await.expect("pipeline succeeds");

    assert_eq!(report.server_id, SERVER_ID);
    assert_eq!(report.artifacts, vec![dir.path().join("app.zip")]);
    assert!(dir.path().join("app.zip").exists());
    assert!(!dir.path().join(BUILD_LOG_FILE).exists());
    assert_eq!(report.published, None);

    assert_eq!(h.provider.deleted_instances(), vec![SERVER_ID]);
    assert_eq!(h.provider.deleted_credentials(), vec![101]);
    assert_eq!(h.state.saves.get(), 1);
    assert_eq!(h.state.clears.get(), 1);
    assert!(h.state.record.borrow().is_none());
}

#[tokio::test]
async fn build_runs_only_over_pinned_connection() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, &[]);
    let h = Harness::new(HostScript::default());

    h.run(&config).await.expect("pipeline succeeds");

    let policies = h.connector.policies.borrow();
    assert_eq!(policies.len(), 2);
    assert!(matches!(policies[0], HostKeyPolicy::Unverified));
    assert!(matches!(policies[1], HostKeyPolicy::Pinned { .. }));
    let uploads = h.connector.uploads.borrow();
    assert_eq!(uploads.len(), 1);
    assert!(uploads[0].0.starts_with("/tmp/burnbox-source-"));
    assert_eq!(uploads[0].2, 0o600);
}

#[tokio::test]
async fn progress_lines_cover_every_stage_without_release() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, &[]);
    let h = Harness::new(HostScript::default());

    h.run(&config).await.expect("pipeline succeeds");

    let steps = h.reporter.steps.borrow();
    let progress: Vec<&String> = steps.iter().filter(|s| s.starts_with('[')).collect();
    assert_eq!(progress.len(), 9);
    assert!(progress[0].contains("1/9"));
    assert!(progress[8].contains("9/9"));
    assert!(progress[8].contains("100%"));
}

// Scenario A
#[tokio::test]
async fn failed_build_saves_redacted_log_and_deletes_server_once() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, &[]);
    let h = Harness::new(HostScript {
        build_exit: 2,
        ..HostScript::default()
    });

    let err = h.run(&config).await.expect_err("build must fail");

    let chain = format!("{err:#}");
    assert!(chain.contains("build failed"), "{chain}");
    assert!(chain.contains("code 2"), "{chain}");

    let log = std::fs::read_to_string(dir.path().join(BUILD_LOG_FILE)).expect("build.log");
    assert!(!log.contains(PROVIDER_TOKEN));
    assert!(log.contains("HETZNER_TOKEN=REDACTED"));
    assert!(log.contains("built ok"));
    assert!(log.contains("build-1  | compiling"));

    assert_eq!(h.provider.deleted_instances(), vec![SERVER_ID]);
    assert_eq!(h.state.clears.get(), 1);
}

#[cfg(unix)]
#[tokio::test]
async fn build_log_is_private() {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().unwrap();
    let config = config(&dir, &[]);
    let h = Harness::new(HostScript {
        build_exit: 1,
        ..HostScript::default()
    });

    h.run(&config).await.expect_err("build must fail");

    let mode = std::fs::metadata(dir.path().join(BUILD_LOG_FILE))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o600);
}

// Scenario B
#[tokio::test]
async fn keep_on_failure_preserves_server_and_names_it() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, &[("KEEP_SERVER_ON_FAILURE", "yes")]);
    let h = Harness::new(HostScript {
        build_exit: 2,
        ..HostScript::default()
    });

    h.run(&config).await.expect_err("build must fail");

    assert!(h.provider.deleted_instances().is_empty());
    assert!(h.provider.deleted_credentials().is_empty());
    let warned = h
        .reporter
        .warnings
        .borrow()
        .iter()
        .any(|w| w.contains(&SERVER_ID.to_string()) && w.contains(SERVER_IP));
    assert!(warned, "warnings: {:?}", h.reporter.warnings.borrow());
    assert_eq!(h.state.clears.get(), 0);
    assert!(h.state.record.borrow().is_some());
}

#[tokio::test]
async fn keep_on_failure_still_deletes_after_success() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, &[("KEEP_SERVER_ON_FAILURE", "true")]);
    let h = Harness::new(HostScript::default());

    h.run(&config).await.expect("pipeline succeeds");

    assert_eq!(h.provider.deleted_instances(), vec![SERVER_ID]);
}

#[tokio::test]
async fn no_matching_artifacts_fails_and_tears_down() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, &[]);
    let h = Harness::new(HostScript {
        artifacts: Vec::new(),
        ..HostScript::default()
    });

    let err = h.run(&config).await.expect_err("no artifacts");

    assert!(format!("{err:#}").contains("no artifacts matched"));
    assert!(!h.connector.ran("download "));
    assert_eq!(h.provider.deleted_instances(), vec![SERVER_ID]);
}

#[tokio::test]
async fn reused_debug_keys_are_attached_but_not_deleted() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir, &[]);
    config.debug_keys = vec![
        "ssh-ed25519 AAAAC3Nza fresh@laptop".to_string(),
        "ssh-ed25519 AAAAC3Nza reused@laptop".to_string(),
    ];
    let h = Harness::new(HostScript::default());

    h.run(&config).await.expect("pipeline succeeds");

    let log = h.provider.log.borrow();
    assert_eq!(log.attached_credentials, vec![101, 102, 900]);
    assert!(log.created_credentials[1].ends_with("-debug-1"));
    let mut deleted = log.deleted_credentials.clone();
    deleted.sort_unstable();
    assert_eq!(deleted, vec![101, 102]);
}

#[tokio::test]
async fn teardown_failure_after_success_is_an_error_and_keeps_state() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, &[]);
    let mut h = Harness::new(HostScript::default());
    h.provider.delete_fails = true;

    let err = h.run(&config).await.expect_err("teardown fails");

    assert!(format!("{err:#}").contains("teardown failed"));
    assert_eq!(h.state.clears.get(), 0);
    assert!(h.state.record.borrow().is_some());
}

#[tokio::test]
async fn archive_failure_creates_nothing() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, &[]);
    let provider = MockProvider::default();
    let connector = MockConnector::default();
    let state = MemoryState::default();
    let reporter = RecordingReporter::default();

    let orchestrator = Orchestrator {
        config: &config,
        provider: &provider,
        archiver: &FailingArchiver,
        connector: &connector,
        network: &PortOpen,
        state: &state,
        publisher: &UnusedPublisher,
        reporter: &reporter,
    };
    let err = orchestrator
        .run(&CancellationToken::new())
        .await
        .expect_err("archive fails");

    assert!(format!("{err:#}").contains("repository not found"));
    assert_eq!(provider.calls(), 0);
    assert_eq!(state.saves.get(), 0);
}

#[tokio::test]
async fn cancellation_before_provisioning_makes_no_provider_calls() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, &[]);
    let h = Harness::new(HostScript::default());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let orchestrator = Orchestrator {
        config: &config,
        provider: &h.provider,
        archiver: &FakeArchiver,
        connector: &h.connector,
        network: &PortOpen,
        state: &h.state,
        publisher: &UnusedPublisher,
        reporter: &h.reporter,
    };
    orchestrator.run(&cancel).await.expect_err("cancelled");

    assert_eq!(h.provider.calls(), 0);
}

#[tokio::test]
async fn release_publishes_downloaded_artifacts() {
    let dir = TempDir::new().unwrap();
    let config = config(
        &dir,
        &[
            ("RELEASE_TAG", "v1.2.3"),
            ("GITHUB_REPOSITORY", "acme/firmware"),
            ("GITHUB_TOKEN", "ghp_release_token"),
        ],
    );
    let h = Harness::new(HostScript::default());
    let publisher = RecordingPublisher::default();

    let orchestrator = Orchestrator {
        config: &config,
        provider: &h.provider,
        archiver: &FakeArchiver,
        connector: &h.connector,
        network: &PortOpen,
        state: &h.state,
        publisher: &publisher,
        reporter: &h.reporter,
    };
    let report = orchestrator
        .run(&CancellationToken::new())
        .await
        .expect("pipeline succeeds");

    assert_eq!(report.published.as_deref(), Some("v1.2.3"));
    let published = publisher.published.borrow();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].1, vec![dir.path().join("app.zip")]);
    assert!(h.reporter.steps.borrow().iter().any(|s| s.contains("10/10")));
}

#[tokio::test]
async fn cancellation_mid_build_still_deletes_server_once() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, &[]);
    let cancel = CancellationToken::new();
    let h = Harness::new(HostScript {
        build_hangs: true,
        interrupt_on_build: Some(cancel.clone()),
        ..HostScript::default()
    });

    let err = h.run_until(&config, &cancel).await.expect_err("cancelled");

    assert!(
        matches!(err.downcast_ref::<BuildError>(), Some(BuildError::Cancelled)),
        "{err:#}"
    );
    assert_eq!(h.provider.deleted_instances(), vec![SERVER_ID]);
    assert_eq!(h.provider.deleted_credentials(), vec![101]);
    assert_eq!(h.state.clears.get(), 1);
}

#[tokio::test]
async fn build_timeout_is_reported_as_timed_out() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir, &[]);
    config.build.timeout = Duration::from_millis(50);
    let h = Harness::new(HostScript {
        build_hangs: true,
        ..HostScript::default()
    });

    let err = h.run(&config).await.expect_err("build times out");

    assert!(
        matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::TimedOut(limit)) if *limit == Duration::from_millis(50)
        ),
        "{err:#}"
    );
    assert!(format!("{err:#}").contains("run build failed"), "{err:#}");
    assert!(dir.path().join(BUILD_LOG_FILE).exists());
    assert_eq!(h.provider.deleted_instances(), vec![SERVER_ID]);
}

#[tokio::test]
async fn panic_after_creation_tears_down_then_resumes() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, &[]);
    let h = Harness::new(HostScript::default());

    let orchestrator = Orchestrator {
        config: &config,
        provider: &h.provider,
        archiver: &FakeArchiver,
        connector: &h.connector,
        network: &PanickingNetwork,
        state: &h.state,
        publisher: &UnusedPublisher,
        reporter: &h.reporter,
    };
    let outcome = AssertUnwindSafe(orchestrator.run(&CancellationToken::new()))
        .catch_unwind()
        .await;

    let payload = outcome.expect_err("panic is resumed");
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"port check blew up"));
    assert_eq!(h.provider.deleted_instances(), vec![SERVER_ID]);
    assert_eq!(h.provider.deleted_credentials(), vec![101]);
    assert_eq!(h.state.clears.get(), 1);
}
