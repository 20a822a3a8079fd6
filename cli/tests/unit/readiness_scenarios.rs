//! The boot stability wait against scripted hosts, on a paused clock.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::time::Duration;

use burnbox_cli::application::services::readiness::wait_for_stable_boot;
use burnbox_cli::domain::{PollPolicy, ReadinessError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::mocks::{HostScript, ScriptedShell};

const WINDOW: Duration = Duration::from_secs(60);
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

fn every_five_seconds(timeout_secs: u64) -> PollPolicy {
    PollPolicy {
        timeout: Duration::from_secs(timeout_secs),
        interval: Duration::from_secs(5),
    }
}

async fn wait(shell: &ScriptedShell, timeout_secs: u64) -> Result<String, ReadinessError> {
    wait_for_stable_boot(
        &CancellationToken::new(),
        every_five_seconds(timeout_secs),
        shell,
        WINDOW,
        PROBE_TIMEOUT,
    )
    .await
}

#[tokio::test(start_paused = true)]
async fn steady_host_is_stable_after_one_window() {
    let shell = ScriptedShell::new(HostScript::default());
    let start = Instant::now();

    let host = wait(&shell, 600).await.expect("stable");

    assert_eq!(host, "builder-01");
    assert_eq!(start.elapsed(), WINDOW);
}

#[tokio::test(start_paused = true)]
async fn rescue_system_is_waited_out() {
    let shell = ScriptedShell::new(HostScript::booting_through(&[
        "rescue", "rescue", "rescue", "builder-01",
    ]));
    let start = Instant::now();

    let host = wait(&shell, 600).await.expect("stable");

    assert_eq!(host, "builder-01");
    // Three rescue probes at 0s, 5s, 10s; the window starts at 15s.
    assert_eq!(start.elapsed(), Duration::from_secs(75));
}

#[tokio::test(start_paused = true)]
async fn memory_root_is_waited_out_even_with_a_final_hostname() {
    let shell = ScriptedShell::new(HostScript {
        tmpfs_probes: 2,
        ..HostScript::default()
    });
    let start = Instant::now();

    let host = wait(&shell, 600).await.expect("stable");

    assert_eq!(host, "builder-01");
    assert_eq!(start.elapsed(), Duration::from_secs(70));
}

#[tokio::test(start_paused = true)]
async fn hostname_change_restarts_the_window() {
    let shell = ScriptedShell::new(HostScript::booting_through(&[
        "builder-old",
        "builder-old",
        "builder-old",
        "builder-old",
        "builder-new",
    ]));
    let start = Instant::now();

    let host = wait(&shell, 600).await.expect("stable");

    assert_eq!(host, "builder-new");
    assert_eq!(start.elapsed(), Duration::from_secs(80));
}

#[tokio::test(start_paused = true)]
async fn failing_df_never_counts_as_stable() {
    let shell = ScriptedShell::new(HostScript {
        df_fails: true,
        ..HostScript::default()
    });

    let err = wait(&shell, 120).await.expect_err("must not become stable");

    assert!(
        matches!(
            err,
            ReadinessError::Aborted { .. } | ReadinessError::Timeout { .. }
        ),
        "{err}"
    );
    assert!(err.to_string().contains("df exited"), "{err}");
    assert!(shell.hostname_calls() > 1);
}

#[tokio::test(start_paused = true)]
async fn host_stuck_in_rescue_gives_up_at_the_timeout() {
    let shell = ScriptedShell::new(HostScript::booting_through(&["rescue"]));
    let start = Instant::now();

    let err = wait(&shell, 120).await.expect_err("never leaves rescue");

    assert!(err.to_string().contains("installer"), "{err}");
    assert!(start.elapsed() <= Duration::from_secs(120) + PROBE_TIMEOUT);
}

#[tokio::test(start_paused = true)]
async fn cancellation_ends_the_wait() {
    let shell = ScriptedShell::new(HostScript::booting_through(&["rescue"]));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(12)).await;
        trigger.cancel();
    });

    let err = wait_for_stable_boot(
        &cancel,
        every_five_seconds(600),
        &shell,
        WINDOW,
        PROBE_TIMEOUT,
    )
    .await
    .expect_err("cancelled");

    assert!(matches!(err, ReadinessError::Cancelled { .. }), "{err}");
}
