//! Bounded, cancellable waits for a new server to become usable.
//!
//! Three waits run in order: provider reports running, the SSH port accepts
//! TCP connections, and the host has finished booting its final system.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{NetworkProbe, RemoteShell, ResourceProvider};
use crate::domain::{
    BootObservation, BootPhase, InstanceStatus, PollPolicy, ReadinessError, StabilityTracker,
};

/// Why a single probe did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeFailure {
    /// Not ready yet; try again after the interval.
    Retry(String),
    /// Will never become ready; stop waiting.
    Abort(String),
}

/// One readiness check, repeated by [`poll_until`].
#[allow(async_fn_in_trait)]
pub trait Probe {
    type Output;

    /// Human-readable name of the condition, used in errors.
    fn describe(&self) -> String;

    async fn attempt(&mut self, cancel: &CancellationToken)
    -> Result<Self::Output, ProbeFailure>;
}

/// Repeats `probe` until it succeeds, aborts, `policy.timeout` elapses, or
/// `cancel` fires.
///
/// The total wait never exceeds the timeout plus one probe duration, and
/// cancellation is observed during both probes and sleeps.
///
/// # Errors
///
/// Returns [`ReadinessError::Timeout`] with the last failure reason,
/// [`ReadinessError::Aborted`], or [`ReadinessError::Cancelled`].
pub async fn poll_until<P: Probe>(
    cancel: &CancellationToken,
    policy: PollPolicy,
    probe: &mut P,
) -> Result<P::Output, ReadinessError> {
    let what = probe.describe();
    let started = Instant::now();
    let deadline = started + policy.timeout;
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(ReadinessError::Cancelled { what });
        }
        attempt += 1;
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(ReadinessError::Cancelled { what }),
            outcome = probe.attempt(cancel) => outcome,
        };
        let last = match outcome {
            Ok(value) => {
                tracing::debug!(%what, attempt, "ready");
                return Ok(value);
            }
            Err(ProbeFailure::Abort(reason)) => {
                return Err(ReadinessError::Aborted { what, reason });
            }
            Err(ProbeFailure::Retry(reason)) => reason,
        };

        let now = Instant::now();
        if now >= deadline {
            return Err(ReadinessError::Timeout {
                what,
                waited: now - started,
                last,
            });
        }
        tracing::debug!(%what, attempt, reason = %last, "not ready yet");
        if !sleep_or_cancel(cancel, policy.interval.min(deadline - now)).await {
            return Err(ReadinessError::Cancelled { what });
        }
    }
}

/// Sleeps for `duration`. Returns `false` if `cancel` fired first.
pub async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(duration) => true,
    }
}

/// A child token that also fires once `after` has elapsed.
pub struct Deadline {
    parent: CancellationToken,
    token: CancellationToken,
    timer: tokio::task::JoinHandle<()>,
}

impl Deadline {
    #[must_use]
    pub fn new(parent: &CancellationToken, after: Duration) -> Self {
        let token = parent.child_token();
        let fire = token.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            fire.cancel();
        });
        Self {
            parent: parent.clone(),
            token,
            timer,
        }
    }

    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// True when the token fired because time ran out, not because the
    /// parent was cancelled.
    #[must_use]
    pub fn expired(&self) -> bool {
        self.token.is_cancelled() && !self.parent.is_cancelled()
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.timer.abort();
    }
}

// ── Probes ────────────────────────────────────────────────────────────────────

/// Provider reports the server as running.
pub struct RunningProbe<'a, P> {
    provider: &'a P,
    id: u64,
}

impl<P: ResourceProvider> Probe for RunningProbe<'_, P> {
    type Output = ();

    fn describe(&self) -> String {
        format!("server {} to be running", self.id)
    }

    async fn attempt(&mut self, _cancel: &CancellationToken) -> Result<(), ProbeFailure> {
        match self.provider.instance_status(self.id).await {
            Ok(InstanceStatus::Running) => Ok(()),
            Ok(status) if status.is_terminal() => {
                Err(ProbeFailure::Abort(format!("server entered state {status:?}")))
            }
            Ok(status) => Err(ProbeFailure::Retry(format!("status {status:?}"))),
            Err(e) if e.is_transient() => Err(ProbeFailure::Retry(e.to_string())),
            Err(e) => Err(ProbeFailure::Abort(e.to_string())),
        }
    }
}

/// The SSH port accepts TCP connections.
pub struct PortProbe<'a, N> {
    network: &'a N,
    host: &'a str,
    port: u16,
}

impl<N: NetworkProbe> Probe for PortProbe<'_, N> {
    type Output = ();

    fn describe(&self) -> String {
        format!("port {} on {}", self.port, self.host)
    }

    async fn attempt(&mut self, _cancel: &CancellationToken) -> Result<(), ProbeFailure> {
        match self.network.check_tcp_connectivity(self.host, self.port).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(ProbeFailure::Retry("connection refused or timed out".into())),
            Err(e) => Err(ProbeFailure::Retry(e.to_string())),
        }
    }
}

/// The host answers as the same non-installer system for a full window.
pub struct StabilityProbe<'a, S> {
    shell: &'a S,
    tracker: StabilityTracker,
    started: Instant,
    probe_timeout: Duration,
}

impl<S: RemoteShell> StabilityProbe<'_, S> {
    async fn observe(&self, cancel: &CancellationToken) -> BootObservation {
        let deadline = Deadline::new(cancel, self.probe_timeout);
        let hostname = match self.shell.run(deadline.token(), "hostname").await {
            Ok(out) if out.success() => out.stdout,
            Ok(out) => {
                return BootObservation::Unreachable {
                    reason: format!("hostname exited with {:?}", out.status),
                };
            }
            Err(e) => {
                return BootObservation::Unreachable {
                    reason: e.to_string(),
                };
            }
        };
        // Both signals are required; a host that cannot report its root
        // filesystem is not counted as up.
        let df = match self.shell.run(deadline.token(), "df -T /").await {
            Ok(out) if out.success() => out.stdout,
            Ok(out) => {
                return BootObservation::Unreachable {
                    reason: format!("df exited with {:?}", out.status),
                };
            }
            Err(e) => {
                return BootObservation::Unreachable {
                    reason: e.to_string(),
                };
            }
        };
        BootObservation::from_probe(&hostname, &df)
    }
}

impl<S: RemoteShell> Probe for StabilityProbe<'_, S> {
    type Output = String;

    fn describe(&self) -> String {
        "the final operating system to finish booting".to_string()
    }

    async fn attempt(&mut self, cancel: &CancellationToken) -> Result<String, ProbeFailure> {
        let observation = self.observe(cancel).await;
        let last = match &observation {
            BootObservation::Unreachable { reason } => format!("unreachable: {reason}"),
            BootObservation::Reachable {
                hostname,
                installer_signals: true,
            } => format!("{hostname} is still the installer system"),
            BootObservation::Reachable { hostname, .. } => format!("answering as {hostname}"),
        };
        let at = self.started.elapsed();
        match self.tracker.observe(observation, at) {
            BootPhase::Stable { identity } => Ok(identity.clone()),
            BootPhase::Failed => Err(ProbeFailure::Abort(format!(
                "not stable after {at:?}; last probe: {last}"
            ))),
            BootPhase::Unreachable => Err(ProbeFailure::Retry(last)),
            phase => Err(ProbeFailure::Retry(phase.to_string())),
        }
    }
}

// ── Waits ─────────────────────────────────────────────────────────────────────

/// Waits until the provider reports server `id` as running.
///
/// # Errors
///
/// See [`poll_until`].
pub async fn wait_for_running<P: ResourceProvider>(
    cancel: &CancellationToken,
    policy: PollPolicy,
    provider: &P,
    id: u64,
) -> Result<(), ReadinessError> {
    poll_until(cancel, policy, &mut RunningProbe { provider, id }).await
}

/// Waits until `host:port` accepts TCP connections.
///
/// # Errors
///
/// See [`poll_until`].
pub async fn wait_for_port<N: NetworkProbe>(
    cancel: &CancellationToken,
    policy: PollPolicy,
    network: &N,
    host: &str,
    port: u16,
) -> Result<(), ReadinessError> {
    poll_until(cancel, policy, &mut PortProbe { network, host, port }).await
}

/// Waits until the host has answered as the same final system for `window`.
/// Returns the stable hostname.
///
/// # Errors
///
/// See [`poll_until`].
pub async fn wait_for_stable_boot<S: RemoteShell>(
    cancel: &CancellationToken,
    policy: PollPolicy,
    shell: &S,
    window: Duration,
    probe_timeout: Duration,
) -> Result<String, ReadinessError> {
    let mut probe = StabilityProbe {
        shell,
        tracker: StabilityTracker::new(window).with_timeout(policy.timeout),
        started: Instant::now(),
        probe_timeout,
    };
    let result = poll_until(cancel, policy, &mut probe).await;
    if let Err(e) = &result {
        tracing::warn!(phase = %probe.tracker.phase(), error = %e, "host did not settle");
    }
    result
}
