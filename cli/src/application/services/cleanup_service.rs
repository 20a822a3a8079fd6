//! Teardown of provider resources, shared by the build pipeline and the
//! standalone `cleanup` command.

use anyhow::{Context, Result};
use burnbox_common::ServerState;

use crate::application::ports::{ProgressReporter, ResourceProvider, ServerStateStore};
use crate::domain::{CleanupError, ConfigError};

/// Result of `burnbox cleanup`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// No state file; nothing was contacted.
    NothingToClean,
    /// The recorded server was deleted.
    Removed { server_id: u64 },
    /// The provider no longer knows the server; only the record was removed.
    AlreadyGone { server_id: u64 },
}

/// Deletes the server, then its credentials.
///
/// A server that is already gone counts as deleted. Credential failures are
/// reported as warnings and do not fail the call.
///
/// # Errors
///
/// Returns [`CleanupError::DeleteInstance`] if the server could not be deleted.
pub async fn release_resources(
    provider: &impl ResourceProvider,
    reporter: &impl ProgressReporter,
    instance_id: u64,
    credential_ids: &[u64],
) -> Result<(), CleanupError> {
    let instance = match provider.delete_instance(instance_id).await {
        Ok(()) => {
            tracing::info!(server_id = instance_id, "server deleted");
            Ok(())
        }
        Err(e) if e.is_not_found() => {
            tracing::info!(server_id = instance_id, "server already gone");
            Ok(())
        }
        Err(source) => Err(CleanupError::DeleteInstance {
            id: instance_id,
            source,
        }),
    };

    delete_credentials(provider, reporter, credential_ids).await;
    instance
}

/// Reconciles a persisted server record left behind by an earlier run.
///
/// `provider_for` builds the provider from the loaded record and is only
/// invoked when a record exists.
///
/// # Errors
///
/// Returns [`ConfigError::PreservationRequested`] when `keep_server` is set,
/// or an error if the server exists but cannot be deleted. The record is
/// kept in both cases.
pub async fn cleanup_persisted_server<S, P, F, R>(
    store: &S,
    keep_server: bool,
    provider_for: F,
    reporter: &R,
) -> Result<CleanupOutcome>
where
    S: ServerStateStore,
    P: ResourceProvider,
    F: FnOnce(&ServerState) -> Result<P>,
    R: ProgressReporter,
{
    let Some(state) = store.load_async().await? else {
        reporter.success("nothing to cleanup");
        return Ok(CleanupOutcome::NothingToClean);
    };
    if keep_server {
        return Err(ConfigError::PreservationRequested.into());
    }

    let provider = provider_for(&state)?;
    let credentials: Vec<u64> = state.credential_ids().collect();
    let server_id = state.server_id;

    match provider.instance_status(server_id).await {
        Err(e) if e.is_not_found() => {
            reporter.step(&format!("server {server_id} no longer exists"));
            delete_credentials(&provider, reporter, &credentials).await;
            store.clear_async().await?;
            reporter.success("removed stale server state");
            return Ok(CleanupOutcome::AlreadyGone { server_id });
        }
        Err(e) => {
            return Err(e).with_context(|| format!("looking up server {server_id}"));
        }
        Ok(status) => {
            tracing::debug!(server_id, ?status, "server found");
        }
    }

    reporter.step(&format!(
        "deleting server {server_id} ({}) and its ssh keys",
        state.server_ip
    ));
    release_resources(&provider, reporter, server_id, &credentials).await?;
    store.clear_async().await?;
    reporter.success(&format!("server {server_id} deleted"));
    Ok(CleanupOutcome::Removed { server_id })
}

/// Deletes each credential, warning about (and skipping) failures.
pub async fn delete_credentials(
    provider: &impl ResourceProvider,
    reporter: &impl ProgressReporter,
    credential_ids: &[u64],
) {
    for &id in credential_ids {
        match provider.delete_credential(id).await {
            Ok(()) => tracing::debug!(ssh_key_id = id, "ssh key deleted"),
            Err(e) if e.is_not_found() => {}
            Err(source) => {
                let err = CleanupError::DeleteCredential { id, source };
                tracing::warn!(error = %err, "ssh key left behind");
                reporter.warn(&err.to_string());
            }
        }
    }
}
