//! `burnbox cleanup`: reconcile a server left behind by an earlier run.

use anyhow::{Result, bail};

use crate::application::services::cleanup_service::{CleanupOutcome, cleanup_persisted_server};
use crate::domain::Secret;
use crate::infra::config::load_cleanup_config;
use crate::infra::hetzner::HetznerProvider;
use crate::infra::state::StateManager;
use crate::output::{OutputContext, TerminalReporter};

/// Entry point for `burnbox cleanup`.
///
/// # Errors
///
/// Returns an error if the state file is unreadable, no provider token is
/// available, or the server exists but cannot be deleted.
pub async fn run(ctx: &OutputContext) -> Result<()> {
    let config = load_cleanup_config()?;
    let store = StateManager::with_path(config.state_file.clone());
    let reporter = TerminalReporter::new(ctx);

    let outcome = cleanup_persisted_server(
        &store,
        config.keep_server_on_failure,
        |state| {
            let token = match (&config.provider_token, state.provider_token.as_str()) {
                (Some(token), _) => token.clone(),
                (None, "") => bail!(
                    "state file {} has no provider token; set HETZNER_TOKEN",
                    config.state_file.display()
                ),
                (None, stored) => Secret::new(stored),
            };
            HetznerProvider::new(&config.api_url, token)
        },
        &reporter,
    )
    .await?;

    tracing::info!(?outcome, "cleanup finished");
    if let CleanupOutcome::Removed { server_id } | CleanupOutcome::AlreadyGone { server_id } =
        outcome
    {
        ctx.kv("server", &server_id.to_string());
    }
    Ok(())
}
