//! `burnbox run`: the full build pipeline on a fresh server.

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::application::services::orchestrator::Orchestrator;
use crate::domain::BuildConfig;
use crate::infra::archive::SourceArchiver;
use crate::infra::config::load_build_config;
use crate::infra::github::GitHubClient;
use crate::infra::hetzner::HetznerProvider;
use crate::infra::network::TokioNetworkProbe;
use crate::infra::ssh::OpenSshConnector;
use crate::infra::state::StateManager;
use crate::output::{OutputContext, TerminalReporter};

/// Entry point for `burnbox run`.
///
/// # Errors
///
/// Returns a [`crate::domain::ConfigError`] for bad configuration, otherwise
/// the first pipeline failure.
pub async fn run(ctx: &OutputContext, cancel: &CancellationToken) -> Result<()> {
    let mut config = load_build_config()?;
    let github = GitHubClient::new()?;
    add_actor_keys(ctx, &github, &mut config).await;

    let provider = HetznerProvider::new(&config.api_url, config.provider_token.clone())?;
    let archiver = SourceArchiver::default();
    let connector = OpenSshConnector::new(config.readiness.dial_timeout)?;
    let network = TokioNetworkProbe::new(config.readiness.dial_timeout);
    let state = StateManager::with_path(config.state_file.clone());
    let reporter = TerminalReporter::new(ctx);

    let orchestrator = Orchestrator {
        config: &config,
        provider: &provider,
        archiver: &archiver,
        connector: &connector,
        network: &network,
        state: &state,
        publisher: &github,
        reporter: &reporter,
    };
    let report = orchestrator.run(cancel).await?;

    ctx.success("build finished");
    ctx.kv("server", &report.server_id.to_string());
    for artifact in &report.artifacts {
        ctx.kv("artifact", &artifact.display().to_string());
    }
    if let Some(tag) = &report.published {
        ctx.kv("release", tag);
    }
    Ok(())
}

/// In GitHub Actions, grants the triggering actor debug access. Best-effort.
async fn add_actor_keys(ctx: &OutputContext, github: &GitHubClient, config: &mut BuildConfig) {
    let Some(actor) = config.github_actor.clone() else {
        return;
    };
    match github.fetch_user_keys(&config.github_api_url, &actor).await {
        Ok(keys) => {
            tracing::info!(actor = %actor, count = keys.len(), "injecting actor public keys");
            config.debug_keys.extend(keys);
        }
        Err(e) => ctx.warn(&format!("could not fetch public keys of {actor}: {e:#}")),
    }
}
