//! CLI argument parsing with clap derive

use anyhow::Result;
use clap::builder::FalseyValueParser;
use clap::{ArgAction, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use crate::commands;
use crate::output::OutputContext;

/// Build on a disposable cloud server, collect the artifacts, tear it down
#[derive(Parser)]
#[command(
    name = "burnbox",
    version,
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true,
    after_help = "Configuration is read from environment variables (HETZNER_TOKEN, \
                  BUILD_SOURCE_DIR or BUILD_REPO_URL, ...)."
)]
pub struct Cli {
    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Disable colored output (any non-empty `NO_COLOR` other than a falsey
    /// word such as `0` or `false` also disables it)
    #[arg(
        long,
        global = true,
        env = "NO_COLOR",
        action = ArgAction::SetTrue,
        value_parser = FalseyValueParser::new()
    )]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Provision a server, run the build, download artifacts, delete the server
    Run,

    /// Delete a server recorded by an earlier run and remove its state file
    Cleanup,
}

impl Cli {
    /// Execute the CLI command.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn run(self, cancel: &CancellationToken) -> Result<()> {
        let Cli {
            quiet,
            no_color,
            command,
        } = self;
        let ctx = OutputContext::new(no_color, quiet);
        match command {
            Command::Run => commands::run::run(&ctx, cancel).await,
            Command::Cleanup => commands::cleanup::run(&ctx).await,
        }
    }
}
