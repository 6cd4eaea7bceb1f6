//! Ferrous CI CLI entrypoint.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

mod commands;
mod config;
mod handlers;
mod logging;

#[cfg(test)]
mod handlers_tests;

use commands::{Commands, ConfigCommands};
use config::{CliConfig, LogFormat};
use handlers::Context;

#[derive(Parser)]
#[command(name = "ferrous")]
#[command(author, version, about = "Ferrous CI run coordinator", long_about = None)]
struct Cli {
    /// Workflow file (defaults to ferrous.yaml in the workspace)
    #[arg(long, global = true)]
    workflow: Option<PathBuf>,

    /// Directory the build and test commands run in
    #[arg(long, global = true, default_value = ".")]
    workspace: PathBuf,

    /// Log output format
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = CliConfig::load().unwrap_or_default();
    logging::init(cli.log_format.unwrap_or(config.log_format));

    let ctx = Context {
        config,
        workflow: cli.workflow,
        workspace: cli.workspace,
    };

    let code = match cli.command {
        Commands::Init => {
            handlers::init(&ctx).await?;
            0
        }
        Commands::Validate { path } => {
            handlers::validate(&ctx, path.as_deref()).await?;
            0
        }
        Commands::Schema => {
            handlers::schema()?;
            0
        }
        Commands::Check { event } => {
            handlers::check(&ctx, event).await?;
            0
        }
        Commands::Run { event } => match handlers::run(&ctx, event).await? {
            Some(run) => handlers::exit_code(run.phase),
            None => 0,
        },
        Commands::Serve => {
            let report = handlers::serve(&ctx).await?;
            if report.failed > 0 { 1 } else { 0 }
        }
        Commands::History { group, limit } => {
            handlers::history(&ctx, group.as_deref(), limit).await?;
            0
        }
        Commands::Show { run_id } => {
            handlers::show(&ctx, run_id).await?;
            0
        }
        Commands::Config { command } => {
            match command {
                ConfigCommands::Show => handlers::show_config(&ctx)?,
                ConfigCommands::Set { key, value } => handlers::set_config(&key, &value)?,
            }
            0
        }
    };

    Ok(ExitCode::from(code))
}
