//! Basset CLI entry point.
//!
//! Binary name: `basset`
//!
//! Parses CLI arguments, initializes tracing, the database and the engine,
//! then dispatches to the matching command handler.

mod cli;
mod state;

use basset_observe::{TracingOptions, init_tracing, shutdown_tracing};
use clap::Parser;
use clap_complete::generate;

use cli::exec::ExecCommand;
use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut options = TracingOptions::with_verbosity(cli.verbose);
    if cli.quiet && cli.verbose == 0 {
        options.default_directive = "error".to_string();
    }
    options.json = cli.log_json;
    options.otel = cli.otel;
    init_tracing(&options).map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "basset", &mut std::io::stdout());
        return Ok(());
    }

    let bridge = match &cli.command {
        Commands::Run { bridge, .. } => bridge.as_deref(),
        Commands::Exec {
            action: ExecCommand::Resume { bridge, .. },
        } => bridge.as_deref(),
        _ => None,
    };
    let state = AppState::init(bridge).await?;

    let result = match cli.command {
        Commands::Workflow { action } => {
            cli::workflow::handle_workflow_command(action, &state, cli.json).await
        }
        Commands::Run {
            workflow_id,
            inputs,
            ..
        } => cli::run::run_workflow(&state, &workflow_id, &inputs, cli.quiet, cli.json).await,
        Commands::Exec { action } => {
            cli::exec::handle_exec_command(action, &state, cli.quiet, cli.json).await
        }
        Commands::Completions { .. } => Ok(()),
    };

    shutdown_tracing();
    result
}
