//! CLI command definitions for the `basset` binary.
//!
//! Uses clap derive macros for argument parsing. Commands are grouped by
//! noun: `basset workflow ...` manages stored definitions, `basset run`
//! starts an execution and `basset exec ...` inspects and controls them.

pub mod exec;
pub mod run;
pub mod workflow;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Run browser automation workflows.
#[derive(Parser)]
#[command(name = "basset", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export tracing spans to stdout through OpenTelemetry.
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage stored workflow definitions.
    #[command(alias = "wf")]
    Workflow {
        #[command(subcommand)]
        action: workflow::WorkflowCommand,
    },

    /// Execute a stored workflow and follow it until it settles.
    Run {
        /// Workflow ID.
        workflow_id: String,

        /// Input value as `key=value` (repeatable). Values parse as JSON,
        /// falling back to a plain string.
        #[arg(short, long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,

        /// Base URL of the browser bridge (overrides `bridge_url` in config.toml).
        #[arg(long, env = "BASSET_BRIDGE_URL")]
        bridge: Option<String>,
    },

    /// Inspect and control executions.
    Exec {
        #[command(subcommand)]
        action: exec::ExecCommand,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}
