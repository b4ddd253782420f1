//! Execution inspection and control subcommands.

use std::time::Duration;

use anyhow::{Context, Result};
use basset_core::workflow::context::ExecutionContext;
use basset_types::execution::{ExecutionFilter, ExecutionState, ExecutionStatus};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::{StyledObject, style};
use uuid::Uuid;

use super::run::follow_execution;
use crate::state::AppState;

/// Execution subcommands.
#[derive(Subcommand)]
pub enum ExecCommand {
    /// List executions, newest first.
    #[command(alias = "ls")]
    List {
        /// Only executions with this status.
        #[arg(long)]
        status: Option<ExecutionStatus>,

        /// Only executions of this workflow.
        #[arg(long)]
        workflow: Option<String>,

        /// Maximum number of executions to show.
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Show the status of one execution.
    Status {
        /// Execution UUID.
        id: String,

        /// Print the full execution record (variables, step results, evidence).
        #[arg(long)]
        full: bool,
    },

    /// Resume a paused execution and follow it.
    Resume {
        /// Execution UUID.
        id: String,

        /// Base URL of the browser bridge (overrides `bridge_url` in config.toml).
        #[arg(long, env = "BASSET_BRIDGE_URL")]
        bridge: Option<String>,
    },

    /// Cancel a pending or paused execution.
    Cancel {
        /// Execution UUID.
        id: String,

        /// Reason recorded on the execution.
        #[arg(long)]
        reason: Option<String>,
    },

    /// Delete finished executions older than the retention window.
    Cleanup {
        /// Retention in hours (defaults to `retention_hours` from config.toml).
        #[arg(long)]
        hours: Option<u64>,
    },
}

/// Handle an execution subcommand.
pub async fn handle_exec_command(
    cmd: ExecCommand,
    state: &AppState,
    quiet: bool,
    json: bool,
) -> Result<()> {
    match cmd {
        ExecCommand::List {
            status,
            workflow,
            limit,
        } => {
            let filter = ExecutionFilter {
                status,
                workflow_id: workflow,
                limit: Some(limit),
                ..Default::default()
            };
            handle_list(&filter, state, json).await
        }
        ExecCommand::Status { id, full } => handle_status(&id, full, state, json).await,
        ExecCommand::Resume { id, .. } => {
            let execution_id = parse_execution_id(&id)?;
            let events = state.executor.event_bus().subscribe();
            state
                .executor
                .resume(execution_id)
                .await
                .with_context(|| format!("Failed to resume execution {execution_id}"))?;
            follow_execution(state, execution_id, events, quiet, json).await
        }
        ExecCommand::Cancel { id, reason } => handle_cancel(&id, reason, state, json).await,
        ExecCommand::Cleanup { hours } => handle_cleanup(hours, state, json).await,
    }
}

fn parse_execution_id(id: &str) -> Result<Uuid> {
    Uuid::parse_str(id).with_context(|| format!("Invalid execution ID: {id}"))
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

async fn handle_list(filter: &ExecutionFilter, state: &AppState, json: bool) -> Result<()> {
    let summaries = state.executor.list_executions(filter).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }

    if summaries.is_empty() {
        println!();
        println!("  No executions found.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Execution"),
            Cell::new("Workflow").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Progress"),
            Cell::new("Errors"),
            Cell::new("Started"),
            Cell::new("Duration"),
        ]);

    for summary in &summaries {
        table.add_row(vec![
            Cell::new(summary.execution_id),
            Cell::new(&summary.workflow_name).fg(Color::Cyan),
            Cell::new(summary.status).fg(status_color(summary.status)),
            Cell::new(format!(
                "{}/{} ({:.0}%)",
                summary.completed_steps, summary.total_steps, summary.progress
            )),
            Cell::new(summary.error_count),
            Cell::new(
                summary
                    .start_time
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ),
            Cell::new(format_duration(summary.duration_ms)),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

async fn handle_status(id: &str, full: bool, state: &AppState, json: bool) -> Result<()> {
    let execution_id = parse_execution_id(id)?;
    let execution = state.executor.get_state(execution_id).await?;

    if full && json {
        println!("{}", serde_json::to_string_pretty(&execution)?);
        return Ok(());
    }
    print_execution(&execution, json)?;

    if full && !json {
        println!("  {}", style("Variables").bold());
        println!("{}", indent(&serde_json::to_string_pretty(&execution.variables)?));
        println!();
        println!("  {}", style("Step results").bold());
        println!("{}", indent(&serde_json::to_string_pretty(&execution.step_results)?));
        println!();
    }
    Ok(())
}

/// Print the settled or current state of an execution.
///
/// JSON mode prints the status summary plus outputs.
pub fn print_execution(execution: &ExecutionState, json: bool) -> Result<()> {
    let summary = ExecutionContext::from_state(execution.clone()).summary();

    if json {
        let mut out = serde_json::to_value(&summary)?;
        out["outputs"] = serde_json::Value::Object(execution.outputs.clone());
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {}",
        style(&summary.workflow_name).cyan().bold(),
        styled_status(summary.status)
    );
    println!("  Execution: {}", summary.execution_id);
    println!(
        "  Progress: {}/{} steps ({:.0}%)",
        summary.completed_steps, summary.total_steps, summary.progress
    );
    println!("  Duration: {}", format_duration(summary.duration_ms));
    if summary.error_count > 0 {
        println!("  Errors: {}", summary.error_count);
    }

    if let Some(info) = &execution.error_info {
        let step = info.step_id.as_deref().unwrap_or("-");
        println!(
            "  {} [{}] step {step} after {} attempt(s): {}",
            style("Error:").red().bold(),
            info.kind.as_str(),
            info.attempts,
            info.message
        );
    }
    if let Some(reason) = &execution.cancel_reason {
        println!("  Cancel reason: {reason}");
    }
    if execution.status == ExecutionStatus::Paused {
        println!(
            "  Resume with: {}",
            style(format!("basset exec resume {}", summary.execution_id)).dim()
        );
    }

    if !execution.outputs.is_empty() {
        println!();
        println!("  {}", style("Outputs").bold());
        for (name, value) in &execution.outputs {
            println!("    {} = {value}", style(name).cyan());
        }
    }

    if !execution.evidence.is_empty() {
        println!();
        println!("  {}", style("Evidence").bold());
        for evidence in &execution.evidence {
            println!(
                "    {} {} {}",
                style(&evidence.kind).dim(),
                evidence.step_id,
                evidence.label.as_deref().unwrap_or("")
            );
        }
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Cancel / Cleanup
// ---------------------------------------------------------------------------

async fn handle_cancel(
    id: &str,
    reason: Option<String>,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let execution_id = parse_execution_id(id)?;
    state
        .executor
        .cancel(execution_id, reason)
        .await
        .with_context(|| format!("Failed to cancel execution {execution_id}"))?;

    if json {
        let out = serde_json::json!({
            "execution_id": execution_id.to_string(),
            "cancelled": true,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!(
            "  {} Cancelled execution {}",
            style("*").green().bold(),
            execution_id
        );
    }
    Ok(())
}

async fn handle_cleanup(hours: Option<u64>, state: &AppState, json: bool) -> Result<()> {
    let hours = hours.unwrap_or(state.config.retention_hours);
    let removed = state
        .executor
        .cleanup(Duration::from_secs(hours.saturating_mul(3600)))
        .await?;

    if json {
        let out = serde_json::json!({ "removed": removed, "retention_hours": hours });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!(
            "  {} Removed {} execution(s) older than {}h",
            style("*").green().bold(),
            removed,
            hours
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Formatting helpers
// ---------------------------------------------------------------------------

fn status_color(status: ExecutionStatus) -> Color {
    match status {
        ExecutionStatus::Pending => Color::Grey,
        ExecutionStatus::Running => Color::Blue,
        ExecutionStatus::Paused => Color::Yellow,
        ExecutionStatus::Completed => Color::Green,
        ExecutionStatus::Failed => Color::Red,
        ExecutionStatus::Cancelled => Color::DarkGrey,
    }
}

fn styled_status(status: ExecutionStatus) -> StyledObject<&'static str> {
    let label = style(status.as_str());
    match status {
        ExecutionStatus::Pending | ExecutionStatus::Cancelled => label.dim(),
        ExecutionStatus::Running => label.blue(),
        ExecutionStatus::Paused => label.yellow(),
        ExecutionStatus::Completed => label.green(),
        ExecutionStatus::Failed => label.red(),
    }
}

fn format_duration(duration_ms: Option<u64>) -> String {
    match duration_ms {
        None => "-".to_string(),
        Some(ms) if ms < 1_000 => format!("{ms}ms"),
        Some(ms) if ms < 60_000 => format!("{:.1}s", ms as f64 / 1_000.0),
        Some(ms) => format!("{}m {}s", ms / 60_000, (ms % 60_000) / 1_000),
    }
}

fn indent(text: &str) -> String {
    text.lines()
        .map(|line| format!("    {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}
