//! Workflow definition subcommands.
//!
//! Every store operation answers with a `{success, data | error, timestamp}`
//! envelope; `--json` prints that envelope verbatim.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use basset_core::workflow::definition::{
    count_steps, load_workflow_file, save_workflow_file, serialize_workflow_yaml,
};
use basset_types::store::{SortField, SortOrder, StoreResponse, WorkflowQuery};
use basset_types::workflow::WorkflowDefinition;
use clap::{Subcommand, ValueEnum};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use dialoguer::Confirm;
use serde::Serialize;

use crate::state::AppState;

/// Workflow management subcommands.
#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// Store a workflow from a YAML or JSON file.
    Create {
        /// Path to the definition (`.json` is JSON, anything else YAML).
        file: PathBuf,

        /// Store under this ID instead of the one in the file.
        #[arg(long)]
        id: Option<String>,
    },

    /// Replace a stored workflow with the contents of a file.
    Update {
        /// Workflow ID.
        id: String,

        /// Path to the new definition.
        file: PathBuf,
    },

    /// List stored workflows.
    #[command(alias = "ls")]
    List,

    /// Show a stored workflow.
    Show {
        /// Workflow ID.
        id: String,

        /// Print the full definition as YAML.
        #[arg(long)]
        yaml: bool,
    },

    /// Search workflows by text and tags.
    Search {
        /// Case-insensitive text matched against name, description and tags.
        text: Option<String>,

        /// Required tag (repeatable; all must match).
        #[arg(short, long = "tag")]
        tags: Vec<String>,

        /// Sort field.
        #[arg(long, value_enum, default_value_t = SortArg::Updated)]
        sort: SortArg,

        /// Sort ascending instead of descending.
        #[arg(long)]
        asc: bool,

        /// Number of results to skip.
        #[arg(long, default_value_t = 0)]
        offset: usize,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Copy a workflow under a new ID.
    Clone {
        /// Workflow ID to copy.
        id: String,

        /// Name of the copy (defaults to "<name> (copy)").
        #[arg(long)]
        name: Option<String>,
    },

    /// Delete a stored workflow.
    #[command(alias = "rm")]
    Delete {
        /// Workflow ID.
        id: String,

        /// Skip the confirmation prompt.
        #[arg(short, long)]
        force: bool,
    },

    /// Check a definition file without storing it.
    Validate {
        /// Path to the definition.
        file: PathBuf,
    },

    /// Write a stored workflow to a file.
    Export {
        /// Workflow ID.
        id: String,

        /// Destination (`.json` writes JSON, anything else YAML).
        file: PathBuf,
    },
}

/// Sort field accepted on the command line.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SortArg {
    Name,
    Created,
    Updated,
}

impl From<SortArg> for SortField {
    fn from(arg: SortArg) -> Self {
        match arg {
            SortArg::Name => SortField::Name,
            SortArg::Created => SortField::CreatedAt,
            SortArg::Updated => SortField::UpdatedAt,
        }
    }
}

/// Handle a workflow subcommand.
pub async fn handle_workflow_command(
    cmd: WorkflowCommand,
    state: &AppState,
    json: bool,
) -> Result<()> {
    match cmd {
        WorkflowCommand::Create { file, id } => handle_create(&file, id, state, json).await,
        WorkflowCommand::Update { id, file } => handle_update(&id, &file, state, json).await,
        WorkflowCommand::List => {
            let response = state.executor.workflows().list().await;
            print_workflows(response, json)
        }
        WorkflowCommand::Show { id, yaml } => handle_show(&id, yaml, state, json).await,
        WorkflowCommand::Search {
            text,
            tags,
            sort,
            asc,
            offset,
            limit,
        } => {
            let query = WorkflowQuery {
                text,
                tags,
                sort_by: sort.into(),
                order: if asc { SortOrder::Asc } else { SortOrder::Desc },
                offset,
                limit,
            };
            let response = state.executor.workflows().search(&query).await;
            print_workflows(response, json)
        }
        WorkflowCommand::Clone { id, name } => handle_clone(&id, name, state, json).await,
        WorkflowCommand::Delete { id, force } => handle_delete(&id, force, state, json).await,
        WorkflowCommand::Validate { file } => handle_validate(&file, json),
        WorkflowCommand::Export { id, file } => handle_export(&id, &file, state, json).await,
    }
}

// ---------------------------------------------------------------------------
// Create / Update
// ---------------------------------------------------------------------------

fn load_file(file: &Path) -> Result<WorkflowDefinition> {
    load_workflow_file(file).with_context(|| format!("Failed to load {}", file.display()))
}

async fn handle_create(
    file: &Path,
    id: Option<String>,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let mut def = load_file(file)?;
    if let Some(id) = id {
        def.id = id;
    }

    let response = state.executor.workflows().create(def).await;
    let def = unwrap_response(response, json)?;

    if !json {
        println!();
        println!(
            "  {} Created workflow '{}'",
            style("*").green().bold(),
            style(&def.name).cyan()
        );
        print_definition_brief(&def);
        println!();
        println!(
            "  Run it with: {}",
            style(format!("basset run {}", def.id)).dim()
        );
        println!();
    }
    Ok(())
}

async fn handle_update(id: &str, file: &Path, state: &AppState, json: bool) -> Result<()> {
    let def = load_file(file)?;
    let response = state.executor.workflows().update(id, def).await;
    let def = unwrap_response(response, json)?;

    if !json {
        println!();
        println!(
            "  {} Updated workflow '{}'",
            style("*").green().bold(),
            style(&def.name).cyan()
        );
        print_definition_brief(&def);
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// List / Search
// ---------------------------------------------------------------------------

fn print_workflows(response: StoreResponse<Vec<WorkflowDefinition>>, json: bool) -> Result<()> {
    let defs = unwrap_response(response, json)?;
    if json {
        return Ok(());
    }

    if defs.is_empty() {
        println!();
        println!("  No workflows found.");
        println!(
            "  Create one with: {}",
            style("basset workflow create <file.yaml>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID"),
            Cell::new("Name").fg(Color::Cyan),
            Cell::new("Version"),
            Cell::new("Steps"),
            Cell::new("Tags"),
            Cell::new("Updated"),
        ]);

    for def in &defs {
        table.add_row(vec![
            Cell::new(&def.id),
            Cell::new(&def.name).fg(Color::Cyan),
            Cell::new(&def.version),
            Cell::new(count_steps(&def.steps)),
            Cell::new(def.tags.join(", ")),
            Cell::new(def.updated_at.format("%Y-%m-%d %H:%M")),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Show
// ---------------------------------------------------------------------------

async fn handle_show(id: &str, yaml: bool, state: &AppState, json: bool) -> Result<()> {
    let response = state.executor.workflows().get(id).await;
    let def = unwrap_response(response, json)?;
    if json {
        return Ok(());
    }

    if yaml {
        print!("{}", serialize_workflow_yaml(&def)?);
        return Ok(());
    }

    println!();
    println!("  {}", style(&def.name).cyan().bold());
    if let Some(description) = &def.description {
        println!("  {}", style(description).dim());
    }
    println!();
    print_definition_brief(&def);
    println!("  Created: {}", def.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("  Updated: {}", def.updated_at.format("%Y-%m-%d %H:%M:%S"));

    if !def.inputs.is_empty() {
        println!();
        println!("  {}", style("Inputs").bold());
        for input in &def.inputs {
            let required = if input.required && input.default.is_none() {
                style("required").yellow().to_string()
            } else {
                style("optional").dim().to_string()
            };
            println!(
                "    {} ({:?}, {required})",
                style(&input.name).cyan(),
                input.input_type
            );
        }
    }

    println!();
    println!("  {}", style("Steps").bold());
    for (index, step) in def.steps.iter().enumerate() {
        println!(
            "    {:>2}. {} {}",
            index + 1,
            style(step.action.kind()).dim(),
            step.display_name()
        );
    }

    if !def.outputs.is_empty() {
        println!();
        println!("  {}", style("Outputs").bold());
        let mut outputs: Vec<_> = def.outputs.iter().collect();
        outputs.sort();
        for (name, path) in outputs {
            println!("    {} <- {}", style(name).cyan(), path);
        }
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Clone / Delete / Export
// ---------------------------------------------------------------------------

async fn handle_clone(
    id: &str,
    name: Option<String>,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let response = state.executor.workflows().clone_workflow(id, name).await;
    let def = unwrap_response(response, json)?;

    if !json {
        println!();
        println!(
            "  {} Cloned '{}' as '{}'",
            style("*").green().bold(),
            id,
            style(&def.name).cyan()
        );
        println!("  ID: {}", def.id);
        println!();
    }
    Ok(())
}

async fn handle_delete(id: &str, force: bool, state: &AppState, json: bool) -> Result<()> {
    if !force && !json {
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Permanently delete workflow '{}'?",
                style(id).red().bold()
            ))
            .default(false)
            .interact()?;

        if !confirmed {
            println!("  Cancelled.");
            return Ok(());
        }
    }

    let response = state.executor.workflows().delete(id).await;
    let deleted = unwrap_response(response, json)?;

    if !json {
        println!(
            "  {} Deleted workflow '{}'",
            style("*").green().bold(),
            deleted
        );
    }
    Ok(())
}

async fn handle_export(id: &str, file: &Path, state: &AppState, json: bool) -> Result<()> {
    let def = state
        .executor
        .workflows()
        .get(id)
        .await
        .into_result()
        .map_err(anyhow::Error::msg)?;
    save_workflow_file(file, &def)
        .with_context(|| format!("Failed to write {}", file.display()))?;

    if json {
        let out = serde_json::json!({
            "id": def.id,
            "path": file.display().to_string(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!(
            "  {} Exported '{}' to {}",
            style("*").green().bold(),
            style(&def.name).cyan(),
            file.display()
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

fn handle_validate(file: &Path, json: bool) -> Result<()> {
    let result = load_workflow_file(file);

    if json {
        let out = match &result {
            Ok(def) => serde_json::json!({
                "valid": true,
                "name": def.name,
                "steps": count_steps(&def.steps),
            }),
            Err(e) => serde_json::json!({ "valid": false, "error": e.to_string() }),
        };
        println!("{}", serde_json::to_string_pretty(&out)?);
    }

    match result {
        Ok(def) => {
            if !json {
                println!(
                    "  {} {} is valid ({} steps)",
                    style("*").green().bold(),
                    file.display(),
                    count_steps(&def.steps)
                );
            }
            Ok(())
        }
        Err(e) => bail!("{} is invalid: {e}", file.display()),
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Print the envelope in JSON mode, then unwrap it into the payload.
fn unwrap_response<T: Serialize>(response: StoreResponse<T>, json: bool) -> Result<T> {
    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    }
    response.into_result().map_err(anyhow::Error::msg)
}

fn print_definition_brief(def: &WorkflowDefinition) {
    println!("  ID: {}", def.id);
    println!("  Version: {}", def.version);
    println!("  Steps: {}", count_steps(&def.steps));
    if !def.tags.is_empty() {
        println!("  Tags: {}", def.tags.join(", "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_arg_maps_to_store_field() {
        assert_eq!(SortField::from(SortArg::Name), SortField::Name);
        assert_eq!(SortField::from(SortArg::Created), SortField::CreatedAt);
        assert_eq!(SortField::from(SortArg::Updated), SortField::UpdatedAt);
    }

    #[test]
    fn test_unwrap_response_surfaces_store_error() {
        let response: StoreResponse<String> = StoreResponse::err("workflow not found: nope");
        let err = unwrap_response(response, false).unwrap_err();
        assert_eq!(err.to_string(), "workflow not found: nope");

        let ok = unwrap_response(StoreResponse::ok(7), false).unwrap();
        assert_eq!(ok, 7);
    }
}
