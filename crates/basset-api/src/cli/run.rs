//! `basset run`: start an execution and follow its events until it settles.
//!
//! The first Ctrl-C pauses the execution at its next step boundary so it can
//! be continued later with `basset exec resume`; a second Ctrl-C cancels it.

use anyhow::{Context, Result, bail};
use basset_types::event::ExecutionEvent;
use basset_types::execution::ExecutionStatus;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use super::exec::print_execution;
use crate::state::AppState;

/// Execute `workflow_id` with `key=value` inputs and wait for the outcome.
pub async fn run_workflow(
    state: &AppState,
    workflow_id: &str,
    raw_inputs: &[String],
    quiet: bool,
    json: bool,
) -> Result<()> {
    let inputs = parse_inputs(raw_inputs)?;

    // Subscribe before starting so the first events are not missed.
    let events = state.executor.event_bus().subscribe();
    let execution_id = state
        .executor
        .execute(workflow_id, inputs)
        .await
        .with_context(|| format!("Failed to start workflow '{workflow_id}'"))?;

    if !quiet && !json {
        println!();
        println!(
            "  {} Running '{}' against {}",
            style("*").green().bold(),
            style(workflow_id).cyan(),
            style(&state.bridge_url).dim()
        );
        println!("  Execution: {execution_id}");
        println!();
    }

    follow_execution(state, execution_id, events, quiet, json).await
}

/// Stream progress for a live execution, then print its settled state.
///
/// Fails when the execution ends in `failed`.
pub async fn follow_execution(
    state: &AppState,
    execution_id: Uuid,
    mut events: broadcast::Receiver<ExecutionEvent>,
    quiet: bool,
    json: bool,
) -> Result<()> {
    let spinner = if quiet || json {
        None
    } else {
        Some(progress_spinner()?)
    };
    let mut interrupts = 0u8;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) if event.execution_id() == execution_id => {
                    if let Some(spinner) = &spinner {
                        report_event(spinner, &event);
                    }
                    if event.is_terminal()
                        || matches!(event, ExecutionEvent::ExecutionPaused { .. })
                    {
                        break;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "progress display fell behind");
                    if !state.executor.registry().contains(&execution_id) {
                        break;
                    }
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                interrupts += 1;
                let outcome = if interrupts == 1 {
                    if let Some(spinner) = &spinner {
                        spinner.set_message("pausing at the next step (Ctrl-C again to cancel)");
                    }
                    state.executor.pause(execution_id).await
                } else {
                    state
                        .executor
                        .cancel(execution_id, Some("interrupted".to_string()))
                        .await
                };
                if let Err(e) = outcome {
                    tracing::debug!(execution_id = %execution_id, "interrupt ignored: {e}");
                }
            }
        }
    }

    if let Some(spinner) = spinner {
        spinner.finish_and_clear();
    }

    let final_state = state.executor.wait(execution_id).await?;
    print_execution(&final_state, json)?;

    if final_state.status == ExecutionStatus::Failed {
        let reason = final_state
            .error_info
            .as_ref()
            .map(|e| e.message.clone())
            .unwrap_or_else(|| "unknown error".to_string());
        bail!("Execution {execution_id} failed: {reason}");
    }
    Ok(())
}

fn progress_spinner() -> Result<ProgressBar> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner().template("  {spinner:.cyan} {msg}")?);
    spinner.enable_steady_tick(std::time::Duration::from_millis(80));
    spinner.set_message("starting...");
    Ok(spinner)
}

fn report_event(spinner: &ProgressBar, event: &ExecutionEvent) {
    match event {
        ExecutionEvent::ExecutionStarted { total_steps, .. } => {
            spinner.set_message(format!("running ({total_steps} steps)"));
        }
        ExecutionEvent::ExecutionResumed { .. } => {
            spinner.set_message("resumed");
        }
        ExecutionEvent::StepStarted {
            step_id, step_type, ..
        } => {
            spinner.set_message(format!("{step_id} ({step_type})"));
        }
        ExecutionEvent::StepCompleted {
            step_id,
            duration_ms,
            ..
        } => {
            spinner.println(format!(
                "  {} {step_id} {}",
                style("ok").green(),
                style(format!("{duration_ms}ms")).dim()
            ));
        }
        ExecutionEvent::StepFailed {
            step_id,
            kind,
            error,
            will_retry,
            ..
        } => {
            let label = if *will_retry {
                style("retry").yellow()
            } else {
                style("fail").red()
            };
            spinner.println(format!(
                "  {label} {step_id} [{}] {error}",
                kind.as_str()
            ));
        }
        ExecutionEvent::RetryScheduled {
            step_id,
            attempt,
            delay_ms,
            ..
        } => {
            spinner.set_message(format!(
                "{step_id}: attempt {attempt} in {delay_ms}ms"
            ));
        }
        ExecutionEvent::ExecutionPaused { .. }
        | ExecutionEvent::ExecutionCompleted { .. }
        | ExecutionEvent::ExecutionFailed { .. }
        | ExecutionEvent::ExecutionCancelled { .. } => {}
    }
}

// ---------------------------------------------------------------------------
// Input parsing
// ---------------------------------------------------------------------------

/// Parse `key=value` pairs. Values parse as JSON, falling back to a string.
pub fn parse_inputs(raw: &[String]) -> Result<Map<String, Value>> {
    let mut inputs = Map::new();
    for pair in raw {
        let (key, value) = parse_input(pair)?;
        inputs.insert(key, value);
    }
    Ok(inputs)
}

fn parse_input(pair: &str) -> Result<(String, Value)> {
    let Some((key, raw)) = pair.split_once('=') else {
        bail!("Invalid input '{pair}': expected KEY=VALUE");
    };
    let key = key.trim();
    if key.is_empty() {
        bail!("Invalid input '{pair}': empty key");
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_input_json_values() {
        assert_eq!(parse_input("count=3").unwrap(), ("count".to_string(), json!(3)));
        assert_eq!(parse_input("flag=true").unwrap().1, json!(true));
        assert_eq!(parse_input("ids=[1,2]").unwrap().1, json!([1, 2]));
        assert_eq!(parse_input("q=\"7\"").unwrap().1, json!("7"));
    }

    #[test]
    fn test_parse_input_falls_back_to_string() {
        assert_eq!(
            parse_input("url=https://example.com/?a=b").unwrap(),
            ("url".to_string(), json!("https://example.com/?a=b"))
        );
        assert_eq!(parse_input("empty=").unwrap().1, json!(""));
    }

    #[test]
    fn test_parse_input_rejects_malformed_pairs() {
        assert!(parse_input("novalue").is_err());
        assert!(parse_input("=value").is_err());
    }

    #[test]
    fn test_later_inputs_override_earlier() {
        let raw = vec!["a=1".to_string(), "a=2".to_string(), "b=x".to_string()];
        let inputs = parse_inputs(&raw).unwrap();
        assert_eq!(inputs["a"], json!(2));
        assert_eq!(inputs["b"], json!("x"));
    }
}
