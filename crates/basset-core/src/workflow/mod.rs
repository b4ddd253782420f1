//! Workflow engine core: definitions, execution state and the executors.
//!
//! - `definition` -- YAML/JSON parsing, validation, input binding, file load/save
//! - `substitution` -- `${name.path}` reference resolution with cycle detection
//! - `expression` -- JEXL evaluator for conditions, predicates and scripts
//! - `context` -- Execution context: lifecycle, variables, results, evidence
//! - `retry` -- Error classification and backoff decisions
//! - `checkpoint` -- Durable execution records in the KV store
//! - `keyed_lock` -- Per-execution async locks
//! - `registry` -- Live execution handles and control signals
//! - `step_executor` -- Dispatchers for all 13 step kinds
//! - `executor` -- Orchestration of whole runs with pause/resume/cancel

pub mod checkpoint;
pub mod context;
pub mod definition;
pub mod executor;
pub mod expression;
pub mod keyed_lock;
pub mod registry;
pub mod retry;
pub mod step_executor;
pub mod substitution;
