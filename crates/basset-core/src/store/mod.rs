//! Workflow definition store.
//!
//! - `workflow_store` -- CRUD, search and cloning of definitions over a `KvStore`

pub mod workflow_store;

pub use workflow_store::{StoreError, WORKFLOW_KEY_PREFIX, WorkflowStore};
