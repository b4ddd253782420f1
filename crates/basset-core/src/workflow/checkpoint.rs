//! Durable checkpoint manager for execution state.
//!
//! Wraps a [`KvStore`] to persist whole [`ExecutionState`] documents under
//! `execution:{id}`. The executor saves after every top-level step and every
//! lifecycle transition so an interrupted run can resume from its last
//! checkpoint. Saves for the same execution are serialized: at most one is in
//! flight at a time.

use basset_types::execution::{ExecutionFilter, ExecutionState};
use uuid::Uuid;

use super::keyed_lock::KeyedLocks;
use crate::storage::KvStore;

/// Key prefix of persisted execution records.
pub const EXECUTION_KEY_PREFIX: &str = "execution:";

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Persists execution state through the key/value store.
///
/// Generic over `K: KvStore` so it works with any storage backend
/// (SQLite, in-memory, etc.).
pub struct CheckpointManager<K: KvStore> {
    store: K,
    save_locks: KeyedLocks,
}

impl<K: KvStore> CheckpointManager<K> {
    pub fn new(store: K) -> Self {
        Self {
            store,
            save_locks: KeyedLocks::new(),
        }
    }

    /// Access the underlying store.
    pub fn store(&self) -> &K {
        &self.store
    }

    pub fn execution_key(execution_id: &Uuid) -> String {
        format!("{EXECUTION_KEY_PREFIX}{execution_id}")
    }

    /// Write the full state, waiting for any in-flight save of the same
    /// execution to finish first.
    pub async fn save(&self, state: &ExecutionState) -> Result<(), CheckpointError> {
        let _guard = self.save_locks.lock(state.execution_id).await;

        let value = serde_json::to_value(state)
            .map_err(|e| CheckpointError::Serialization(e.to_string()))?;
        self.store
            .set(&Self::execution_key(&state.execution_id), &value)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(
            execution_id = %state.execution_id,
            status = %state.status,
            "checkpointed execution"
        );
        Ok(())
    }

    pub async fn load(
        &self,
        execution_id: &Uuid,
    ) -> Result<Option<ExecutionState>, CheckpointError> {
        let value = self
            .store
            .get(&Self::execution_key(execution_id))
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        value
            .map(|v| {
                serde_json::from_value(v).map_err(|e| CheckpointError::Serialization(e.to_string()))
            })
            .transpose()
    }

    pub async fn delete(&self, execution_id: &Uuid) -> Result<(), CheckpointError> {
        self.store
            .delete(&Self::execution_key(execution_id))
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(execution_id = %execution_id, "deleted execution checkpoint");
        Ok(())
    }

    /// Every persisted execution passing `filter`, newest first.
    ///
    /// Records that fail to deserialize are skipped with a warning.
    pub async fn list(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<ExecutionState>, CheckpointError> {
        let keys = self
            .store
            .list_keys(EXECUTION_KEY_PREFIX)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        let mut states = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(value) = self
                .store
                .get(&key)
                .await
                .map_err(|e| CheckpointError::Repository(e.to_string()))?
            else {
                continue;
            };
            match serde_json::from_value::<ExecutionState>(value) {
                Ok(state) if filter.matches(&state) => states.push(state),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(
                        key = key.as_str(),
                        error = %e,
                        "skipping corrupt execution record"
                    );
                }
            }
        }

        states.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            states.truncate(limit);
        }
        Ok(states)
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Underlying store operation failed.
    #[error("checkpoint repository error: {0}")]
    Repository(String),

    /// The record could not be encoded or decoded.
    #[error("checkpoint serialization error: {0}")]
    Serialization(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
