//! Registry of live execution handles.
//!
//! An execution is "live" while a task is driving it. Its [`ExecutionHandle`]
//! carries the cooperative control signals (pause request, cancellation
//! token) the step executor checks before every dispatch, plus a watch
//! channel with the latest state snapshot for status queries.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use basset_types::execution::ExecutionState;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// ExecutionSignals
// ---------------------------------------------------------------------------

/// Cooperative control signals for one execution.
///
/// Cheap to clone; all clones observe the same signals.
#[derive(Debug, Clone, Default)]
pub struct ExecutionSignals {
    cancel: CancellationToken,
    pause: Arc<AtomicBool>,
}

impl ExecutionSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the execution to stop at its next step boundary.
    pub fn request_pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
    }

    pub fn clear_pause(&self) {
        self.pause.store(false, Ordering::SeqCst);
    }

    pub fn pause_requested(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}

// ---------------------------------------------------------------------------
// ExecutionHandle
// ---------------------------------------------------------------------------

/// Control and observation handle of a live execution.
#[derive(Debug)]
pub struct ExecutionHandle {
    execution_id: Uuid,
    signals: ExecutionSignals,
    snapshot: watch::Sender<ExecutionState>,
    cancel_reason: std::sync::Mutex<Option<String>>,
}

impl ExecutionHandle {
    pub fn new(state: ExecutionState) -> Self {
        let (snapshot, _) = watch::channel(state.clone());
        Self {
            execution_id: state.execution_id,
            signals: ExecutionSignals::new(),
            snapshot,
            cancel_reason: std::sync::Mutex::new(None),
        }
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn signals(&self) -> &ExecutionSignals {
        &self.signals
    }

    /// Latest published state.
    pub fn snapshot(&self) -> ExecutionState {
        self.snapshot.borrow().clone()
    }

    pub fn publish(&self, state: &ExecutionState) {
        self.snapshot.send_replace(state.clone());
    }

    pub fn subscribe(&self) -> watch::Receiver<ExecutionState> {
        self.snapshot.subscribe()
    }

    /// Cancel the execution, remembering why.
    pub fn cancel(&self, reason: impl Into<String>) {
        if let Ok(mut slot) = self.cancel_reason.lock() {
            slot.get_or_insert_with(|| reason.into());
        }
        self.signals.cancel();
    }

    pub fn cancel_reason(&self) -> Option<String> {
        self.cancel_reason.lock().ok().and_then(|slot| slot.clone())
    }
}

// ---------------------------------------------------------------------------
// ExecutionRegistry
// ---------------------------------------------------------------------------

/// Errors from registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("execution {0} is already running")]
    AlreadyRunning(Uuid),
}

/// Live handles keyed by execution ID. At most one handle per ID.
#[derive(Debug, Default)]
pub struct ExecutionRegistry {
    handles: DashMap<Uuid, Arc<ExecutionHandle>>,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: Arc<ExecutionHandle>) -> Result<(), RegistryError> {
        match self.handles.entry(handle.execution_id()) {
            Entry::Occupied(entry) => Err(RegistryError::AlreadyRunning(*entry.key())),
            Entry::Vacant(entry) => {
                entry.insert(handle);
                Ok(())
            }
        }
    }

    pub fn get(&self, execution_id: &Uuid) -> Option<Arc<ExecutionHandle>> {
        self.handles.get(execution_id).map(|h| Arc::clone(h.value()))
    }

    pub fn remove(&self, execution_id: &Uuid) -> Option<Arc<ExecutionHandle>> {
        self.handles.remove(execution_id).map(|(_, handle)| handle)
    }

    pub fn contains(&self, execution_id: &Uuid) -> bool {
        self.handles.contains_key(execution_id)
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.handles.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::definition;
    use crate::workflow::context::ExecutionContext;
    use serde_json::Map;

    fn handle() -> Arc<ExecutionHandle> {
        let ctx = ExecutionContext::new(definition(Vec::new()), Map::new());
        Arc::new(ExecutionHandle::new(ctx.into_state()))
    }

    #[test]
    fn test_one_handle_per_id() {
        let registry = ExecutionRegistry::new();
        let h = handle();
        registry.register(Arc::clone(&h)).unwrap();
        assert!(matches!(
            registry.register(Arc::clone(&h)),
            Err(RegistryError::AlreadyRunning(id)) if id == h.execution_id()
        ));
        assert_eq!(registry.len(), 1);

        registry.remove(&h.execution_id());
        assert!(registry.is_empty());
        registry.register(h).unwrap();
    }

    #[test]
    fn test_signals_shared_across_clones() {
        let signals = ExecutionSignals::new();
        let clone = signals.clone();
        clone.request_pause();
        assert!(signals.pause_requested());
        signals.clear_pause();
        assert!(!clone.pause_requested());

        clone.cancel();
        assert!(signals.is_cancelled());
    }

    #[test]
    fn test_cancel_keeps_first_reason() {
        let h = handle();
        h.cancel("first");
        h.cancel("second");
        assert_eq!(h.cancel_reason().as_deref(), Some("first"));
        assert!(h.signals().is_cancelled());
    }

    #[tokio::test]
    async fn test_snapshot_publish_and_subscribe() {
        let h = handle();
        let mut rx = h.subscribe();
        let mut state = h.snapshot();
        state.variables.insert("x".to_string(), serde_json::json!(1));
        h.publish(&state);

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().variables["x"], 1);
        assert_eq!(h.snapshot().variables["x"], 1);
    }
}
