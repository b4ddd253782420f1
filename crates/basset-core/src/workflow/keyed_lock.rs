//! Per-execution async locks that do not outlive their users.
//!
//! Each key maps to a `tokio::sync::Mutex` created on first use. The map
//! entry is dropped again as soon as no guard holds it and no task waits on
//! it, so a long-lived process keeps entries only for executions with an
//! operation in flight.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Mutual exclusion keyed by execution ID.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: Uuid) -> KeyedGuard<'_> {
        let mutex = Arc::clone(self.locks.entry(key).or_default().value());
        let guard = mutex.lock_owned().await;
        KeyedGuard {
            key,
            locks: &self.locks,
            guard: Some(guard),
        }
    }

    /// Number of keys with a holder or waiter.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Exclusive access to one key; released on drop.
#[derive(Debug)]
pub struct KeyedGuard<'a> {
    key: Uuid,
    locks: &'a DashMap<Uuid, Arc<Mutex<()>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        // The owned guard holds its own `Arc`; release it before counting.
        self.guard.take();
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
