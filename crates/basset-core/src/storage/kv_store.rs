//! Key-value store trait.
//!
//! Defines the interface for flat, string-keyed JSON storage. Workflow
//! definitions, execution records and ingested entities all live behind it
//! under their own key prefixes. Implementations live in basset-infra.

use std::future::Future;
use std::sync::Arc;

use basset_types::error::RepositoryError;
use serde_json::Value;

/// Trait for persistent key-value storage of JSON documents.
///
/// Uses RPITIT (native async fn in traits, Rust 2024 edition).
pub trait KvStore: Send + Sync {
    /// Get a value by key. Returns None if the key does not exist.
    fn get(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<Value>, RepositoryError>> + Send;

    /// Set a value for a key (upsert).
    fn set(
        &self,
        key: &str,
        value: &Value,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Delete a key. No-op if key does not exist.
    fn delete(&self, key: &str) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// List all keys starting with `prefix`, in ascending order.
    fn list_keys(
        &self,
        prefix: &str,
    ) -> impl Future<Output = Result<Vec<String>, RepositoryError>> + Send;
}

/// Shared stores delegate to the inner store.
impl<K: KvStore> KvStore for Arc<K> {
    fn get(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<Value>, RepositoryError>> + Send {
        (**self).get(key)
    }

    fn set(
        &self,
        key: &str,
        value: &Value,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send {
        (**self).set(key, value)
    }

    fn delete(&self, key: &str) -> impl Future<Output = Result<(), RepositoryError>> + Send {
        (**self).delete(key)
    }

    fn list_keys(
        &self,
        prefix: &str,
    ) -> impl Future<Output = Result<Vec<String>, RepositoryError>> + Send {
        (**self).list_keys(prefix)
    }
}
