//! In-memory key-value store backed by a `DashMap`.
//!
//! Used for ephemeral runs (`basset run --ephemeral`) and throughout the test
//! suites. Nothing survives the process.

use basset_types::error::RepositoryError;
use dashmap::DashMap;
use serde_json::Value;

use super::kv_store::KvStore;

/// Process-local [`KvStore`] implementation.
#[derive(Debug, Default)]
pub struct InMemoryKvStore {
    entries: DashMap<String, Value>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, RepositoryError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn set(&self, key: &str, value: &Value) -> Result<(), RepositoryError> {
        self.entries.insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), RepositoryError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, RepositoryError> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = InMemoryKvStore::new();
        store.set("workflow:a", &json!({"name": "a"})).await.unwrap();

        let value = store.get("workflow:a").await.unwrap();
        assert_eq!(value, Some(json!({"name": "a"})));

        store.delete("workflow:a").await.unwrap();
        assert!(store.get("workflow:a").await.unwrap().is_none());
        // Deleting a missing key is a no-op
        store.delete("workflow:a").await.unwrap();
    }

    #[tokio::test]
    async fn test_set_overwrites() {
        let store = InMemoryKvStore::new();
        store.set("k", &json!(1)).await.unwrap();
        store.set("k", &json!(2)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(json!(2)));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_list_keys_by_prefix_sorted() {
        let store = InMemoryKvStore::new();
        store.set("execution:b", &json!({})).await.unwrap();
        store.set("execution:a", &json!({})).await.unwrap();
        store.set("workflow:x", &json!({})).await.unwrap();

        let keys = store.list_keys("execution:").await.unwrap();
        assert_eq!(keys, vec!["execution:a", "execution:b"]);
        assert_eq!(store.list_keys("").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_shared_store_through_arc() {
        let store = std::sync::Arc::new(InMemoryKvStore::new());
        let shared = std::sync::Arc::clone(&store);
        KvStore::set(&shared, "k", &json!("v")).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(json!("v")));
    }
}
