//! Ingestion provider: persists entities produced by `ingest` steps.
//!
//! [`IngestionProvider`] is the port; [`BoxIngestionProvider`] erases it for
//! runtime wiring, and [`KvIngestionProvider`] is the built-in implementation
//! that stores every entity as a JSON document in a [`KvStore`].

use std::future::Future;
use std::pin::Pin;

use basset_types::error::StepError;
use chrono::Utc;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::storage::KvStore;

/// Key prefix for ingested entities: `entity:{type}:{id}`.
pub const ENTITY_KEY_PREFIX: &str = "entity:";

/// Persists a typed entity and returns `{ "id": ... }`.
pub trait IngestionProvider: Send + Sync {
    fn ingest(
        &self,
        entity_type: &str,
        data: &Value,
    ) -> impl Future<Output = Result<Value, StepError>> + Send;
}

// ---------------------------------------------------------------------------
// Dynamic dispatch
// ---------------------------------------------------------------------------

/// Object-safe version of [`IngestionProvider`] with boxed futures.
pub trait IngestionProviderDyn: Send + Sync {
    fn ingest_boxed<'a>(
        &'a self,
        entity_type: &'a str,
        data: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value, StepError>> + Send + 'a>>;
}

impl<T: IngestionProvider> IngestionProviderDyn for T {
    fn ingest_boxed<'a>(
        &'a self,
        entity_type: &'a str,
        data: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value, StepError>> + Send + 'a>> {
        Box::pin(self.ingest(entity_type, data))
    }
}

/// Type-erased ingestion provider.
pub struct BoxIngestionProvider {
    inner: Box<dyn IngestionProviderDyn + Send + Sync>,
}

impl BoxIngestionProvider {
    pub fn new<T: IngestionProvider + 'static>(provider: T) -> Self {
        Self {
            inner: Box::new(provider),
        }
    }

    pub async fn ingest(&self, entity_type: &str, data: &Value) -> Result<Value, StepError> {
        self.inner.ingest_boxed(entity_type, data).await
    }
}

impl std::fmt::Debug for BoxIngestionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxIngestionProvider").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// KvIngestionProvider
// ---------------------------------------------------------------------------

/// Stores entities under `entity:{type}:{uuid-v7}`.
pub struct KvIngestionProvider<K: KvStore> {
    store: K,
}

impl<K: KvStore> KvIngestionProvider<K> {
    pub fn new(store: K) -> Self {
        Self { store }
    }

    /// Build the storage key of an entity.
    pub fn entity_key(entity_type: &str, id: &Uuid) -> String {
        format!("{ENTITY_KEY_PREFIX}{entity_type}:{id}")
    }
}

impl<K: KvStore> IngestionProvider for KvIngestionProvider<K> {
    async fn ingest(&self, entity_type: &str, data: &Value) -> Result<Value, StepError> {
        if entity_type.is_empty() || entity_type.contains(':') {
            return Err(StepError::validation(format!(
                "invalid entity type '{entity_type}'"
            )));
        }

        let id = Uuid::now_v7();
        let record = json!({
            "id": id,
            "entity_type": entity_type,
            "data": data,
            "ingested_at": Utc::now(),
        });

        self.store
            .set(&Self::entity_key(entity_type, &id), &record)
            .await
            .map_err(|e| StepError::provider(format!("failed to store entity: {e}")))?;

        tracing::debug!(entity_type, entity_id = %id, "ingested entity");
        Ok(json!({ "id": id }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryKvStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_ingest_stores_entity_under_typed_key() {
        let store = Arc::new(InMemoryKvStore::new());
        let provider = KvIngestionProvider::new(Arc::clone(&store));

        let result = provider
            .ingest("profile", &json!({"username": "alice"}))
            .await
            .unwrap();
        let id: Uuid = serde_json::from_value(result["id"].clone()).unwrap();

        let key = KvIngestionProvider::<Arc<InMemoryKvStore>>::entity_key("profile", &id);
        let stored = store.get(&key).await.unwrap().unwrap();
        assert_eq!(stored["data"]["username"], "alice");
        assert_eq!(stored["entity_type"], "profile");
        assert_eq!(store.list_keys("entity:profile:").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ingest_rejects_bad_entity_type() {
        let provider = KvIngestionProvider::new(InMemoryKvStore::new());
        let err = provider.ingest("a:b", &json!({})).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_boxed_ingestion_delegates() {
        let boxed = BoxIngestionProvider::new(KvIngestionProvider::new(InMemoryKvStore::new()));
        let result = boxed.ingest("domain", &json!("example.com")).await.unwrap();
        assert!(result["id"].is_string());
    }
}
