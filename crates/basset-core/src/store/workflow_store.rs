//! Workflow definition store over a key/value backend.
//!
//! Definitions live under `workflow:{id}`. Every public operation answers
//! with a [`StoreResponse`] envelope; failures become `success: false` with
//! a message instead of an `Err`.

use std::cmp::Ordering;

use basset_types::store::{SortField, SortOrder, StoreResponse, WorkflowQuery};
use basset_types::workflow::WorkflowDefinition;
use chrono::Utc;
use uuid::Uuid;

use crate::storage::KvStore;
use crate::workflow::definition::{DefinitionError, validate_definition};

/// Key prefix of stored workflow definitions.
pub const WORKFLOW_KEY_PREFIX: &str = "workflow:";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from workflow store operations, rendered into the envelope.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("workflow not found: {0}")]
    NotFound(String),

    #[error("workflow already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid workflow: {0}")]
    Invalid(#[from] DefinitionError),

    #[error("storage error: {0}")]
    Repository(String),

    #[error("corrupt workflow record '{key}': {message}")]
    Serialization { key: String, message: String },
}

// ---------------------------------------------------------------------------
// WorkflowStore
// ---------------------------------------------------------------------------

/// CRUD, search and cloning of workflow definitions.
///
/// Generic over `K: KvStore` so the same store runs on SQLite or in memory.
pub struct WorkflowStore<K: KvStore> {
    kv: K,
}

impl<K: KvStore> WorkflowStore<K> {
    pub fn new(kv: K) -> Self {
        Self { kv }
    }

    pub fn workflow_key(id: &str) -> String {
        format!("{WORKFLOW_KEY_PREFIX}{id}")
    }

    /// Store a new definition.
    ///
    /// An empty `id` is replaced by a generated UUID v7. Timestamps are set
    /// to now. Fails if the definition is invalid or the id is taken.
    pub async fn create(
        &self,
        definition: WorkflowDefinition,
    ) -> StoreResponse<WorkflowDefinition> {
        self.try_create(definition).await.into()
    }

    pub async fn get(&self, id: &str) -> StoreResponse<WorkflowDefinition> {
        self.try_get(id).await.into()
    }

    /// Replace an existing definition, keeping its id and creation time.
    pub async fn update(
        &self,
        id: &str,
        definition: WorkflowDefinition,
    ) -> StoreResponse<WorkflowDefinition> {
        self.try_update(id, definition).await.into()
    }

    /// Delete a definition, answering with the deleted id.
    pub async fn delete(&self, id: &str) -> StoreResponse<String> {
        self.try_delete(id).await.into()
    }

    /// All definitions, most recently updated first.
    pub async fn list(&self) -> StoreResponse<Vec<WorkflowDefinition>> {
        self.try_search(&WorkflowQuery::default()).await.into()
    }

    /// Filter, sort and paginate definitions.
    pub async fn search(&self, query: &WorkflowQuery) -> StoreResponse<Vec<WorkflowDefinition>> {
        self.try_search(query).await.into()
    }

    /// Copy a definition under a fresh id.
    ///
    /// The copy is named `new_name`, or `"{name} (copy)"` when none is given.
    pub async fn clone_workflow(
        &self,
        id: &str,
        new_name: Option<String>,
    ) -> StoreResponse<WorkflowDefinition> {
        self.try_clone(id, new_name).await.into()
    }

    // -----------------------------------------------------------------------
    // Result-returning internals
    // -----------------------------------------------------------------------

    async fn try_create(
        &self,
        mut definition: WorkflowDefinition,
    ) -> Result<WorkflowDefinition, StoreError> {
        if definition.id.trim().is_empty() {
            definition.id = Uuid::now_v7().to_string();
        }
        validate_definition(&definition)?;

        if self.load(&definition.id).await?.is_some() {
            return Err(StoreError::AlreadyExists(definition.id));
        }

        let now = Utc::now();
        definition.created_at = now;
        definition.updated_at = now;
        self.write(&definition).await?;

        tracing::info!(
            workflow_id = definition.id.as_str(),
            name = definition.name.as_str(),
            "created workflow"
        );
        Ok(definition)
    }

    async fn try_get(&self, id: &str) -> Result<WorkflowDefinition, StoreError> {
        self.load(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn try_update(
        &self,
        id: &str,
        mut definition: WorkflowDefinition,
    ) -> Result<WorkflowDefinition, StoreError> {
        let existing = self.try_get(id).await?;

        definition.id = existing.id;
        definition.created_at = existing.created_at;
        definition.updated_at = Utc::now();
        validate_definition(&definition)?;
        self.write(&definition).await?;

        tracing::info!(workflow_id = id, "updated workflow");
        Ok(definition)
    }

    async fn try_delete(&self, id: &str) -> Result<String, StoreError> {
        if self.load(id).await?.is_none() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        self.kv
            .delete(&Self::workflow_key(id))
            .await
            .map_err(|e| StoreError::Repository(e.to_string()))?;

        tracing::info!(workflow_id = id, "deleted workflow");
        Ok(id.to_string())
    }

    async fn try_search(
        &self,
        query: &WorkflowQuery,
    ) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let mut matches: Vec<WorkflowDefinition> = self
            .load_all()
            .await?
            .into_iter()
            .filter(|def| matches_query(def, query))
            .collect();

        matches.sort_by(|a, b| {
            let ordering = compare(a, b, query.sort_by);
            match query.order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });

        let page = matches.into_iter().skip(query.offset);
        Ok(match query.limit {
            Some(limit) => page.take(limit).collect(),
            None => page.collect(),
        })
    }

    async fn try_clone(
        &self,
        id: &str,
        new_name: Option<String>,
    ) -> Result<WorkflowDefinition, StoreError> {
        let source = self.try_get(id).await?;

        let mut copy = source.clone();
        copy.id = Uuid::now_v7().to_string();
        copy.name = new_name.unwrap_or_else(|| format!("{} (copy)", source.name));
        let copy = self.try_create(copy).await?;

        tracing::info!(
            source_id = id,
            workflow_id = copy.id.as_str(),
            "cloned workflow"
        );
        Ok(copy)
    }

    // -----------------------------------------------------------------------
    // Storage helpers
    // -----------------------------------------------------------------------

    async fn load(&self, id: &str) -> Result<Option<WorkflowDefinition>, StoreError> {
        let key = Self::workflow_key(id);
        let value = self
            .kv
            .get(&key)
            .await
            .map_err(|e| StoreError::Repository(e.to_string()))?;

        value
            .map(|v| {
                serde_json::from_value(v).map_err(|e| StoreError::Serialization {
                    key,
                    message: e.to_string(),
                })
            })
            .transpose()
    }

    /// Every decodable definition; corrupt records are skipped with a warning.
    async fn load_all(&self) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let keys = self
            .kv
            .list_keys(WORKFLOW_KEY_PREFIX)
            .await
            .map_err(|e| StoreError::Repository(e.to_string()))?;

        let mut definitions = Vec::with_capacity(keys.len());
        for key in keys {
            let id = &key[WORKFLOW_KEY_PREFIX.len()..];
            match self.load(id).await {
                Ok(Some(def)) => definitions.push(def),
                Ok(None) => {}
                Err(StoreError::Serialization { key, message }) => {
                    tracing::warn!(
                        key = key.as_str(),
                        error = message.as_str(),
                        "skipping corrupt workflow"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(definitions)
    }

    async fn write(&self, definition: &WorkflowDefinition) -> Result<(), StoreError> {
        let key = Self::workflow_key(&definition.id);
        let value = serde_json::to_value(definition).map_err(|e| StoreError::Serialization {
            key: key.clone(),
            message: e.to_string(),
        })?;
        self.kv
            .set(&key, &value)
            .await
            .map_err(|e| StoreError::Repository(e.to_string()))
    }
}

fn matches_query(def: &WorkflowDefinition, query: &WorkflowQuery) -> bool {
    let text_matches = query.text.as_deref().is_none_or(|text| {
        let needle = text.to_lowercase();
        def.name.to_lowercase().contains(&needle)
            || def
                .description
                .as_deref()
                .is_some_and(|d| d.to_lowercase().contains(&needle))
            || def.tags.iter().any(|t| t.to_lowercase().contains(&needle))
    });

    let tags_match = query
        .tags
        .iter()
        .all(|wanted| def.tags.iter().any(|t| t.eq_ignore_ascii_case(wanted)));

    text_matches && tags_match
}

fn compare(a: &WorkflowDefinition, b: &WorkflowDefinition, field: SortField) -> Ordering {
    let ordering = match field {
        SortField::Name => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
        SortField::CreatedAt => a.created_at.cmp(&b.created_at),
        SortField::UpdatedAt => a.updated_at.cmp(&b.updated_at),
    };
    // Stable tie-break so pagination is deterministic.
    ordering.then_with(|| a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryKvStore;
    use crate::testing::{definition, step};
    use basset_types::workflow::{ScriptParams, StepAction};
    use serde_json::json;

    fn store() -> WorkflowStore<InMemoryKvStore> {
        WorkflowStore::new(InMemoryKvStore::new())
    }

    fn workflow(id: &str, name: &str, tags: &[&str]) -> WorkflowDefinition {
        let mut def = definition(vec![step(
            "answer",
            StepAction::Script(ScriptParams {
                expression: "42".to_string(),
            }),
        )]);
        def.id = id.to_string();
        def.name = name.to_string();
        def.tags = tags.iter().map(|t| t.to_string()).collect();
        def
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = store();
        let created = store.create(workflow("wf-1", "Profile scan", &[])).await;
        assert!(created.success);

        let fetched = store.get("wf-1").await.into_result().unwrap();
        assert_eq!(fetched.name, "Profile scan");
        assert_eq!(fetched.created_at, fetched.updated_at);
    }

    #[tokio::test]
    async fn test_create_generates_id_when_empty() {
        let store = store();
        let created = store.create(workflow("", "Anon", &[])).await.into_result().unwrap();
        assert!(Uuid::parse_str(&created.id).is_ok());
        assert!(store.get(&created.id).await.success);
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates_and_invalid() {
        let store = store();
        store.create(workflow("wf-1", "One", &[])).await;

        let dup = store.create(workflow("wf-1", "Again", &[])).await;
        assert!(!dup.success);
        assert!(dup.error.unwrap().contains("already exists"));

        let mut empty = workflow("wf-2", "Empty", &[]);
        empty.steps.clear();
        let invalid = store.create(empty).await;
        assert!(!invalid.success);
        assert!(invalid.error.unwrap().contains("invalid workflow"));
    }

    #[tokio::test]
    async fn test_get_missing_is_error_envelope() {
        let resp = store().get("nope").await;
        assert!(!resp.success);
        assert!(resp.data.is_none());
        assert_eq!(resp.error.as_deref(), Some("workflow not found: nope"));
    }

    #[tokio::test]
    async fn test_update_keeps_identity() {
        let store = store();
        let created = store
            .create(workflow("wf-1", "Before", &[]))
            .await
            .into_result()
            .unwrap();

        let mut changed = workflow("ignored", "After", &["osint"]);
        changed.variables.insert("seed".to_string(), json!(1));
        let updated = store.update("wf-1", changed).await.into_result().unwrap();

        assert_eq!(updated.id, "wf-1");
        assert_eq!(updated.name, "After");
        assert_eq!(updated.created_at, created.created_at);
        assert!(updated.updated_at >= created.updated_at);
        assert!(!store.update("missing", workflow("x", "X", &[])).await.success);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = store();
        store.create(workflow("wf-1", "One", &[])).await;

        assert_eq!(store.delete("wf-1").await.into_result().unwrap(), "wf-1");
        assert!(!store.get("wf-1").await.success);
        assert!(!store.delete("wf-1").await.success);
    }

    #[tokio::test]
    async fn test_search_filters_sorts_and_paginates() {
        let store = store();
        store.create(workflow("a", "Email sweep", &["osint", "email"])).await;
        store.create(workflow("b", "Phone sweep", &["osint"])).await;
        store.create(workflow("c", "Login check", &["auth"])).await;

        let by_tag = WorkflowQuery {
            tags: vec!["OSINT".to_string()],
            sort_by: SortField::Name,
            order: SortOrder::Asc,
            ..Default::default()
        };
        let names: Vec<String> = store
            .search(&by_tag)
            .await
            .into_result()
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["Email sweep", "Phone sweep"]);

        let by_text = WorkflowQuery {
            text: Some("sweep".to_string()),
            sort_by: SortField::Name,
            order: SortOrder::Desc,
            offset: 1,
            limit: Some(5),
            ..Default::default()
        };
        let page = store.search(&by_text).await.into_result().unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].name, "Email sweep");

        assert_eq!(store.list().await.into_result().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_list_skips_corrupt_records() {
        let kv = std::sync::Arc::new(InMemoryKvStore::new());
        let store = WorkflowStore::new(std::sync::Arc::clone(&kv));
        store.create(workflow("good", "Good", &[])).await;
        kv.set("workflow:bad", &json!({"name": 1})).await.unwrap();

        let all = store.list().await.into_result().unwrap();
        assert_eq!(all.len(), 1);
        assert!(!store.get("bad").await.success);
    }

    #[tokio::test]
    async fn test_clone_assigns_new_id_and_name() {
        let store = store();
        store.create(workflow("wf-1", "Scan", &["osint"])).await;

        let copy = store.clone_workflow("wf-1", None).await.into_result().unwrap();
        assert_ne!(copy.id, "wf-1");
        assert_eq!(copy.name, "Scan (copy)");
        assert_eq!(copy.tags, vec!["osint"]);

        let named = store
            .clone_workflow("wf-1", Some("Rescan".to_string()))
            .await
            .into_result()
            .unwrap();
        assert_eq!(named.name, "Rescan");
        assert!(!store.clone_workflow("missing", None).await.success);
    }
}
