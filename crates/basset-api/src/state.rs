//! Application state wiring the engine together.
//!
//! AppState pins the generic engine to the concrete infra implementations:
//! a SQLite-backed KV store, the HTTP bridge for browser capabilities and the
//! built-in detection, verification and ingestion providers.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use basset_core::event::EventBus;
use basset_core::provider::{
    BoxCapabilityProvider, BoxIngestionProvider, FormatVerifier, KvIngestionProvider,
    PatternDetector,
};
use basset_core::workflow::executor::WorkflowExecutor;
use basset_core::workflow::step_executor::Providers;
use basset_infra::bridge::BridgeCapabilityProvider;
use basset_infra::config::{load_engine_config, resolve_data_dir};
use basset_infra::sqlite::kv::SqliteKvStore;
use basset_infra::sqlite::pool::{DatabasePool, database_url};
use basset_types::config::EngineConfig;

/// Bridge address used when neither `--bridge` nor `bridge_url` is set.
pub const DEFAULT_BRIDGE_URL: &str = "http://127.0.0.1:9222";

/// Executor pinned to the SQLite store.
pub type ConcreteExecutor = WorkflowExecutor<SqliteKvStore>;

/// Shared application state for CLI commands.
#[derive(Clone)]
pub struct AppState {
    pub executor: ConcreteExecutor,
    pub config: Arc<EngineConfig>,
    pub data_dir: PathBuf,
    pub bridge_url: String,
}

impl AppState {
    /// Initialize the application state: load config, open the database,
    /// wire providers.
    ///
    /// `bridge` overrides the configured bridge URL.
    pub async fn init(bridge: Option<&str>) -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let config = load_engine_config(&data_dir).await;

        let db_pool = DatabasePool::new(&database_url(&data_dir))
            .await
            .context("Failed to open the execution database")?;
        let kv = Arc::new(SqliteKvStore::new(db_pool));

        let bridge_url = bridge
            .map(str::to_string)
            .or_else(|| config.bridge_url.clone())
            .unwrap_or_else(|| DEFAULT_BRIDGE_URL.to_string());
        let bridge = BridgeCapabilityProvider::new(bridge_url.clone())
            .context("Failed to build the bridge HTTP client")?;

        let providers = Providers {
            capabilities: Arc::new(BoxCapabilityProvider::new(bridge)),
            detection: Arc::new(PatternDetector::new()),
            verification: Arc::new(FormatVerifier::new()),
            ingestion: Arc::new(BoxIngestionProvider::new(KvIngestionProvider::new(
                Arc::clone(&kv),
            ))),
        };

        tracing::debug!(
            data_dir = %data_dir.display(),
            bridge_url = bridge_url.as_str(),
            "initialized application state"
        );

        let executor = WorkflowExecutor::new(
            kv,
            providers,
            config.clone(),
            EventBus::default(),
        );

        Ok(Self {
            executor,
            config: Arc::new(config),
            data_dir,
            bridge_url,
        })
    }
}
