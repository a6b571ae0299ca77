use anyhow::Context;
use mailmirror_config::{AppConfig, ConfigManager};
use mailmirror_storage::{IngestWriter, QueryEngine, Storage, StorageOptions, SyncStateStore};
use std::path::Path;
use std::time::Duration;

pub struct AppState {
    pub(crate) config_manager: ConfigManager,
    pub(crate) config: AppConfig,
    pub(crate) storage: Storage,
    pub(crate) query: QueryEngine,
    pub(crate) ingest: IngestWriter,
    pub(crate) sync_state: SyncStateStore,
}

/// Resolves the configuration directory, creating a default config file on
/// first use.
pub fn open_config(config_dir: Option<&Path>) -> anyhow::Result<ConfigManager> {
    match config_dir {
        Some(root) => ConfigManager::with_root(root),
        None => ConfigManager::new(),
    }
    .context("initialize config manager")
}

impl AppState {
    pub async fn initialize(config_manager: ConfigManager, config: AppConfig) -> anyhow::Result<Self> {
        let db_path = config_manager.database_path(&config);
        let options = StorageOptions {
            max_connections: config.database.max_connections.max(1),
            busy_timeout: Duration::from_secs(config.database.busy_timeout_secs),
        };
        let storage = Storage::connect(&db_path, options)
            .await
            .with_context(|| format!("open mailbox index at {}", db_path.display()))?;

        tracing::info!(path = %db_path.display(), "opened mailbox index");

        let query = QueryEngine::new(&storage, config.query.clone());
        let ingest = IngestWriter::new(&storage);
        let sync_state = SyncStateStore::new(&storage);

        Ok(Self {
            config_manager,
            config,
            storage,
            query,
            ingest,
            sync_state,
        })
    }

    pub async fn shutdown(self) {
        self.storage.close().await;
        tracing::debug!("closed mailbox index");
    }
}
