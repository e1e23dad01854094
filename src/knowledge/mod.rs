//! Knowledge bases and their registry.
//!
//! A [`KnowledgeBase`] wraps one [`Store`] and answers free-text questions with
//! formatted entries. The [`KnowledgeBaseManager`] is an explicit registry of
//! named knowledge bases owned by the [`AppContext`].

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::database::sqlite::models::{KnowledgeRow, StoredBatch};
use crate::ingest::load_batch;
use crate::store::Store;
use crate::vectorizer::SearchConfig;
use crate::{KbError, Result};

#[derive(Debug)]
pub struct KnowledgeBase {
    store: Arc<Store>,
    search: SearchConfig,
}

impl KnowledgeBase {
    #[inline]
    pub fn new(store: Arc<Store>, search: SearchConfig) -> Self {
        Self { store, search }
    }

    #[inline]
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Ingest the batch at `path` when the store holds no rows yet.
    ///
    /// Returns `None` when the store already had data.
    #[inline]
    pub async fn populate_if_empty(&self, path: &Path) -> Result<Option<StoredBatch>> {
        if !self.store.is_empty().await {
            debug!("Store already holds data, skipping {}", path.display());
            return Ok(None);
        }

        warn!("Store is empty, populating it from {}", path.display());
        let batch = load_batch(path)?;
        let stored = self.store.store_dataframe(batch).await?;
        info!(
            "Store populated with {} rows as version {}",
            stored.ids.len(),
            stored.version
        );
        Ok(Some(stored))
    }

    /// Entries most similar to `query`, one formatted line per row
    #[inline]
    pub async fn query(&self, query: &str) -> Result<Vec<String>> {
        let rows = self
            .store
            .get_entries_similar_to_problem(query, &self.search)
            .await?;
        debug!("Found {} entries for query", rows.len());

        Ok(rows.iter().map(|row| self.format_row(row)).collect())
    }

    /// `label:value` pairs in schema order, joined by `;`, e.g. `Q:..;Desc:..;Sol.:..`
    #[inline]
    pub fn format_row(&self, row: &KnowledgeRow) -> String {
        self.store
            .schema()
            .columns()
            .iter()
            .map(|column| {
                format!(
                    "{}:{}",
                    column.label,
                    row.record.get(column.field).unwrap_or_default()
                )
            })
            .collect::<Vec<_>>()
            .join(";")
    }
}

/// Named knowledge bases available to callers
#[derive(Debug, Default)]
pub struct KnowledgeBaseManager {
    bases: RwLock<HashMap<String, Arc<KnowledgeBase>>>,
}

impl KnowledgeBaseManager {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `base` under `name`, replacing any previous registration
    #[inline]
    pub async fn register(&self, name: impl Into<String>, base: Arc<KnowledgeBase>) {
        let name = name.into();
        debug!("Registering knowledge base {}", name);
        if self.bases.write().await.insert(name.clone(), base).is_some() {
            warn!("Knowledge base {} was already registered and has been replaced", name);
        }
    }

    #[inline]
    pub async fn get(&self, name: &str) -> Result<Arc<KnowledgeBase>> {
        self.bases
            .read()
            .await
            .get(name)
            .map(Arc::clone)
            .ok_or_else(|| KbError::NoSuchKnowledgeBase(name.to_string()))
    }

    /// Registered names, sorted
    #[inline]
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.bases.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    async fn drain(&self) -> Vec<(String, Arc<KnowledgeBase>)> {
        self.bases.write().await.drain().collect()
    }
}

/// Everything a running process needs, created once at startup
#[derive(Debug)]
pub struct AppContext {
    config: Config,
    manager: KnowledgeBaseManager,
    default_name: String,
}

impl AppContext {
    /// Open the configured store, seed it if needed and register it under its table name
    #[inline]
    pub async fn initialize(config: Config) -> Result<Self> {
        let store = Arc::new(Store::open(&config).await?);
        let name = store.engine().table_name().to_string();

        let base = Arc::new(KnowledgeBase::new(
            store,
            SearchConfig::from_settings(&config.search),
        ));

        if let Some(seed_file) = &config.store.seed_file {
            base.populate_if_empty(seed_file).await?;
        }

        let manager = KnowledgeBaseManager::new();
        manager.register(name.clone(), base).await;

        Ok(Self {
            config,
            manager,
            default_name: name,
        })
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub fn manager(&self) -> &KnowledgeBaseManager {
        &self.manager
    }

    /// The knowledge base of the configured store
    #[inline]
    pub async fn default_knowledge_base(&self) -> Result<Arc<KnowledgeBase>> {
        self.manager.get(&self.default_name).await
    }

    /// Close every registered store
    #[inline]
    pub async fn shutdown(&self) {
        for (name, base) in self.manager.drain().await {
            debug!("Closing knowledge base {}", name);
            base.store().close().await;
        }
        info!("Application context shut down");
    }
}
