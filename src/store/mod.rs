//! Store orchestration.
//!
//! The [`Store`] is the single entry point that keeps the relational table and
//! the vector index consistent. Writes go Persist → Project → Index → Flag →
//! Refresh; a failed index step undoes the relational write. Reads are served
//! from an in-memory snapshot of the current version that is only swapped in
//! after a write completes.

#[cfg(test)]
mod tests;

pub mod consistency;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::{Config, VectorStoreKind};
use crate::database::lancedb::LanceIndex;
use crate::database::memory::InMemoryIndex;
use crate::database::sqlite::RelationalEngine;
use crate::database::sqlite::models::{Batch, KnowledgeRow, Record, StoredBatch};
use crate::database::vector_index::{Document, MetadataFilter, VectorIndex};
use crate::embeddings::create_embedder;
use crate::entity::{EntitySchema, schema_for};
use crate::vectorizer::{SearchConfig, Vectorizer};
use crate::{KbError, Result};

pub use consistency::{ConsistencyReport, ConsistencyValidator};

/// Read view of the current version
#[derive(Debug, Default)]
struct Snapshot {
    version: Option<i64>,
    rows: Vec<KnowledgeRow>,
}

/// Outcome of a garbage collection pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    pub current_version: Option<i64>,
    pub rows_deleted: u64,
    pub documents_deleted: u64,
}

/// Outcome of draining the unvectorized cursor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatchUpReport {
    pub indexed: u64,
    pub failed: u64,
}

/// Outcome of startup reconciliation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub loaded_rows: usize,
    pub gc: GcReport,
    /// Rows whose documents had gone missing and were queued for catch-up
    pub requeued: u64,
    pub catch_up: CatchUpReport,
}

/// Outcome of [`Store::repair`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairReport {
    pub orphans_deleted: u64,
    pub rows_requeued: u64,
    pub catch_up: CatchUpReport,
}

#[derive(Debug)]
pub struct Store {
    engine: RelationalEngine,
    vectorizer: Vectorizer,
    schema: Arc<dyn EntitySchema>,
    snapshot: RwLock<Arc<Snapshot>>,
    write_lock: Mutex<()>,
}

impl Store {
    /// Build the engine, embedder, index and vectorizer from `config`, then reconcile
    #[inline]
    pub async fn open(config: &Config) -> Result<Self> {
        config
            .validate()
            .map_err(|e| KbError::Config(e.to_string()))?;

        let schema = schema_for(&config.store.entity_schema)?;
        let engine = RelationalEngine::connect(&config.store, Arc::clone(&schema)).await?;

        let embedder = create_embedder(&config.embedding)?;
        let index: Arc<dyn VectorIndex> = match config.vector_store.kind {
            VectorStoreKind::Lancedb => Arc::new(
                LanceIndex::open(
                    &config.vector_database_path(),
                    &config.vector_store.collection_name,
                    embedder,
                )
                .await?,
            ),
            VectorStoreKind::Memory => {
                warn!("Using the in-memory vector index, documents are rebuilt on every start");
                Arc::new(InMemoryIndex::new(embedder))
            }
        };

        let vectorizer = Vectorizer::new(
            index,
            schema,
            Duration::from_secs(config.vector_store.index_timeout_secs),
        );

        let store = Self::new(engine, vectorizer);
        let report = store.on_init().await?;
        info!(
            "Store ready: {} rows loaded, {} rows vectorized during catch-up",
            report.loaded_rows, report.catch_up.indexed
        );
        Ok(store)
    }

    /// Wire a store from parts; call [`Store::on_init`] before serving reads
    #[inline]
    pub fn new(engine: RelationalEngine, vectorizer: Vectorizer) -> Self {
        let schema = Arc::clone(engine.schema());
        Self {
            engine,
            vectorizer,
            schema,
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            write_lock: Mutex::new(()),
        }
    }

    #[inline]
    pub fn engine(&self) -> &RelationalEngine {
        &self.engine
    }

    #[inline]
    pub fn vectorizer(&self) -> &Vectorizer {
        &self.vectorizer
    }

    #[inline]
    pub fn schema(&self) -> &Arc<dyn EntitySchema> {
        &self.schema
    }

    /// Startup reconciliation: load the cache, collect garbage, vectorize leftovers
    #[inline]
    pub async fn on_init(&self) -> Result<ReconcileReport> {
        let _guard = self.write_lock.lock().await;

        let loaded_rows = self.reload_snapshot().await?;

        let current_version = self.engine.current_version().await?;
        let gc = match current_version {
            Some(current) => {
                let rows_deleted = self.engine.clear_versions_older_than(current).await?;
                let documents_deleted =
                    match self.vectorizer.delete_versions_older_than(current).await {
                        Ok(deleted) => deleted,
                        Err(e) => {
                            warn!("Vector garbage collection failed, retrying on next pass: {}", e);
                            0
                        }
                    };
                GcReport {
                    current_version,
                    rows_deleted,
                    documents_deleted,
                }
            }
            None => GcReport::default(),
        };

        let requeued = self.requeue_missing().await;

        let catch_up = self.catch_up().await?;
        if catch_up.indexed > 0 || gc.rows_deleted > 0 {
            self.reload_snapshot().await?;
        }

        // Catch-up deletes stale documents of every row it indexes
        if gc.documents_deleted > 0 || catch_up.indexed > 0 {
            self.compact_index().await;
        }

        Ok(ReconcileReport {
            loaded_rows,
            gc,
            requeued,
            catch_up,
        })
    }

    /// Requeue rows flagged as vectorized whose documents are gone, e.g. after
    /// the index was recreated or lived only in memory
    async fn requeue_missing(&self) -> u64 {
        let validator = ConsistencyValidator::new(&self.engine, &self.vectorizer);

        let report = match validator.validate_consistency().await {
            Ok(report) => report,
            Err(e) => {
                warn!("Skipping missing document check: {}", e);
                return 0;
            }
        };

        match validator.requeue_rows(&report.missing_in_index).await {
            Ok(requeued) => requeued,
            Err(e) => {
                warn!("Could not requeue rows with missing documents: {}", e);
                0
            }
        }
    }

    async fn compact_index(&self) {
        if let Err(e) = self.vectorizer.optimize().await {
            warn!("Vector index compaction failed, retrying after the next GC: {}", e);
        }
    }

    async fn reload_snapshot(&self) -> Result<usize> {
        let rows = self.engine.load().await?;
        let version = rows.first().map(|row| row.version);
        let count = rows.len();

        *self.snapshot.write().await = Arc::new(Snapshot { version, rows });
        debug!("Read cache holds {} rows of version {:?}", count, version);
        Ok(count)
    }

    async fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&*self.snapshot.read().await)
    }

    /// Vectorize every row still flagged as unvectorized, one row at a time.
    ///
    /// A row that fails is logged and left for the next pass.
    async fn catch_up(&self) -> Result<CatchUpReport> {
        let mut cursor = self.engine.unvectorized_rows();

        while let Some(row) = cursor.next().await? {
            // A crash between indexing and flagging leaves a document behind
            if let Err(e) = self.vectorizer.delete_rows(vec![row.id]).await {
                warn!("Could not clear stale documents of row {}: {}", row.id, e);
            }

            let document = self.vectorizer.to_document(&row.record, row.version, row.id);
            let success = match self.vectorizer.index(vec![document]).await {
                Ok(_) => true,
                Err(e) => {
                    warn!("Catch-up vectorization of row {} failed: {}", row.id, e);
                    false
                }
            };

            if let Err(e) = cursor.report(row.id, success).await {
                warn!("Could not record outcome for row {}: {}", row.id, e);
            }
        }

        let report = CatchUpReport {
            indexed: cursor.succeeded(),
            failed: cursor.failed(),
        };
        if report.indexed > 0 || report.failed > 0 {
            info!(
                "Catch-up vectorized {} rows, {} left for the next pass",
                report.indexed, report.failed
            );
        }
        Ok(report)
    }

    /// Ingest `batch` as a new version in both stores, or in neither
    #[inline]
    pub async fn store_dataframe(&self, batch: Batch) -> Result<StoredBatch> {
        let _guard = self.write_lock.lock().await;

        let stored = self.engine.store(&batch).await?;

        let documents: Vec<Document> = batch
            .records
            .iter()
            .zip(&stored.ids)
            .map(|(record, id)| self.vectorizer.to_document(record, stored.version, *id))
            .collect();

        if let Err(e) = self.vectorizer.index(documents).await {
            return Err(self.undo_version(stored.version, e).await);
        }

        let vectorized = match self.engine.mark_vectorized(stored.version, true).await {
            Ok(_) => true,
            Err(e) => {
                warn!(
                    "Version {} is indexed but could not be flagged, catch-up will redo it: {}",
                    stored.version, e
                );
                false
            }
        };

        let rows = batch
            .records
            .into_iter()
            .zip(&stored.ids)
            .map(|(record, id)| KnowledgeRow {
                id: *id,
                version: stored.version,
                vectorized,
                record: self.schema.project(&record),
            })
            .collect();

        *self.snapshot.write().await = Arc::new(Snapshot {
            version: Some(stored.version),
            rows,
        });

        info!(
            "Version {} stored and indexed ({} rows)",
            stored.version,
            stored.ids.len()
        );
        Ok(stored)
    }

    /// Compensate a failed index step; returns the error to surface
    async fn undo_version(&self, version: i64, vectorization: KbError) -> KbError {
        error!(
            "Vectorization of version {} failed, rolling back: {}",
            version, vectorization
        );

        let rollback = self.engine.rollback(version).await;

        // Documents written before the failure are removed now rather than at the next GC
        match self.vectorizer.delete_version(version).await {
            Ok(0) => {}
            Ok(deleted) => info!(
                "Removed {} partially indexed documents of version {}",
                deleted, version
            ),
            Err(e) => warn!(
                "Could not remove documents of version {}, next GC will: {}",
                version, e
            ),
        }

        match rollback {
            Ok(rows) => {
                info!("Rolled back {} rows of version {}", rows, version);
                vectorization
            }
            Err(e) => {
                error!("Rollback of version {} failed: {}", version, e);
                KbError::RollbackFailure {
                    version,
                    reason: e.to_string(),
                    vectorization: Box::new(vectorization),
                }
            }
        }
    }

    /// Current-version rows whose `field` equals `value`
    #[inline]
    pub async fn get(&self, field: &str, value: &str) -> Vec<Record> {
        if !self.schema.has_field(field) {
            debug!("Field {} is not part of schema {}", field, self.schema.name());
            return Vec::new();
        }

        self.snapshot()
            .await
            .rows
            .iter()
            .filter(|row| row.record.get(field) == Some(value))
            .map(|row| row.record.clone())
            .collect()
    }

    /// Current-version rows, in id order
    #[inline]
    pub async fn rows(&self) -> Vec<KnowledgeRow> {
        self.snapshot().await.rows.clone()
    }

    #[inline]
    pub async fn similarity_search(
        &self,
        query: &str,
        config: &SearchConfig,
    ) -> Result<Vec<Document>> {
        self.vectorizer.search(query, config).await
    }

    /// Current-version rows most similar to `query`, best first, each row at most once
    #[inline]
    pub async fn get_entries_similar_to_problem(
        &self,
        query: &str,
        config: &SearchConfig,
    ) -> Result<Vec<KnowledgeRow>> {
        let snapshot = self.snapshot().await;
        let Some(version) = snapshot.version else {
            debug!("Store is empty, nothing to search");
            return Ok(Vec::new());
        };

        let config = config
            .clone()
            .with_filter(MetadataFilter::VersionEquals(version));
        let hits = self.vectorizer.search_with_scores(query, &config).await?;

        let mut seen = HashSet::new();
        let ids: Vec<i64> = hits
            .iter()
            .map(|hit| hit.document.metadata.db_id)
            .filter(|id| seen.insert(*id))
            .collect();

        let by_id: HashMap<i64, &KnowledgeRow> =
            snapshot.rows.iter().map(|row| (row.id, row)).collect();

        let rows: Vec<KnowledgeRow> = ids
            .iter()
            .filter_map(|id| by_id.get(id).map(|row| (*row).clone()))
            .collect();

        if rows.len() < ids.len() {
            warn!(
                "{} search hits had no matching row in version {}",
                ids.len() - rows.len(),
                version
            );
        }
        Ok(rows)
    }

    /// Delete rows and documents of every version older than the current one
    #[inline]
    pub async fn clear_old_versions(&self) -> Result<GcReport> {
        let _guard = self.write_lock.lock().await;

        let Some(current) = self.engine.current_version().await? else {
            return Ok(GcReport::default());
        };

        let rows_deleted = self.engine.clear_versions_older_than(current).await?;
        let documents_deleted = self.vectorizer.delete_versions_older_than(current).await?;
        if documents_deleted > 0 {
            self.compact_index().await;
        }

        info!(
            "Garbage collection below version {}: {} rows, {} documents",
            current, rows_deleted, documents_deleted
        );
        Ok(GcReport {
            current_version: Some(current),
            rows_deleted,
            documents_deleted,
        })
    }

    #[inline]
    pub async fn is_empty(&self) -> bool {
        self.snapshot().await.rows.is_empty()
    }

    #[inline]
    pub async fn current_version(&self) -> Option<i64> {
        self.snapshot().await.version
    }

    #[inline]
    pub async fn consistency_report(&self) -> Result<ConsistencyReport> {
        ConsistencyValidator::new(&self.engine, &self.vectorizer)
            .validate_consistency()
            .await
    }

    /// Delete orphaned documents, requeue rows with missing or duplicated documents and catch up
    #[inline]
    pub async fn repair(&self) -> Result<RepairReport> {
        let _guard = self.write_lock.lock().await;

        let validator = ConsistencyValidator::new(&self.engine, &self.vectorizer);
        let report = validator.validate_consistency().await?;

        let orphans_deleted = validator
            .cleanup_orphaned_documents(&report.orphaned_in_index)
            .await?;
        let rows_requeued = validator.requeue_rows(&report.missing_in_index).await?
            + validator
                .reset_duplicates(&report.duplicated_in_index)
                .await?;

        let catch_up = self.catch_up().await?;
        self.reload_snapshot().await?;

        Ok(RepairReport {
            orphans_deleted,
            rows_requeued,
            catch_up,
        })
    }

    #[inline]
    pub async fn close(&self) {
        self.engine.close().await;
    }
}
