//! Bridge between relational rows and the vector index.
//!
//! The vectorizer owns the metadata contract: every document it builds carries
//! the `_db_id` and `_version` of its source row, which is how search results
//! are joined back to relational identity.

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::config::SearchSettings;
use crate::database::sqlite::models::Record;
use crate::database::vector_index::{
    Document, DocumentMetadata, MetadataFilter, ScoredDocument, VectorIndex,
};
use crate::entity::EntitySchema;
use crate::{KbError, Result};

pub const DEFAULT_INDEX_TIMEOUT: Duration = Duration::from_secs(60);

/// Parameters of a similarity query
#[derive(Debug, Clone, PartialEq)]
pub struct SearchConfig {
    pub k: usize,
    /// Minimum relevance in `[0, 1]`; hits below it are dropped
    pub score_threshold: Option<f32>,
    pub filter: Option<MetadataFilter>,
}

impl Default for SearchConfig {
    #[inline]
    fn default() -> Self {
        Self {
            k: 4,
            score_threshold: None,
            filter: None,
        }
    }
}

impl SearchConfig {
    #[inline]
    pub fn from_settings(settings: &SearchSettings) -> Self {
        Self {
            k: settings.k,
            score_threshold: settings.score_threshold,
            filter: None,
        }
    }

    #[inline]
    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    #[inline]
    pub fn with_filter(mut self, filter: MetadataFilter) -> Self {
        self.filter = Some(filter);
        self
    }
}

#[derive(Debug, Clone)]
pub struct Vectorizer {
    index: Arc<dyn VectorIndex>,
    schema: Arc<dyn EntitySchema>,
    index_timeout: Duration,
}

impl Vectorizer {
    #[inline]
    pub fn new(
        index: Arc<dyn VectorIndex>,
        schema: Arc<dyn EntitySchema>,
        index_timeout: Duration,
    ) -> Self {
        Self {
            index,
            schema,
            index_timeout,
        }
    }

    #[inline]
    pub fn index_name(&self) -> &'static str {
        self.index.name()
    }

    #[inline]
    pub fn to_document(&self, record: &Record, version: i64, db_id: i64) -> Document {
        Document {
            text: self.schema.to_document_text(record),
            metadata: DocumentMetadata { db_id, version },
        }
    }

    /// Index `documents`; an index call that outlives the timeout counts as failed
    #[inline]
    pub async fn index(&self, documents: Vec<Document>) -> Result<Vec<String>> {
        let count = documents.len();
        debug!("Indexing {} documents into {}", count, self.index.name());

        match tokio::time::timeout(self.index_timeout, self.index.add(documents)).await {
            Ok(Ok(ids)) => {
                debug!("Indexed {} documents", ids.len());
                Ok(ids)
            }
            Ok(Err(e)) => {
                error!("Failed to index {} documents: {}", count, e);
                Err(e)
            }
            Err(_) => {
                error!(
                    "Indexing {} documents timed out after {:?}",
                    count, self.index_timeout
                );
                Err(KbError::VectorIndex(format!(
                    "indexing timed out after {:?}",
                    self.index_timeout
                )))
            }
        }
    }

    /// Vector-side counterpart of relational GC
    #[inline]
    pub async fn delete_versions_older_than(&self, current: i64) -> Result<u64> {
        let deleted = self
            .index
            .delete(&MetadataFilter::VersionBelow(current))
            .await?;
        if deleted > 0 {
            info!(
                "Deleted {} vector documents older than version {}",
                deleted, current
            );
        }
        Ok(deleted)
    }

    #[inline]
    pub async fn delete_version(&self, version: i64) -> Result<u64> {
        self.index
            .delete(&MetadataFilter::VersionEquals(version))
            .await
    }

    #[inline]
    pub async fn delete_rows(&self, db_ids: Vec<i64>) -> Result<u64> {
        self.index.delete(&MetadataFilter::DbIdIn(db_ids)).await
    }

    #[inline]
    pub async fn search(&self, query: &str, config: &SearchConfig) -> Result<Vec<Document>> {
        Ok(self
            .search_with_scores(query, config)
            .await?
            .into_iter()
            .map(|hit| hit.document)
            .collect())
    }

    /// Ranked hits, best first, restricted by `config.filter` and `config.score_threshold`
    #[inline]
    pub async fn search_with_scores(
        &self,
        query: &str,
        config: &SearchConfig,
    ) -> Result<Vec<ScoredDocument>> {
        let mut hits = self
            .index
            .search(query, config.filter.as_ref(), config.k)
            .await?;

        if let Some(threshold) = config.score_threshold {
            hits.retain(|hit| hit.score >= threshold);
        }

        debug!("Search for {:?} returned {} hits", query, hits.len());
        Ok(hits)
    }

    #[inline]
    pub async fn list_metadata(
        &self,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<DocumentMetadata>> {
        self.index.list_metadata(filter).await
    }

    #[inline]
    pub async fn count(&self) -> Result<u64> {
        self.index.count().await
    }

    /// Compact the index after deletes
    #[inline]
    pub async fn optimize(&self) -> Result<()> {
        debug!("Optimizing {}", self.index.name());
        self.index.optimize().await
    }
}
