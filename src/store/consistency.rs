// Consistency validation between the relational table and the vector index


use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::Result;
use crate::database::sqlite::RelationalEngine;
use crate::database::vector_index::DocumentMetadata;
use crate::vectorizer::Vectorizer;

/// Consistency check results between the relational table and the vector index
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsistencyReport {
    pub relational_rows: usize,
    pub vector_documents: usize,
    /// Rows flagged as vectorized that have no vector document
    pub missing_in_index: Vec<i64>,
    /// Rows still waiting for catch-up vectorization
    pub pending_rows: Vec<i64>,
    /// Documents whose `(_db_id, _version)` matches no row
    pub orphaned_in_index: Vec<DocumentMetadata>,
    /// Rows indexed more than once
    pub duplicated_in_index: Vec<i64>,
    pub is_consistent: bool,
}

impl ConsistencyReport {
    /// One-line description for logs and the status command
    #[inline]
    pub fn summary(&self) -> String {
        if self.is_consistent {
            format!(
                "Stores are consistent: {} relational rows, {} vector documents",
                self.relational_rows, self.vector_documents
            )
        } else {
            format!(
                "Store inconsistencies found: {} missing in index, {} orphaned in index, {} duplicated in index",
                self.missing_in_index.len(),
                self.orphaned_in_index.len(),
                self.duplicated_in_index.len()
            )
        }
    }

    /// Rows waiting for catch-up are not counted as issues
    #[inline]
    pub fn total_issues(&self) -> usize {
        self.missing_in_index.len() + self.orphaned_in_index.len() + self.duplicated_in_index.len()
    }
}

pub struct ConsistencyValidator<'a> {
    engine: &'a RelationalEngine,
    vectorizer: &'a Vectorizer,
}

impl<'a> ConsistencyValidator<'a> {
    #[inline]
    pub fn new(engine: &'a RelationalEngine, vectorizer: &'a Vectorizer) -> Self {
        Self { engine, vectorizer }
    }

    #[inline]
    pub async fn validate_consistency(&self) -> Result<ConsistencyReport> {
        info!("Starting relational/vector consistency validation");

        let rows = self.engine.row_identities().await?;
        debug!("Found {} relational rows", rows.len());

        let documents = self.vectorizer.list_metadata(None).await?;
        debug!("Found {} vector documents", documents.len());

        let row_versions: HashMap<i64, i64> =
            rows.iter().map(|(id, version, _)| (*id, *version)).collect();

        let mut document_counts: HashMap<DocumentMetadata, usize> = HashMap::new();
        for metadata in &documents {
            *document_counts.entry(*metadata).or_insert(0) += 1;
        }
        let indexed_ids: HashSet<i64> = document_counts.keys().map(|m| m.db_id).collect();

        let missing_in_index: Vec<i64> = rows
            .iter()
            .filter(|(id, _, vectorized)| *vectorized && !indexed_ids.contains(id))
            .map(|(id, _, _)| *id)
            .collect();

        let pending_rows: Vec<i64> = rows
            .iter()
            .filter(|(_, _, vectorized)| !*vectorized)
            .map(|(id, _, _)| *id)
            .collect();

        let mut orphaned_in_index: Vec<DocumentMetadata> = document_counts
            .keys()
            .filter(|m| row_versions.get(&m.db_id) != Some(&m.version))
            .copied()
            .collect();
        orphaned_in_index.sort();

        let mut duplicated_in_index: Vec<i64> = document_counts
            .iter()
            .filter(|(m, count)| **count > 1 && row_versions.get(&m.db_id) == Some(&m.version))
            .map(|(m, _)| m.db_id)
            .collect();
        duplicated_in_index.sort_unstable();

        let is_consistent = missing_in_index.is_empty()
            && orphaned_in_index.is_empty()
            && duplicated_in_index.is_empty();

        let report = ConsistencyReport {
            relational_rows: rows.len(),
            vector_documents: documents.len(),
            missing_in_index,
            pending_rows,
            orphaned_in_index,
            duplicated_in_index,
            is_consistent,
        };

        if report.is_consistent {
            info!("{}", report.summary());
        } else {
            warn!("{}", report.summary());
        }

        Ok(report)
    }

    /// Delete vector documents that no longer have a source row
    #[inline]
    pub async fn cleanup_orphaned_documents(&self, orphans: &[DocumentMetadata]) -> Result<u64> {
        if orphans.is_empty() {
            return Ok(0);
        }

        // Row ids are never reused, so an orphan's id cannot belong to a live row
        let ids: Vec<i64> = orphans
            .iter()
            .map(|m| m.db_id)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let deleted = self.vectorizer.delete_rows(ids).await?;
        info!("Deleted {} orphaned vector documents", deleted);
        Ok(deleted)
    }

    /// Clear the vectorized flag of rows so the next catch-up indexes them again
    #[inline]
    pub async fn requeue_rows(&self, ids: &[i64]) -> Result<u64> {
        let requeued = self.engine.set_rows_vectorized(ids, false).await?;
        if requeued > 0 {
            info!("Requeued {} rows for vectorization", requeued);
        }
        Ok(requeued)
    }

    /// Drop every document of the given rows and requeue them for a single fresh document
    #[inline]
    pub async fn reset_duplicates(&self, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        self.vectorizer.delete_rows(ids.to_vec()).await?;
        self.requeue_rows(ids).await
    }
}
