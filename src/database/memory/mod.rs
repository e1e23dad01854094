
#[cfg(test)]
pub(crate) mod faulty;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::database::vector_index::{
    Document, DocumentMetadata, MetadataFilter, ScoredDocument, VectorIndex,
};
use crate::embeddings::Embedder;
use crate::{KbError, Result};

#[derive(Debug, Clone)]
struct Entry {
    id: String,
    document: Document,
    vector: Vec<f32>,
}

/// Brute-force cosine index kept in process memory
#[derive(Debug)]
pub struct InMemoryIndex {
    embedder: Arc<dyn Embedder>,
    entries: RwLock<Vec<Entry>>,
}

impl InMemoryIndex {
    #[inline]
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            entries: RwLock::new(Vec::new()),
        }
    }
}

/// Cosine similarity mapped onto `[0, 1]`
pub(crate) fn relevance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    (dot / (norm_a * norm_b)).clamp(0.0, 1.0)
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn add(&self, documents: Vec<Document>) -> Result<Vec<String>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let texts: Vec<String> = documents.iter().map(|d| d.text.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts).await?;
        if vectors.len() != documents.len() {
            return Err(KbError::VectorIndex(format!(
                "Embedder returned {} vectors for {} documents",
                vectors.len(),
                documents.len()
            )));
        }

        let new_entries: Vec<Entry> = documents
            .into_iter()
            .zip(vectors)
            .map(|(document, vector)| Entry {
                id: Uuid::new_v4().to_string(),
                document,
                vector,
            })
            .collect();
        let ids = new_entries.iter().map(|e| e.id.clone()).collect();

        let mut entries = self.entries.write().await;
        entries.extend(new_entries);
        debug!("In-memory index now holds {} documents", entries.len());

        Ok(ids)
    }

    async fn search(
        &self,
        query: &str,
        filter: Option<&MetadataFilter>,
        k: usize,
    ) -> Result<Vec<ScoredDocument>> {
        let query_vector = self.embedder.embed(query).await?;
        let entries = self.entries.read().await;

        let mut hits: Vec<ScoredDocument> = entries
            .iter()
            .filter(|entry| filter.is_none_or(|f| f.matches(&entry.document.metadata)))
            .map(|entry| ScoredDocument {
                document: entry.document.clone(),
                score: relevance(&query_vector, &entry.vector),
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(k);
        Ok(hits)
    }

    async fn delete(&self, filter: &MetadataFilter) -> Result<u64> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|entry| !filter.matches(&entry.document.metadata));
        let removed = (before - entries.len()) as u64;

        debug!("Deleted {} documents matching {}", removed, filter);
        Ok(removed)
    }

    async fn list_metadata(
        &self,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<DocumentMetadata>> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .map(|entry| entry.document.metadata)
            .filter(|metadata| filter.is_none_or(|f| f.matches(metadata)))
            .collect())
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.entries.read().await.len() as u64)
    }
}
