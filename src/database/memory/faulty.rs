//! Index wrapper that fails on demand, for exercising rollback and catch-up paths

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::InMemoryIndex;
use crate::database::vector_index::{
    Document, DocumentMetadata, MetadataFilter, ScoredDocument, VectorIndex,
};
use crate::embeddings::HashingEmbedder;
use crate::{KbError, Result};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Fault {
    None,
    /// Every add fails before anything is written
    RejectAdds,
    /// Adds are written, then reported as failed
    IndexThenFail,
    /// Adds hang for the given time before succeeding
    Stall(Duration),
    /// Adds fail when any document text contains the marker
    RejectText(String),
}

#[derive(Debug)]
pub(crate) struct FaultyIndex {
    inner: InMemoryIndex,
    fault: Mutex<Fault>,
    optimizations: AtomicU64,
}

impl FaultyIndex {
    pub(crate) fn new() -> Self {
        Self {
            inner: InMemoryIndex::new(Arc::new(HashingEmbedder::new(256))),
            fault: Mutex::new(Fault::None),
            optimizations: AtomicU64::new(0),
        }
    }

    pub(crate) fn set_fault(&self, fault: Fault) {
        *self.fault.lock().expect("fault lock poisoned") = fault;
    }

    pub(crate) fn optimizations(&self) -> u64 {
        self.optimizations.load(Ordering::SeqCst)
    }

    fn fault(&self) -> Fault {
        self.fault.lock().expect("fault lock poisoned").clone()
    }
}

#[async_trait]
impl VectorIndex for FaultyIndex {
    fn name(&self) -> &'static str {
        "faulty"
    }

    async fn add(&self, documents: Vec<Document>) -> Result<Vec<String>> {
        match self.fault() {
            Fault::None => self.inner.add(documents).await,
            Fault::RejectAdds => Err(KbError::VectorIndex("index unavailable".to_string())),
            Fault::IndexThenFail => {
                self.inner.add(documents).await?;
                Err(KbError::VectorIndex("connection reset after write".to_string()))
            }
            Fault::Stall(delay) => {
                tokio::time::sleep(delay).await;
                self.inner.add(documents).await
            }
            Fault::RejectText(marker) => {
                if documents.iter().any(|d| d.text.contains(&marker)) {
                    Err(KbError::VectorIndex(format!("cannot embed '{}'", marker)))
                } else {
                    self.inner.add(documents).await
                }
            }
        }
    }

    async fn search(
        &self,
        query: &str,
        filter: Option<&MetadataFilter>,
        k: usize,
    ) -> Result<Vec<ScoredDocument>> {
        self.inner.search(query, filter, k).await
    }

    async fn delete(&self, filter: &MetadataFilter) -> Result<u64> {
        self.inner.delete(filter).await
    }

    async fn list_metadata(
        &self,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<DocumentMetadata>> {
        self.inner.list_metadata(filter).await
    }

    async fn count(&self) -> Result<u64> {
        self.inner.count().await
    }

    async fn optimize(&self) -> Result<()> {
        self.optimizations.fetch_add(1, Ordering::SeqCst);
        self.inner.optimize().await
    }
}
