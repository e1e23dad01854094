//! Vector index abstraction.
//!
//! A vector index embeds document text and answers similarity queries. It is
//! a derived cache over relational rows: every document carries the `_db_id`
//! and `_version` of the row it was projected from, and those two keys are
//! the only way search results are traced back to relational identity.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};

use crate::Result;

/// Relational identity carried by every indexed document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentMetadata {
    #[serde(rename = "_db_id")]
    pub db_id: i64,
    #[serde(rename = "_version")]
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub text: String,
    pub metadata: DocumentMetadata,
}

/// A search hit; `score` is a relevance in `[0, 1]`, higher is better
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredDocument {
    pub document: Document,
    pub score: f32,
}

/// Predicate over document metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataFilter {
    VersionEquals(i64),
    VersionBelow(i64),
    DbIdIn(Vec<i64>),
}

impl MetadataFilter {
    #[inline]
    pub fn matches(&self, metadata: &DocumentMetadata) -> bool {
        match self {
            Self::VersionEquals(version) => metadata.version == *version,
            Self::VersionBelow(version) => metadata.version < *version,
            Self::DbIdIn(ids) => ids.contains(&metadata.db_id),
        }
    }

    /// True when no document can ever match
    #[inline]
    pub fn matches_nothing(&self) -> bool {
        matches!(self, Self::DbIdIn(ids) if ids.is_empty())
    }

    /// SQL predicate over the `db_id` / `version` columns of a LanceDB table
    #[inline]
    pub fn to_predicate(&self) -> String {
        match self {
            Self::VersionEquals(version) => format!("version = {}", version),
            Self::VersionBelow(version) => format!("version < {}", version),
            Self::DbIdIn(ids) if ids.is_empty() => "false".to_string(),
            Self::DbIdIn(ids) => format!(
                "db_id IN ({})",
                ids.iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }
}

impl Display for MetadataFilter {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_predicate())
    }
}

/// Trait for vector index backends.
///
/// Backends own their embedder: callers hand over text and get text back.
#[async_trait]
pub trait VectorIndex: Send + Sync + Debug {
    /// Backend name for logs and status output
    fn name(&self) -> &'static str;

    /// Embed and index `documents`, returning one index-assigned id per document
    async fn add(&self, documents: Vec<Document>) -> Result<Vec<String>>;

    /// Up to `k` documents most similar to `query`, best first
    async fn search(
        &self,
        query: &str,
        filter: Option<&MetadataFilter>,
        k: usize,
    ) -> Result<Vec<ScoredDocument>>;

    /// Remove every document matching `filter`, returning how many were removed
    async fn delete(&self, filter: &MetadataFilter) -> Result<u64>;

    async fn list_metadata(&self, filter: Option<&MetadataFilter>)
    -> Result<Vec<DocumentMetadata>>;

    async fn count(&self) -> Result<u64>;

    /// Reclaim space left behind by deletes. Backends without on-disk state do nothing.
    async fn optimize(&self) -> Result<()> {
        Ok(())
    }
}
