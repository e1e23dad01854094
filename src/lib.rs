use thiserror::Error;

pub type Result<T> = std::result::Result<T, KbError>;

#[derive(Error, Debug)]
pub enum KbError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    /// A relational write failed. The transaction has already been rolled back.
    #[error("Failed to store batch: {0}")]
    StoreFailure(String),

    /// The compensating rollback after a vectorization error failed as well.
    /// The vectorization error is kept as the source so both causes are visible.
    #[error("Failed to roll back version {version}: {reason}")]
    RollbackFailure {
        version: i64,
        reason: String,
        #[source]
        vectorization: Box<KbError>,
    },

    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Vector index error: {0}")]
    VectorIndex(String),

    #[error("No such knowledge base: {0}")]
    NoSuchKnowledgeBase(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub mod commands;
pub mod config;
pub mod database;
pub mod embeddings;
pub mod entity;
pub mod ingest;
pub mod knowledge;
pub mod store;
pub mod vectorizer;
