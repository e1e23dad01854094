// Embeddings module
// Turns document text into vectors, either through Ollama or a local hashing model

pub mod hashing;
pub mod ollama;

use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::info;

use crate::config::{EmbeddingConfig, EmbeddingProvider};
use crate::{KbError, Result};

pub use hashing::HashingEmbedder;
pub use ollama::{OllamaClient, OllamaEmbedder};

#[async_trait]
pub trait Embedder: Send + Sync + Debug {
    /// Provider and model, for logs
    fn name(&self) -> String;

    fn dimensions(&self) -> usize;

    /// One vector per input text, in input order
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut embeddings = self.embed_batch(&[text.to_string()]).await?;
        embeddings
            .pop()
            .ok_or_else(|| KbError::Embedding("No embedding returned".to_string()))
    }
}

/// Build the embedder selected by `config.provider`
#[inline]
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    let embedder: Arc<dyn Embedder> = match config.provider {
        EmbeddingProvider::Ollama => {
            let client = OllamaClient::new(config)
                .map_err(|e| KbError::Config(format!("Failed to create Ollama client: {:#}", e)))?;
            Arc::new(OllamaEmbedder::new(client, config.embedding_dimension as usize))
        }
        EmbeddingProvider::Hashing => {
            Arc::new(HashingEmbedder::new(config.embedding_dimension as usize))
        }
    };

    info!("Using embedder {}", embedder.name());
    Ok(embedder)
}
