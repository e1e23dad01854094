#[cfg(test)]
mod tests;

use async_trait::async_trait;
use std::collections::HashMap;

use crate::Result;
use crate::embeddings::Embedder;

/// Deterministic, content-aware embeddings without a model server.
///
/// Each token adds weight to one dimension picked by its hash, and each of its
/// character trigrams to another, so texts sharing words end up close under
/// cosine similarity. Vectors are unit length; empty text maps to zero.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    #[inline]
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn bucket(&self, seed: u64, bytes: &[u8]) -> usize {
        let hash = bytes
            .iter()
            .fold(seed, |acc, b| acc.wrapping_mul(1_099_511_628_211) ^ u64::from(*b));
        (hash % self.dimensions as u64) as usize
    }

    #[inline]
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0_f32; self.dimensions];

        let lower = text.to_lowercase();
        let mut frequencies: HashMap<&str, u32> = HashMap::new();
        for token in lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|token| !token.is_empty())
        {
            *frequencies.entry(token).or_insert(0) += 1;
        }

        for (token, frequency) in &frequencies {
            let weight = *frequency as f32;
            embedding[self.bucket(0xcbf2_9ce4_8422_2325, token.as_bytes())] += weight;

            let chars: Vec<char> = token.chars().collect();
            for window in chars.windows(3) {
                let trigram: String = window.iter().collect();
                embedding[self.bucket(0x8422_2325_cbf2_9ce4, trigram.as_bytes())] +=
                    weight.sqrt() * 0.5;
            }
        }

        let norm = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut embedding {
                *value /= norm;
            }
        }

        embedding
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn name(&self) -> String {
        format!("hashing/{}", self.dimensions)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|text| self.embed_text(text)).collect())
    }
}
