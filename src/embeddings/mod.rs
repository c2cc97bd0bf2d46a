pub mod chunking;
pub mod ollama;

#[cfg(test)]
mod tests;

use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;

use crate::config::{Config, EmbeddingProvider};
use crate::{RagError, Result};

pub use chunking::{Chunk, ChunkUnit, ChunkingConfig, chunk_document, stitch};
pub use ollama::{OllamaClient, OllamaEmbedder};

/// Maps text to fixed-length vectors for one model.
///
/// `embed` and `embed_batch` must agree numerically; the default `embed`
/// goes through `embed_batch`.
pub trait Embedder: Send + Sync {
    /// Identifier stamped on every vector this embedder produces
    fn model_id(&self) -> &str;

    /// Vector length, when known before the first request
    fn dimension(&self) -> Option<usize>;

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    #[inline]
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])?
            .pop()
            .ok_or_else(|| RagError::Embedding("embedder returned no vector".to_string()))
    }

    /// Fails with `ModelUnavailable` when the model cannot be used
    #[inline]
    fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// Longest prefix of `text` with at most `max_chars` characters
#[inline]
pub fn truncate_input(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => {
            debug!(
                "Truncating embedding input from {} bytes to {} bytes",
                text.len(),
                cut
            );
            text.get(..cut).unwrap_or(text)
        }
        None => text,
    }
}

/// Offline embedder using signed feature hashing of lowercase word tokens.
/// Texts sharing vocabulary land close together; no model server is needed.
#[derive(Debug, Clone)]
pub struct HashedEmbedder {
    dimension: usize,
    model_id: String,
}

impl HashedEmbedder {
    #[inline]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            model_id: format!("hashed-{}", dimension),
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dimension];
        if self.dimension == 0 {
            return vector;
        }

        for token in tokenize(text) {
            let digest = Sha256::digest(token.as_bytes());
            let mut bucket_bytes = [0_u8; 8];
            bucket_bytes.copy_from_slice(&digest[..8]);
            let bucket = (u64::from_le_bytes(bucket_bytes) % self.dimension as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        normalize(&mut vector);
        vector
    }
}

impl Embedder for HashedEmbedder {
    #[inline]
    fn model_id(&self) -> &str {
        &self.model_id
    }

    #[inline]
    fn dimension(&self) -> Option<usize> {
        Some(self.dimension)
    }

    #[inline]
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }
}

/// Lowercase alphanumeric runs
#[inline]
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
}

/// Scale `vector` to unit length; zero vectors are left alone
#[inline]
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

/// Build the embedder selected by the configuration
#[inline]
pub fn build_embedder(config: &Config) -> Result<Arc<dyn Embedder>> {
    match config.embedding.provider {
        EmbeddingProvider::Ollama => Ok(Arc::new(OllamaEmbedder::new(&config.ollama)?)),
        EmbeddingProvider::Hashed => Ok(Arc::new(HashedEmbedder::new(
            config.embedding.dimension as usize,
        ))),
    }
}
