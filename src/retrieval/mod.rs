
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::database::vector_store::{Metric, QueryResult, VectorStore};
use crate::embeddings::{Embedder, tokenize};
use crate::{RagError, Result};

/// Retrieval tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Chunks handed to the answerer per question
    pub top_k: usize,
    /// Candidates fetched per kept result, leaving room for deduplication
    pub fetch_multiplier: usize,
    /// Word-set Jaccard similarity at which a chunk duplicates a better one
    /// from the same document
    pub dedup_threshold: f32,
    /// Results scoring below this are dropped
    pub min_score: Option<f32>,
    /// Similarity for newly built indexes
    pub metric: Metric,
}

impl Default for RetrievalConfig {
    #[inline]
    fn default() -> Self {
        Self {
            top_k: 5,
            fetch_multiplier: 3,
            dedup_threshold: 0.9,
            min_score: None,
            metric: Metric::Cosine,
        }
    }
}

/// Turns a question into ranked supporting chunks
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    store: Arc<RwLock<VectorStore>>,
    config: RetrievalConfig,
}

impl Retriever {
    #[inline]
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<RwLock<VectorStore>>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            embedder,
            store,
            config,
        }
    }

    #[inline]
    pub fn store(&self) -> &Arc<RwLock<VectorStore>> {
        &self.store
    }

    /// Up to `k` chunks ranked by similarity to `question`. A question that
    /// embeds to a zero vector retrieves nothing.
    ///
    /// Fails with `ModelMismatch` when the index was built by another model.
    #[inline]
    pub async fn retrieve(&self, question: &str, k: usize) -> Result<Vec<QueryResult>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        self.store.read().await.check_model(self.embedder.model_id())?;

        let embedder = Arc::clone(&self.embedder);
        let text = question.to_string();
        let query = tokio::task::spawn_blocking(move || embedder.embed(&text))
            .await
            .map_err(|e| RagError::Other(e.into()))??;

        // A question with no embeddable content is similar to nothing
        if query.iter().all(|value| *value == 0.0) {
            debug!("Question embedded to a zero vector, nothing to retrieve");
            return Ok(Vec::new());
        }

        let fetch = k.saturating_mul(self.config.fetch_multiplier.max(1));
        let candidates = self.store.read().await.search(&query, fetch, None).await?;
        debug!(
            "Fetched {} candidates for {} results",
            candidates.len(),
            k
        );

        Ok(self.select(candidates, k))
    }

    /// Drop low scores and near-duplicates, keeping rank order
    fn select(&self, candidates: Vec<QueryResult>, k: usize) -> Vec<QueryResult> {
        let mut kept: Vec<(QueryResult, HashSet<String>)> = Vec::with_capacity(k);

        for candidate in candidates {
            if kept.len() == k {
                break;
            }
            if self
                .config
                .min_score
                .is_some_and(|min_score| candidate.score < min_score)
            {
                continue;
            }

            let words: HashSet<String> = tokenize(&candidate.text).collect();
            let duplicate = kept.iter().any(|(other, other_words)| {
                other.document_id == candidate.document_id
                    && jaccard(&words, other_words) >= self.config.dedup_threshold
            });
            if duplicate {
                debug!("Dropping near-duplicate chunk {}", candidate.chunk_id);
                continue;
            }

            kept.push((candidate, words));
        }

        kept.into_iter().map(|(result, _)| result).collect()
    }
}

/// Jaccard similarity of two word sets; two empty sets are identical
#[inline]
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f32 / union as f32
}
