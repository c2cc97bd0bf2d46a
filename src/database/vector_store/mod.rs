#[cfg(test)]
mod tests;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::database::lancedb::ChunkTable;
use crate::database::sqlite::{IndexMetadata, Manifest};
use crate::embeddings::chunking::{CharSpan, Chunk};
use crate::loader::Document;
use crate::{RagError, Result};

pub use crate::database::sqlite::DocumentRecord;

const INDEX_VERSION: u32 = 1;
const METADATA_FILE: &str = "metadata.db";
const VECTORS_DIR: &str = "vectors";

/// Similarity measure, fixed for the lifetime of an index
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum Metric {
    #[default]
    Cosine,
    InnerProduct,
}

/// A chunk, its vector and the metadata needed to answer from it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexEntry {
    pub chunk_id: String,
    pub document_id: String,
    pub source_uri: String,
    pub ordinal: usize,
    pub text: String,
    pub char_span: CharSpan,
    /// 1-based page for paged sources
    pub page: Option<u32>,
    pub model_id: String,
    pub vector: Vec<f32>,
}

impl IndexEntry {
    #[inline]
    pub fn from_chunk(
        chunk: &Chunk,
        document: &Document,
        model_id: &str,
        vector: Vec<f32>,
    ) -> Self {
        Self {
            chunk_id: chunk.id.clone(),
            document_id: chunk.document_id.clone(),
            source_uri: document.source_uri.clone(),
            ordinal: chunk.ordinal,
            text: chunk.text.clone(),
            char_span: chunk.char_span,
            page: document.page_at(chunk.char_span.start),
            model_id: model_id.to_string(),
            vector,
        }
    }
}

/// One search hit
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QueryResult {
    pub chunk_id: String,
    pub document_id: String,
    pub source_uri: String,
    pub ordinal: usize,
    pub text: String,
    pub page: Option<u32>,
    pub score: f32,
}

/// Restrict a search to one document or one source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchFilter {
    Document(String),
    Source(String),
}

/// Summary of an index for status reporting
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IndexStatus {
    pub model_id: String,
    pub metric: Metric,
    pub dimension: Option<usize>,
    pub document_count: usize,
    pub chunk_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persistent vector index.
///
/// Chunk rows and their vectors live in a LanceDB table; the manifest and the
/// per-document records live in SQLite next to it. Writes go through
/// `upsert`, which validates the whole batch before touching any row, and are
/// durable once they return.
pub struct VectorStore {
    root: PathBuf,
    metadata: IndexMetadata,
    chunks: ChunkTable,
    manifest: Manifest,
    documents: BTreeMap<String, DocumentRecord>,
    chunk_count: usize,
}

impl VectorStore {
    /// Create an empty index at `root`, replacing whatever was there
    ///
    /// # Arguments
    /// * `root` - Directory that will hold the index
    /// * `model_id` - Embedding model every entry must come from
    /// * `dimension` - Vector length, or `None` to take it from the first upsert
    /// * `metric` - Similarity used by `search`
    #[inline]
    pub async fn create(
        root: &Path,
        model_id: &str,
        dimension: Option<usize>,
        metric: Metric,
    ) -> Result<Self> {
        if root.is_dir() {
            fs::remove_dir_all(root)?;
        } else if root.exists() {
            fs::remove_file(root)?;
        }
        fs::create_dir_all(root)?;

        let metadata = IndexMetadata::open(&root.join(METADATA_FILE), true)
            .await
            .map_err(metadata_error)?;
        let now = Utc::now();
        let manifest = Manifest {
            version: INDEX_VERSION,
            model_id: model_id.to_string(),
            dimension,
            metric,
            created_at: now,
            updated_at: now,
        };
        metadata
            .write_manifest(&manifest)
            .await
            .map_err(metadata_error)?;

        let mut chunks = ChunkTable::connect(&root.join(VECTORS_DIR)).await?;
        if let Some(dimension) = dimension {
            chunks.create(dimension).await?;
        }

        info!("Created index at {} for model {}", root.display(), model_id);
        Ok(Self {
            root: root.to_path_buf(),
            metadata,
            chunks,
            manifest,
            documents: BTreeMap::new(),
            chunk_count: 0,
        })
    }

    /// Open the index at `root`.
    ///
    /// A missing or unreadable index is `IndexUnavailable`; the caller has to
    /// decide whether to rebuild.
    #[inline]
    pub async fn load(root: &Path) -> Result<Self> {
        let metadata_path = root.join(METADATA_FILE);
        if !metadata_path.is_file() {
            return Err(RagError::IndexUnavailable(format!(
                "no index at {}",
                root.display()
            )));
        }

        let metadata = IndexMetadata::open(&metadata_path, false)
            .await
            .map_err(unavailable(root))?;
        let manifest = metadata
            .read_manifest()
            .await
            .map_err(unavailable(root))?
            .ok_or_else(|| {
                RagError::IndexUnavailable(format!("{} has no manifest", root.display()))
            })?;

        if manifest.version != INDEX_VERSION {
            return Err(RagError::IndexUnavailable(format!(
                "index version {} is not supported (expected {})",
                manifest.version, INDEX_VERSION
            )));
        }

        let documents = metadata.documents().await.map_err(unavailable(root))?;
        let chunks = ChunkTable::connect(&root.join(VECTORS_DIR))
            .await
            .map_err(unavailable(root))?;

        match (chunks.dimension(), manifest.dimension) {
            (Some(table), Some(stamped)) if table == stamped => {}
            (None, _) if documents.is_empty() => {}
            (table, stamped) => {
                warn!("Index at {} is inconsistent", root.display());
                return Err(RagError::IndexUnavailable(format!(
                    "vector table dimension {:?} does not match manifest dimension {:?}",
                    table, stamped
                )));
            }
        }

        let chunk_count = chunks.count().await.map_err(unavailable(root))?;

        info!(
            "Loaded index with {} chunks from {} (model {})",
            chunk_count,
            root.display(),
            manifest.model_id
        );
        Ok(Self {
            root: root.to_path_buf(),
            metadata,
            chunks,
            manifest,
            documents,
            chunk_count,
        })
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn model_id(&self) -> &str {
        &self.manifest.model_id
    }

    #[inline]
    pub fn dimension(&self) -> Option<usize> {
        self.manifest.dimension
    }

    #[inline]
    pub fn metric(&self) -> Metric {
        self.manifest.metric
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.chunk_count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.chunk_count == 0
    }

    /// Vectors from different models are not comparable
    #[inline]
    pub fn check_model(&self, embedder_model: &str) -> Result<()> {
        if self.manifest.model_id == embedder_model {
            return Ok(());
        }
        Err(RagError::ModelMismatch {
            index_model: self.manifest.model_id.clone(),
            embedder_model: embedder_model.to_string(),
        })
    }

    /// Insert or replace entries by chunk id.
    ///
    /// The batch is rejected as a whole if any entry is malformed: empty id,
    /// foreign model, wrong dimension, non-finite component, or a zero vector
    /// under cosine similarity.
    #[inline]
    pub async fn upsert(&mut self, entries: &[IndexEntry]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }

        let dimension = self.validate(entries)?;

        if self.manifest.dimension.is_none() {
            info!("Index dimension fixed at {}", dimension);
            self.metadata
                .set_dimension(dimension)
                .await
                .map_err(metadata_error)?;
            self.manifest.dimension = Some(dimension);
        }
        if !self.chunks.exists() {
            self.chunks.create(dimension).await?;
        }

        self.chunks.upsert(entries).await?;
        self.refresh().await?;

        debug!("Upserted {} entries ({} total)", entries.len(), self.chunk_count);
        Ok(entries.len())
    }

    /// Check a batch as `upsert` would, without writing it. Returns the
    /// dimension the batch is held to.
    #[inline]
    pub fn validate(&self, entries: &[IndexEntry]) -> Result<usize> {
        let dimension = self
            .manifest
            .dimension
            .or_else(|| entries.first().map(|entry| entry.vector.len()))
            .unwrap_or_default();

        for (index, entry) in entries.iter().enumerate() {
            self.validate_entry(entry, dimension).map_err(|reason| {
                RagError::Validation(format!(
                    "entry {} (chunk {}) rejected: {}",
                    index, entry.chunk_id, reason
                ))
            })?;
        }

        Ok(dimension)
    }

    fn validate_entry(
        &self,
        entry: &IndexEntry,
        dimension: usize,
    ) -> std::result::Result<(), String> {
        if entry.chunk_id.trim().is_empty() {
            return Err("empty chunk id".to_string());
        }
        if entry.model_id != self.manifest.model_id {
            return Err(format!(
                "model '{}' does not match index model '{}'",
                entry.model_id, self.manifest.model_id
            ));
        }
        self.check_vector(&entry.vector, dimension)
    }

    fn check_vector(&self, vector: &[f32], dimension: usize) -> std::result::Result<(), String> {
        if dimension == 0 || vector.len() != dimension {
            return Err(format!(
                "vector has {} dimensions, expected {}",
                vector.len(),
                dimension
            ));
        }
        if vector.iter().any(|value| !value.is_finite()) {
            return Err("vector has a non-finite component".to_string());
        }
        if self.manifest.metric == Metric::Cosine && is_zero(vector) {
            return Err("zero vector cannot be compared by cosine similarity".to_string());
        }
        Ok(())
    }

    /// Top `k` entries by descending similarity, ties broken by ascending
    /// chunk id. Only chunks of recorded documents are returned.
    #[inline]
    pub async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<QueryResult>> {
        if k == 0 || self.chunk_count == 0 {
            return Ok(Vec::new());
        }

        let dimension = self.manifest.dimension.unwrap_or(query.len());
        self.check_vector(query, dimension)
            .map_err(|reason| RagError::Validation(format!("query rejected: {}", reason)))?;

        // Extra rows leave room to order ties at the cutoff
        let mut results: Vec<QueryResult> = self
            .chunks
            .search(query, k.saturating_mul(2), self.manifest.metric, filter)
            .await?
            .into_iter()
            .filter(|result| self.documents.contains_key(&result.document_id))
            .collect();

        results.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        results.truncate(k);
        Ok(results)
    }

    /// Remove every chunk of a document along with its record
    #[inline]
    pub async fn delete(&mut self, document_id: &str) -> Result<usize> {
        let before = self.chunk_count;
        self.chunks.delete_document(document_id).await?;
        let had_record = self
            .metadata
            .delete_document(document_id)
            .await
            .map_err(metadata_error)?;
        self.documents.remove(document_id);
        self.refresh().await?;

        let removed = before.saturating_sub(self.chunk_count);
        if removed > 0 || had_record {
            debug!("Deleted document {} ({} chunks)", document_id, removed);
        }
        Ok(removed)
    }

    #[inline]
    pub async fn record_document(
        &mut self,
        document_id: &str,
        record: DocumentRecord,
    ) -> Result<()> {
        self.metadata
            .upsert_document(document_id, &record)
            .await
            .map_err(metadata_error)?;
        self.documents.insert(document_id.to_string(), record);
        self.touch().await
    }

    #[inline]
    pub fn document(&self, document_id: &str) -> Option<&DocumentRecord> {
        self.documents.get(document_id)
    }

    #[inline]
    pub fn documents(&self) -> impl Iterator<Item = (&String, &DocumentRecord)> {
        self.documents.iter()
    }

    /// Ids of documents recorded for a source URI
    #[inline]
    pub fn documents_for_source(&self, source_uri: &str) -> Vec<String> {
        self.documents
            .iter()
            .filter(|(_, record)| record.source_uri == source_uri)
            .map(|(id, _)| id.clone())
            .collect()
    }

    #[inline]
    pub fn status(&self) -> IndexStatus {
        IndexStatus {
            model_id: self.manifest.model_id.clone(),
            metric: self.manifest.metric,
            dimension: self.manifest.dimension,
            document_count: self.documents.len(),
            chunk_count: self.chunk_count,
            created_at: self.manifest.created_at,
            updated_at: self.manifest.updated_at,
        }
    }

    /// Stamp the manifest and compact the vector table. Every write is
    /// already durable; this keeps the table fast to search.
    #[inline]
    pub async fn persist(&mut self) -> Result<()> {
        self.touch().await?;
        self.chunks.optimize().await?;
        info!(
            "Checkpointed index with {} chunks at {}",
            self.chunk_count,
            self.root.display()
        );
        Ok(())
    }

    async fn refresh(&mut self) -> Result<()> {
        self.chunk_count = self.chunks.count().await?;
        self.touch().await
    }

    async fn touch(&mut self) -> Result<()> {
        self.manifest.updated_at = Utc::now();
        self.metadata
            .touch(self.manifest.updated_at)
            .await
            .map_err(metadata_error)
    }
}

fn is_zero(vector: &[f32]) -> bool {
    vector.iter().all(|value| *value == 0.0)
}

fn metadata_error(e: anyhow::Error) -> RagError {
    RagError::Database(format!("{:#}", e))
}

fn unavailable<E: Display>(root: &Path) -> impl FnOnce(E) -> RagError + '_ {
    move |e| {
        warn!("Index at {} is unreadable: {:#}", root.display(), e);
        RagError::IndexUnavailable(format!("cannot read index at {}: {:#}", root.display(), e))
    }
}
