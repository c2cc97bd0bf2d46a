// Indexer module
// Builds and incrementally refreshes the vector index from configured sources


use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::database::vector_store::{DocumentRecord, IndexEntry, IndexStatus, VectorStore};
use crate::embeddings::Embedder;
use crate::embeddings::chunking::{Chunk, chunk_document};
use crate::loader::{Document, LoadFailure, Loader, Source, SourceKind};
use crate::{RagError, Result};

/// Outcome of a setup run
#[derive(Debug)]
pub struct SetupReport {
    pub documents_indexed: usize,
    /// Documents whose content and chunking were already indexed
    pub skipped_unchanged: usize,
    pub chunks_written: usize,
    /// Stale or vanished documents deleted from the index
    pub removed: usize,
    /// Sources that could not be loaded or indexed
    pub failures: Vec<LoadFailure>,
    /// Files ignored because their format is not supported
    pub skipped_files: Vec<PathBuf>,
    pub cancelled: bool,
    pub status: IndexStatus,
}

impl SetupReport {
    #[inline]
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}

enum DocumentOutcome {
    Indexed { chunks: usize, removed: usize },
    Unchanged,
    Failed(LoadFailure),
}

/// A document chunked and embedded, ready to be written
struct PreparedDocument {
    document: Document,
    entries: Vec<IndexEntry>,
    fingerprint: String,
}

enum Prepared {
    Ready(PreparedDocument),
    Unchanged,
    Failed(LoadFailure),
}

/// Runs the Loader → Chunker → Embedder → Index pipeline
pub struct Indexer {
    config: Config,
    embedder: Arc<dyn Embedder>,
    loader: Loader,
    cancel: CancellationToken,
}

impl Indexer {
    #[inline]
    pub fn new(config: Config, embedder: Arc<dyn Embedder>) -> Self {
        let loader = Loader::new(config.crawler.clone());
        Self {
            config,
            embedder,
            loader,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop loading, crawling and indexing once `cancel` fires
    #[inline]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.loader = Loader::new(self.config.crawler.clone()).with_cancellation(cancel.clone());
        self.cancel = cancel;
        self
    }

    /// Ingest every configured source into the persisted index.
    ///
    /// Unchanged documents are skipped and files that disappeared from the
    /// docs directory are pruned. With `rebuild` the existing index is
    /// discarded, which is also the only way to switch embedding models.
    ///
    /// Per-document failures end up in the report. Configuration-class
    /// errors abort the run; documents committed before them stay indexed.
    #[inline]
    pub async fn setup(&self, rebuild: bool) -> Result<SetupReport> {
        let embedder = Arc::clone(&self.embedder);
        tokio::task::spawn_blocking(move || embedder.health_check())
            .await
            .map_err(|e| RagError::Other(e.into()))??;

        let store = RwLock::new(self.open_store(rebuild).await?);

        let (sources, mut failures, docs_present) = self.sources();
        let loaded = self.loader.load_all(&sources).await;
        failures.extend(loaded.failures);
        let walk_complete = docs_present && loaded.walk_complete;
        if loaded.cancelled {
            warn!("Setup cancelled while loading sources");
        }

        let mut report = SetupReport {
            documents_indexed: 0,
            skipped_unchanged: 0,
            chunks_written: 0,
            removed: 0,
            failures,
            skipped_files: loaded.skipped,
            cancelled: loaded.cancelled,
            status: store.read().await.status(),
        };

        let bar = progress_bar(loaded.documents.len());
        let concurrency = self.config.indexing.concurrency.max(1);
        let checkpoint_every = self.config.indexing.checkpoint_every.max(1);

        // Chunking and embedding run concurrently; writes happen one document
        // at a time below, so no task holds the store across an await
        let shared = &store;
        let mut prepared = stream::iter(loaded.documents)
            .map(|document| async move { self.prepare_document(document, shared).await })
            .buffer_unordered(concurrency);

        let mut since_checkpoint = 0;
        while !report.cancelled {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    warn!("Setup cancelled, keeping completed documents");
                    report.cancelled = true;
                    break;
                }
                next = prepared.next() => next,
            };
            let Some(next) = next else {
                break;
            };
            bar.inc(1);

            let outcome = match next {
                Prepared::Ready(document) => commit(&mut *store.write().await, document).await,
                Prepared::Unchanged => DocumentOutcome::Unchanged,
                Prepared::Failed(failure) => DocumentOutcome::Failed(failure),
            };
            match outcome {
                DocumentOutcome::Indexed { chunks, removed } => {
                    report.documents_indexed += 1;
                    report.chunks_written += chunks;
                    report.removed += removed;
                    since_checkpoint += 1;
                }
                DocumentOutcome::Unchanged => report.skipped_unchanged += 1,
                DocumentOutcome::Failed(failure) if failure.error.is_fatal() => {
                    error!("Aborting setup: {}", failure.error);
                    bar.abandon();
                    return Err(failure.error);
                }
                DocumentOutcome::Failed(failure) => {
                    warn!("Failed to index {}: {}", failure.source_uri, failure.error);
                    report.failures.push(failure);
                }
            }

            if since_checkpoint >= checkpoint_every {
                debug!("Checkpointing index after {} documents", since_checkpoint);
                store.write().await.persist().await?;
                since_checkpoint = 0;
            }
        }
        drop(prepared);
        bar.finish_and_clear();

        if walk_complete && !report.cancelled {
            report.removed += prune_vanished(&mut *store.write().await, &loaded.seen_files).await?;
        } else if !report.cancelled {
            info!("Docs directory was not fully walked, skipping pruning");
        }

        let mut store = store.write().await;
        store.persist().await?;
        report.status = store.status();

        info!(
            "Setup finished: {} indexed, {} unchanged, {} removed, {} failed{}",
            report.documents_indexed,
            report.skipped_unchanged,
            report.removed,
            report.failures.len(),
            if report.cancelled { " (cancelled)" } else { "" }
        );

        Ok(report)
    }

    /// Existing index for the configured model, or a fresh one.
    ///
    /// A missing index starts empty. An unreadable one is left alone unless
    /// `rebuild` is set.
    async fn open_store(&self, rebuild: bool) -> Result<VectorStore> {
        let index_path = self.config.index_path();

        if rebuild || !index_path.exists() {
            if rebuild {
                info!("Rebuilding index from scratch");
            } else {
                info!("No index at {}, creating one", index_path.display());
            }
            return VectorStore::create(
                &index_path,
                self.embedder.model_id(),
                self.embedder.dimension(),
                self.config.metric(),
            )
            .await;
        }

        let store = VectorStore::load(&index_path).await.map_err(|e| match e {
            RagError::IndexUnavailable(message) => RagError::IndexUnavailable(format!(
                "{}; run `docs-rag setup --rebuild`",
                message
            )),
            other => other,
        })?;
        store.check_model(self.embedder.model_id())?;
        if store.metric() != self.config.metric() {
            warn!(
                "Index uses {:?} similarity, ignoring configured {:?} until rebuilt",
                store.metric(),
                self.config.metric()
            );
        }
        Ok(store)
    }

    /// Configured sources, invalid URLs as failures, and whether the docs
    /// directory exists
    fn sources(&self) -> (Vec<Source>, Vec<LoadFailure>, bool) {
        let mut sources = Vec::new();
        let mut failures = Vec::new();

        let docs_path = self.config.docs_path();
        let docs_present = docs_path.is_dir();
        if docs_present {
            sources.push(Source::File(docs_path));
        } else {
            warn!("Docs directory {} does not exist", docs_path.display());
        }

        for url in &self.config.sources.urls {
            match Source::parse(url) {
                Ok(source @ Source::Web(_)) => sources.push(source),
                Ok(Source::File(_)) => failures.push(LoadFailure {
                    source_uri: url.clone(),
                    error: RagError::Config(format!("not a web URL: {}", url)),
                }),
                Err(error) => failures.push(LoadFailure {
                    source_uri: url.clone(),
                    error,
                }),
            }
        }

        (sources, failures, docs_present)
    }

    /// Chunk and embed one document. Unchanged documents stop here.
    async fn prepare_document(&self, document: Document, store: &RwLock<VectorStore>) -> Prepared {
        let failed = |error: RagError| {
            Prepared::Failed(LoadFailure {
                source_uri: document.source_uri.clone(),
                error,
            })
        };

        let chunks: Vec<Chunk> = match chunk_document(&document, &self.config.chunking) {
            Ok(chunks) => chunks.into_iter().filter(|chunk| !chunk.is_blank()).collect(),
            Err(e) => return failed(e),
        };
        let fingerprint = fingerprint(&chunks);

        if store
            .read()
            .await
            .document(&document.id)
            .is_some_and(|record| record.fingerprint == fingerprint)
        {
            debug!("Skipping unchanged document {}", document.source_uri);
            return Prepared::Unchanged;
        }

        let vectors = if chunks.is_empty() {
            Vec::new()
        } else {
            let embedder = Arc::clone(&self.embedder);
            let texts: Vec<String> = chunks.iter().map(|chunk| chunk.text.clone()).collect();
            match tokio::task::spawn_blocking(move || embedder.embed_batch(&texts)).await {
                Ok(Ok(vectors)) => vectors,
                Ok(Err(e)) => return failed(e),
                Err(e) => return failed(RagError::Other(e.into())),
            }
        };
        if vectors.len() != chunks.len() {
            return failed(RagError::Embedding(format!(
                "expected {} vectors, got {}",
                chunks.len(),
                vectors.len()
            )));
        }

        let model_id = self.embedder.model_id();
        let entries: Vec<IndexEntry> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| IndexEntry::from_chunk(chunk, &document, model_id, vector))
            .collect();

        Prepared::Ready(PreparedDocument {
            document,
            entries,
            fingerprint,
        })
    }
}

/// Replace every stale version of a document's source with its new entries.
/// Nothing is written if the batch is rejected.
async fn commit(store: &mut VectorStore, prepared: PreparedDocument) -> DocumentOutcome {
    let PreparedDocument {
        document,
        entries,
        fingerprint,
    } = prepared;
    let failed = |error: RagError| {
        DocumentOutcome::Failed(LoadFailure {
            source_uri: document.source_uri.clone(),
            error,
        })
    };

    // A rejected batch must leave the previous version in place
    if let Err(e) = store.validate(&entries) {
        return failed(e);
    }

    let mut removed = 0;
    for document_id in &store.documents_for_source(&document.source_uri) {
        if let Err(e) = store.delete(document_id).await {
            return failed(e);
        }
        if *document_id != document.id {
            removed += 1;
        }
    }
    if let Err(e) = store.upsert(&entries).await {
        return failed(e);
    }

    let chunk_count = entries.len();
    let record = DocumentRecord {
        source_uri: document.source_uri.clone(),
        source_kind: document.source_kind,
        fingerprint,
        chunk_count,
        indexed_at: chrono::Utc::now(),
    };
    if let Err(e) = store.record_document(&document.id, record).await {
        return failed(e);
    }

    debug!(
        "Indexed {} ({} chunks, replaced {} stale)",
        document.source_uri, chunk_count, removed
    );
    DocumentOutcome::Indexed {
        chunks: chunk_count,
        removed,
    }
}

/// Hash of the chunk ids, which change with both content and chunking settings
fn fingerprint(chunks: &[Chunk]) -> String {
    let mut hasher = Sha256::new();
    for chunk in chunks {
        hasher.update(chunk.id.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

/// Delete file documents whose source is no longer on disk; web documents stay
async fn prune_vanished(store: &mut VectorStore, seen_files: &HashSet<String>) -> Result<usize> {
    let vanished: Vec<(String, String)> = store
        .documents()
        .filter(|(_, record)| {
            record.source_kind == SourceKind::File && !seen_files.contains(&record.source_uri)
        })
        .map(|(id, record)| (id.clone(), record.source_uri.clone()))
        .collect();

    for (document_id, source_uri) in &vanished {
        info!("Pruning vanished file {}", source_uri);
        store.delete(document_id).await?;
    }
    Ok(vanished.len())
}

fn progress_bar(len: usize) -> ProgressBar {
    if console::user_attended_stderr() {
        ProgressBar::new(len as u64).with_style(
            ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} Indexing documents")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        )
    } else {
        ProgressBar::hidden()
    }
}
