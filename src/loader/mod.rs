pub mod files;

#[cfg(test)]
mod tests;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use walkdir::WalkDir;

use self::files::{FileFormat, read_file};
use crate::crawler::{CrawlerConfig, SiteCrawler, validate_url};
use crate::{RagError, Result};

/// Where a document came from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum SourceKind {
    File,
    Web,
}

/// Normalized text of one source, immutable once loaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Hex SHA-256 over the source URI and text
    pub id: String,
    pub source_uri: String,
    pub raw_text: String,
    pub source_kind: SourceKind,
    pub fetched_at: DateTime<Utc>,
    /// Byte offsets of page starts for paged formats, empty otherwise
    pub page_starts: Vec<usize>,
}

impl Document {
    #[inline]
    pub fn new(
        source_uri: impl Into<String>,
        raw_text: impl Into<String>,
        source_kind: SourceKind,
    ) -> Self {
        let source_uri = source_uri.into();
        let raw_text = raw_text.into();
        Self {
            id: document_id(&source_uri, &raw_text),
            source_uri,
            raw_text,
            source_kind,
            fetched_at: Utc::now(),
            page_starts: Vec::new(),
        }
    }

    #[inline]
    pub fn with_page_starts(mut self, page_starts: Vec<usize>) -> Self {
        self.page_starts = page_starts;
        self
    }

    /// 1-based page containing the byte at `offset`, if the document is paged
    #[inline]
    pub fn page_at(&self, offset: usize) -> Option<u32> {
        if self.page_starts.is_empty() {
            return None;
        }
        let page = self.page_starts.partition_point(|&start| start <= offset).max(1);
        u32::try_from(page).ok()
    }
}

/// Stable content hash, so reloading an unchanged source yields the same id
#[inline]
pub fn document_id(source_uri: &str, raw_text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_uri.as_bytes());
    hasher.update([0_u8]);
    hasher.update(raw_text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A file, a directory of files, or a web seed URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    File(PathBuf),
    Web(Url),
}

impl Source {
    /// Treat anything with an http(s) scheme as a web seed, everything else as a path
    #[inline]
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            let url = validate_url(trimmed).map_err(|e| RagError::Fetch {
                url: trimmed.to_string(),
                message: format!("{:#}", e),
            })?;
            return Ok(Self::Web(url));
        }
        Ok(Self::File(PathBuf::from(trimmed)))
    }

    #[inline]
    pub fn kind(&self) -> SourceKind {
        match self {
            Self::File(_) => SourceKind::File,
            Self::Web(_) => SourceKind::Web,
        }
    }
}

impl fmt::Display for Source {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Web(url) => write!(f, "{}", url),
        }
    }
}

/// A source that could not be turned into a document
#[derive(Debug)]
pub struct LoadFailure {
    pub source_uri: String,
    pub error: RagError,
}

/// Documents loaded from a set of sources, along with what went wrong
#[derive(Debug, Default)]
pub struct LoadReport {
    pub documents: Vec<Document>,
    pub failures: Vec<LoadFailure>,
    /// Files skipped because their format is not supported
    pub skipped: Vec<PathBuf>,
    /// URIs of every supported file found, loaded or not
    pub seen_files: HashSet<String>,
    /// False when any directory could not be walked completely
    pub walk_complete: bool,
    /// Loading stopped early because it was cancelled
    pub cancelled: bool,
}

impl LoadReport {
    fn fail(&mut self, source_uri: impl Into<String>, error: RagError) {
        let source_uri = source_uri.into();
        warn!("Failed to load {}: {}", source_uri, error);
        self.failures.push(LoadFailure { source_uri, error });
    }

    fn merge(&mut self, other: Self) {
        self.documents.extend(other.documents);
        self.failures.extend(other.failures);
        self.skipped.extend(other.skipped);
        self.seen_files.extend(other.seen_files);
        self.walk_complete &= other.walk_complete;
        self.cancelled |= other.cancelled;
    }
}

/// Reads files and crawls web seeds into documents
#[derive(Debug, Clone, Default)]
pub struct Loader {
    crawler_config: CrawlerConfig,
    cancel: CancellationToken,
}

impl Loader {
    #[inline]
    pub fn new(crawler_config: CrawlerConfig) -> Self {
        Self {
            crawler_config,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop walking and crawling once `cancel` fires
    #[inline]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Load a single file or web page without following links
    #[inline]
    pub async fn load(&self, source: &Source) -> Result<Document> {
        match source {
            Source::File(path) => {
                let path = path.clone();
                tokio::task::spawn_blocking(move || load_file(&path))
                    .await
                    .map_err(|e| RagError::Other(e.into()))?
            }
            Source::Web(url) => {
                let mut crawler = SiteCrawler::new(self.crawler_config.clone());
                let page = crawler.fetch_page(url).await?;
                if page.text.is_empty() {
                    return Err(RagError::Fetch {
                        url: url.to_string(),
                        message: "page has no text content".to_string(),
                    });
                }
                Ok(Document::new(url.as_str(), page.text, SourceKind::Web))
            }
        }
    }

    /// Load every source. Directories are walked recursively and web seeds
    /// are crawled; per-source failures are collected rather than returned.
    ///
    /// Once cancelled, the report holds whatever was loaded so far and is
    /// marked incomplete.
    #[inline]
    pub async fn load_all(&self, sources: &[Source]) -> LoadReport {
        let mut report = LoadReport {
            walk_complete: true,
            ..LoadReport::default()
        };

        for source in sources {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            match source {
                Source::File(path) => {
                    let path = path.clone();
                    let cancel = self.cancel.clone();
                    match tokio::task::spawn_blocking(move || load_path(&path, &cancel)).await {
                        Ok(partial) => report.merge(partial),
                        Err(e) => {
                            report.walk_complete = false;
                            report.fail(source.to_string(), RagError::Other(e.into()));
                        }
                    }
                }
                Source::Web(url) => self.crawl_into(url, &mut report).await,
            }
        }

        if report.cancelled {
            report.walk_complete = false;
            info!("Loading cancelled after {} documents", report.documents.len());
        }

        info!(
            "Loaded {} documents ({} failed, {} skipped)",
            report.documents.len(),
            report.failures.len(),
            report.skipped.len()
        );
        report
    }

    async fn crawl_into(&self, seed: &Url, report: &mut LoadReport) {
        let mut crawler =
            SiteCrawler::new(self.crawler_config.clone()).with_cancellation(self.cancel.clone());
        match crawler.crawl(seed.as_str()).await {
            Ok(outcome) => {
                report.cancelled |= outcome.stats.cancelled;
                if outcome.stats.budget_exhausted {
                    info!("Crawl of {} stopped at its budget", seed);
                }
                for page in outcome.pages {
                    report
                        .documents
                        .push(Document::new(page.url.as_str(), page.text, SourceKind::Web));
                }
                for error in outcome.failures {
                    let uri = match &error {
                        RagError::Fetch { url, .. } => url.clone(),
                        _ => seed.to_string(),
                    };
                    report.fail(uri, error);
                }
            }
            Err(e) => report.fail(seed.as_str(), e),
        }
    }
}

/// Read one supported file into a document
#[inline]
pub fn load_file(path: &Path) -> Result<Document> {
    if path.is_dir() {
        return Err(RagError::Read {
            source_uri: path.display().to_string(),
            message: "is a directory".to_string(),
        });
    }
    let file = read_file(path)?;
    Ok(Document::new(path.display().to_string(), file.text, SourceKind::File)
        .with_page_starts(file.page_starts))
}

fn load_path(path: &Path, cancel: &CancellationToken) -> LoadReport {
    let mut report = LoadReport {
        walk_complete: true,
        ..LoadReport::default()
    };

    if !path.exists() {
        report.walk_complete = false;
        report.fail(
            path.display().to_string(),
            RagError::Read {
                source_uri: path.display().to_string(),
                message: "no such file or directory".to_string(),
            },
        );
        return report;
    }

    if !path.is_dir() {
        report.seen_files.insert(path.display().to_string());
        match load_file(path) {
            Ok(document) => report.documents.push(document),
            Err(e) => report.fail(path.display().to_string(), e),
        }
        return report;
    }

    debug!("Walking {}", path.display());
    for entry in WalkDir::new(path).sort_by_file_name() {
        if cancel.is_cancelled() {
            debug!("Walk of {} cancelled", path.display());
            report.cancelled = true;
            report.walk_complete = false;
            break;
        }

        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                report.walk_complete = false;
                let uri = e
                    .path()
                    .map_or_else(|| path.display().to_string(), |p| p.display().to_string());
                report.fail(
                    uri.clone(),
                    RagError::Read {
                        source_uri: uri,
                        message: e.to_string(),
                    },
                );
                continue;
            }
        };

        if entry.file_type().is_dir() {
            continue;
        }

        let file_path = entry.path();
        if FileFormat::from_path(file_path).is_none() {
            warn!("Skipping unsupported file {}", file_path.display());
            report.skipped.push(file_path.to_path_buf());
            continue;
        }

        report.seen_files.insert(file_path.display().to_string());
        match load_file(file_path) {
            Ok(document) => {
                debug!("Loaded {} ({} bytes)", document.source_uri, document.raw_text.len());
                report.documents.push(document);
            }
            Err(e) => report.fail(file_path.display().to_string(), e),
        }
    }

    report
}
