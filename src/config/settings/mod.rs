
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

use crate::RagError;
use crate::crawler::CrawlerConfig;
use crate::database::vector_store::Metric;
use crate::embeddings::chunking::{ChunkUnit, ChunkingConfig};
use crate::generation::AnswerConfig;
use crate::retrieval::RetrievalConfig;

pub const DEFAULT_HASHED_DIMENSION: u32 = 384;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub ollama: OllamaConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub answer: AnswerConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub crawler: CrawlerConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OllamaConfig {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub embedding_model: String,
    pub generation_model: String,
    pub batch_size: u32,
    /// Inputs longer than this many characters are truncated before embedding
    pub max_input_chars: usize,
    pub request_timeout_seconds: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            protocol: "http".to_string(),
            host: "localhost".to_string(),
            port: 11434,
            embedding_model: "nomic-embed-text:latest".to_string(),
            generation_model: "llama3.2:latest".to_string(),
            batch_size: 16,
            max_input_chars: 8192,
            request_timeout_seconds: 120,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    #[default]
    Ollama,
    /// Deterministic feature hashing, needs no model server
    Hashed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    /// Only used by the hashed provider; Ollama models fix their own dimension
    pub dimension: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Ollama,
            dimension: DEFAULT_HASHED_DIMENSION,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SourcesConfig {
    /// Relative paths resolve against the data directory
    pub docs_dir: PathBuf,
    pub urls: Vec<String>,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            docs_dir: PathBuf::from("docs"),
            urls: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IndexingConfig {
    /// Number of documents processed in parallel during setup
    pub concurrency: usize,
    /// Persist the index after this many completed documents
    pub checkpoint_every: usize,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            checkpoint_every: 25,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration directory not found or could not be created")]
    DirectoryError,
    #[error("Invalid URL format: {0}")]
    InvalidUrl(String),
    #[error("Invalid port: {0} (must be between 1 and 65535)")]
    InvalidPort(u16),
    #[error("Invalid batch size: {0} (must be between 1 and 1000)")]
    InvalidBatchSize(u32),
    #[error("Invalid model name: {0} (cannot be empty)")]
    InvalidModel(String),
    #[error("Invalid protocol: {0} (must be 'http' or 'https')")]
    InvalidProtocol(String),
    #[error("Invalid embedding dimension: {0} (must be between 8 and 4096)")]
    InvalidEmbeddingDimension(u32),
    #[error("Invalid max input chars: {0} (must be at least 64)")]
    InvalidMaxInputChars(usize),
    #[error("Invalid chunk size: {0} (must be greater than 0)")]
    InvalidChunkSize(usize),
    #[error("Chunk overlap ({0}) must be smaller than chunk size ({1})")]
    InvalidOverlap(usize, usize),
    #[error("Boundary tolerance ({0}) must be smaller than chunk size ({1})")]
    InvalidBoundaryTolerance(usize, usize),
    #[error("Invalid top-k: {0} (must be between 1 and 100)")]
    InvalidTopK(usize),
    #[error("Invalid fetch multiplier: {0} (must be between 1 and 10)")]
    InvalidFetchMultiplier(usize),
    #[error("Invalid dedup threshold: {0} (must be in (0, 1])")]
    InvalidDedupThreshold(f32),
    #[error("Invalid max prompt chars: {0} (must be at least 256)")]
    InvalidMaxPromptChars(usize),
    #[error("Invalid crawl budget: {0}")]
    InvalidCrawlBudget(String),
    #[error("Invalid indexing concurrency: {0} (must be between 1 and 64)")]
    InvalidConcurrency(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl From<ConfigError> for RagError {
    #[inline]
    fn from(error: ConfigError) -> Self {
        Self::Config(error.to_string())
    }
}

impl Config {
    /// Default data directory, `~/.docs-rag`
    #[inline]
    pub fn default_dir() -> Result<PathBuf, ConfigError> {
        dirs::home_dir()
            .map(|home| home.join(".docs-rag"))
            .or_else(|| dirs::data_dir().map(|data| data.join("docs-rag")))
            .ok_or(ConfigError::DirectoryError)
    }

    #[inline]
    pub fn load<P: AsRef<Path>>(config_dir: P) -> Result<Self> {
        let config_path = config_dir.as_ref().join("config.toml");

        if !config_path.exists() {
            return Ok(Self {
                base_dir: config_dir.as_ref().to_path_buf(),
                ..Self::default()
            });
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;
        config.base_dir = config_dir.as_ref().to_path_buf();

        config
            .validate()
            .with_context(|| "Configuration validation failed")?;

        Ok(config)
    }

    #[inline]
    pub fn save(&self) -> Result<()> {
        self.validate()
            .context("Configuration validation failed before saving")?;

        let config_dir = self.get_base_dir();

        fs::create_dir_all(config_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                config_dir.display()
            )
        })?;

        let config_path = self.config_file_path();
        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    #[inline]
    pub fn get_base_dir(&self) -> &Path {
        &self.base_dir
    }

    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ollama.validate()?;
        self.validate_embedding_config()?;
        self.validate_chunking_config()?;
        self.validate_retrieval_config()?;
        self.validate_crawler_config()?;

        for url in &self.sources.urls {
            crate::crawler::validate_url(url).map_err(|_| ConfigError::InvalidUrl(url.clone()))?;
        }

        if self.answer.max_prompt_chars < 256 {
            return Err(ConfigError::InvalidMaxPromptChars(
                self.answer.max_prompt_chars,
            ));
        }

        if !(1..=64).contains(&self.indexing.concurrency) {
            return Err(ConfigError::InvalidConcurrency(self.indexing.concurrency));
        }

        Ok(())
    }

    fn validate_embedding_config(&self) -> Result<(), ConfigError> {
        if self.embedding.provider == EmbeddingProvider::Hashed
            && !(8..=4096).contains(&self.embedding.dimension)
        {
            return Err(ConfigError::InvalidEmbeddingDimension(
                self.embedding.dimension,
            ));
        }
        Ok(())
    }

    fn validate_chunking_config(&self) -> Result<(), ConfigError> {
        let config = &self.chunking;

        if config.chunk_size == 0 {
            return Err(ConfigError::InvalidChunkSize(config.chunk_size));
        }

        if config.chunk_overlap >= config.chunk_size {
            return Err(ConfigError::InvalidOverlap(
                config.chunk_overlap,
                config.chunk_size,
            ));
        }

        // Sentence windows never snap, so the tolerance is irrelevant there
        if config.unit != ChunkUnit::Sentences && config.boundary_tolerance >= config.chunk_size {
            return Err(ConfigError::InvalidBoundaryTolerance(
                config.boundary_tolerance,
                config.chunk_size,
            ));
        }

        Ok(())
    }

    fn validate_retrieval_config(&self) -> Result<(), ConfigError> {
        let config = &self.retrieval;

        if !(1..=100).contains(&config.top_k) {
            return Err(ConfigError::InvalidTopK(config.top_k));
        }

        if !(1..=10).contains(&config.fetch_multiplier) {
            return Err(ConfigError::InvalidFetchMultiplier(config.fetch_multiplier));
        }

        if !(config.dedup_threshold > 0.0 && config.dedup_threshold <= 1.0) {
            return Err(ConfigError::InvalidDedupThreshold(config.dedup_threshold));
        }

        Ok(())
    }

    fn validate_crawler_config(&self) -> Result<(), ConfigError> {
        let config = &self.crawler;

        if config.max_pages == 0 {
            return Err(ConfigError::InvalidCrawlBudget(
                "max_pages must be greater than 0".to_string(),
            ));
        }

        if config.timeout_seconds == 0 || config.crawl_timeout_seconds == 0 {
            return Err(ConfigError::InvalidCrawlBudget(
                "timeouts must be greater than 0".to_string(),
            ));
        }

        if config.crawl_timeout_seconds < config.timeout_seconds {
            return Err(ConfigError::InvalidCrawlBudget(format!(
                "crawl timeout ({}s) is shorter than a single request timeout ({}s)",
                config.crawl_timeout_seconds, config.timeout_seconds
            )));
        }

        Ok(())
    }

    #[inline]
    pub fn config_file_path(&self) -> PathBuf {
        self.get_base_dir().join("config.toml")
    }

    /// Directory scanned for local documents
    #[inline]
    pub fn docs_path(&self) -> PathBuf {
        if self.sources.docs_dir.is_absolute() {
            self.sources.docs_dir.clone()
        } else {
            self.get_base_dir().join(&self.sources.docs_dir)
        }
    }

    /// Directory holding the vector table and the index metadata database
    #[inline]
    pub fn index_path(&self) -> PathBuf {
        self.get_base_dir().join("index")
    }

    #[inline]
    pub fn metric(&self) -> Metric {
        self.retrieval.metric
    }

    #[inline]
    pub fn ollama_url(&self) -> Result<Url, ConfigError> {
        self.ollama.ollama_url()
    }
}

impl OllamaConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol != "http" && self.protocol != "https" {
            return Err(ConfigError::InvalidProtocol(self.protocol.clone()));
        }

        let url_str = format!("{}://{}:{}", self.protocol, self.host, self.port);
        Url::parse(&url_str).map_err(|_| ConfigError::InvalidUrl(url_str))?;

        if self.port == 0 {
            return Err(ConfigError::InvalidPort(self.port));
        }

        if self.embedding_model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(self.embedding_model.clone()));
        }

        if self.generation_model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(self.generation_model.clone()));
        }

        if self.batch_size == 0 || self.batch_size > 1000 {
            return Err(ConfigError::InvalidBatchSize(self.batch_size));
        }

        if self.max_input_chars < 64 {
            return Err(ConfigError::InvalidMaxInputChars(self.max_input_chars));
        }

        Ok(())
    }

    pub fn ollama_url(&self) -> Result<Url, ConfigError> {
        let url_str = format!("{}://{}:{}", self.protocol, self.host, self.port);
        Url::parse(&url_str).map_err(|_| ConfigError::InvalidUrl(url_str))
    }

    pub fn set_protocol(&mut self, protocol: String) -> Result<(), ConfigError> {
        if protocol != "http" && protocol != "https" {
            return Err(ConfigError::InvalidProtocol(protocol));
        }
        self.protocol = protocol;
        Ok(())
    }

    pub fn set_host(&mut self, host: String) -> Result<(), ConfigError> {
        let temp_config = OllamaConfig {
            host: host.clone(),
            ..self.clone()
        };
        temp_config.validate()?;
        self.host = host;
        Ok(())
    }

    pub fn set_port(&mut self, port: u16) -> Result<(), ConfigError> {
        if port == 0 {
            return Err(ConfigError::InvalidPort(port));
        }
        self.port = port;
        Ok(())
    }

    pub fn set_embedding_model(&mut self, model: String) -> Result<(), ConfigError> {
        if model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(model));
        }
        self.embedding_model = model;
        Ok(())
    }

    pub fn set_generation_model(&mut self, model: String) -> Result<(), ConfigError> {
        if model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(model));
        }
        self.generation_model = model;
        Ok(())
    }
}

impl SourcesConfig {
    /// Add a seed URL, ignoring duplicates
    pub fn add_url(&mut self, url: &str) -> Result<bool, ConfigError> {
        let parsed =
            crate::crawler::validate_url(url).map_err(|_| ConfigError::InvalidUrl(url.to_string()))?;
        let normalized = parsed.to_string();
        if self.urls.contains(&normalized) {
            return Ok(false);
        }
        self.urls.push(normalized);
        Ok(true)
    }
}
