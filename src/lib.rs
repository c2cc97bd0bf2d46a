use thiserror::Error;

pub type Result<T> = std::result::Result<T, RagError>;

#[derive(Error, Debug)]
pub enum RagError {
    #[error("Read error for {source_uri}: {message}")]
    Read { source_uri: String, message: String },

    #[error("Fetch error for {url}: {message}")]
    Fetch { url: String, message: String },

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Model mismatch: index was built with '{index_model}', embedder uses '{embedder_model}'")]
    ModelMismatch {
        index_model: String,
        embedder_model: String,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl RagError {
    /// Errors that invalidate every later operation and must abort a run
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ModelUnavailable(_)
                | Self::ModelMismatch { .. }
                | Self::Config(_)
                | Self::IndexUnavailable(_)
                | Self::Database(_)
        )
    }
}

pub mod commands;
pub mod config;
pub mod crawler;
pub mod database;
pub mod embeddings;
pub mod generation;
pub mod indexer;
pub mod loader;
pub mod retrieval;
