// Configuration management module
// TOML-backed settings for models, chunking, retrieval and sources

pub mod interactive;
pub mod settings;


pub use interactive::{run_interactive_config, show_config};
pub use settings::{
    Config, ConfigError, EmbeddingConfig, EmbeddingProvider, IndexingConfig, OllamaConfig,
    SourcesConfig,
};

/// Resolve the data directory, preferring an explicit override
#[inline]
pub fn resolve_data_dir(
    override_dir: Option<std::path::PathBuf>,
) -> Result<std::path::PathBuf, ConfigError> {
    override_dir.map_or_else(Config::default_dir, Ok)
}
