// Configuration management module
// Typed TOML configuration for the store, vector index and embeddings

pub mod settings;

pub use settings::{
    Config, ConfigError, EmbeddingConfig, EmbeddingProvider, SearchSettings, StoreConfig,
    VectorStoreConfig, VectorStoreKind,
};

/// Get the configuration directory path
#[inline]
pub fn get_config_dir() -> Result<std::path::PathBuf, ConfigError> {
    Config::config_dir()
}

/// Print the effective configuration
#[inline]
pub fn show_config(config: &Config) -> anyhow::Result<()> {
    println!("Configuration directory: {}", config.get_base_dir().display());
    println!();
    println!("{}", toml::to_string_pretty(config)?);
    println!(
        "Vector database path: {}",
        config.vector_database_path().display()
    );
    Ok(())
}
