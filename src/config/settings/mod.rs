
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

use crate::embeddings::ollama::DEFAULT_EMBEDDING_DIMENSION;

pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const DATABASE_FILE_NAME: &str = "knowledge.db";
pub const VECTOR_DIRECTORY_NAME: &str = "vectors";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub vector_store: VectorStoreConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub search: SearchSettings,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

/// Relational side of a knowledge base.
///
/// A missing `connection_string` leaves the relational engine unconfigured:
/// reads come back empty and writes fail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub connection_string: Option<String>,
    /// Defaults to the entity schema's own table name.
    pub table_name: Option<String>,
    pub entity_schema: String,
    /// Batch file ingested when the knowledge base starts out empty
    pub seed_file: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            connection_string: None,
            table_name: None,
            entity_schema: "support_ticket".to_string(),
            seed_file: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VectorStoreKind {
    #[default]
    Lancedb,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VectorStoreConfig {
    pub kind: VectorStoreKind,
    pub collection_name: String,
    pub persist_directory: Option<PathBuf>,
    pub index_timeout_secs: u64,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            kind: VectorStoreKind::Lancedb,
            collection_name: "knowledge_base".to_string(),
            persist_directory: None,
            index_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    #[default]
    Ollama,
    Hashing,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub model: String,
    pub batch_size: u32,
    pub embedding_dimension: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Ollama,
            protocol: "http".to_string(),
            host: "localhost".to_string(),
            port: 11434,
            model: "nomic-embed-text:latest".to_string(),
            batch_size: 16,
            embedding_dimension: DEFAULT_EMBEDDING_DIMENSION,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SearchSettings {
    pub k: usize,
    pub score_threshold: Option<f32>,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            k: 4,
            score_threshold: None,
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
    #[error("Invalid table name: {0} (letters, digits and '_' only, not starting with a digit)")]
    InvalidTableName(String),
    #[error("Invalid collection name: {0} (cannot be empty)")]
    InvalidCollectionName(String),
    #[error("Unknown entity schema: {0}")]
    UnknownEntitySchema(String),
    #[error("Invalid search limit: {0} (must be between 1 and 100)")]
    InvalidSearchLimit(usize),
    #[error("Invalid score threshold: {0} (must be between 0.0 and 1.0)")]
    InvalidScoreThreshold(f32),
    #[error("Invalid index timeout: {0} (must be between 1 and 3600 seconds)")]
    InvalidIndexTimeout(u64),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl Config {
    /// Load `config.toml` from `config_dir`.
    ///
    /// Without a config file the knowledge base lives entirely inside
    /// `config_dir`: a SQLite file next to a LanceDB directory.
    #[inline]
    pub fn load<P: AsRef<Path>>(config_dir: P) -> Result<Self> {
        let base_dir = config_dir.as_ref().to_path_buf();
        let config_path = base_dir.join(CONFIG_FILE_NAME);

        if !config_path.exists() {
            return Ok(Self::local(base_dir));
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;
        config.base_dir = base_dir;

        config
            .validate()
            .with_context(|| "Configuration validation failed")?;

        Ok(config)
    }

    /// Default configuration rooted at `base_dir`, with the relational store configured.
    #[inline]
    pub fn local(base_dir: PathBuf) -> Self {
        let mut config = Self {
            base_dir,
            ..Self::default()
        };
        config.store.connection_string = Some(config.default_database_url());
        config
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

    /// Per-user configuration directory (`~/.qna-kbase`)
    #[inline]
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        dirs::home_dir()
            .map(|home| home.join(".qna-kbase"))
            .or_else(|| dirs::data_dir().map(|data| data.join("qna-kbase")))
            .ok_or(ConfigError::DirectoryError)
    }

    #[inline]
    pub fn get_base_dir(&self) -> &Path {
        &self.base_dir
    }

    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.store.validate()?;
        self.vector_store.validate()?;
        self.embedding.validate()?;
        self.search.validate()?;
        Ok(())
    }

    #[inline]
    pub fn config_file_path(&self) -> PathBuf {
        self.get_base_dir().join(CONFIG_FILE_NAME)
    }

    /// SQLite URL used when the config directory holds the database
    #[inline]
    pub fn default_database_url(&self) -> String {
        format!(
            "sqlite://{}",
            self.get_base_dir().join(DATABASE_FILE_NAME).display()
        )
    }

    /// Directory for the LanceDB collection
    #[inline]
    pub fn vector_database_path(&self) -> PathBuf {
        self.vector_store
            .persist_directory
            .clone()
            .unwrap_or_else(|| self.get_base_dir().join(VECTOR_DIRECTORY_NAME))
    }

    #[inline]
    pub fn ollama_url(&self) -> Result<Url, ConfigError> {
        self.embedding.ollama_url()
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !crate::entity::is_known_schema(&self.entity_schema) {
            return Err(ConfigError::UnknownEntitySchema(self.entity_schema.clone()));
        }

        if let Some(table_name) = &self.table_name {
            validate_identifier(table_name)?;
        }

        Ok(())
    }
}

impl VectorStoreConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.collection_name.trim().is_empty() {
            return Err(ConfigError::InvalidCollectionName(
                self.collection_name.clone(),
            ));
        }
        validate_identifier(&self.collection_name)
            .map_err(|_| ConfigError::InvalidCollectionName(self.collection_name.clone()))?;

        if !(1..=3600).contains(&self.index_timeout_secs) {
            return Err(ConfigError::InvalidIndexTimeout(self.index_timeout_secs));
        }

        Ok(())
    }
}

impl EmbeddingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(8..=4096).contains(&self.embedding_dimension) {
            return Err(ConfigError::InvalidEmbeddingDimension(
                self.embedding_dimension,
            ));
        }

        if self.batch_size == 0 || self.batch_size > 1000 {
            return Err(ConfigError::InvalidBatchSize(self.batch_size));
        }

        if self.provider == EmbeddingProvider::Hashing {
            return Ok(());
        }

        if self.protocol != "http" && self.protocol != "https" {
            return Err(ConfigError::InvalidProtocol(self.protocol.clone()));
        }

        if self.port == 0 {
            return Err(ConfigError::InvalidPort(self.port));
        }

        self.ollama_url()?;

        if self.model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(self.model.clone()));
        }

        Ok(())
    }

    pub fn ollama_url(&self) -> Result<Url, ConfigError> {
        let url_str = format!("{}://{}:{}", self.protocol, self.host, self.port);
        Url::parse(&url_str).map_err(|_| ConfigError::InvalidUrl(url_str))
    }
}

impl SearchSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=100).contains(&self.k) {
            return Err(ConfigError::InvalidSearchLimit(self.k));
        }

        if let Some(threshold) = self.score_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(ConfigError::InvalidScoreThreshold(threshold));
            }
        }

        Ok(())
    }
}

/// Table and collection names end up inside SQL and Lance predicates verbatim.
pub fn validate_identifier(name: &str) -> Result<(), ConfigError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid_start && valid_rest && name.len() <= 64 {
        Ok(())
    } else {
        Err(ConfigError::InvalidTableName(name.to_string()))
    }
}
