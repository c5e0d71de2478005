use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::gate::QueryPolicy;
use crate::index::{Distance, HybridParams, SearchMode};
use crate::models::RELATIONAL_TABLES;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    #[serde(default = "default_max_rows")]
    pub max_rows: u32,
    #[serde(default = "default_allowed_tables")]
    pub allowed_tables: Vec<String>,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_rows: default_max_rows(),
            allowed_tables: default_allowed_tables(),
        }
    }
}

fn default_max_rows() -> u32 {
    100
}
fn default_allowed_tables() -> Vec<String> {
    RELATIONAL_TABLES.iter().map(|t| t.to_string()).collect()
}

impl QueryConfig {
    /// The gate policy derived from this section.
    pub fn policy(&self) -> QueryPolicy {
        QueryPolicy::new(self.allowed_tables.iter().cloned(), self.max_rows)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default)]
    pub distance: Distance,
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,
    /// Used when a search does not name one.
    #[serde(default)]
    pub search_type: SearchMode,
    /// Weight of the dense score in hybrid search, in `[0, 1]`.
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f32,
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    /// Seconds a rebuild lease survives without renewal.
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            distance: Distance::default(),
            default_top_k: default_top_k(),
            search_type: SearchMode::default(),
            hybrid_alpha: default_hybrid_alpha(),
            candidate_k: default_candidate_k(),
            lease_ttl_secs: default_lease_ttl_secs(),
        }
    }
}

impl IndexConfig {
    pub fn hybrid(&self) -> HybridParams {
        HybridParams {
            alpha: self.hybrid_alpha,
            candidate_k: self.candidate_k,
        }
    }
}

fn default_top_k() -> usize {
    10
}
fn default_hybrid_alpha() -> f32 {
    0.6
}
fn default_candidate_k() -> usize {
    50
}
fn default_lease_ttl_secs() -> u64 {
    600
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

impl Config {
    /// A config with defaults for everything except the database path.
    pub fn with_db_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig { path: path.into() },
            query: QueryConfig::default(),
            index: IndexConfig::default(),
            embedding: EmbeddingConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.query.max_rows < 1 {
        anyhow::bail!("query.max_rows must be >= 1");
    }

    if config.query.allowed_tables.is_empty() {
        anyhow::bail!("query.allowed_tables must not be empty");
    }
    for table in &config.query.allowed_tables {
        if !RELATIONAL_TABLES.contains(&table.as_str()) {
            anyhow::bail!(
                "query.allowed_tables contains unknown table '{}'. Known tables: {}",
                table,
                RELATIONAL_TABLES.join(", ")
            );
        }
    }

    if config.index.default_top_k < 1 {
        anyhow::bail!("index.default_top_k must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.index.hybrid_alpha) {
        anyhow::bail!(
            "index.hybrid_alpha must be in [0.0, 1.0], got {}",
            config.index.hybrid_alpha
        );
    }
    if config.index.candidate_k < 1 {
        anyhow::bail!("index.candidate_k must be >= 1");
    }
    if config.index.lease_ttl_secs < 1 {
        anyhow::bail!("index.lease_ttl_secs must be >= 1");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "hash" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or hash.",
            other
        ),
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.batch_size == 0 {
            anyhow::bail!("embedding.batch_size must be > 0");
        }
    }

    Ok(())
}
