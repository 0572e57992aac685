//! Configuration parsing and validation.
//!
//! kbstore is configured via a TOML file (default: `./config/kb.toml`).
//! Every section has defaults, so an empty file is a valid configuration
//! that stores data in `./data/kb.sqlite` and embeds with the offline
//! `hashing` provider.
//!
//! # Example
//!
//! ```toml
//! [db]
//! url = "sqlite://./data/kb.sqlite"
//! max_connections = 8
//!
//! [embedding]
//! provider = "ollama"
//! model = "nomic-embed-text"
//! dims = 768
//!
//! [chunking]
//! chunk_size = 1000
//! overlap = 200
//!
//! [retrieval]
//! top_k = 5
//! alpha = 0.7
//!
//! [collections]
//! prefix = "kb"
//!
//! [server]
//! bind = "127.0.0.1:7340"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use kbstore_core::chunk::validate_params;
use kbstore_core::registry::CollectionRegistry;

/// Top-level configuration.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub collections: CollectionsConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Connection pool settings.
#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    /// sqlx connection URL, e.g. `sqlite://./data/kb.sqlite` or `sqlite::memory:`.
    #[serde(default = "default_db_url")]
    pub url: String,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// How long to wait for a free pooled connection.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// Deadline applied to every store operation.
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: default_db_url(),
            min_connections: default_min_connections(),
            max_connections: default_max_connections(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            operation_timeout_ms: default_operation_timeout_ms(),
        }
    }
}

impl DbConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

fn default_db_url() -> String {
    "sqlite://./data/kb.sqlite".to_string()
}
fn default_min_connections() -> u32 {
    1
}
fn default_max_connections() -> u32 {
    8
}
fn default_acquire_timeout_ms() -> u64 {
    5_000
}
fn default_operation_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `hashing`, `openai`, `ollama`, or `disabled`.
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Required for `openai` and `ollama`. `hashing` falls back to `hashing-v1`.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Base URL override for the `openai` and `ollama` providers.
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: default_dims(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            url: None,
        }
    }
}

fn default_provider() -> String {
    "hashing".to_string()
}
fn default_dims() -> Option<usize> {
    Some(384)
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    3
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
pub struct ChunkingConfig {
    /// Target chunk length in characters.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Characters shared between consecutive chunks.
    #[serde(default = "default_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            overlap: default_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    1000
}
fn default_overlap() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: i64,
    /// Weight of the vector score in the hybrid blend.
    #[serde(default = "default_alpha")]
    pub alpha: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            alpha: default_alpha(),
        }
    }
}

fn default_top_k() -> i64 {
    5
}
fn default_alpha() -> f64 {
    0.7
}

#[derive(Debug, Deserialize, Clone)]
pub struct CollectionsConfig {
    /// Collection names are `<prefix>_<tenant>`.
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

impl Default for CollectionsConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
        }
    }
}

fn default_prefix() -> String {
    "kb".to_string()
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
    "127.0.0.1:7340".to_string()
}

/// Read, parse, and validate a config file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate config from a TOML string.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Validate db
    if config.db.max_connections < 1 {
        bail!("db.max_connections must be >= 1");
    }
    if config.db.min_connections > config.db.max_connections {
        bail!(
            "db.min_connections ({}) must not exceed db.max_connections ({})",
            config.db.min_connections,
            config.db.max_connections
        );
    }
    if config.db.operation_timeout_ms == 0 {
        bail!("db.operation_timeout_ms must be > 0");
    }

    // Validate chunking
    validate_params(config.chunking.chunk_size, config.chunking.overlap)
        .map_err(|e| anyhow::anyhow!("chunking: {}", e))?;

    // Validate retrieval
    if config.retrieval.top_k < 1 {
        bail!("retrieval.top_k must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.alpha) {
        bail!("retrieval.alpha must be in [0.0, 1.0]");
    }

    // Validate embedding
    match config.embedding.provider.as_str() {
        "disabled" | "hashing" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be hashing, openai, ollama, or disabled.",
            other
        ),
    }
    if config.embedding.is_enabled() {
        if config.embedding.dims.unwrap_or(0) == 0 {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        let needs_model = config.embedding.provider != "hashing";
        if needs_model && config.embedding.model.as_deref().unwrap_or("").is_empty() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be > 0");
        }
    }

    // Validate collections
    CollectionRegistry::new(&config.collections.prefix)
        .map_err(|e| anyhow::anyhow!("collections.prefix: {}", e))?;

    Ok(())
}
