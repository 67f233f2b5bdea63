/// Configuration module for docintel.
///
/// Handles loading, validating, and providing default configuration values.
/// Each component receives its own section by value; nothing reads a global.
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{info, warn};

use crate::ai::rate_limit::RateLimitSettings;

/// File name used when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "docintel.json";

/// Index database file name placed inside the served root.
pub const DEFAULT_DB_FILE: &str = ".docintel.db";

// ── Default value functions ──────────────────────────────────────────

fn default_root() -> String {
    "./".to_string()
}

fn default_chunk_size() -> usize {
    1000
}

fn default_chunk_overlap() -> usize {
    200
}

fn default_max_file_size_mb() -> u64 {
    100
}

fn default_pool_size() -> u32 {
    4
}

fn default_search_top_k() -> usize {
    5
}

fn default_min_similarity() -> f64 {
    0.3
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

fn default_dimensions() -> usize {
    384
}

fn default_generation_model() -> String {
    "llama3.2".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_provider_timeout_ms() -> u64 {
    120_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_operation_timeout_ms() -> u64 {
    60_000
}

fn default_max_prompt_length() -> usize {
    200_000
}

/// Indexing embeds every chunk, so embedding keys get far more headroom than
/// generation.
fn default_provider_limits() -> HashMap<String, RateLimitSettings> {
    HashMap::from([
        (
            "embedding:hash".to_string(),
            RateLimitSettings {
                window_secs: 60,
                max_requests: 100_000,
            },
        ),
        (
            "embedding:ollama".to_string(),
            RateLimitSettings {
                window_secs: 60,
                max_requests: 6_000,
            },
        ),
    ])
}

/// User entries are laid over the defaults, so overriding one key keeps the
/// others.
fn merge_provider_limits<'de, D>(deserializer: D) -> Result<HashMap<String, RateLimitSettings>, D::Error>
where
    D: Deserializer<'de>,
{
    let user = HashMap::<String, RateLimitSettings>::deserialize(deserializer)?;
    let mut limits = default_provider_limits();
    limits.extend(user);
    Ok(limits)
}

// ── Config structs ───────────────────────────────────────────────────

/// Which tool set the server exposes.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServerMode {
    /// Retrieval-augmented tools enabled; an index is opened for the root.
    #[default]
    Rag,
    /// File and AI tools only. No index is opened.
    Basic,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    #[default]
    Hash,
    Ollama,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    #[serde(default = "default_root")]
    pub root: String,

    /// Defaults to `<root>/.docintel.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,

    #[serde(default)]
    pub mode: ServerMode,

    #[serde(default)]
    pub indexing: IndexingConfig,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub middleware: MiddlewareConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct IndexingConfig {
    /// Chunk window in characters.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Characters shared by consecutive chunks.
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,

    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,

    /// SQLite connections kept open by the store.
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SearchConfig {
    #[serde(default = "default_search_top_k")]
    pub top_k: usize,

    #[serde(default = "default_min_similarity")]
    pub min_similarity: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub provider: EmbeddingBackend,

    #[serde(default = "default_embedding_model")]
    pub model: String,

    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    #[serde(default = "default_ollama_url")]
    pub base_url: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ProviderConfig {
    #[serde(default = "default_ollama_url")]
    pub base_url: String,

    #[serde(default = "default_generation_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_provider_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct MiddlewareConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Per-attempt timeout for calls made without an operation context.
    #[serde(default = "default_operation_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Longest prompt, in characters, accepted for generation.
    #[serde(default = "default_max_prompt_length")]
    pub max_prompt_length: usize,

    #[serde(default)]
    pub rate_limit: RateLimitSettings,

    /// Overrides keyed by provider key, e.g. `embedding:ollama`.
    #[serde(
        default = "default_provider_limits",
        deserialize_with = "merge_provider_limits"
    )]
    pub provider_limits: HashMap<String, RateLimitSettings>,
}

// ── Default impls ────────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        Self {
            root: default_root(),
            db_path: None,
            mode: ServerMode::default(),
            indexing: IndexingConfig::default(),
            search: SearchConfig::default(),
            embedding: EmbeddingConfig::default(),
            provider: ProviderConfig::default(),
            middleware: MiddlewareConfig::default(),
        }
    }
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            max_file_size_mb: default_max_file_size_mb(),
            pool_size: default_pool_size(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            top_k: default_search_top_k(),
            min_similarity: default_min_similarity(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingBackend::default(),
            model: default_embedding_model(),
            dimensions: default_dimensions(),
            base_url: default_ollama_url(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_url(),
            model: default_generation_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_ms: default_provider_timeout_ms(),
        }
    }
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            default_timeout_ms: default_operation_timeout_ms(),
            max_prompt_length: default_max_prompt_length(),
            rate_limit: RateLimitSettings::default(),
            provider_limits: default_provider_limits(),
        }
    }
}

impl IndexingConfig {
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(1024 * 1024)
    }
}

// ── Config implementation ────────────────────────────────────────────

impl Config {
    /// Load configuration from a JSON file.
    ///
    /// With no path, `docintel.json` in the working directory is used. A
    /// missing file yields defaults (and a template is written for the
    /// default path); a file that fails to parse is an error.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let path = config_path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));

        if !path.exists() {
            info!("{} not found, using defaults", path.display());
            let cfg = Self::default();

            if config_path.is_none() {
                match cfg.save(path) {
                    Ok(()) => info!("Generated config template: {}", path.display()),
                    Err(e) => warn!("Failed to generate config template: {e}"),
                }
            }

            return Ok(cfg);
        }

        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;

        let cfg: Config = serde_json::from_str(&data)
            .with_context(|| format!("invalid JSON in {}", path.display()))?;

        info!("Loaded configuration from {}", path.display());
        Ok(cfg)
    }

    /// Save configuration to a JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_string_pretty(self).context("failed to marshal config")?;
        std::fs::write(path, data)
            .with_context(|| format!("failed to write config: {}", path.display()))?;
        Ok(())
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.root.trim().is_empty(), "root must not be empty");
        anyhow::ensure!(self.indexing.chunk_size > 0, "chunk_size must be positive");
        anyhow::ensure!(
            self.indexing.chunk_overlap < self.indexing.chunk_size,
            "chunk_overlap must be smaller than chunk_size"
        );
        anyhow::ensure!(
            self.indexing.max_file_size_mb > 0,
            "max_file_size_mb must be positive"
        );
        anyhow::ensure!(self.indexing.pool_size > 0, "pool_size must be positive");
        anyhow::ensure!(self.search.top_k > 0, "search.top_k must be positive");
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.search.min_similarity),
            "search.min_similarity must be within 0.0..=1.0"
        );
        anyhow::ensure!(
            self.embedding.dimensions > 0,
            "embedding.dimensions must be positive"
        );
        anyhow::ensure!(
            (0.0..=2.0).contains(&self.provider.temperature),
            "provider.temperature must be within 0.0..=2.0"
        );
        anyhow::ensure!(
            self.provider.max_tokens > 0,
            "provider.max_tokens must be positive"
        );
        anyhow::ensure!(
            self.provider.timeout_ms > 0,
            "provider.timeout_ms must be positive"
        );
        anyhow::ensure!(
            self.middleware.base_delay_ms <= self.middleware.max_delay_ms,
            "middleware.base_delay_ms must not exceed max_delay_ms"
        );
        anyhow::ensure!(
            self.middleware.default_timeout_ms > 0,
            "middleware.default_timeout_ms must be positive"
        );
        for (key, limit) in
            std::iter::once(("default", &self.middleware.rate_limit)).chain(
                self.middleware
                    .provider_limits
                    .iter()
                    .map(|(k, v)| (k.as_str(), v)),
            )
        {
            anyhow::ensure!(
                limit.window_secs > 0 && limit.max_requests > 0,
                "rate limit for {key} needs a positive window and request count"
            );
        }
        Ok(())
    }

    /// Absolute path of the served root.
    pub fn root_dir(&self) -> Result<PathBuf> {
        let root = std::path::absolute(Path::new(&self.root))
            .with_context(|| format!("cannot resolve root {}", self.root))?;
        Ok(root)
    }

    /// Index database location: `db_path` if set, else inside the root.
    pub fn resolved_db_path(&self) -> Result<PathBuf> {
        match &self.db_path {
            Some(p) => Ok(std::path::absolute(Path::new(p))
                .with_context(|| format!("cannot resolve db_path {p}"))?),
            None => Ok(self.root_dir()?.join(DEFAULT_DB_FILE)),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
