use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    pub embedding: EmbeddingConfig,
    pub generation: GenerationConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Root directory holding one subdirectory per session.
    pub root: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap(),
        }
    }
}

fn default_max_tokens() -> usize {
    500
}
fn default_overlap() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Number of nearest chunks retrieved per query.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Most recent conversation messages included in the grounding prompt.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            history_window: default_history_window(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_history_window() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// Base URL of an OpenAI-compatible embeddings endpoint.
    pub base_url: String,
    pub model: String,
    pub dims: usize,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// Base URL of an OpenAI-compatible chat completions endpoint.
    pub base_url: String,
    pub model: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
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

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.max_tokens {
        anyhow::bail!("chunking.overlap_tokens must be < chunking.max_tokens");
    }
    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.embedding.model.is_empty() {
        anyhow::bail!("embedding.model must not be empty");
    }
    if config.generation.model.is_empty() {
        anyhow::bail!("generation.model must not be empty");
    }

    Ok(config)
}
