use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub verifier: VerifierConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// `"fixed_size"` or `"full_content"`.
    #[serde(default = "default_chunk_mode")]
    pub mode: String,
    /// Target characters per chunk in fixed-size mode.
    #[serde(default = "default_target_chars")]
    pub target_chars: usize,
    /// Documents at or below this length are kept as a single chunk even in
    /// fixed-size mode.
    #[serde(default = "default_full_content_max_chars")]
    pub full_content_max_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            mode: default_chunk_mode(),
            target_chars: default_target_chars(),
            full_content_max_chars: default_full_content_max_chars(),
        }
    }
}

fn default_chunk_mode() -> String {
    "fixed_size".to_string()
}
fn default_target_chars() -> usize {
    500
}
fn default_full_content_max_chars() -> usize {
    600
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Weight for dense similarity: `score = alpha*dense + (1-alpha)*lexical`.
    #[serde(default = "default_alpha")]
    pub default_alpha: f64,
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,
    #[serde(default = "default_min_score")]
    pub default_min_score: f64,
    /// Candidate multiplier per channel: each index contributes up to
    /// `candidate_factor * top_k` candidates before fusion.
    #[serde(default = "default_candidate_factor")]
    pub candidate_factor: usize,
    /// Remote fallback is consulted when local retrieval returns fewer
    /// results than this.
    #[serde(default = "default_min_local_results")]
    pub min_local_results: usize,
    /// Chat model used for the remote answer fallback in openai mode.
    #[serde(default = "default_fallback_model")]
    pub fallback_model: String,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_alpha: default_alpha(),
            default_top_k: default_top_k(),
            default_min_score: default_min_score(),
            candidate_factor: default_candidate_factor(),
            min_local_results: default_min_local_results(),
            fallback_model: default_fallback_model(),
        }
    }
}

fn default_alpha() -> f64 {
    0.6
}
fn default_top_k() -> usize {
    5
}
fn default_min_score() -> f64 {
    0.0
}
fn default_candidate_factor() -> usize {
    4
}
fn default_min_local_results() -> usize {
    1
}
fn default_fallback_model() -> String {
    "gpt-4o-mini".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"local"` (deterministic, offline) or `"openai"` (remote API).
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
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
            provider: default_provider(),
            model: None,
            dims: default_dims(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "local".to_string()
}
fn default_dims() -> usize {
    384
}
fn default_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    /// Worker tasks on the standard lane.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Queued jobs the standard lane will buffer before enqueue backpressure.
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
    /// Per-document processing budget on the standard lane.
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,
    /// Extended budget for the large-document lane.
    #[serde(default = "default_large_timeout")]
    pub large_timeout_secs: u64,
    /// Finished jobs kept in the status registry.
    #[serde(default = "default_finished_retention")]
    pub finished_retention: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            capacity: default_queue_capacity(),
            job_timeout_secs: default_job_timeout(),
            large_timeout_secs: default_large_timeout(),
            finished_retention: default_finished_retention(),
        }
    }
}

fn default_worker_count() -> usize {
    4
}
fn default_queue_capacity() -> usize {
    256
}
fn default_job_timeout() -> u64 {
    120
}
fn default_large_timeout() -> u64 {
    600
}
fn default_finished_retention() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    #[serde(default = "default_max_files")]
    pub max_files_per_batch: usize,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: usize,
    /// Files above `max_file_bytes` must go through `/upload-large`, up to
    /// this size.
    #[serde(default = "default_max_large_bytes")]
    pub max_large_file_bytes: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_files_per_batch: default_max_files(),
            max_file_bytes: default_max_file_bytes(),
            max_large_file_bytes: default_max_large_bytes(),
        }
    }
}

fn default_max_files() -> usize {
    10
}
fn default_max_file_bytes() -> usize {
    5 * 1024 * 1024
}
fn default_max_large_bytes() -> usize {
    50 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct VerifierConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Literature search endpoint (PubMed esearch-style JSON).
    #[serde(default = "default_verifier_url")]
    pub endpoint: String,
    #[serde(default = "default_verifier_timeout")]
    pub timeout_secs: u64,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_verifier_url(),
            timeout_secs: default_verifier_timeout(),
        }
    }
}

fn default_verifier_url() -> String {
    "https://eutils.ncbi.nlm.nih.gov/entrez/eutils/esearch.fcgi".to_string()
}
fn default_verifier_timeout() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    match config.chunking.mode.as_str() {
        "fixed_size" | "full_content" => {}
        other => anyhow::bail!(
            "Unknown chunking mode: '{}'. Must be fixed_size or full_content.",
            other
        ),
    }
    if config.chunking.target_chars == 0 {
        anyhow::bail!("chunking.target_chars must be > 0");
    }

    if !(0.0..=1.0).contains(&config.retrieval.default_alpha) {
        anyhow::bail!("retrieval.default_alpha must be in [0.0, 1.0]");
    }
    if config.retrieval.default_top_k == 0 {
        anyhow::bail!("retrieval.default_top_k must be >= 1");
    }
    if config.retrieval.candidate_factor == 0 {
        anyhow::bail!("retrieval.candidate_factor must be >= 1");
    }

    match config.embedding.provider.as_str() {
        "local" => {}
        "openai" => {
            if config.embedding.model.is_none() {
                anyhow::bail!("embedding.model must be specified when provider is 'openai'");
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be local or openai.",
            other
        ),
    }
    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }

    if config.queue.worker_count == 0 {
        anyhow::bail!("queue.worker_count must be >= 1");
    }
    if config.upload.max_files_per_batch == 0 {
        anyhow::bail!("upload.max_files_per_batch must be >= 1");
    }
    if config.upload.max_large_file_bytes < config.upload.max_file_bytes {
        anyhow::bail!("upload.max_large_file_bytes must be >= upload.max_file_bytes");
    }

    Ok(())
}
