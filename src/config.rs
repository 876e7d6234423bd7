//! TOML configuration.
//!
//! The whole engine is driven by one [`Config`] value, loaded once at startup
//! and passed by reference into every component. Nothing below this module
//! reads settings from the environment; the only exception is provider API
//! keys, whose *variable names* are configured here and resolved when the
//! provider chain is constructed.
//!
//! ```toml
//! [index]
//! dir = "./data/index"
//!
//! [corpus]
//! root = "./knowledge"
//!
//! [embedding]
//! provider = "hash"
//! dims = 256
//!
//! [[synthesis.providers]]
//! kind = "ollama"
//! model = "nemotron-mini"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::vector_index::Metric;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub index: IndexConfig,
    pub corpus: CorpusConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub synthesis: SynthesisConfig,
    #[serde(default)]
    pub citation: CitationConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    pub dir: PathBuf,
    #[serde(default)]
    pub metric: Metric,
    #[serde(default = "default_ef_construction")]
    pub ef_construction: usize,
    #[serde(default = "default_ef_search")]
    pub ef_search: usize,
    #[serde(default = "default_max_neighbors")]
    pub max_neighbors: usize,
}

fn default_ef_construction() -> usize {
    64
}
fn default_ef_search() -> usize {
    48
}
fn default_max_neighbors() -> usize {
    12
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorpusConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

fn default_include_globs() -> Vec<String> {
    vec![
        "**/*.pdf".to_string(),
        "**/*.md".to_string(),
        "**/*.txt".to_string(),
        "**/*.docx".to_string(),
    ]
}
fn default_max_file_bytes() -> u64 {
    64 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_max_tokens() -> usize {
    350
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Bumped by hand to force a full re-embed without changing model.
    #[serde(default = "default_revision")]
    pub revision: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_openai_key_env")]
    pub api_key_env: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            revision: default_revision(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            url: None,
            api_key_env: default_openai_key_env(),
        }
    }
}

fn default_provider() -> String {
    "hash".to_string()
}
fn default_revision() -> u32 {
    1
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
fn default_openai_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_search_k")]
    pub search_k: usize,
    #[serde(default = "default_ask_k")]
    pub ask_k: usize,
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
    /// Number of leading ask-mode slots that may repeat a source before
    /// per-source deduplication kicks in.
    #[serde(default = "default_diversity_floor")]
    pub diversity_floor: usize,
    #[serde(default = "default_lexical_boost")]
    pub lexical_boost: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            search_k: default_search_k(),
            ask_k: default_ask_k(),
            candidate_multiplier: default_candidate_multiplier(),
            diversity_floor: default_diversity_floor(),
            lexical_boost: default_lexical_boost(),
        }
    }
}

fn default_search_k() -> usize {
    5
}
fn default_ask_k() -> usize {
    4
}
fn default_candidate_multiplier() -> usize {
    2
}
fn default_diversity_floor() -> usize {
    1
}
fn default_lexical_boost() -> f32 {
    0.2
}

#[derive(Debug, Deserialize, Clone)]
pub struct SynthesisConfig {
    /// Overall deadline for one ask/explain request, across all providers.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            providers: Vec::new(),
        }
    }
}

impl SynthesisConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_request_timeout_secs() -> u64 {
    90
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    /// `ollama` or `openai`.
    pub kind: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    pub model: String,
    #[serde(default = "default_provider_timeout_secs")]
    pub timeout_secs: u64,
    /// Name of the environment variable holding the API key, if any.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl ProviderConfig {
    pub fn label(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.kind, self.model))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_provider_timeout_secs() -> u64 {
    60
}
fn default_temperature() -> f32 {
    0.35
}

#[derive(Debug, Deserialize, Clone)]
pub struct CitationConfig {
    #[serde(default = "default_max_verbatim_chars")]
    pub max_verbatim_chars: usize,
}

impl Default for CitationConfig {
    fn default() -> Self {
        Self {
            max_verbatim_chars: default_max_verbatim_chars(),
        }
    }
}

fn default_max_verbatim_chars() -> usize {
    90
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
    "127.0.0.1:7341".to_string()
}

impl Config {
    /// A config rooted at `./knowledge` / `./data/index` with every default,
    /// used by commands that can run without a config file.
    pub fn minimal() -> Self {
        Self::with_dirs(PathBuf::from("./knowledge"), PathBuf::from("./data/index"))
    }

    /// Default config for a given corpus and index directory.
    pub fn with_dirs(corpus_root: PathBuf, index_dir: PathBuf) -> Self {
        Self {
            index: IndexConfig {
                dir: index_dir,
                metric: Metric::default(),
                ef_construction: default_ef_construction(),
                ef_search: default_ef_search(),
                max_neighbors: default_max_neighbors(),
            },
            corpus: CorpusConfig {
                root: corpus_root,
                include_globs: default_include_globs(),
                exclude_globs: Vec::new(),
                follow_symlinks: false,
                max_file_bytes: default_max_file_bytes(),
            },
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
            synthesis: SynthesisConfig::default(),
            citation: CitationConfig::default(),
            server: ServerConfig::default(),
        }
    }

    /// Check cross-field constraints that serde defaults cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.chunking.max_tokens == 0 {
            bail!("chunking.max_tokens must be > 0");
        }
        if self.index.max_neighbors < 2 {
            bail!("index.max_neighbors must be >= 2");
        }
        if self.index.ef_search == 0 || self.index.ef_construction == 0 {
            bail!("index.ef_search and index.ef_construction must be > 0");
        }
        if self.retrieval.search_k == 0 || self.retrieval.ask_k == 0 {
            bail!("retrieval.search_k and retrieval.ask_k must be >= 1");
        }
        if self.retrieval.candidate_multiplier == 0 {
            bail!("retrieval.candidate_multiplier must be >= 1");
        }
        if !(0.0..=1.0).contains(&self.retrieval.lexical_boost) {
            bail!("retrieval.lexical_boost must be in [0.0, 1.0]");
        }
        if self.citation.max_verbatim_chars < 20 {
            bail!("citation.max_verbatim_chars must be >= 20");
        }
        if self.embedding.dims == Some(0) {
            bail!("embedding.dims must be > 0");
        }
        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be > 0");
        }

        match self.embedding.provider.as_str() {
            "hash" | "ollama" | "openai" | "local" => {}
            other => bail!(
                "Unknown embedding provider: '{}'. Must be hash, ollama, openai, or local.",
                other
            ),
        }
        if matches!(self.embedding.provider.as_str(), "ollama" | "openai") {
            if self.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    self.embedding.provider
                );
            }
            if self.embedding.dims.is_none() {
                bail!(
                    "embedding.dims must be specified when provider is '{}'",
                    self.embedding.provider
                );
            }
        }

        for provider in &self.synthesis.providers {
            match provider.kind.as_str() {
                "ollama" | "openai" => {}
                other => bail!(
                    "Unknown synthesis provider kind: '{}'. Must be ollama or openai.",
                    other
                ),
            }
            if provider.timeout_secs == 0 {
                bail!("synthesis provider '{}' needs timeout_secs > 0", provider.label());
            }
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}
