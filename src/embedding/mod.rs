//! Embedder abstraction and implementations.
//!
//! An [`Embedder`] maps chunk text to a fixed-length vector. Every embedder
//! reports a [`version`](Embedder::version) string; the index records it and
//! refuses to mix vectors from different versions.
//!
//! - **[`HashEmbedder`]**: deterministic feature hashing; no model, no
//!   network. The default, and what the tests run on.
//! - **[`OllamaEmbedder`]**: a local Ollama instance's `/api/embed`.
//! - **[`OpenAIEmbedder`]**: the OpenAI `/v1/embeddings` API.
//! - **`LocalEmbedder`**: in-process inference via fastembed (feature
//!   `local-embeddings`).
//!
//! # Retry Strategy
//!
//! The HTTP embedders use exponential backoff for transient errors:
//! - HTTP 429 and 5xx → retry
//! - other HTTP 4xx → fail immediately
//! - network errors → retry
//! - backoff: 1s, 2s, 4s, … (capped at 2^5)

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::EngineError;

const DEFAULT_HASH_DIMS: usize = 256;

/// A text → vector function with a stable identity.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier (e.g. `"nomic-embed-text"`).
    fn model_name(&self) -> &str;
    /// Output dimensionality.
    fn dims(&self) -> usize;
    /// Compatibility key stored with every vector: `provider:model:dims:rN`.
    fn version(&self) -> &str;
    /// Embed a batch; the result has one vector per input, in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

pub fn version_string(provider: &str, model: &str, dims: usize, revision: u32) -> String {
    format!("{}:{}:{}:r{}", provider, model, dims, revision)
}

/// Embed a single query text.
pub async fn embed_query(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>> {
    let results = embedder.embed(&[text.to_string()]).await?;
    results
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("Empty embedding response"))
}

/// Embed `texts` in batches of `batch_size`, checking dimensionality.
pub async fn embed_batched(
    embedder: &dyn Embedder,
    texts: &[String],
    batch_size: usize,
) -> Result<Vec<Vec<f32>>> {
    let mut out = Vec::with_capacity(texts.len());
    for batch in texts.chunks(batch_size.max(1)) {
        let vectors = embedder.embed(batch).await?;
        if vectors.len() != batch.len() {
            bail!(
                "embedder returned {} vectors for {} texts",
                vectors.len(),
                batch.len()
            );
        }
        for v in &vectors {
            if v.len() != embedder.dims() {
                bail!(
                    "embedder returned {} dims, expected {}",
                    v.len(),
                    embedder.dims()
                );
            }
        }
        out.extend(vectors);
    }
    Ok(out)
}

/// [`embed_batched`] for one document's chunks; any failure is an
/// [`EngineError::EmbeddingFailure`] for that document.
pub async fn embed_document(
    embedder: &dyn Embedder,
    doc_key: &str,
    texts: &[String],
    batch_size: usize,
) -> std::result::Result<Vec<Vec<f32>>, EngineError> {
    embed_batched(embedder, texts, batch_size)
        .await
        .map_err(|e| EngineError::EmbeddingFailure {
            doc: doc_key.to_string(),
            reason: format!("{:#}", e),
        })
}

// ============ Hash Embedder ============

/// Signed feature hashing over lowercase word unigrams and bigrams,
/// L2-normalized.
///
/// Cheap and fully deterministic, with enough lexical signal that related
/// passages land near each other.
pub struct HashEmbedder {
    dims: usize,
    version: String,
}

impl HashEmbedder {
    pub fn new(dims: usize, revision: u32) -> Self {
        Self {
            dims,
            version: version_string("hash", "feature-hash", dims, revision),
        }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        let words = tokenize(text);
        for word in &words {
            self.add_feature(&mut v, word.as_bytes(), 1.0);
        }
        for pair in words.windows(2) {
            let bigram = format!("{} {}", pair[0], pair[1]);
            self.add_feature(&mut v, bigram.as_bytes(), 0.5);
        }
        crate::vector_index::normalize(&mut v);
        v
    }

    fn add_feature(&self, v: &mut [f32], feature: &[u8], weight: f32) {
        let digest = Sha256::digest(feature);
        let mut idx_bytes = [0u8; 8];
        idx_bytes.copy_from_slice(&digest[..8]);
        let bucket = (u64::from_le_bytes(idx_bytes) % self.dims as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        v[bucket] += sign * weight;
    }
}

/// Lowercase alphanumeric words; shared with lexical reranking.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "feature-hash"
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn version(&self) -> &str {
        &self.version
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

// ============ HTTP embedders ============

/// POST `body` to `url` with retry/backoff; returns the parsed JSON body.
async fn post_with_retry(
    client: &reqwest::Client,
    url: &str,
    api_key: Option<&str>,
    body: &serde_json::Value,
    max_retries: u32,
    label: &str,
) -> Result<serde_json::Value> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let mut request = client.post(url).json(body);
        if let Some(key) = api_key {
            request = request.bearer_auth(key);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response.json().await?);
                }
                let body_text = response.text().await.unwrap_or_default();
                if status.as_u16() == 429 || status.is_server_error() {
                    last_err = Some(anyhow!("{} API error {}: {}", label, status, body_text));
                    continue;
                }
                bail!("{} API error {}: {}", label, status, body_text);
            }
            Err(e) => {
                last_err = Some(anyhow!("{} connection error ({}): {}", label, url, e));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("{} embedding failed after retries", label)))
}

fn json_vectors<'a>(
    arrays: impl Iterator<Item = Option<&'a serde_json::Value>>,
) -> Result<Vec<Vec<f32>>> {
    arrays
        .map(|item| {
            let array = item
                .and_then(|e| e.as_array())
                .ok_or_else(|| anyhow!("embedding is not an array"))?;
            Ok(array
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect())
        })
        .collect()
}

/// Embedder backed by Ollama's `POST /api/embed`.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
    max_retries: u32,
    version: String,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for Ollama embedder"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow!("embedding.dims required for Ollama embedder"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://127.0.0.1:11434".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            version: version_string("ollama", &model, dims, config.revision),
            model,
            dims,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn version(&self) -> &str {
        &self.version
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let json = post_with_retry(
            &self.client,
            &format!("{}/api/embed", self.url),
            None,
            &body,
            self.max_retries,
            "Ollama",
        )
        .await?;
        let embeddings = json
            .get("embeddings")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow!("Invalid Ollama response: missing embeddings array"))?;
        json_vectors(embeddings.iter().map(Some))
    }
}

/// Embedder backed by the OpenAI embeddings API.
pub struct OpenAIEmbedder {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    dims: usize,
    max_retries: u32,
    version: String,
}

impl OpenAIEmbedder {
    /// Reads the API key from the variable named by `embedding.api_key_env`.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("embedding.model required for OpenAI embedder"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow!("embedding.dims required for OpenAI embedder"))?;
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| anyhow!("{} environment variable not set", config.api_key_env))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            api_key,
            version: version_string("openai", &model, dims, config.revision),
            model,
            dims,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn version(&self) -> &str {
        &self.version
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
            "dimensions": self.dims,
        });
        let json = post_with_retry(
            &self.client,
            &format!("{}/v1/embeddings", self.url),
            Some(&self.api_key),
            &body,
            self.max_retries,
            "OpenAI",
        )
        .await?;
        let mut data: Vec<&serde_json::Value> = json
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| anyhow!("Invalid OpenAI response: missing data array"))?
            .iter()
            .collect();
        data.sort_by_key(|item| item.get("index").and_then(|i| i.as_u64()).unwrap_or(0));
        json_vectors(data.into_iter().map(|item| item.get("embedding")))
    }
}

// ============ Local (fastembed) ============

/// In-process embedder. The model is downloaded on first use and cached;
/// after that no network access is needed.
#[cfg(feature = "local-embeddings")]
pub struct LocalEmbedder {
    model: String,
    dims: usize,
    batch_size: usize,
    version: String,
    engine: Arc<std::sync::Mutex<Option<fastembed::TextEmbedding>>>,
}

#[cfg(feature = "local-embeddings")]
impl LocalEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
        // Validate the name up front so a typo fails at startup.
        fastembed_model(&model)?;
        let dims = config.dims.unwrap_or(match model.as_str() {
            "bge-base-en-v1.5" | "nomic-embed-text-v1.5" => 768,
            "bge-large-en-v1.5" => 1024,
            _ => 384,
        });
        Ok(Self {
            version: version_string("local", &model, dims, config.revision),
            model,
            dims,
            batch_size: config.batch_size,
            engine: Arc::new(std::sync::Mutex::new(None)),
        })
    }
}

#[cfg(feature = "local-embeddings")]
fn fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        other => bail!(
            "Unknown local embedding model: '{}'. Supported models: all-minilm-l6-v2, \
             bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, nomic-embed-text-v1.5",
            other
        ),
    }
}

#[cfg(feature = "local-embeddings")]
#[async_trait]
impl Embedder for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn version(&self) -> &str {
        &self.version
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let engine = Arc::clone(&self.engine);
        let model = fastembed_model(&self.model)?;
        let batch_size = self.batch_size;
        let texts = texts.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut guard = engine
                .lock()
                .map_err(|_| anyhow!("local embedding model lock poisoned"))?;
            if guard.is_none() {
                let loaded = fastembed::TextEmbedding::try_new(
                    fastembed::InitOptions::new(model).with_show_download_progress(false),
                )
                .map_err(|e| anyhow!("Failed to initialize local embedding model: {}", e))?;
                *guard = Some(loaded);
            }
            let Some(text_embedding) = guard.as_mut() else {
                bail!("local embedding model unavailable");
            };
            text_embedding
                .embed(texts, Some(batch_size))
                .map_err(|e| anyhow!("Local embedding failed: {}", e))
        })
        .await?
    }
}

/// Build the embedder named by `[embedding].provider`.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "hash" => Ok(Arc::new(HashEmbedder::new(
            config.dims.unwrap_or(DEFAULT_HASH_DIMS),
            config.revision,
        ))),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        "openai" => Ok(Arc::new(OpenAIEmbedder::new(config)?)),
        #[cfg(feature = "local-embeddings")]
        "local" => Ok(Arc::new(LocalEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings"),
        other => Err(EngineError::Config(format!("unknown embedding provider '{}'", other)).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector_index::cosine_similarity;

    #[test]
    fn test_hash_embedder_deterministic_and_normalized() {
        let e = HashEmbedder::new(64, 1);
        let a = e.embed_one("Position sizing limits the damage of a bad trade");
        let b = e.embed_one("Position sizing limits the damage of a bad trade");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_hash_embedder_lexical_signal() {
        let e = HashEmbedder::new(256, 1);
        let q = e.embed_one("stop loss placement");
        let near = e.embed_one("Where to put a stop loss: placement below support");
        let far = e.embed_one("Dividend reinvestment compounds over decades");
        assert!(cosine_similarity(&q, &near) > cosine_similarity(&q, &far));
    }

    #[test]
    fn test_version_changes_with_revision() {
        assert_ne!(
            HashEmbedder::new(64, 1).version(),
            HashEmbedder::new(64, 2).version()
        );
        assert_eq!(HashEmbedder::new(64, 1).version(), "hash:feature-hash:64:r1");
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(tokenize("RSI-14, EMA(20)!"), vec!["rsi", "14", "ema", "20"]);
    }

    #[tokio::test]
    async fn test_embed_batched_preserves_order() {
        let e = HashEmbedder::new(32, 1);
        let texts: Vec<String> = (0..7).map(|i| format!("text number {}", i)).collect();
        let batched = embed_batched(&e, &texts, 3).await.unwrap();
        let whole = e.embed(&texts).await.unwrap();
        assert_eq!(batched, whole);
    }

    struct Broken;

    #[async_trait]
    impl Embedder for Broken {
        fn model_name(&self) -> &str {
            "broken"
        }
        fn dims(&self) -> usize {
            4
        }
        fn version(&self) -> &str {
            "broken:broken:4:r1"
        }
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            bail!("connection reset")
        }
    }

    #[tokio::test]
    async fn test_embed_document_failure_names_document() {
        let err = embed_document(&Broken, "notes/risk.md", &["x".to_string()], 8)
            .await
            .unwrap_err();
        match err {
            EngineError::EmbeddingFailure { doc, reason } => {
                assert_eq!(doc, "notes/risk.md");
                assert!(reason.contains("connection reset"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_unknown_provider_is_config_error() {
        let config = EmbeddingConfig {
            provider: "word2vec".to_string(),
            ..EmbeddingConfig::default()
        };
        let err = create_embedder(&config).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::Config(_))
        ));
    }

    #[test]
    fn test_create_hash_embedder_default_dims() {
        let embedder = create_embedder(&EmbeddingConfig::default()).unwrap();
        assert_eq!(embedder.dims(), DEFAULT_HASH_DIMS);
    }
}
