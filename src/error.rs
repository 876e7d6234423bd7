//! Error taxonomy for the engine.
//!
//! Most of these never reach a caller: unreadable documents and embedding
//! failures are absorbed by the builder and surfaced as [`BuildWarning`]s,
//! provider failures are absorbed by the synthesizer's fallback chain.
//! [`EngineError::IndexVersionMismatch`] is the one query-time error a
//! caller must handle (by triggering a rebuild).

use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("document unreadable: {path}: {reason}")]
    DocumentUnreadable { path: String, reason: String },

    #[error("embedding failed for {doc}: {reason}")]
    EmbeddingFailure { doc: String, reason: String },

    #[error(
        "index was built with embedder '{index}' but queries use '{query}'; rebuild required"
    )]
    IndexVersionMismatch { index: String, query: String },

    #[error("provider '{provider}' timed out after {millis} ms")]
    ProviderTimeout { provider: String, millis: u128 },

    #[error("provider '{provider}' failed: {reason}")]
    ProviderError { provider: String, reason: String },

    #[error("corrupt index at {path}: {reason}")]
    CorruptIndex { path: String, reason: String },

    #[error("another index build is already running")]
    BuildInProgress,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    pub fn provider(provider: &str, reason: impl std::fmt::Display) -> Self {
        EngineError::ProviderError {
            provider: provider.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn corrupt(path: &std::path::Path, reason: impl std::fmt::Display) -> Self {
        EngineError::CorruptIndex {
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Non-fatal conditions reported by an index build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildWarning {
    /// No eligible documents (or no embeddable chunks); the index was cleared.
    EmptyCorpus { root: String },
    /// Re-embedding one document failed; its previous state was kept.
    EmbeddingFailure { doc: String, reason: String },
    /// A document could not be read or yielded no text.
    Skipped { doc: String, reason: String },
    /// The previous index could not be reused and was rebuilt from scratch.
    FullRebuild { reason: String },
}

impl std::fmt::Display for BuildWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildWarning::EmptyCorpus { root } => {
                write!(f, "no eligible documents under {}; index cleared", root)
            }
            BuildWarning::EmbeddingFailure { doc, reason } => {
                write!(f, "embedding failed for {} (previous state kept): {}", doc, reason)
            }
            BuildWarning::Skipped { doc, reason } => write!(f, "skipped {}: {}", doc, reason),
            BuildWarning::FullRebuild { reason } => write!(f, "full rebuild: {}", reason),
        }
    }
}
