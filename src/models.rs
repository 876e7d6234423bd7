//! Core data types that flow through ingestion and retrieval.
//!
//! A [`DocumentFile`] is discovered on disk, split into [`Chunk`]s, and each
//! chunk becomes one [`ChunkRecord`] row in the persisted metadata table with
//! a matching vector in the index. Queries produce [`Hit`]s, which the
//! synthesizer turns into an [`Answer`].

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// `(size, mtime)` pair used to detect document change without reading it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub size: u64,
    /// Modification time in nanoseconds since the Unix epoch.
    pub mtime_ns: i64,
}

/// Extraction strategy, chosen from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocKind {
    Pdf,
    Docx,
    Text,
}

impl DocKind {
    pub fn from_path(path: &std::path::Path) -> Self {
        match path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .as_deref()
        {
            Some("pdf") => DocKind::Pdf,
            Some("docx") => DocKind::Docx,
            _ => DocKind::Text,
        }
    }
}

/// A source document found by the corpus walk.
#[derive(Debug, Clone)]
pub struct DocumentFile {
    /// Corpus-relative path with `/` separators; the document's identity.
    pub key: String,
    pub path: PathBuf,
    pub shortname: String,
    pub kind: DocKind,
    pub fingerprint: Fingerprint,
}

/// A contiguous span of normalized text from one document.
///
/// The chunk refers to its document by key only; removing a document is a
/// bulk delete of every row carrying that key.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Stable id derived from the document key and ordinal.
    pub id: String,
    pub doc_key: String,
    pub ordinal: u32,
    pub text: String,
    /// SHA-256 of `text`.
    pub hash: String,
}

impl Chunk {
    /// One-based section number shown in citations.
    pub fn section(&self) -> u32 {
        self.ordinal + 1
    }
}

/// One row of the persisted metadata table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: String,
    pub doc_key: String,
    pub shortname: String,
    pub section: u32,
    pub text: String,
    pub snippet: String,
    pub hash: String,
    pub embedder_version: String,
}

impl ChunkRecord {
    /// Compact citation label, e.g. `[Risk_Playbook §3]`.
    pub fn label(&self) -> String {
        citation_label(&self.shortname, self.section)
    }
}

pub fn citation_label(shortname: &str, section: u32) -> String {
    format!("[{} §{}]", shortname, section)
}

/// A retrieved chunk with its final ranking score.
#[derive(Debug, Clone, Serialize)]
pub struct Hit {
    pub record: ChunkRecord,
    pub score: f32,
}

/// Reference from an answer back to a retrieved chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub doc_key: String,
    pub shortname: String,
    pub section: u32,
    pub label: String,
}

impl From<&ChunkRecord> for Citation {
    fn from(record: &ChunkRecord) -> Self {
        Self {
            doc_key: record.doc_key.clone(),
            shortname: record.shortname.clone(),
            section: record.section,
            label: record.label(),
        }
    }
}

/// A `search` result row: snippet plus where it came from.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub snippet: String,
    pub citation: Citation,
    pub score: f32,
}

/// Synthesized answer. Ephemeral, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub text: String,
    pub citations: Vec<Citation>,
    /// Label of the provider that produced the text, `"heuristic"` for the
    /// extractive fallback, or `"none"` when nothing matched.
    pub provider: String,
}

pub const NO_MATCH: &str = "No strong match";

impl Answer {
    pub fn no_match() -> Self {
        Self {
            text: NO_MATCH.to_string(),
            citations: Vec::new(),
            provider: "none".to_string(),
        }
    }

    pub fn is_no_match(&self) -> bool {
        self.citations.is_empty() && self.text == NO_MATCH
    }
}

/// Answer shape requested from the synthesizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Style {
    Ask,
    ExplainSignal,
}

impl Style {
    /// Inclusive `(min, max)` line count of the final answer text.
    pub fn line_bounds(self) -> (usize, usize) {
        match self {
            Style::Ask => (6, 10),
            Style::ExplainSignal => (8, 12),
        }
    }
}

/// Retrieval flavour; controls `k` and source deduplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalMode {
    /// Several chunks from one source are allowed.
    Search,
    /// Sources are deduplicated past the diversity floor.
    Ask,
}
