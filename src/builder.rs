//! Index build pipeline.
//!
//! Coordinates one rebuild: corpus scan → change classification →
//! extraction, chunking and embedding of changed/new documents → pruning of
//! removed documents → merge into a copy of the previous index → atomic
//! publish.
//!
//! # Failure handling
//!
//! | Condition | Effect |
//! |-----------|--------|
//! | document unreadable / no text | old chunks dropped, fingerprint + reason recorded, `Skipped` warning |
//! | path cannot be walked or stat'ed | documents under it keep their previous state, `Skipped` warning |
//! | embedding fails for a document | document's previous state kept untouched, `EmbeddingFailure` warning |
//! | embedder version, dims, metric or graph params differ | previous index discarded, `FullRebuild` warning |
//! | previous index corrupt | treated as absent, `FullRebuild` warning |
//! | no documents, or no chunks after merge | index cleared, `EmptyCorpus` warning |
//!
//! Builds are serialized by an exclusive file lock in the index directory;
//! a second concurrent build fails with [`EngineError::BuildInProgress`].
//! When nothing changed the previous generation stays live and no files are
//! written.

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::change::{classify, ChangeKind};
use crate::chunk::{chunk_text, snippet};
use crate::config::Config;
use crate::corpus::scan_corpus;
use crate::embedding::{embed_document, Embedder};
use crate::error::{BuildWarning, EngineError};
use crate::extract::extract_document;
use crate::models::{ChunkRecord, DocumentFile};
use crate::progress::{BuildProgressEvent, BuildProgressReporter};
use crate::store::{FileState, IndexMeta, IndexStore, Snapshot};
use crate::vector_index::{GraphParams, VectorIndex};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedDocument {
    pub doc: String,
    pub reason: String,
}

/// Outcome of one build run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildReport {
    /// Live generation after the run.
    pub generation: Option<String>,
    /// Whether this run wrote a new generation.
    pub published: bool,
    pub documents: usize,
    pub unchanged: usize,
    pub changed: usize,
    pub new: usize,
    pub removed: usize,
    pub chunks: usize,
    pub embedded_chunks: usize,
    pub embed_calls: usize,
    pub skipped: Vec<SkippedDocument>,
    pub warnings: Vec<BuildWarning>,
}

/// Run one incremental build and return the report plus the snapshot that
/// is live afterwards.
pub async fn build_index(
    config: &Config,
    embedder: &dyn Embedder,
    progress: &dyn BuildProgressReporter,
) -> Result<(BuildReport, Snapshot)> {
    let store = IndexStore::new(&config.index.dir);
    let _lock = store.lock()?;

    let params = GraphParams::from(&config.index);
    let metric = config.index.metric;
    let mut report = BuildReport::default();

    let previous = match store.load() {
        Ok(snapshot) => snapshot,
        Err(e @ EngineError::CorruptIndex { .. }) => {
            warn!(error = %e, "previous index unusable, rebuilding from scratch");
            report.warnings.push(BuildWarning::FullRebuild {
                reason: e.to_string(),
            });
            None
        }
        Err(e) => return Err(e.into()),
    };

    let (base, must_publish) = match previous {
        Some(snapshot) => match incompatibility(&snapshot, embedder, metric, params) {
            Some(reason) => {
                info!(reason = %reason, "index geometry changed, rebuilding from scratch");
                report.warnings.push(BuildWarning::FullRebuild { reason });
                let mut fresh =
                    Snapshot::empty(embedder.version(), embedder.dims(), metric, params);
                fresh.generation = snapshot.generation;
                (fresh, true)
            }
            None => (snapshot, false),
        },
        None => (
            Snapshot::empty(embedder.version(), embedder.dims(), metric, params),
            true,
        ),
    };
    let must_publish = must_publish || base.generation.is_none();

    progress.report(BuildProgressEvent::Scanning {
        root: config.corpus.root.display().to_string(),
    });
    let scan = scan_corpus(&config.corpus)?;
    for (doc, reason) in &scan.rejected {
        report.skipped.push(SkippedDocument {
            doc: doc.clone(),
            reason: reason.clone(),
        });
        report.warnings.push(BuildWarning::Skipped {
            doc: doc.clone(),
            reason: reason.clone(),
        });
    }

    for (path, reason) in &scan.unreadable {
        let doc = if path.is_empty() { "." } else { path.as_str() };
        report.skipped.push(SkippedDocument {
            doc: doc.to_string(),
            reason: reason.clone(),
        });
        report.warnings.push(BuildWarning::Skipped {
            doc: doc.to_string(),
            reason: format!("{} (previous state kept)", reason),
        });
    }

    let mut changes = classify(&base.meta.fingerprints(), &scan.documents);
    for key in base.meta.files.keys() {
        if scan.is_unreadable(key) && changes.hold(key) {
            info!(doc = %key, "document unreadable on disk, keeping previous state");
        }
    }
    if changes.is_noop() {
        debug!("corpus unchanged since last build");
    }
    report.documents = scan.documents.len();
    report.unchanged = changes.count(ChangeKind::Unchanged);
    report.changed = changes.count(ChangeKind::Changed);
    report.new = changes.count(ChangeKind::New);
    report.removed = changes.count(ChangeKind::Removed);
    progress.report(BuildProgressEvent::Classified {
        unchanged: report.unchanged as u64,
        changed: report.changed as u64,
        new: report.new as u64,
        removed: report.removed as u64,
    });

    let mut meta = base.meta.clone();
    let mut index = base.index.clone();
    let mut dirty = false;

    for key in changes.keys_of(ChangeKind::Removed) {
        info!(doc = %key, "document removed");
        drop_document(&mut meta, &mut index, key);
        meta.files.remove(key);
        dirty = true;
    }

    // Unchanged documents can still be renamed by shortname disambiguation.
    for doc in &scan.documents {
        if changes.kind_of(&doc.key) != Some(ChangeKind::Unchanged) {
            continue;
        }
        if let Some(state) = meta.files.get_mut(&doc.key) {
            if let Some(reason) = &state.skip_reason {
                report.skipped.push(SkippedDocument {
                    doc: doc.key.clone(),
                    reason: reason.clone(),
                });
            }
            if state.shortname != doc.shortname {
                state.shortname = doc.shortname.clone();
                for record in meta.chunks.iter_mut().filter(|r| r.doc_key == doc.key) {
                    record.shortname = doc.shortname.clone();
                }
                dirty = true;
            }
        }
    }

    let pending: Vec<&DocumentFile> = scan
        .documents
        .iter()
        .filter(|d| {
            matches!(
                changes.kind_of(&d.key),
                Some(ChangeKind::Changed) | Some(ChangeKind::New)
            )
        })
        .collect();
    let total = pending.len() as u64;
    let batch_size = config.embedding.batch_size.max(1);

    for (i, doc) in pending.into_iter().enumerate() {
        progress.report(BuildProgressEvent::Processing {
            doc: doc.key.clone(),
            n: i as u64 + 1,
            total,
        });

        let text = match extract_document(doc).await {
            Ok(text) => text,
            Err(EngineError::DocumentUnreadable { reason, .. }) => {
                skip_document(&mut meta, &mut index, &mut report, doc, reason);
                dirty = true;
                continue;
            }
            Err(other) => return Err(other.into()),
        };
        let chunks = chunk_text(&doc.key, &text, config.chunking.max_tokens);
        if chunks.is_empty() {
            skip_document(&mut meta, &mut index, &mut report, doc, "no selectable text".to_string());
            dirty = true;
            continue;
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        report.embed_calls += texts.len().div_ceil(batch_size);
        let vectors = match embed_document(embedder, &doc.key, &texts, batch_size).await {
            Ok(vectors) => vectors,
            Err(EngineError::EmbeddingFailure { doc, reason }) => {
                warn!(doc = %doc, reason = %reason, "embedding failed, keeping previous state");
                report.warnings.push(BuildWarning::EmbeddingFailure { doc, reason });
                continue;
            }
            Err(other) => return Err(other.into()),
        };

        drop_document(&mut meta, &mut index, &doc.key);
        for (chunk, vector) in chunks.iter().zip(vectors) {
            index.insert(&chunk.id, vector)?;
            meta.chunks.push(ChunkRecord {
                id: chunk.id.clone(),
                doc_key: doc.key.clone(),
                shortname: doc.shortname.clone(),
                section: chunk.section(),
                snippet: snippet(&chunk.text),
                text: chunk.text.clone(),
                hash: chunk.hash.clone(),
                embedder_version: embedder.version().to_string(),
            });
        }
        meta.files.insert(
            doc.key.clone(),
            FileState {
                fingerprint: doc.fingerprint,
                shortname: doc.shortname.clone(),
                chunks: chunks.len() as u32,
                skip_reason: None,
            },
        );
        report.embedded_chunks += chunks.len();
        dirty = true;
        info!(doc = %doc.key, chunks = chunks.len(), "document indexed");
    }

    meta.sort_chunks();

    if meta.chunks.is_empty() {
        warn!(root = %config.corpus.root.display(), "no indexable content, clearing index");
        report.warnings.push(BuildWarning::EmptyCorpus {
            root: config.corpus.root.display().to_string(),
        });
    }

    report.chunks = meta.chunks.len();

    if !dirty && !must_publish {
        info!("index up to date");
        report.generation = base.generation.clone();
        return Ok((report, base));
    }

    progress.report(BuildProgressEvent::Publishing {
        chunks: meta.chunks.len() as u64,
    });
    let generation = store.publish(&meta, &index)?;
    info!(
        generation = %generation,
        chunks = meta.chunks.len(),
        embedded = report.embedded_chunks,
        "published index"
    );
    report.generation = Some(generation.clone());
    report.published = true;

    let snapshot = Snapshot::new(Some(generation), meta, index)?;
    Ok((report, snapshot))
}

/// Why `snapshot` cannot be extended with vectors from `embedder`, if it can't.
fn incompatibility(
    snapshot: &Snapshot,
    embedder: &dyn Embedder,
    metric: crate::vector_index::Metric,
    params: GraphParams,
) -> Option<String> {
    let meta = &snapshot.meta;
    if meta.embedder_version != embedder.version() {
        return Some(format!(
            "embedder changed from '{}' to '{}'",
            meta.embedder_version,
            embedder.version()
        ));
    }
    if meta.dims != embedder.dims() {
        return Some(format!("dims changed from {} to {}", meta.dims, embedder.dims()));
    }
    if meta.metric != metric {
        return Some(format!("metric changed from {} to {}", meta.metric, metric));
    }
    if snapshot.index.params() != params {
        return Some("graph parameters changed".to_string());
    }
    None
}

/// Bulk-delete every chunk of `doc_key` from the metadata table and index.
fn drop_document(meta: &mut IndexMeta, index: &mut VectorIndex, doc_key: &str) {
    meta.chunks.retain(|record| {
        if record.doc_key == doc_key {
            index.remove(&record.id);
            false
        } else {
            true
        }
    });
}

fn skip_document(
    meta: &mut IndexMeta,
    index: &mut VectorIndex,
    report: &mut BuildReport,
    doc: &DocumentFile,
    reason: String,
) {
    warn!(doc = %doc.key, reason = %reason, "skipping unreadable document");
    drop_document(meta, index, &doc.key);
    meta.files.insert(
        doc.key.clone(),
        FileState {
            fingerprint: doc.fingerprint,
            shortname: doc.shortname.clone(),
            chunks: 0,
            skip_reason: Some(reason.clone()),
        },
    );
    report.skipped.push(SkippedDocument {
        doc: doc.key.clone(),
        reason: reason.clone(),
    });
    report.warnings.push(BuildWarning::Skipped {
        doc: doc.key.clone(),
        reason,
    });
}
