//! Index summary for `kb status`.
//!
//! Shows what the live generation contains: embedder identity, geometry,
//! document and chunk counts, and which documents were skipped and why.

use anyhow::Result;
use serde::Serialize;
use std::path::Path;

use crate::builder::SkippedDocument;
use crate::config::Config;
use crate::store::{IndexStore, Snapshot};

#[derive(Debug, Clone, Serialize)]
pub struct IndexStatus {
    pub index_dir: String,
    pub generation: Option<String>,
    /// Unix seconds the live generation was written.
    pub built_at: Option<i64>,
    pub embedder_version: String,
    pub dims: usize,
    pub metric: String,
    pub documents: usize,
    pub chunks: usize,
    pub size_bytes: u64,
    pub skipped: Vec<SkippedDocument>,
}

impl IndexStatus {
    pub fn from_snapshot(index_dir: &Path, snapshot: &Snapshot) -> Self {
        let gen_dir = snapshot.generation.as_ref().map(|g| index_dir.join(g));
        let built_at = gen_dir
            .as_ref()
            .and_then(|dir| std::fs::metadata(dir).ok())
            .and_then(|m| m.modified().ok())
            .map(|t| chrono::DateTime::<chrono::Utc>::from(t).timestamp());
        let size_bytes = gen_dir.as_deref().map(dir_size).unwrap_or(0);

        let meta = &snapshot.meta;
        Self {
            index_dir: index_dir.display().to_string(),
            generation: snapshot.generation.clone(),
            built_at,
            embedder_version: meta.embedder_version.clone(),
            dims: meta.dims,
            metric: meta.metric.to_string(),
            documents: meta.files.values().filter(|f| f.skip_reason.is_none()).count(),
            chunks: meta.chunks.len(),
            size_bytes,
            skipped: meta
                .files
                .iter()
                .filter_map(|(doc, state)| {
                    state.skip_reason.as_ref().map(|reason| SkippedDocument {
                        doc: doc.clone(),
                        reason: reason.clone(),
                    })
                })
                .collect(),
        }
    }
}

/// Status of the live index on disk, without constructing an engine.
/// `None` when nothing has been published yet.
pub fn collect_status(config: &Config) -> Result<Option<IndexStatus>> {
    let store = IndexStore::new(&config.index.dir);
    Ok(store
        .load()?
        .map(|snapshot| IndexStatus::from_snapshot(store.dir(), &snapshot)))
}

/// Run the status command: load the live index and print a summary.
pub fn run_status(config: &Config, json: bool) -> Result<()> {
    let status = collect_status(config)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Playbook index status");
    println!("=====================");
    println!();
    println!("  Index dir:   {}", config.index.dir.display());

    let Some(status) = status else {
        println!("  Generation:  none (run `kb rebuild`)");
        println!();
        return Ok(());
    };

    println!(
        "  Generation:  {}",
        status.generation.as_deref().unwrap_or("none")
    );
    println!(
        "  Built:       {}",
        status
            .built_at
            .map(format_ts_relative)
            .unwrap_or_else(|| "unknown".to_string())
    );
    println!("  Size:        {}", format_bytes(status.size_bytes));
    println!();
    println!("  Embedder:    {}", status.embedder_version);
    println!("  Geometry:    {} dims, {}", status.dims, status.metric);
    println!("  Documents:   {}", status.documents);
    println!("  Chunks:      {}", status.chunks);

    if !status.skipped.is_empty() {
        println!();
        println!("  Skipped ({}):", status.skipped.len());
        for s in &status.skipped {
            println!("    {:<40} {}", s.doc, s.reason);
        }
    }
    println!();
    Ok(())
}

fn dir_size(dir: &Path) -> u64 {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter_map(|e| e.metadata().ok())
                .filter(|m| m.is_file())
                .map(|m| m.len())
                .sum()
        })
        .unwrap_or(0)
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }
    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FileState, IndexMeta};
    use crate::models::Fingerprint;
    use crate::vector_index::{GraphParams, Metric, VectorIndex};

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn test_relative_time() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 7200), "2 hours ago");
        assert!(format_ts_relative(now + 1000).contains('-'));
    }

    #[test]
    fn test_status_lists_skipped_documents() {
        let mut meta = IndexMeta::empty("hash:feature-hash:8:r1", 8, Metric::Cosine);
        let fp = Fingerprint { size: 1, mtime_ns: 1 };
        meta.files.insert(
            "scan.pdf".to_string(),
            FileState {
                fingerprint: fp,
                shortname: "scan".to_string(),
                chunks: 0,
                skip_reason: Some("no selectable text".to_string()),
            },
        );
        let index = VectorIndex::new(Metric::Cosine, 8, GraphParams::default());
        let snapshot = Snapshot::new(None, meta, index).unwrap();

        let status = IndexStatus::from_snapshot(Path::new("/tmp/none"), &snapshot);
        assert_eq!(status.documents, 0);
        assert_eq!(status.chunks, 0);
        assert_eq!(status.metric, "cosine");
        assert_eq!(
            status.skipped,
            vec![SkippedDocument {
                doc: "scan.pdf".to_string(),
                reason: "no selectable text".to_string()
            }]
        );
        assert!(status.built_at.is_none());
    }
}
