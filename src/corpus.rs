//! Corpus directory walk.
//!
//! Discovers eligible documents under `[corpus].root` using include/exclude
//! globs and records each one's [`Fingerprint`]. The corpus is read-only to
//! the engine: this module never opens a file for writing and never reads a
//! file's contents.

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::HashMap;
use std::path::Path;
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::CorpusConfig;
use crate::models::{DocKind, DocumentFile, Fingerprint};

/// Files found by a scan, plus the ones rejected before extraction.
#[derive(Debug, Default)]
pub struct CorpusScan {
    pub documents: Vec<DocumentFile>,
    /// `(key, reason)` for files that matched the globs but were rejected.
    pub rejected: Vec<(String, String)>,
    /// `(key, reason)` for paths that could not be walked or stat'ed. The key
    /// may name a directory; everything recorded under it keeps its previous
    /// state. An empty key stands for the whole corpus.
    pub unreadable: Vec<(String, String)>,
}

impl CorpusScan {
    /// True when `doc_key` is, or lies under, an unreadable path.
    pub fn is_unreadable(&self, doc_key: &str) -> bool {
        self.unreadable.iter().any(|(key, _)| {
            key.is_empty()
                || doc_key == key
                || doc_key
                    .strip_prefix(key.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }
}

/// Walk the corpus root and return eligible documents sorted by key.
///
/// A missing root is not an error: it is an empty corpus, which the builder
/// turns into a cleared index plus a warning.
pub fn scan_corpus(config: &CorpusConfig) -> Result<CorpusScan> {
    let root = &config.root;
    let mut scan = CorpusScan::default();
    if !root.exists() {
        debug!(root = %root.display(), "corpus root does not exist");
        return Ok(scan);
    }

    let include_set = build_globset(&config.include_globs)?;

    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/.*".to_string(),
        "**/~$*".to_string(),
    ];
    default_excludes.extend(config.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let walker = WalkDir::new(root)
        .follow_links(config.follow_symlinks)
        .sort_by_file_name();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let key = e.path().map(|p| corpus_key(root, p)).unwrap_or_default();
                if key.is_empty() || !exclude_set.is_match(&key) {
                    warn!(path = %key, error = %e, "cannot walk corpus path");
                    scan.unreadable.push((key, e.to_string()));
                }
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let key = corpus_key(root, path);

        if exclude_set.is_match(&key) || !include_set.is_match(&key) {
            continue;
        }

        let fingerprint = match fingerprint(path) {
            Ok(fp) => fp,
            Err(e) => {
                warn!(doc = %key, error = %e, "cannot stat document");
                scan.unreadable.push((key, format!("stat failed: {}", e)));
                continue;
            }
        };
        if fingerprint.size > config.max_file_bytes {
            scan.rejected.push((
                key,
                format!(
                    "file is {} bytes, above max_file_bytes {}",
                    fingerprint.size, config.max_file_bytes
                ),
            ));
            continue;
        }

        scan.documents.push(DocumentFile {
            shortname: sanitize_shortname(path),
            kind: DocKind::from_path(path),
            path: path.to_path_buf(),
            key,
            fingerprint,
        });
    }

    scan.documents.sort_by(|a, b| a.key.cmp(&b.key));
    disambiguate_shortnames(&mut scan.documents);

    Ok(scan)
}

/// Corpus-relative path with `/` separators.
fn corpus_key(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Current `(size, mtime)` of a file.
pub fn fingerprint(path: &Path) -> std::io::Result<Fingerprint> {
    let metadata = std::fs::metadata(path)?;
    let modified = metadata.modified().unwrap_or(UNIX_EPOCH);
    let mtime_ns = match modified.duration_since(UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_nanos()).unwrap_or(i64::MAX),
        Err(e) => -i64::try_from(e.duration().as_nanos()).unwrap_or(i64::MAX),
    };
    Ok(Fingerprint {
        size: metadata.len(),
        mtime_ns,
    })
}

/// Citation shortname from the file stem: runs of non-alphanumerics become a
/// single `_`, leading/trailing underscores are dropped.
pub fn sanitize_shortname(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().trim().to_string())
        .unwrap_or_default();
    let cleaned: String = stem
        .chars()
        .map(|ch| if ch.is_alphanumeric() { ch } else { '_' })
        .collect();
    let joined = cleaned
        .split('_')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_");
    if joined.is_empty() {
        "document".to_string()
    } else {
        joined
    }
}

/// Give colliding shortnames a `_2`, `_3`, … suffix in key order.
fn disambiguate_shortnames(documents: &mut [DocumentFile]) {
    let mut seen: HashMap<String, u32> = HashMap::new();
    for doc in documents.iter_mut() {
        let count = seen.entry(doc.shortname.clone()).or_insert(0);
        *count += 1;
        if *count > 1 {
            doc.shortname = format!("{}_{}", doc.shortname, count);
        }
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}
