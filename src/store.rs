//! On-disk index: generation directories behind an atomic `CURRENT` pointer.
//!
//! ```text
//! <index.dir>/
//!   CURRENT            name of the live generation, e.g. "gen-6f0c…"
//!   .build.lock        advisory lock held by the running builder
//!   gen-<uuid>/
//!     meta.json        metadata table (IndexMeta)
//!     vectors.bin      VectorIndex binary image
//! ```
//!
//! A generation directory is written completely and fsynced before
//! `CURRENT.tmp` is renamed over `CURRENT`, so a reader resolving the
//! pointer sees either the old pair of files or the new pair. The previous
//! generation is kept after a swap for readers that resolved the pointer
//! just before it moved; older ones are removed.

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::models::{ChunkRecord, Fingerprint};
use crate::vector_index::{GraphParams, IndexError, Metric, VectorIndex};

pub const META_FORMAT: u32 = 1;
const CURRENT: &str = "CURRENT";
const CURRENT_TMP: &str = "CURRENT.tmp";
const LOCK_FILE: &str = ".build.lock";
const META_FILE: &str = "meta.json";
const VECTORS_FILE: &str = "vectors.bin";
const GEN_PREFIX: &str = "gen-";

/// What the last build recorded about one corpus file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileState {
    pub fingerprint: Fingerprint,
    pub shortname: String,
    pub chunks: u32,
    /// Set when the file was skipped; its fingerprint is still recorded so
    /// an unchanged unreadable file is not extracted again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

/// The metadata table. Deliberately free of wall-clock fields so that an
/// unchanged corpus serializes to identical bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub format: u32,
    pub embedder_version: String,
    pub dims: usize,
    pub metric: Metric,
    pub files: BTreeMap<String, FileState>,
    /// Sorted by `(doc_key, section)`.
    pub chunks: Vec<ChunkRecord>,
}

impl IndexMeta {
    pub fn empty(embedder_version: &str, dims: usize, metric: Metric) -> Self {
        Self {
            format: META_FORMAT,
            embedder_version: embedder_version.to_string(),
            dims,
            metric,
            files: BTreeMap::new(),
            chunks: Vec::new(),
        }
    }

    pub fn fingerprints(&self) -> BTreeMap<String, Fingerprint> {
        self.files
            .iter()
            .map(|(k, v)| (k.clone(), v.fingerprint))
            .collect()
    }

    pub fn sort_chunks(&mut self) {
        self.chunks.sort_by(|a, b| {
            a.doc_key
                .cmp(&b.doc_key)
                .then_with(|| a.section.cmp(&b.section))
        });
    }
}

/// An immutable, validated (metadata, vectors) pair.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// `None` for an index that has never been published.
    pub generation: Option<String>,
    pub meta: IndexMeta,
    pub index: VectorIndex,
    by_id: HashMap<String, usize>,
}

impl Snapshot {
    /// Pair metadata with vectors after checking they describe the same
    /// chunk set.
    pub fn new(generation: Option<String>, meta: IndexMeta, index: VectorIndex) -> Result<Self> {
        let location = generation.clone().unwrap_or_else(|| "<memory>".to_string());
        let corrupt = |reason: String| EngineError::CorruptIndex {
            path: location.clone(),
            reason,
        };

        if index.dims() != meta.dims || index.metric() != meta.metric {
            return Err(corrupt(format!(
                "vectors are {} dims/{}, metadata says {} dims/{}",
                index.dims(),
                index.metric(),
                meta.dims,
                meta.metric
            )));
        }
        if index.len() != meta.chunks.len() {
            return Err(corrupt(format!(
                "{} vectors for {} metadata rows",
                index.len(),
                meta.chunks.len()
            )));
        }
        let mut by_id = HashMap::with_capacity(meta.chunks.len());
        for (i, record) in meta.chunks.iter().enumerate() {
            if by_id.insert(record.id.clone(), i).is_some() {
                return Err(corrupt(format!("duplicate chunk id {}", record.id)));
            }
            if !index.contains(&record.id) {
                return Err(corrupt(format!("chunk {} has no vector", record.id)));
            }
            if record.embedder_version != meta.embedder_version {
                return Err(corrupt(format!(
                    "chunk {} embedded with '{}'",
                    record.id, record.embedder_version
                )));
            }
        }
        Ok(Self {
            generation,
            meta,
            index,
            by_id,
        })
    }

    /// A never-published index with the given geometry.
    pub fn empty(embedder_version: &str, dims: usize, metric: Metric, params: GraphParams) -> Self {
        Self {
            generation: None,
            meta: IndexMeta::empty(embedder_version, dims, metric),
            index: VectorIndex::new(metric, dims, params),
            by_id: HashMap::new(),
        }
    }

    pub fn record(&self, id: &str) -> Option<&ChunkRecord> {
        self.by_id.get(id).map(|&i| &self.meta.chunks[i])
    }

    pub fn is_empty(&self) -> bool {
        self.meta.chunks.is_empty()
    }
}

/// Held for the duration of a build; released on drop.
#[derive(Debug)]
pub struct BuildLock {
    file: File,
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!(error = %e, "failed to release build lock");
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexStore {
    dir: PathBuf,
}

impl IndexStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Take the cross-process build lock, or fail with
    /// [`EngineError::BuildInProgress`] if another builder holds it.
    pub fn lock(&self) -> Result<BuildLock> {
        fs::create_dir_all(&self.dir)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.dir.join(LOCK_FILE))?;
        file.try_lock_exclusive()
            .map_err(|_| EngineError::BuildInProgress)?;
        Ok(BuildLock { file })
    }

    /// Name of the live generation, if one was ever published.
    pub fn current_generation(&self) -> Result<Option<String>> {
        let path = self.dir.join(CURRENT);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let name = content.trim().to_string();
        if !name.starts_with(GEN_PREFIX) || name.contains(['/', '\\']) || name.contains("..") {
            return Err(EngineError::corrupt(&path, format!("bad pointer '{}'", name)));
        }
        Ok(Some(name))
    }

    /// Load the live generation. `Ok(None)` when nothing was published yet.
    pub fn load(&self) -> Result<Option<Snapshot>> {
        let Some(generation) = self.current_generation()? else {
            return Ok(None);
        };
        let gen_dir = self.dir.join(&generation);

        let meta_path = gen_dir.join(META_FILE);
        let meta_bytes = fs::read(&meta_path).map_err(|e| EngineError::corrupt(&meta_path, e))?;
        let meta: IndexMeta =
            serde_json::from_slice(&meta_bytes).map_err(|e| EngineError::corrupt(&meta_path, e))?;
        if meta.format != META_FORMAT {
            return Err(EngineError::corrupt(
                &meta_path,
                format!("unsupported metadata format {}", meta.format),
            ));
        }

        let vectors_path = gen_dir.join(VECTORS_FILE);
        let index = VectorIndex::load(&vectors_path).map_err(|e| match e {
            IndexError::Io(io) => EngineError::corrupt(&vectors_path, io),
            other => EngineError::corrupt(&vectors_path, other),
        })?;

        debug!(generation = %generation, chunks = meta.chunks.len(), "loaded index");
        Snapshot::new(Some(generation), meta, index).map(Some)
    }

    /// Write a new generation and atomically point `CURRENT` at it.
    /// Returns the new generation name.
    pub fn publish(&self, meta: &IndexMeta, index: &VectorIndex) -> Result<String> {
        fs::create_dir_all(&self.dir)?;
        let previous = self.current_generation().ok().flatten();

        let generation = format!("{}{}", GEN_PREFIX, uuid::Uuid::new_v4().simple());
        let gen_dir = self.dir.join(&generation);
        fs::create_dir(&gen_dir)?;

        let mut meta_bytes = serde_json::to_vec_pretty(meta)?;
        meta_bytes.push(b'\n');
        write_synced(&gen_dir.join(META_FILE), &meta_bytes)?;
        write_synced(&gen_dir.join(VECTORS_FILE), &index.to_bytes())?;
        sync_dir(&gen_dir);

        let tmp = self.dir.join(CURRENT_TMP);
        write_synced(&tmp, format!("{}\n", generation).as_bytes())?;
        fs::rename(&tmp, self.dir.join(CURRENT))?;
        sync_dir(&self.dir);

        let mut keep = vec![generation.as_str()];
        if let Some(prev) = previous.as_deref() {
            keep.push(prev);
        }
        self.collect_garbage(&keep);

        Ok(generation)
    }

    /// Delete generation directories not named in `keep`. Best effort.
    fn collect_garbage(&self, keep: &[&str]) {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "cannot list index dir for cleanup");
                return;
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(GEN_PREFIX) || keep.contains(&name.as_str()) {
                continue;
            }
            match fs::remove_dir_all(entry.path()) {
                Ok(()) => debug!(generation = %name, "removed stale generation"),
                Err(e) => warn!(generation = %name, error = %e, "failed to remove stale generation"),
            }
        }
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

/// Flush directory entries. Not supported everywhere, so failures are ignored.
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}
