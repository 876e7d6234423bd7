//! Approximate nearest-neighbour index over chunk embeddings.
//!
//! A layered proximity graph (HNSW-style) supporting incremental
//! [`insert`](VectorIndex::insert) and [`remove`](VectorIndex::remove) without
//! rebuilding unaffected entries, and a compact little-endian binary format
//! that round-trips the graph exactly.
//!
//! # Algorithm
//!
//! - **Levels.** A node's top layer is drawn from a geometric distribution
//!   seeded by the SHA-256 of its id, so the same id always lands on the
//!   same layer and builds are reproducible.
//! - **Insert.** Greedy descent from the entry point to the node's top
//!   layer, then a beam of `ef_construction` on each lower layer; the node
//!   links to its closest `max_neighbors` (twice that on layer 0) and
//!   neighbours that overflow are pruned back to their closest set.
//! - **Remove.** Every edge into the removed node is dropped and each
//!   neighbour list that lost an edge is repaired from the removed node's
//!   own neighbours.
//! - **Search.** Greedy descent, then one beam of `ef_search` on layer 0,
//!   sorted exactly. If `k` exceeds the beam, the remaining entries follow
//!   in exhaustive order. The ranked sequence does not depend on `k`, so
//!   `search(q, k)` is always a prefix of `search(q, k + 1)`.
//!
//! # Ordering
//!
//! | Key | Direction |
//! |-----|-----------|
//! | score | descending |
//! | insertion sequence | ascending |
//!
//! The insertion sequence is persisted, so ties resolve identically after
//! a save/load cycle.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::io::Write;
use std::path::Path;
use thiserror::Error;

use crate::config::IndexConfig;

const MAGIC: &[u8; 4] = b"PBVX";
const FORMAT_VERSION: u32 = 1;
const MAX_LEVEL: usize = 12;
const NO_ENTRY: u32 = u32::MAX;

/// Similarity function, fixed for the lifetime of an index.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    #[default]
    Cosine,
    Dot,
}

impl Metric {
    pub fn score(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::Cosine => cosine_similarity(a, b),
            Metric::Dot => dot(a, b),
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            Metric::Cosine => 0,
            Metric::Dot => 1,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Metric::Cosine),
            1 => Some(Metric::Dot),
            _ => None,
        }
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Metric::Cosine => write!(f, "cosine"),
            Metric::Dot => write!(f, "dot"),
        }
    }
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Cosine similarity; 0.0 when either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}

/// Scale `v` to unit length in place. Zero vectors are left alone.
pub fn normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("vector has {got} dims, index expects {expected}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("invalid index file: {0}")]
    Corrupt(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Graph tuning knobs. Persisted with the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphParams {
    pub ef_construction: usize,
    pub ef_search: usize,
    pub max_neighbors: usize,
}

impl Default for GraphParams {
    fn default() -> Self {
        Self {
            ef_construction: 64,
            ef_search: 48,
            max_neighbors: 12,
        }
    }
}

impl From<&IndexConfig> for GraphParams {
    fn from(config: &IndexConfig) -> Self {
        Self {
            ef_construction: config.ef_construction,
            ef_search: config.ef_search,
            max_neighbors: config.max_neighbors,
        }
    }
}

#[derive(Debug, Clone)]
struct Node {
    id: String,
    seq: u64,
    vector: Vec<f32>,
    level: usize,
    /// Out-edges per layer, `0..=level`.
    neighbors: Vec<Vec<usize>>,
}

/// A node reference with its score against the current query.
///
/// Orders by score, then by *earlier* insertion, so "greater" always means
/// "ranks first".
#[derive(Debug, Clone, Copy)]
struct Scored {
    score: f32,
    seq: u64,
    slot: usize,
}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scored {}

#[derive(Debug, Clone)]
pub struct VectorIndex {
    metric: Metric,
    dims: usize,
    params: GraphParams,
    /// Slot storage; removed nodes leave a `None` until the next load.
    nodes: Vec<Option<Node>>,
    slots: HashMap<String, usize>,
    entry: Option<usize>,
    next_seq: u64,
}

impl VectorIndex {
    pub fn new(metric: Metric, dims: usize, params: GraphParams) -> Self {
        Self {
            metric,
            dims,
            params,
            nodes: Vec::new(),
            slots: HashMap::new(),
            entry: None,
            next_seq: 0,
        }
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn params(&self) -> GraphParams {
        self.params
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.slots.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&[f32]> {
        let slot = *self.slots.get(id)?;
        self.node(slot).map(|n| n.vector.as_slice())
    }

    /// `(id, vector)` pairs in insertion order.
    pub fn entries(&self) -> Vec<(&str, &[f32])> {
        let mut live: Vec<&Node> = self.nodes.iter().flatten().collect();
        live.sort_by_key(|n| n.seq);
        live.into_iter()
            .map(|n| (n.id.as_str(), n.vector.as_slice()))
            .collect()
    }

    /// Insert `vector` under `id`. An existing entry with the same id is
    /// replaced and takes a fresh insertion sequence.
    pub fn insert(&mut self, id: &str, vector: Vec<f32>) -> Result<(), IndexError> {
        if vector.len() != self.dims {
            return Err(IndexError::DimensionMismatch {
                expected: self.dims,
                got: vector.len(),
            });
        }
        if self.slots.contains_key(id) {
            self.remove(id);
        }

        let level = node_level(id, self.params.max_neighbors);
        let seq = self.next_seq;
        self.next_seq += 1;
        let slot = self.nodes.len();
        let query = vector.clone();
        self.nodes.push(Some(Node {
            id: id.to_string(),
            seq,
            vector,
            level,
            neighbors: vec![Vec::new(); level + 1],
        }));
        self.slots.insert(id.to_string(), slot);

        let Some(entry) = self.entry else {
            self.entry = Some(slot);
            return Ok(());
        };
        let top = self.node(entry).map(|n| n.level).unwrap_or(0);

        let mut entry_points = vec![entry];
        for layer in (level + 1..=top).rev() {
            if let Some(best) = self.search_layer(&query, &entry_points, 1, layer).first() {
                entry_points = vec![best.slot];
            }
        }

        for layer in (0..=level.min(top)).rev() {
            let found = self.search_layer(&query, &entry_points, self.params.ef_construction, layer);
            let chosen: Vec<usize> = found
                .iter()
                .filter(|s| s.slot != slot)
                .take(self.layer_cap(layer))
                .map(|s| s.slot)
                .collect();
            if let Some(node) = self.nodes[slot].as_mut() {
                node.neighbors[layer] = chosen.clone();
            }
            for neighbor in chosen {
                self.link(neighbor, slot, layer);
            }
            if !found.is_empty() {
                entry_points = found.into_iter().map(|s| s.slot).collect();
            }
        }

        if level > top {
            self.entry = Some(slot);
        }
        Ok(())
    }

    /// Remove `id`; returns whether it was present.
    pub fn remove(&mut self, id: &str) -> bool {
        let Some(slot) = self.slots.remove(id) else {
            return false;
        };
        let Some(removed) = self.nodes[slot].take() else {
            return false;
        };

        for other in 0..self.nodes.len() {
            let mut damaged = Vec::new();
            if let Some(node) = self.nodes[other].as_mut() {
                for (layer, list) in node.neighbors.iter_mut().enumerate() {
                    let before = list.len();
                    list.retain(|&s| s != slot);
                    if list.len() != before {
                        damaged.push(layer);
                    }
                }
            }
            for layer in damaged {
                let donors = removed.neighbors.get(layer).cloned().unwrap_or_default();
                self.repair(other, layer, donors);
            }
        }

        if self.entry == Some(slot) {
            self.entry = self
                .nodes
                .iter()
                .enumerate()
                .filter_map(|(i, n)| n.as_ref().map(|n| (i, n)))
                .max_by(|a, b| {
                    a.1.level
                        .cmp(&b.1.level)
                        .then_with(|| b.1.seq.cmp(&a.1.seq))
                })
                .map(|(i, _)| i);
        }
        true
    }

    /// Top `k` `(id, score)` pairs for `query`, best first.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(String, f32)>, IndexError> {
        if query.len() != self.dims {
            return Err(IndexError::DimensionMismatch {
                expected: self.dims,
                got: query.len(),
            });
        }
        let Some(entry) = self.entry else {
            return Ok(Vec::new());
        };
        if k == 0 {
            return Ok(Vec::new());
        }

        let top = self.node(entry).map(|n| n.level).unwrap_or(0);
        let mut entry_points = vec![entry];
        for layer in (1..=top).rev() {
            if let Some(best) = self.search_layer(query, &entry_points, 1, layer).first() {
                entry_points = vec![best.slot];
            }
        }

        let mut ranked = self.search_layer(query, &entry_points, self.params.ef_search.max(1), 0);
        ranked.truncate(k);
        if ranked.len() < k {
            let taken: HashSet<usize> = ranked.iter().map(|s| s.slot).collect();
            let mut rest: Vec<Scored> = (0..self.nodes.len())
                .filter(|slot| !taken.contains(slot))
                .filter_map(|slot| self.scored(query, slot))
                .collect();
            rest.sort_by(|a, b| b.cmp(a));
            let missing = k - ranked.len();
            ranked.extend(rest.into_iter().take(missing));
        }

        Ok(ranked
            .into_iter()
            .filter_map(|s| self.node(s.slot).map(|n| (n.id.clone(), s.score)))
            .collect())
    }

    fn node(&self, slot: usize) -> Option<&Node> {
        self.nodes.get(slot).and_then(|n| n.as_ref())
    }

    fn scored(&self, query: &[f32], slot: usize) -> Option<Scored> {
        self.node(slot).map(|n| Scored {
            score: self.metric.score(query, &n.vector),
            seq: n.seq,
            slot,
        })
    }

    fn layer_cap(&self, layer: usize) -> usize {
        if layer == 0 {
            self.params.max_neighbors * 2
        } else {
            self.params.max_neighbors
        }
    }

    fn search_layer(
        &self,
        query: &[f32],
        entry_points: &[usize],
        ef: usize,
        layer: usize,
    ) -> Vec<Scored> {
        let mut visited: HashSet<usize> = HashSet::new();
        let mut candidates: BinaryHeap<Scored> = BinaryHeap::new();
        let mut results: BinaryHeap<Reverse<Scored>> = BinaryHeap::new();

        for &ep in entry_points {
            if !visited.insert(ep) {
                continue;
            }
            if let Some(s) = self.scored(query, ep) {
                candidates.push(s);
                results.push(Reverse(s));
                if results.len() > ef {
                    results.pop();
                }
            }
        }

        while let Some(current) = candidates.pop() {
            if let Some(Reverse(worst)) = results.peek() {
                if results.len() >= ef && current < *worst {
                    break;
                }
            }
            let Some(neighbors) = self.node(current.slot).and_then(|n| n.neighbors.get(layer))
            else {
                continue;
            };
            for &n in neighbors {
                if !visited.insert(n) {
                    continue;
                }
                let Some(s) = self.scored(query, n) else {
                    continue;
                };
                let admit = results.len() < ef
                    || results.peek().map_or(true, |Reverse(worst)| s > *worst);
                if admit {
                    candidates.push(s);
                    results.push(Reverse(s));
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut out: Vec<Scored> = results.into_iter().map(|Reverse(s)| s).collect();
        out.sort_by(|a, b| b.cmp(a));
        out
    }

    /// Closest `cap` live candidates to `owner`, deduplicated, best first.
    fn closest(&self, owner: usize, candidates: Vec<usize>, cap: usize) -> Vec<usize> {
        let Some(base) = self.node(owner) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        let mut scored: Vec<Scored> = candidates
            .into_iter()
            .filter(|&c| c != owner && seen.insert(c))
            .filter_map(|c| self.scored(&base.vector, c))
            .collect();
        scored.sort_by(|a, b| b.cmp(a));
        scored.into_iter().take(cap).map(|s| s.slot).collect()
    }

    fn link(&mut self, from: usize, to: usize, layer: usize) {
        let cap = self.layer_cap(layer);
        let Some(list) = self.node(from).and_then(|n| n.neighbors.get(layer)) else {
            return;
        };
        let mut list = list.clone();
        list.push(to);
        if list.len() > cap {
            list = self.closest(from, list, cap);
        }
        if let Some(node) = self.nodes[from].as_mut() {
            node.neighbors[layer] = list;
        }
    }

    fn repair(&mut self, owner: usize, layer: usize, donors: Vec<usize>) {
        let Some(list) = self.node(owner).and_then(|n| n.neighbors.get(layer)) else {
            return;
        };
        let mut candidates = list.clone();
        candidates.extend(donors);
        let repaired = self.closest(owner, candidates, self.layer_cap(layer));
        if let Some(node) = self.nodes[owner].as_mut() {
            node.neighbors[layer] = repaired;
        }
    }

    // ============ Persistence ============

    /// Serialize live entries in insertion order, slots renumbered densely.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut live: Vec<(usize, &Node)> = self
            .nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.as_ref().map(|n| (i, n)))
            .collect();
        live.sort_by_key(|(_, n)| n.seq);
        let remap: HashMap<usize, u32> = live
            .iter()
            .enumerate()
            .map(|(dense, (slot, _))| (*slot, dense as u32))
            .collect();

        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        put_u32(&mut out, FORMAT_VERSION);
        out.push(self.metric.to_byte());
        put_u32(&mut out, self.dims as u32);
        put_u32(&mut out, self.params.ef_construction as u32);
        put_u32(&mut out, self.params.ef_search as u32);
        put_u32(&mut out, self.params.max_neighbors as u32);
        out.extend_from_slice(&self.next_seq.to_le_bytes());
        put_u32(&mut out, live.len() as u32);
        let entry = self
            .entry
            .and_then(|e| remap.get(&e).copied())
            .unwrap_or(NO_ENTRY);
        put_u32(&mut out, entry);

        for (_, node) in &live {
            put_u32(&mut out, node.id.len() as u32);
            out.extend_from_slice(node.id.as_bytes());
            out.extend_from_slice(&node.seq.to_le_bytes());
            out.push(node.level as u8);
            for x in &node.vector {
                out.extend_from_slice(&x.to_le_bytes());
            }
            for layer in &node.neighbors {
                let targets: Vec<u32> = layer.iter().filter_map(|s| remap.get(s).copied()).collect();
                put_u32(&mut out, targets.len() as u32);
                for t in targets {
                    put_u32(&mut out, t);
                }
            }
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IndexError> {
        let mut r = Reader { bytes, pos: 0 };
        if r.take(4)? != MAGIC {
            return Err(IndexError::Corrupt("bad magic".to_string()));
        }
        let version = r.u32()?;
        if version != FORMAT_VERSION {
            return Err(IndexError::Corrupt(format!(
                "unsupported format version {}",
                version
            )));
        }
        let metric = Metric::from_byte(r.u8()?)
            .ok_or_else(|| IndexError::Corrupt("unknown metric".to_string()))?;
        let dims = r.u32()? as usize;
        let params = GraphParams {
            ef_construction: r.u32()? as usize,
            ef_search: r.u32()? as usize,
            max_neighbors: r.u32()? as usize,
        };
        let next_seq = r.u64()?;
        let count = r.u32()? as usize;
        let entry = r.u32()?;

        let mut nodes = Vec::with_capacity(count.min(1 << 20));
        let mut slots = HashMap::new();
        for slot in 0..count {
            let id_len = r.u32()? as usize;
            let id = String::from_utf8(r.take(id_len)?.to_vec())
                .map_err(|_| IndexError::Corrupt("id is not UTF-8".to_string()))?;
            let seq = r.u64()?;
            if seq >= next_seq {
                return Err(IndexError::Corrupt(format!("sequence out of range for {}", id)));
            }
            let level = r.u8()? as usize;
            if level > MAX_LEVEL {
                return Err(IndexError::Corrupt(format!("level {} too high", level)));
            }
            let mut vector = Vec::with_capacity(dims);
            for _ in 0..dims {
                vector.push(f32::from_le_bytes(r.array()?));
            }
            let mut neighbors = Vec::with_capacity(level + 1);
            for _ in 0..=level {
                let n = r.u32()? as usize;
                let mut list = Vec::with_capacity(n.min(1024));
                for _ in 0..n {
                    let target = r.u32()? as usize;
                    if target >= count {
                        return Err(IndexError::Corrupt("edge points past end".to_string()));
                    }
                    list.push(target);
                }
                neighbors.push(list);
            }
            if slots.insert(id.clone(), slot).is_some() {
                return Err(IndexError::Corrupt(format!("duplicate id {}", id)));
            }
            nodes.push(Some(Node {
                id,
                seq,
                vector,
                level,
                neighbors,
            }));
        }
        if r.pos != bytes.len() {
            return Err(IndexError::Corrupt("trailing bytes".to_string()));
        }

        let entry = match entry {
            NO_ENTRY => None,
            e if (e as usize) < count => Some(e as usize),
            _ => return Err(IndexError::Corrupt("entry point out of range".to_string())),
        };
        if entry.is_none() != (count == 0) {
            return Err(IndexError::Corrupt("entry point missing".to_string()));
        }

        Ok(Self {
            metric,
            dims,
            params,
            nodes,
            slots,
            entry,
            next_seq,
        })
    }

    /// Write to `path` and fsync.
    pub fn save(&self, path: &Path) -> Result<(), IndexError> {
        let mut file = std::fs::File::create(path)?;
        file.write_all(&self.to_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, IndexError> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }
}

/// Deterministic geometric level from the id hash.
fn node_level(id: &str, max_neighbors: usize) -> usize {
    let digest = Sha256::digest(id.as_bytes());
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&digest[..8]);
    // Uniform in (0, 1].
    let u = (u64::from_le_bytes(raw) as f64 + 1.0) / (u64::MAX as f64 + 1.0);
    let ml = 1.0 / (max_neighbors.max(2) as f64).ln();
    ((-u.ln() * ml).floor() as usize).min(MAX_LEVEL)
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], IndexError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| IndexError::Corrupt("truncated".to_string()))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], IndexError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, IndexError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, IndexError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, IndexError> {
        Ok(u64::from_le_bytes(self.array()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic pseudo-random vectors (LCG).
    fn vectors(n: usize, dims: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut state = seed;
        (0..n)
            .map(|_| {
                (0..dims)
                    .map(|_| {
                        state = state
                            .wrapping_mul(6364136223846793005)
                            .wrapping_add(1442695040888963407);
                        ((state >> 33) as f32 / (1u64 << 31) as f32) - 0.5
                    })
                    .collect()
            })
            .collect()
    }

    fn build(n: usize, dims: usize) -> VectorIndex {
        let mut index = VectorIndex::new(Metric::Cosine, dims, GraphParams::default());
        for (i, v) in vectors(n, dims, 7).into_iter().enumerate() {
            index.insert(&format!("c{}", i), v).unwrap();
        }
        index
    }

    fn brute_force(index: &VectorIndex, query: &[f32], k: usize) -> Vec<String> {
        let mut all: Vec<(String, f32)> = index
            .entries()
            .into_iter()
            .map(|(id, v)| (id.to_string(), cosine_similarity(query, v)))
            .collect();
        all.sort_by(|a, b| b.1.total_cmp(&a.1));
        all.into_iter().take(k).map(|(id, _)| id).collect()
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_empty_index_returns_nothing() {
        let index = VectorIndex::new(Metric::Cosine, 4, GraphParams::default());
        assert!(index.search(&[1.0, 0.0, 0.0, 0.0], 5).unwrap().is_empty());
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut index = VectorIndex::new(Metric::Cosine, 3, GraphParams::default());
        assert!(matches!(
            index.insert("a", vec![1.0, 2.0]),
            Err(IndexError::DimensionMismatch { expected: 3, got: 2 })
        ));
        assert!(index.search(&[1.0], 1).is_err());
    }

    #[test]
    fn test_recall_against_brute_force() {
        let index = build(300, 8);
        let mut hits = 0;
        let queries = vectors(20, 8, 99);
        for q in &queries {
            let got: Vec<String> = index.search(q, 5).unwrap().into_iter().map(|(id, _)| id).collect();
            let want = brute_force(&index, q, 5);
            hits += got.iter().filter(|id| want.contains(id)).count();
        }
        assert!(hits >= 80, "recall too low: {}/100", hits);
    }

    #[test]
    fn test_top_k_is_prefix_of_top_k_plus_one() {
        let index = build(120, 6);
        for q in vectors(10, 6, 3) {
            let mut previous = Vec::new();
            for k in 1..=index.len() + 1 {
                let now = index.search(&q, k).unwrap();
                assert_eq!(&now[..previous.len()], &previous[..], "k={}", k);
                previous = now;
            }
            assert_eq!(previous.len(), index.len());
        }
    }

    #[test]
    fn test_ties_break_by_insertion_order() {
        let mut index = VectorIndex::new(Metric::Dot, 2, GraphParams::default());
        for id in ["zeta", "alpha", "mid"] {
            index.insert(id, vec![1.0, 0.0]).unwrap();
        }
        let ids: Vec<String> = index
            .search(&[1.0, 0.0], 3)
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_remove_drops_entry_and_keeps_others_searchable() {
        let mut index = build(80, 6);
        for i in (0..80).step_by(2) {
            assert!(index.remove(&format!("c{}", i)));
        }
        assert!(!index.remove("c0"));
        assert_eq!(index.len(), 40);
        for q in vectors(5, 6, 11) {
            let results = index.search(&q, 40).unwrap();
            assert_eq!(results.len(), 40);
            for (id, _) in &results {
                let n: usize = id[1..].parse().unwrap();
                assert_eq!(n % 2, 1);
            }
        }
    }

    #[test]
    fn test_reinsert_replaces_vector() {
        let mut index = VectorIndex::new(Metric::Cosine, 2, GraphParams::default());
        index.insert("a", vec![1.0, 0.0]).unwrap();
        index.insert("a", vec![0.0, 1.0]).unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.get("a"), Some(&[0.0f32, 1.0][..]));
    }

    #[test]
    fn test_save_load_round_trip() {
        let mut index = build(150, 8);
        index.remove("c3");
        index.remove("c77");
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("vectors.bin");
        index.save(&path).unwrap();
        let loaded = VectorIndex::load(&path).unwrap();

        assert_eq!(loaded.entries(), index.entries());
        assert_eq!(loaded.metric(), index.metric());
        for q in vectors(15, 8, 5) {
            assert_eq!(loaded.search(&q, 10).unwrap(), index.search(&q, 10).unwrap());
        }
        // Re-encoding a loaded index is byte-stable.
        assert_eq!(loaded.to_bytes(), index.to_bytes());
    }

    #[test]
    fn test_corrupt_bytes_rejected() {
        let index = build(10, 4);
        let bytes = index.to_bytes();
        assert!(VectorIndex::from_bytes(&bytes[..bytes.len() - 3]).is_err());
        assert!(VectorIndex::from_bytes(b"NOPE").is_err());
    }

    #[test]
    fn test_levels_are_deterministic() {
        assert_eq!(node_level("abc", 12), node_level("abc", 12));
        assert!(node_level("abc", 12) <= MAX_LEVEL);
    }
}
