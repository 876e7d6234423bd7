//! Query-time retrieval over an index snapshot.
//!
//! # Algorithm
//!
//! 1. Refuse to query an index built by a different embedder
//!    ([`EngineError::IndexVersionMismatch`]).
//! 2. Embed the query and fetch a candidate pool of
//!    `max(search_k, ask_k) × candidate_multiplier` nearest chunks. The pool
//!    does not depend on the requested `k`, so `search(q, k)` is always a
//!    prefix of `search(q, k + 1)`.
//! 3. Add a lexical boost: `lexical_boost × (fraction of query terms that
//!    occur in the chunk)`. Stable sort the pool by the boosted score, so
//!    equal scores keep the vector index's (insertion-ordered) ranking.
//!    When `k` exceeds the pool, the extra candidates follow the reranked
//!    pool in vector order.
//! 4. Select `k` hits:
//!    - **search** mode takes the top `k` as they come;
//!    - **ask** mode fills the first `diversity_floor` slots freely, then
//!      only admits chunks from documents not yet represented. Deferred
//!      repeats backfill any slots left over.
//!
//! If the query cannot be embedded, candidates are ranked by the lexical
//! score alone so a question still gets an answer.

use std::collections::HashSet;
use tracing::warn;

use crate::config::RetrievalConfig;
use crate::embedding::{embed_query, tokenize, Embedder};
use crate::error::{EngineError, Result};
use crate::models::{Hit, RetrievalMode};
use crate::store::Snapshot;

/// Retrieve up to `k` hits for `query`.
pub async fn retrieve(
    snapshot: &Snapshot,
    embedder: &dyn Embedder,
    config: &RetrievalConfig,
    query: &str,
    k: usize,
    mode: RetrievalMode,
) -> Result<Vec<Hit>> {
    if query.trim().is_empty() || snapshot.is_empty() || k == 0 {
        return Ok(Vec::new());
    }
    check_version(snapshot, embedder)?;

    let terms = query_terms(query);
    let pool = candidate_pool(config);
    let fetch = pool.max(k);

    let candidates: Vec<(String, f32)> = match embed_query(embedder, query).await {
        Ok(vector) => snapshot.index.search(&vector, fetch).map_err(|e| {
            EngineError::CorruptIndex {
                path: snapshot.generation.clone().unwrap_or_default(),
                reason: e.to_string(),
            }
        })?,
        Err(e) => {
            warn!(error = %e, "query embedding failed, ranking lexically");
            lexical_candidates(snapshot, &terms, fetch)
        }
    };

    let mut ranked: Vec<Hit> = candidates
        .into_iter()
        .filter_map(|(id, score)| {
            let record = snapshot.record(&id)?;
            let boost = config.lexical_boost * lexical_overlap(&terms, &record.text);
            Some(Hit {
                record: record.clone(),
                score: score + boost,
            })
        })
        .collect();
    let head = ranked.len().min(pool);
    ranked[..head].sort_by(|a, b| b.score.total_cmp(&a.score));

    Ok(match mode {
        RetrievalMode::Search => {
            ranked.truncate(k);
            ranked
        }
        RetrievalMode::Ask => diversify(ranked, k, config.diversity_floor),
    })
}

/// Number of candidates reranked for every query, whatever `k` is.
pub fn candidate_pool(config: &RetrievalConfig) -> usize {
    config
        .search_k
        .max(config.ask_k)
        .max(1)
        .saturating_mul(config.candidate_multiplier.max(1))
}

pub fn check_version(snapshot: &Snapshot, embedder: &dyn Embedder) -> Result<()> {
    let meta = &snapshot.meta;
    if meta.embedder_version != embedder.version() || meta.dims != embedder.dims() {
        return Err(EngineError::IndexVersionMismatch {
            index: meta.embedder_version.clone(),
            query: embedder.version().to_string(),
        });
    }
    Ok(())
}

/// At most `k` hits; past the first `floor` slots each document appears once
/// unless there are not enough distinct documents to fill `k`.
pub fn diversify(ranked: Vec<Hit>, k: usize, floor: usize) -> Vec<Hit> {
    let mut picked: Vec<Hit> = Vec::with_capacity(k);
    let mut deferred: Vec<Hit> = Vec::new();
    let mut sources: HashSet<String> = HashSet::new();

    for hit in ranked {
        if picked.len() == k {
            break;
        }
        let fresh = !sources.contains(&hit.record.doc_key);
        if picked.len() < floor || fresh {
            sources.insert(hit.record.doc_key.clone());
            picked.push(hit);
        } else {
            deferred.push(hit);
        }
    }

    let room = k.saturating_sub(picked.len());
    picked.extend(deferred.into_iter().take(room));
    picked
}

fn query_terms(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    tokenize(query)
        .into_iter()
        .filter(|t| t.chars().count() >= 2 && seen.insert(t.clone()))
        .collect()
}

/// Fraction of `terms` present among the words of `text`.
fn lexical_overlap(terms: &[String], text: &str) -> f32 {
    if terms.is_empty() {
        return 0.0;
    }
    let words: HashSet<String> = tokenize(text).into_iter().collect();
    let matched = terms.iter().filter(|t| words.contains(*t)).count();
    matched as f32 / terms.len() as f32
}

fn lexical_candidates(snapshot: &Snapshot, terms: &[String], fetch: usize) -> Vec<(String, f32)> {
    // Zero base score; the boost added by the caller does the ranking.
    let mut scored: Vec<(usize, f32)> = snapshot
        .meta
        .chunks
        .iter()
        .enumerate()
        .map(|(i, r)| (i, lexical_overlap(terms, &r.text)))
        .filter(|(_, s)| *s > 0.0)
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    scored
        .into_iter()
        .take(fetch)
        .map(|(i, _)| (snapshot.meta.chunks[i].id.clone(), 0.0))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{chunk_id, content_hash, snippet};
    use crate::embedding::HashEmbedder;
    use crate::models::ChunkRecord;
    use crate::store::IndexMeta;
    use crate::vector_index::{GraphParams, Metric, VectorIndex};

    fn snapshot(embedder: &HashEmbedder, docs: &[(&str, &[&str])]) -> Snapshot {
        let mut meta = IndexMeta::empty(embedder.version(), embedder.dims(), Metric::Cosine);
        let mut index = VectorIndex::new(Metric::Cosine, embedder.dims(), GraphParams::default());
        for (doc, sections) in docs {
            for (i, text) in sections.iter().enumerate() {
                let id = chunk_id(doc, i as u32);
                index.insert(&id, embedder.embed_one(text)).unwrap();
                meta.chunks.push(ChunkRecord {
                    id,
                    doc_key: doc.to_string(),
                    shortname: doc.trim_end_matches(".md").to_string(),
                    section: i as u32 + 1,
                    text: text.to_string(),
                    snippet: snippet(text),
                    hash: content_hash(text),
                    embedder_version: embedder.version().to_string(),
                });
            }
        }
        meta.sort_chunks();
        Snapshot::new(None, meta, index).unwrap()
    }

    fn corpus(embedder: &HashEmbedder) -> Snapshot {
        snapshot(
            embedder,
            &[
                (
                    "long.md",
                    &[
                        "stop loss placement below the swing low",
                        "stop loss placement after a gap",
                        "stop loss placement for options",
                    ],
                ),
                ("short.md", &["stop loss discipline and placement rules"]),
                ("other.md", &["dividend growth investing for retirees"]),
            ],
        )
    }

    #[tokio::test]
    async fn test_search_mode_allows_repeats() {
        let embedder = HashEmbedder::new(128, 1);
        let snap = corpus(&embedder);
        let hits = retrieve(
            &snap,
            &embedder,
            &RetrievalConfig::default(),
            "stop loss placement",
            3,
            RetrievalMode::Search,
        )
        .await
        .unwrap();
        assert_eq!(hits.len(), 3);
        assert!(hits.iter().filter(|h| h.record.doc_key == "long.md").count() >= 2);
    }

    #[tokio::test]
    async fn test_ask_mode_prefers_distinct_sources() {
        let embedder = HashEmbedder::new(128, 1);
        let snap = corpus(&embedder);
        let hits = retrieve(
            &snap,
            &embedder,
            &RetrievalConfig::default(),
            "stop loss placement",
            2,
            RetrievalMode::Ask,
        )
        .await
        .unwrap();
        let docs: HashSet<&str> = hits.iter().map(|h| h.record.doc_key.as_str()).collect();
        assert_eq!(hits.len(), 2);
        assert_eq!(docs.len(), 2);
    }

    #[tokio::test]
    async fn test_version_mismatch_is_error() {
        let built_with = HashEmbedder::new(128, 1);
        let snap = corpus(&built_with);
        let query_with = HashEmbedder::new(128, 2);
        let err = retrieve(
            &snap,
            &query_with,
            &RetrievalConfig::default(),
            "stop",
            3,
            RetrievalMode::Search,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::IndexVersionMismatch { .. }));
    }

    #[tokio::test]
    async fn test_blank_query_and_empty_index_return_nothing() {
        let embedder = HashEmbedder::new(32, 1);
        let snap = corpus(&embedder);
        let config = RetrievalConfig::default();
        assert!(retrieve(&snap, &embedder, &config, "   ", 3, RetrievalMode::Ask)
            .await
            .unwrap()
            .is_empty());

        let empty = Snapshot::empty(embedder.version(), 32, Metric::Cosine, GraphParams::default());
        assert!(retrieve(&empty, &embedder, &config, "stop", 3, RetrievalMode::Ask)
            .await
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_diversify_floor_and_backfill() {
        let embedder = HashEmbedder::new(16, 1);
        let snap = snapshot(&embedder, &[("a.md", &["one", "two", "three"]), ("b.md", &["four"])]);
        // Chunks are sorted a§1, a§2, a§3, b§1.
        let ranked: Vec<Hit> = snap
            .meta
            .chunks
            .iter()
            .map(|r| Hit {
                record: r.clone(),
                score: 1.0,
            })
            .collect();

        let floor_one: Vec<String> = diversify(ranked.clone(), 3, 1)
            .into_iter()
            .map(|h| h.record.id)
            .collect();
        // a§1, b§1, then a§2 as backfill.
        assert_eq!(
            floor_one,
            vec![
                ranked[0].record.id.clone(),
                ranked[3].record.id.clone(),
                ranked[1].record.id.clone()
            ]
        );

        let floor_two = diversify(ranked.clone(), 2, 2);
        assert_eq!(floor_two[1].record.id, ranked[1].record.id);
    }

    #[tokio::test]
    async fn test_search_results_extend_as_k_grows() {
        let embedder = HashEmbedder::new(64, 1);
        let vocab = [
            "breakout", "volume", "candle", "stop", "gap", "trend", "support", "range",
            "pullback", "risk", "entry", "target", "momentum", "reversal", "wick", "open",
        ];
        let texts: Vec<String> = (0..40)
            .map(|i| {
                (0..6)
                    .map(|j| vocab[(i * 7 + j * 5 + i / 3) % vocab.len()])
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect();
        let names: Vec<String> = (0..texts.len()).map(|i| format!("d{:02}.md", i)).collect();
        let docs: Vec<(&str, Vec<&str>)> = names
            .iter()
            .zip(&texts)
            .map(|(name, text)| (name.as_str(), vec![text.as_str()]))
            .collect();
        let docs: Vec<(&str, &[&str])> = docs.iter().map(|(n, t)| (*n, t.as_slice())).collect();
        let snap = snapshot(&embedder, &docs);
        let config = RetrievalConfig::default();

        for query in ["breakout volume candle", "stop risk entry", "gap open reversal wick"] {
            let mut previous: Vec<String> = Vec::new();
            for k in 1..=snap.meta.chunks.len() + 1 {
                let now: Vec<String> =
                    retrieve(&snap, &embedder, &config, query, k, RetrievalMode::Search)
                        .await
                        .unwrap()
                        .into_iter()
                        .map(|h| h.record.id)
                        .collect();
                assert_eq!(&now[..previous.len()], &previous[..], "{} k={}", query, k);
                previous = now;
            }
            assert_eq!(previous.len(), snap.meta.chunks.len());
        }
    }

    #[test]
    fn test_candidate_pool_ignores_k() {
        let config = RetrievalConfig::default();
        assert_eq!(candidate_pool(&config), 10);
    }

    #[test]
    fn test_lexical_overlap() {
        let terms = query_terms("Stop loss, stop!");
        assert_eq!(terms, vec!["stop", "loss"]);
        assert_eq!(lexical_overlap(&terms, "a STOP here"), 0.5);
        assert_eq!(lexical_overlap(&[], "anything"), 0.0);
    }
}
