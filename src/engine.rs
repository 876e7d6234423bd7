//! Query interface over the live index.
//!
//! An [`Engine`] owns the embedder, the synthesizer and the current index
//! [`Snapshot`]. Queries read the snapshot through an [`ArcSwap`] and never
//! block on a build; a rebuild produces a whole new snapshot and swaps the
//! pointer when it is done. When another process publishes a generation the
//! next query notices the changed `CURRENT` pointer and reloads.
//!
//! | Operation | Retrieval | Result |
//! |-----------|-----------|--------|
//! | [`Engine::search`] | `search_k` chunks, repeats allowed | snippets with citations |
//! | [`Engine::ask`] | `ask_k` chunks, source-diversified | 6–10 line answer |
//! | [`Engine::explain`] | `ask_k` chunks, source-diversified | 8–12 line signal template |
//! | [`Engine::rebuild`] | n/a | [`BuildReport`] |

use anyhow::Result;
use arc_swap::ArcSwap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::builder::{build_index, BuildReport};
use crate::config::Config;
use crate::embedding::{create_embedder, Embedder};
use crate::error::EngineError;
use crate::models::{Answer, Citation, RetrievalMode, SearchHit, Style};
use crate::progress::BuildProgressReporter;
use crate::retriever::retrieve;
use crate::status::IndexStatus;
use crate::store::{IndexStore, Snapshot};
use crate::synth::{build_providers, Provider, ProviderChain, Synthesizer};
use crate::vector_index::GraphParams;

pub struct Engine {
    config: Arc<Config>,
    embedder: Arc<dyn Embedder>,
    synthesizer: Synthesizer,
    store: IndexStore,
    snapshot: ArcSwap<Snapshot>,
    build: Mutex<()>,
}

impl Engine {
    /// Construct the configured embedder and providers and load the live
    /// index, if any.
    pub fn open(config: Config) -> Result<Self> {
        let embedder = create_embedder(&config.embedding)?;
        let providers = build_providers(&config.synthesis)?;
        Self::with_parts(config, embedder, providers)
    }

    /// Like [`Engine::open`] with an explicit embedder and provider chain.
    pub fn with_parts(
        config: Config,
        embedder: Arc<dyn Embedder>,
        providers: Vec<Arc<dyn Provider>>,
    ) -> Result<Self> {
        let store = IndexStore::new(&config.index.dir);
        let initial = match store.load() {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => empty_snapshot(&config, embedder.as_ref()),
            Err(e @ EngineError::CorruptIndex { .. }) => {
                warn!(error = %e, "live index unusable; serving empty until rebuilt");
                empty_snapshot(&config, embedder.as_ref())
            }
            Err(e) => return Err(e.into()),
        };
        info!(
            generation = initial.generation.as_deref().unwrap_or("none"),
            chunks = initial.meta.chunks.len(),
            embedder = embedder.version(),
            "engine ready"
        );

        let chain = ProviderChain::new(providers, config.synthesis.request_timeout());
        let synthesizer = Synthesizer::new(chain, config.citation.max_verbatim_chars);
        Ok(Self {
            config: Arc::new(config),
            embedder,
            synthesizer,
            store,
            snapshot: ArcSwap::from_pointee(initial),
            build: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn embedder(&self) -> &dyn Embedder {
        self.embedder.as_ref()
    }

    /// The snapshot queries run against, reloaded first if another process
    /// published a newer generation.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.refresh();
        self.snapshot.load_full()
    }

    fn refresh(&self) {
        let live = match self.store.current_generation() {
            Ok(live) => live,
            Err(e) => {
                debug!(error = %e, "cannot read generation pointer");
                return;
            }
        };
        if live.is_none() || live == self.snapshot.load().generation {
            return;
        }
        match self.store.load() {
            Ok(Some(snapshot)) => {
                info!(generation = ?snapshot.generation, "picked up new index generation");
                self.snapshot.store(Arc::new(snapshot));
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "new generation unreadable; keeping current snapshot"),
        }
    }

    /// Run an incremental build and swap in the result.
    ///
    /// Safe to call repeatedly; an unchanged corpus writes nothing. Fails
    /// with [`EngineError::BuildInProgress`] if a build is already running in
    /// this process or another.
    pub async fn rebuild(&self, progress: &dyn BuildProgressReporter) -> Result<BuildReport> {
        let _guard = self
            .build
            .try_lock()
            .map_err(|_| EngineError::BuildInProgress)?;
        let (report, snapshot) =
            build_index(&self.config, self.embedder.as_ref(), progress).await?;
        for warning in &report.warnings {
            warn!(%warning, "build warning");
        }
        self.snapshot.store(Arc::new(snapshot));
        Ok(report)
    }

    /// Top chunks for `query`; several may come from one document.
    pub async fn search(
        &self,
        query: &str,
        limit: Option<usize>,
    ) -> crate::error::Result<Vec<SearchHit>> {
        let k = limit.unwrap_or(self.config.retrieval.search_k);
        let snapshot = self.snapshot();
        let hits = retrieve(
            &snapshot,
            self.embedder.as_ref(),
            &self.config.retrieval,
            query,
            k,
            RetrievalMode::Search,
        )
        .await?;
        Ok(hits
            .into_iter()
            .map(|hit| SearchHit {
                snippet: hit.record.snippet.clone(),
                citation: Citation::from(&hit.record),
                score: hit.score,
            })
            .collect())
    }

    /// Cited, paraphrased answer to `question`. Always returns text; only an
    /// index built by a different embedder is an error.
    pub async fn ask(&self, question: &str) -> crate::error::Result<Answer> {
        let snapshot = self.snapshot();
        let hits = retrieve(
            &snapshot,
            self.embedder.as_ref(),
            &self.config.retrieval,
            question,
            self.config.retrieval.ask_k,
            RetrievalMode::Ask,
        )
        .await?;
        Ok(self
            .synthesizer
            .synthesize(question, question.trim(), &hits, Style::Ask)
            .await)
    }

    /// Signal brief for `setup` on `ticker`: thesis, entry, invalidation,
    /// risk note and two watch-outs.
    pub async fn explain(
        &self,
        ticker: &str,
        setup: &str,
        timeframe: Option<&str>,
    ) -> crate::error::Result<Answer> {
        let ticker = ticker.trim().to_uppercase();
        let setup = setup.trim();
        let timeframe = timeframe
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or("multi-timeframe");
        if setup.is_empty() {
            return Ok(Answer::no_match());
        }

        let query = format!(
            "{} thesis entry invalidation risk traps {} {}",
            setup, ticker, timeframe
        );
        let question = format!(
            "Explain the {} setup on {} ({}): thesis, entry, invalidation, risk and traps.",
            setup, ticker, timeframe
        );
        let topic = format!("{} {} ({})", ticker, setup, timeframe);

        let snapshot = self.snapshot();
        let hits = retrieve(
            &snapshot,
            self.embedder.as_ref(),
            &self.config.retrieval,
            &query,
            self.config.retrieval.ask_k,
            RetrievalMode::Ask,
        )
        .await?;
        Ok(self
            .synthesizer
            .synthesize(&question, topic.trim(), &hits, Style::ExplainSignal)
            .await)
    }

    pub fn status(&self) -> IndexStatus {
        IndexStatus::from_snapshot(self.store.dir(), &self.snapshot())
    }
}

fn empty_snapshot(config: &Config, embedder: &dyn Embedder) -> Snapshot {
    Snapshot::empty(
        embedder.version(),
        embedder.dims(),
        config.index.metric,
        GraphParams::from(&config.index),
    )
}
