//! Answer synthesis over an ordered provider chain.
//!
//! # Provider chain
//!
//! Providers are tried in configured order. Each attempt is bounded by
//! `min(provider timeout, time left before the request deadline)`; a
//! timeout, a transport/HTTP error or an empty completion moves on to the
//! next provider. Once the request deadline has passed no further provider
//! is tried. If nothing produced text, the extractive heuristic runs. It
//! cannot fail, so [`Synthesizer::synthesize`] always returns an answer.
//!
//! # Output shape
//!
//! | Style | Lines (including `Sources:`) | Body |
//! |-------|------------------------------|------|
//! | `ask` | 6–10 | free-form short lines |
//! | `explain_signal` | 8–12 | Thesis, Entry, Invalidation, Risk note, Watch-out 1, Watch-out 2 |
//!
//! Over-long completions are cut; short ones are padded with heuristic
//! lines. The final text then goes through [`crate::citation`].

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::citation;
use crate::config::{ProviderConfig, SynthesisConfig};
use crate::embedding::tokenize;
use crate::error::EngineError;
use crate::models::{Answer, Citation, Hit, Style};

/// A text-generation backend.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;
    /// Per-attempt upper bound.
    fn timeout(&self) -> Duration;
    async fn generate(&self, prompt: &str, timeout: Duration) -> Result<String, EngineError>;
}

// ============ HTTP providers ============

/// Ollama `POST /api/generate`, non-streaming.
pub struct OllamaProvider {
    client: reqwest::Client,
    name: String,
    base_url: String,
    model: String,
    temperature: f32,
    timeout: Duration,
}

impl OllamaProvider {
    pub fn new(config: &ProviderConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            name: config.label(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "http://127.0.0.1:11434".to_string())
                .trim_end_matches('/')
                .to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            timeout: config.timeout(),
        })
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn generate(&self, prompt: &str, timeout: Duration) -> Result<String, EngineError> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": { "temperature": self.temperature },
        });
        let json = post_json(
            &self.client,
            &format!("{}/api/generate", self.base_url),
            None,
            &body,
            timeout,
            &self.name,
        )
        .await?;
        Ok(json
            .get("response")
            .and_then(|r| r.as_str())
            .unwrap_or_default()
            .trim()
            .to_string())
    }
}

/// OpenAI-compatible `POST /v1/chat/completions`.
pub struct OpenAiProvider {
    client: reqwest::Client,
    name: String,
    base_url: String,
    model: String,
    api_key: Option<String>,
    api_key_env: String,
    temperature: f32,
    timeout: Duration,
}

impl OpenAiProvider {
    /// The key is read from the configured variable now; a missing key makes
    /// every attempt fail fast rather than failing startup.
    pub fn new(config: &ProviderConfig) -> anyhow::Result<Self> {
        let api_key_env = config
            .api_key_env
            .clone()
            .unwrap_or_else(|| "OPENAI_API_KEY".to_string());
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            name: config.label(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".to_string())
                .trim_end_matches('/')
                .to_string(),
            model: config.model.clone(),
            api_key: std::env::var(&api_key_env).ok().filter(|k| !k.is_empty()),
            api_key_env,
            temperature: config.temperature,
            timeout: config.timeout(),
        })
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn generate(&self, prompt: &str, timeout: Duration) -> Result<String, EngineError> {
        let Some(key) = self.api_key.as_deref() else {
            return Err(EngineError::provider(
                &self.name,
                format!("{} is not set", self.api_key_env),
            ));
        };
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": self.temperature,
        });
        let json = post_json(
            &self.client,
            &format!("{}/v1/chat/completions", self.base_url),
            Some(key),
            &body,
            timeout,
            &self.name,
        )
        .await?;
        Ok(json
            .pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .unwrap_or_default()
            .trim()
            .to_string())
    }
}

async fn post_json(
    client: &reqwest::Client,
    url: &str,
    api_key: Option<&str>,
    body: &serde_json::Value,
    timeout: Duration,
    provider: &str,
) -> Result<serde_json::Value, EngineError> {
    let mut request = client.post(url).timeout(timeout).json(body);
    if let Some(key) = api_key {
        request = request.bearer_auth(key);
    }
    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            EngineError::ProviderTimeout {
                provider: provider.to_string(),
                millis: timeout.as_millis(),
            }
        } else {
            EngineError::provider(provider, e)
        }
    })?;
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(EngineError::provider(
            provider,
            format!("HTTP {}: {}", status, text.chars().take(200).collect::<String>()),
        ));
    }
    response
        .json()
        .await
        .map_err(|e| EngineError::provider(provider, e))
}

/// Build the configured providers in priority order.
pub fn build_providers(config: &SynthesisConfig) -> anyhow::Result<Vec<Arc<dyn Provider>>> {
    config
        .providers
        .iter()
        .map(|p| -> anyhow::Result<Arc<dyn Provider>> {
            match p.kind.as_str() {
                "ollama" => Ok(Arc::new(OllamaProvider::new(p)?)),
                "openai" => Ok(Arc::new(OpenAiProvider::new(p)?)),
                other => Err(EngineError::Config(format!(
                    "unknown synthesis provider kind '{}'",
                    other
                ))
                .into()),
            }
        })
        .collect()
}

// ============ Chain ============

/// Text from the first provider that produced some, plus every failure
/// encountered on the way.
#[derive(Debug, Default)]
pub struct ChainOutcome {
    pub text: Option<(String, String)>,
    pub failures: Vec<EngineError>,
}

#[derive(Clone)]
pub struct ProviderChain {
    providers: Vec<Arc<dyn Provider>>,
    request_timeout: Duration,
}

impl ProviderChain {
    pub fn new(providers: Vec<Arc<dyn Provider>>, request_timeout: Duration) -> Self {
        Self {
            providers,
            request_timeout,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub async fn generate(&self, prompt: &str) -> ChainOutcome {
        let deadline = Instant::now() + self.request_timeout;
        let mut outcome = ChainOutcome::default();

        for provider in &self.providers {
            let now = Instant::now();
            if now >= deadline {
                warn!(provider = provider.name(), "request deadline passed, skipping provider");
                break;
            }
            let budget = provider.timeout().min(deadline - now);
            debug!(provider = provider.name(), budget_ms = budget.as_millis() as u64, "trying provider");

            let result = match tokio::time::timeout(budget, provider.generate(prompt, budget)).await {
                Ok(Ok(text)) if !text.trim().is_empty() => {
                    info!(provider = provider.name(), "provider answered");
                    outcome.text = Some((provider.name().to_string(), text));
                    return outcome;
                }
                Ok(Ok(_)) => EngineError::provider(provider.name(), "empty completion"),
                Ok(Err(e)) => e,
                Err(_) => EngineError::ProviderTimeout {
                    provider: provider.name().to_string(),
                    millis: budget.as_millis(),
                },
            };
            warn!(error = %result, "provider failed, falling through");
            outcome.failures.push(result);
        }
        outcome
    }
}

// ============ Synthesizer ============

pub const HEURISTIC: &str = "heuristic";

const GENERIC_LINES: &[&str] = &[
    "- Size positions so a wrong call stays survivable.",
    "- Confirm the level on your own chart before acting.",
    "- Decide the exit before the entry triggers.",
    "- Re-check levels when volatility shifts sharply.",
    "- Skip the trade if the plan needs rewriting mid-move.",
    "- Journal the result either way.",
    "- Treat this as education, not a trade instruction.",
    "- Read the cited sections for the full context.",
];

pub struct Synthesizer {
    chain: ProviderChain,
    max_verbatim: usize,
}

impl Synthesizer {
    pub fn new(chain: ProviderChain, max_verbatim: usize) -> Self {
        Self {
            chain,
            max_verbatim,
        }
    }

    /// Produce an answer for `question` from `hits`.
    ///
    /// `topic` is the short header used by the extractive fallback (the
    /// question itself for `ask`, a ticker/setup line for `explain_signal`).
    pub async fn synthesize(&self, question: &str, topic: &str, hits: &[Hit], style: Style) -> Answer {
        if hits.is_empty() {
            return Answer::no_match();
        }

        let fallback = heuristic_lines(question, topic, hits, style, self.max_verbatim);
        let (provider, raw) = if self.chain.is_empty() {
            (HEURISTIC.to_string(), fallback.join("\n"))
        } else {
            let prompt = build_prompt(question, hits, style, self.max_verbatim);
            match self.chain.generate(&prompt).await.text {
                Some((name, text)) => (name, text),
                None => {
                    info!("all providers failed, using heuristic summary");
                    (HEURISTIC.to_string(), fallback.join("\n"))
                }
            }
        };

        let text = self.finish(&raw, &fallback, hits, style);
        Answer {
            text,
            citations: citations(hits),
            provider,
        }
    }

    /// Template slots, references → labels, line bounds, `Sources:` line,
    /// paraphrase check.
    fn finish(&self, raw: &str, fallback: &[String], hits: &[Hit], style: Style) -> String {
        let labels = citation::labels(hits);
        let raw = match style {
            Style::Ask => raw.to_string(),
            Style::ExplainSignal => conform_explain(raw, fallback).join("\n"),
        };
        let rewritten = citation::rewrite_references(&raw, hits);
        let shaped = shape_lines(&rewritten, fallback, &labels, style);
        let sources: Vec<&str> = hits.iter().map(|h| h.record.text.as_str()).collect();
        citation::enforce_paraphrase(&shaped, &sources, self.max_verbatim)
    }
}

/// One citation per distinct label, in rank order.
fn citations(hits: &[Hit]) -> Vec<Citation> {
    let mut seen = HashSet::new();
    hits.iter()
        .filter(|h| seen.insert(h.record.label()))
        .map(|h| Citation::from(&h.record))
        .collect()
}

pub fn build_prompt(question: &str, hits: &[Hit], style: Style, max_verbatim: usize) -> String {
    let style_hint = match style {
        Style::Ask => "Respond with 6-10 short lines focused on actionable trading education.",
        Style::ExplainSignal => {
            "Respond with 8-12 short lines. Start lines with Thesis:, Entry:, Invalidation:, \
             Risk note:, Watch-out 1: and Watch-out 2:."
        }
    };
    let context = hits
        .iter()
        .map(|h| format!("{}: {}", h.record.label(), h.record.text))
        .collect::<Vec<_>>()
        .join("\n\n");
    format!(
        "You are a trading education coach. Paraphrase insights from the provided context \
         without quoting more than {} continuous characters. Use the citation labels exactly \
         as provided when you reference a source. {}\n\nQuestion: {}\nContext:\n{}\n\nAnswer:",
        max_verbatim, style_hint, question, context
    )
}

/// Fit `text` into the style's line bounds.
///
/// Blank lines and any existing `Sources:` line are dropped; the body is cut
/// to leave room for a `Sources:` line, then padded from `fallback` and the
/// generic lines until the minimum is reached.
pub fn shape_lines(text: &str, fallback: &[String], labels: &[String], style: Style) -> String {
    let (min, max) = style.line_bounds();
    let mut lines: Vec<String> = text
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty() && !l.to_ascii_lowercase().starts_with("sources:"))
        .collect();
    lines.truncate(max - 1);

    let mut pool = fallback
        .iter()
        .skip(1)
        .cloned()
        .chain(GENERIC_LINES.iter().map(|l| l.to_string()));
    loop {
        let body = lines.join("\n");
        let missing = citation::missing_labels(&body, labels);
        let total = lines.len() + usize::from(!missing.is_empty());
        if total >= min {
            if !missing.is_empty() {
                lines.push(citation::sources_line(&missing));
            }
            break;
        }
        match pool.find(|candidate| !lines.contains(candidate)) {
            Some(line) => lines.push(line),
            None => {
                if !missing.is_empty() {
                    lines.push(citation::sources_line(&missing));
                }
                break;
            }
        }
    }
    lines.join("\n")
}

/// Put signal-brief output into template order.
///
/// `fallback` is the heuristic brief (header plus one line per slot). Each
/// slot takes the first matching line of `text` and falls back to the
/// heuristic line when the text has none. Unmatched lines of `text` follow
/// the slots.
pub fn conform_explain(text: &str, fallback: &[String]) -> Vec<String> {
    let mut slots: Vec<Option<String>> = vec![None; EXPLAIN_SLOTS.len()];
    let mut extra = Vec::new();

    for line in text.lines() {
        let cleaned = line
            .trim()
            .trim_start_matches(['-', '*', '•', '#', ' '])
            .replace("**", "");
        let cleaned = cleaned.trim();
        if cleaned.is_empty() || cleaned.to_ascii_lowercase().starts_with("signal brief") {
            continue;
        }
        match slot_of(cleaned, &slots) {
            Some((i, rest)) => slots[i] = Some(format!("{}: {}", EXPLAIN_SLOTS[i].0, rest)),
            None => extra.push(cleaned.to_string()),
        }
    }

    let mut lines = vec![fallback.first().cloned().unwrap_or_default()];
    for (i, slot) in slots.into_iter().enumerate() {
        let line = slot.or_else(|| fallback.get(i + 1).cloned());
        lines.push(line.unwrap_or_else(|| format!("{}: {}", EXPLAIN_SLOTS[i].0, EXPLAIN_SLOTS[i].2)));
    }
    lines.extend(extra);
    lines.retain(|l| !l.is_empty());
    lines
}

/// Which unfilled slot `line` names, and the text after the `Slot:` prefix.
/// Unnumbered watch-outs fill the first free watch-out slot.
fn slot_of<'a>(line: &'a str, filled: &[Option<String>]) -> Option<(usize, &'a str)> {
    let (head, rest) = line.split_once(':')?;
    let head = head.trim().to_ascii_lowercase().replace(' ', "-");
    let rest = rest.trim();
    if rest.is_empty() {
        return None;
    }
    let names: Vec<String> = EXPLAIN_SLOTS
        .iter()
        .map(|(name, _, _)| name.to_ascii_lowercase().replace(' ', "-"))
        .collect();
    if let Some(i) = names.iter().position(|n| *n == head) {
        return filled[i].is_none().then_some((i, rest));
    }
    let aliases: &[(&str, usize)] = &[("invalid", 2), ("stop", 2), ("risk", 3)];
    if let Some((_, i)) = aliases.iter().find(|(alias, _)| *alias == head) {
        return filled[*i].is_none().then_some((*i, rest));
    }
    if head.starts_with("watch-out") || head.starts_with("watchout") {
        return names
            .iter()
            .enumerate()
            .find(|(i, n)| n.starts_with("watch-out") && filled[*i].is_none())
            .map(|(i, _)| (i, rest));
    }
    None
}

// ============ Heuristic ============

/// Sentences of `text`, whitespace-collapsed, fragments dropped.
fn sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let chars: Vec<char> = text.chars().collect();
    for (i, &c) in chars.iter().enumerate() {
        current.push(c);
        let boundary = matches!(c, '.' | '!' | '?')
            && chars.get(i + 1).map_or(true, |n| n.is_whitespace());
        let paragraph = c == '\n' && chars.get(i + 1) == Some(&'\n');
        if boundary || paragraph {
            push_sentence(&mut out, &current);
            current.clear();
        }
    }
    push_sentence(&mut out, &current);
    if out.is_empty() {
        let whole = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if !whole.is_empty() {
            out.push(whole);
        }
    }
    out
}

fn push_sentence(out: &mut Vec<String>, raw: &str) {
    let s = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if s.chars().filter(|c| c.is_alphanumeric()).count() >= 12 {
        out.push(s);
    }
}

/// Cut at a word boundary to at most `max_chars`, marking the cut with `…`.
fn clip(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out = String::new();
    for word in s.split_whitespace() {
        if out.chars().count() + word.chars().count() + 2 > max_chars {
            break;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    if out.is_empty() {
        out = s.chars().take(max_chars.saturating_sub(1)).collect();
    }
    let trimmed = out.trim_end_matches(|c: char| !c.is_alphanumeric()).to_string();
    format!("{}…", trimmed)
}

/// Each hit's sentences ranked by query-term overlap, then position.
fn ranked_sentences(question: &str, hits: &[Hit]) -> Vec<Vec<String>> {
    let terms: HashSet<String> = tokenize(question).into_iter().collect();
    hits.iter()
        .map(|hit| {
            let mut scored: Vec<(usize, usize, String)> = sentences(&hit.record.text)
                .into_iter()
                .enumerate()
                .map(|(i, s)| {
                    let overlap = tokenize(&s).iter().filter(|w| terms.contains(*w)).count();
                    (overlap, i, s)
                })
                .collect();
            scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
            scored.into_iter().map(|(_, _, s)| s).collect()
        })
        .collect()
}

/// Deterministic extractive summary. The first line is a header; the rest
/// are labelled sentence lines. Never empty.
pub fn heuristic_lines(
    question: &str,
    topic: &str,
    hits: &[Hit],
    style: Style,
    max_verbatim: usize,
) -> Vec<String> {
    let clip_at = (max_verbatim * 2 / 3).max(20);
    let ranked = ranked_sentences(question, hits);

    // Round-robin across hits so one source does not fill every line.
    let mut picks: Vec<(String, String)> = Vec::new();
    let depth = ranked.iter().map(Vec::len).max().unwrap_or(0);
    for level in 0..depth {
        for (hit, ordered) in hits.iter().zip(&ranked) {
            if let Some(s) = ordered.get(level) {
                picks.push((clip(s, clip_at), hit.record.label()));
            }
        }
    }

    let topic = clip(topic.trim(), 70);
    match style {
        Style::Ask => {
            let mut lines = vec![format!("Key points on: {}", topic)];
            lines.extend(
                picks
                    .into_iter()
                    .take(6)
                    .map(|(s, label)| format!("- {} {}", s, label)),
            );
            lines
        }
        Style::ExplainSignal => explain_template(&topic, picks),
    }
}

/// Template slot, cue words that make a sentence a good fit, default text.
const EXPLAIN_SLOTS: &[(&str, &[&str], &str)] = &[
    ("Thesis", &["thesis", "trend", "because", "setup", "momentum"], "the setup needs a clear directional reason before it is worth trading."),
    ("Entry", &["entry", "enter", "trigger", "breakout", "buy", "reclaim"], "wait for the trigger level to hold rather than anticipating it."),
    ("Invalidation", &["invalid", "stop", "below", "fails", "close"], "define the price that proves the idea wrong before entering."),
    ("Risk note", &["risk", "size", "position", "loss", "reward"], "keep the loss at the stop small relative to the account."),
    ("Watch-out 1", &["trap", "false", "fake", "avoid", "chop"], "false breaks are common when volume does not confirm."),
    ("Watch-out 2", &["news", "gap", "earnings", "volatility", "liquidity"], "scheduled news can gap price straight through the stop."),
];

fn explain_template(topic: &str, picks: Vec<(String, String)>) -> Vec<String> {
    let mut lines = vec![format!("Signal brief: {}", topic)];
    let mut used = vec![false; picks.len()];

    for (slot, cues, default) in EXPLAIN_SLOTS {
        let cued = picks.iter().enumerate().position(|(i, (s, _))| {
            let words = tokenize(s);
            !used[i] && cues.iter().any(|cue| words.iter().any(|w| w.starts_with(cue)))
        });
        let chosen = cued.or_else(|| used.iter().position(|u| !u));
        match chosen {
            Some(i) => {
                used[i] = true;
                let (sentence, label) = &picks[i];
                lines.push(format!("{}: {} {}", slot, sentence, label));
            }
            None => lines.push(format!("{}: {}", slot, default)),
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkRecord;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn hit(shortname: &str, section: u32, text: &str) -> Hit {
        Hit {
            record: ChunkRecord {
                id: format!("{}-{}", shortname, section),
                doc_key: format!("{}.md", shortname),
                shortname: shortname.to_string(),
                section,
                text: text.to_string(),
                snippet: text.to_string(),
                hash: String::new(),
                embedder_version: "v".to_string(),
            },
            score: 1.0,
        }
    }

    fn sample_hits() -> Vec<Hit> {
        vec![
            hit(
                "Breakouts",
                2,
                "A breakout entry works best when volume expands on the trigger candle. \
                 Stops belong below the breakout level so a failed move is cut quickly. \
                 False breaks trap late buyers who chase extended candles.",
            ),
            hit(
                "Risk",
                1,
                "Position size follows from the distance to the stop. Risk a fixed fraction \
                 of the account on every trade. Earnings gaps can jump straight over a stop.",
            ),
        ]
    }

    struct Scripted {
        name: &'static str,
        reply: Result<&'static str, &'static str>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(name: &'static str, reply: Result<&'static str, &'static str>) -> Self {
            Self {
                name,
                reply,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Provider for Scripted {
        fn name(&self) -> &str {
            self.name
        }
        fn timeout(&self) -> Duration {
            Duration::from_millis(200)
        }
        async fn generate(&self, _prompt: &str, _timeout: Duration) -> Result<String, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.reply
                .map(str::to_string)
                .map_err(|e| EngineError::provider(self.name, e))
        }
    }

    fn line_count(text: &str) -> usize {
        text.lines().count()
    }

    #[tokio::test]
    async fn test_chain_falls_through_to_second_provider() {
        let first = Arc::new(Scripted::new("first", Err("connection refused")));
        let second = Arc::new(Scripted::new("second", Ok("Use [1] and [2].")));
        let chain = ProviderChain::new(
            vec![first.clone(), second.clone()],
            Duration::from_secs(5),
        );
        let outcome = chain.generate("prompt").await;
        assert_eq!(outcome.text.unwrap().0, "second");
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_slow_and_empty_providers_are_failures() {
        let mut slow = Scripted::new("slow", Ok("too late"));
        slow.delay = Duration::from_secs(5);
        let empty = Scripted::new("empty", Ok("   "));
        let chain = ProviderChain::new(vec![Arc::new(slow), Arc::new(empty)], Duration::from_secs(5));
        let outcome = chain.generate("prompt").await;
        assert!(outcome.text.is_none());
        assert!(matches!(outcome.failures[0], EngineError::ProviderTimeout { .. }));
        assert!(matches!(outcome.failures[1], EngineError::ProviderError { .. }));
    }

    #[tokio::test]
    async fn test_request_deadline_stops_chain() {
        let mut slow = Scripted::new("slow", Ok("late"));
        slow.delay = Duration::from_secs(5);
        let never = Arc::new(Scripted::new("never", Ok("unused")));
        let chain = ProviderChain::new(vec![Arc::new(slow), never.clone()], Duration::from_millis(50));
        let outcome = chain.generate("prompt").await;
        assert!(outcome.text.is_none());
        assert_eq!(never.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_all_failed_uses_heuristic_within_bounds() {
        let chain = ProviderChain::new(
            vec![Arc::new(Scripted::new("down", Err("503")))],
            Duration::from_secs(5),
        );
        let synth = Synthesizer::new(chain, 90);
        for style in [Style::Ask, Style::ExplainSignal] {
            let answer = synth
                .synthesize("breakout entry", "breakout entry", &sample_hits(), style)
                .await;
            let (min, max) = style.line_bounds();
            let n = line_count(&answer.text);
            assert!(n >= min && n <= max, "{:?}: {} lines\n{}", style, n, answer.text);
            assert_eq!(answer.provider, HEURISTIC);
            assert!(answer.text.contains("[Breakouts §2]"));
            assert!(answer.text.contains("[Risk §1]"));
        }
    }

    #[tokio::test]
    async fn test_explain_template_lines() {
        let synth = Synthesizer::new(ProviderChain::new(Vec::new(), Duration::from_secs(1)), 90);
        let answer = synth
            .synthesize("AAPL breakout", "AAPL breakout (1D)", &sample_hits(), Style::ExplainSignal)
            .await;
        let lines: Vec<&str> = answer.text.lines().collect();
        assert!(lines[0].starts_with("Signal brief: AAPL breakout"));
        for (i, slot) in ["Thesis:", "Entry:", "Invalidation:", "Risk note:", "Watch-out 1:", "Watch-out 2:"]
            .iter()
            .enumerate()
        {
            assert!(lines[i + 1].starts_with(slot), "line {}: {}", i + 1, lines[i + 1]);
        }
    }

    #[tokio::test]
    async fn test_freeform_explain_output_follows_template() {
        let reply: &'static str = "Generic observation number 1 about the tape.\n\
            Generic observation number 2 about the tape.\n\
            Generic observation number 3 about the tape.\n\
            Generic observation number 4 about the tape.\n\
            Generic observation number 5 about the tape.\n\
            Generic observation number 6 about the tape.\n\
            Generic observation number 7 about the tape.\n\
            Generic observation number 8 about the tape.\n\
            Generic observation number 9 about the tape.";
        let chain = ProviderChain::new(
            vec![Arc::new(Scripted::new("freeform", Ok(reply)))],
            Duration::from_secs(5),
        );
        let answer = Synthesizer::new(chain, 90)
            .synthesize("AAPL breakout", "AAPL breakout (1D)", &sample_hits(), Style::ExplainSignal)
            .await;
        assert_eq!(answer.provider, "freeform");
        let lines: Vec<&str> = answer.text.lines().collect();
        assert!(lines[0].starts_with("Signal brief: AAPL breakout"));
        for (i, slot) in ["Thesis:", "Entry:", "Invalidation:", "Risk note:", "Watch-out 1:", "Watch-out 2:"]
            .iter()
            .enumerate()
        {
            assert!(lines[i + 1].starts_with(slot), "line {}: {}", i + 1, lines[i + 1]);
        }
        assert!(answer.text.contains("Generic observation number 1"));
        let n = line_count(&answer.text);
        assert!((8..=12).contains(&n), "{} lines:\n{}", n, answer.text);
    }

    #[test]
    fn test_conform_explain_keeps_provider_slots() {
        let fallback = heuristic_lines("breakout", "AAPL breakout", &sample_hits(), Style::ExplainSignal, 90);
        let text = "**Entry:** buy the reclaim of the range high\n\
                    - Thesis: buyers defend the gap\n\
                    Watch-out: thin premarket volume\n\
                    Watch-out: earnings next week";
        let lines = conform_explain(text, &fallback);
        assert_eq!(lines[0], fallback[0]);
        assert_eq!(lines[1], "Thesis: buyers defend the gap");
        assert_eq!(lines[2], "Entry: buy the reclaim of the range high");
        assert_eq!(lines[3], fallback[3]);
        assert_eq!(lines[4], fallback[4]);
        assert_eq!(lines[5], "Watch-out 1: thin premarket volume");
        assert_eq!(lines[6], "Watch-out 2: earnings next week");
        assert_eq!(lines.len(), 7);
    }

    #[tokio::test]
    async fn test_long_provider_output_is_cut_and_sourced() {
        let reply: &'static str = "l1 [1]\nl2\nl3\nl4\nl5\nl6\nl7\nl8\nl9\nl10\nl11\nl12\nl13";
        let chain = ProviderChain::new(
            vec![Arc::new(Scripted::new("chatty", Ok(reply)))],
            Duration::from_secs(5),
        );
        let answer = Synthesizer::new(chain, 90)
            .synthesize("q", "q", &sample_hits(), Style::Ask)
            .await;
        let lines: Vec<&str> = answer.text.lines().collect();
        assert_eq!(lines.len(), 10);
        assert_eq!(lines[0], "l1 [Breakouts §2]");
        assert_eq!(lines[9], "Sources: [Risk §1]");
        assert_eq!(answer.provider, "chatty");
    }

    #[tokio::test]
    async fn test_short_provider_output_is_padded() {
        let chain = ProviderChain::new(
            vec![Arc::new(Scripted::new("terse", Ok("Buy strength [Breakouts §2].")))],
            Duration::from_secs(5),
        );
        let answer = Synthesizer::new(chain, 90)
            .synthesize("breakout", "breakout", &sample_hits(), Style::Ask)
            .await;
        let n = line_count(&answer.text);
        assert!((6..=10).contains(&n), "{}", answer.text);
        assert!(answer.text.starts_with("Buy strength [Breakouts §2]."));
        assert!(answer.text.contains("[Risk §1]"));
    }

    #[tokio::test]
    async fn test_no_hits_is_no_match() {
        let synth = Synthesizer::new(ProviderChain::new(Vec::new(), Duration::from_secs(1)), 90);
        assert!(synth.synthesize("q", "q", &[], Style::Ask).await.is_no_match());
    }

    #[test]
    fn test_unknown_provider_kind_is_config_error() {
        let config = SynthesisConfig {
            request_timeout_secs: 10,
            providers: vec![ProviderConfig {
                kind: "carrier-pigeon".to_string(),
                name: None,
                base_url: None,
                model: "m".to_string(),
                timeout_secs: 5,
                api_key_env: None,
                temperature: 0.2,
            }],
        };
        let err = build_providers(&config).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::Config(_))
        ));
    }

    #[test]
    fn test_prompt_mentions_limit_and_labels() {
        let prompt = build_prompt("What is a stop?", &sample_hits(), Style::Ask, 90);
        assert!(prompt.contains("more than 90 continuous characters"));
        assert!(prompt.contains("[Breakouts §2]: A breakout entry"));
        assert!(prompt.ends_with("Answer:"));
    }

    #[test]
    fn test_sentences_and_clip() {
        let s = sentences("First full sentence here. Second one follows!\n\nThird para line");
        assert_eq!(
            s,
            vec!["First full sentence here.", "Second one follows!", "Third para line"]
        );
        let c = clip("alpha beta gamma delta epsilon", 15);
        assert!(c.chars().count() <= 15);
        assert!(c.ends_with('…'));
    }
}
