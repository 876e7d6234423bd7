//! Citation formatting and the paraphrase guarantee.
//!
//! Synthesized text leaves this module with two properties callers rely on:
//!
//! 1. Every source reference is in the compact `[Shortname §N]` form.
//!    Free-form references (`[1]`, `[Risk Playbook p. 3]`,
//!    `(Source: risk playbook, section 3)`) are rewritten; references to
//!    documents that were not retrieved are dropped.
//! 2. No run of more than `max_verbatim_chars` characters appears verbatim
//!    in both the answer and any retrieved chunk. Offending spans are
//!    compressed (stopwords dropped, cut to half the limit, ending in `…`),
//!    and anything still offending after a few passes is removed.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::HashSet;

use crate::models::{citation_label, Hit};

const MAX_PASSES: usize = 8;

static SOURCE_PAREN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\s*\(\s*sources?\s*:\s*([^()]*)\)").expect("static regex")
});

static NAMED_REF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\[\s*([^\[\]]*?)[\s,]*(?:§|\b(?:section|sec\.?|p\.|pp\.|page|chunk|part))\s*(\d+)\s*\]")
        .expect("static regex")
});

static NAMED_ITEM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)([^;,]*?)[\s,]*(?:§|\b(?:section|sec\.?|p\.|pp\.|page|chunk|part))\s*(\d+)")
        .expect("static regex")
});

static NUMERIC_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[(\d{1,3})\]").expect("static regex"));

static STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "been", "but", "by", "can", "could", "do", "does",
    "for", "from", "if", "in", "into", "is", "it", "its", "may", "might", "of", "on", "or",
    "should", "so", "than", "that", "the", "then", "this", "to", "was", "were", "when", "which",
    "who", "will", "with", "would",
];

/// Lowercased alphanumerics only, so "Risk Playbook" matches "Risk_Playbook".
fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Resolve a `(name, section)` reference against the retrieved hits.
///
/// An exact `(shortname, section)` match wins; otherwise the best-ranked
/// hit from the same document. `None` when the document was not retrieved.
fn resolve(hits: &[Hit], name: &str, section: u32) -> Option<String> {
    let wanted = normalize_name(name);
    if wanted.is_empty() {
        return None;
    }
    let same_doc = |hit: &&Hit| normalize_name(&hit.record.shortname) == wanted;
    hits.iter()
        .filter(same_doc)
        .find(|hit| hit.record.section == section)
        .or_else(|| hits.iter().find(same_doc))
        .map(|hit| citation_label(&hit.record.shortname, hit.record.section))
}

/// Rewrite free-form references into `[Shortname §N]` labels.
pub fn rewrite_references(text: &str, hits: &[Hit]) -> String {
    let text = SOURCE_PAREN.replace_all(text, |caps: &Captures| {
        let labels: Vec<String> = NAMED_ITEM
            .captures_iter(&caps[1])
            .filter_map(|item| {
                let section = item[2].parse().ok()?;
                resolve(hits, &item[1], section)
            })
            .collect();
        if labels.is_empty() {
            String::new()
        } else {
            format!(" {}", labels.join(" "))
        }
    });

    let text = NAMED_REF.replace_all(&text, |caps: &Captures| {
        caps[2]
            .parse()
            .ok()
            .and_then(|section| resolve(hits, &caps[1], section))
            .unwrap_or_default()
    });

    let text = NUMERIC_REF.replace_all(&text, |caps: &Captures| {
        caps[1]
            .parse::<usize>()
            .ok()
            .filter(|n| *n >= 1)
            .and_then(|n| hits.get(n - 1))
            .map(|hit| hit.record.label())
            .unwrap_or_default()
    });

    tidy(&text)
}

/// Clean up spacing left behind by removed references.
fn tidy(text: &str) -> String {
    text.lines()
        .map(|line| {
            let mut line = line.split_whitespace().collect::<Vec<_>>().join(" ");
            for (from, to) in [(" .", "."), (" ,", ","), (" ;", ";"), (" :", ":")] {
                line = line.replace(from, to);
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Labels of `hits` in rank order, deduplicated.
pub fn labels(hits: &[Hit]) -> Vec<String> {
    let mut seen = HashSet::new();
    hits.iter()
        .map(|h| h.record.label())
        .filter(|label| seen.insert(label.clone()))
        .collect()
}

/// Labels not mentioned anywhere in `text`.
pub fn missing_labels(text: &str, labels: &[String]) -> Vec<String> {
    labels
        .iter()
        .filter(|label| !text.contains(label.as_str()))
        .cloned()
        .collect()
}

pub fn sources_line(labels: &[String]) -> String {
    format!("Sources: {}", labels.join(", "))
}

/// Every `(max + 1)`-character window of each source, raw and with
/// whitespace collapsed.
struct VerbatimIndex {
    width: usize,
    windows: HashSet<String>,
}

impl VerbatimIndex {
    fn new(sources: &[&str], max_chars: usize) -> Self {
        let width = max_chars + 1;
        let mut windows = HashSet::new();
        for source in sources {
            let collapsed = source.split_whitespace().collect::<Vec<_>>().join(" ");
            for variant in [*source, collapsed.as_str()] {
                let chars: Vec<char> = variant.chars().collect();
                if chars.len() < width {
                    continue;
                }
                for window in chars.windows(width) {
                    windows.insert(window.iter().collect());
                }
            }
        }
        Self { width, windows }
    }

    fn hit_at(&self, chars: &[char], start: usize) -> bool {
        let window: String = chars[start..start + self.width].iter().collect();
        self.windows.contains(&window)
    }

    /// Maximal non-overlapping `[start, end)` char ranges copied from a source.
    fn spans(&self, text: &str) -> Vec<(usize, usize)> {
        let chars: Vec<char> = text.chars().collect();
        let mut spans = Vec::new();
        if self.windows.is_empty() || chars.len() < self.width {
            return spans;
        }
        let last = chars.len() - self.width;
        let mut i = 0;
        while i <= last {
            if !self.hit_at(&chars, i) {
                i += 1;
                continue;
            }
            let start = i;
            let mut end = i + self.width;
            let mut j = i + 1;
            while j <= last && self.hit_at(&chars, j) {
                end = j + self.width;
                j += 1;
            }
            spans.push((start, end));
            i = end;
        }
        spans
    }
}

/// True if `text` shares a run longer than `max_chars` with any source.
pub fn has_verbatim_run(text: &str, sources: &[&str], max_chars: usize) -> bool {
    !VerbatimIndex::new(sources, max_chars).spans(text).is_empty()
}

/// Shorten a copied span: stopwords dropped, at most `budget` chars, `…`.
fn compress(span: &str, budget: usize) -> String {
    let budget = budget.max(2);
    let mut out = String::new();
    for word in span.split_whitespace() {
        let bare = word.trim_matches(|c: char| !c.is_alphanumeric());
        if bare.is_empty() || STOPWORDS.contains(&bare.to_lowercase().as_str()) {
            continue;
        }
        let extra = bare.chars().count() + usize::from(!out.is_empty());
        if out.chars().count() + extra >= budget {
            break;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(bare);
    }
    if out.is_empty() {
        out = span
            .split_whitespace()
            .next()
            .unwrap_or("")
            .chars()
            .take(budget - 1)
            .collect();
    }
    out.push('…');
    out
}

fn replace_spans(text: &str, spans: &[(usize, usize)], with: impl Fn(&str) -> String) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for &(start, end) in spans {
        out.extend(&chars[cursor..start]);
        let span: String = chars[start..end].iter().collect();
        out.push_str(&with(&span));
        cursor = end;
    }
    out.extend(&chars[cursor..]);
    out
}

/// Enforce the verbatim limit against `sources`.
///
/// Infallible: if compression does not converge, offending spans are cut
/// down to a single `…`, which strictly shortens the text each time.
pub fn enforce_paraphrase(text: &str, sources: &[&str], max_chars: usize) -> String {
    let index = VerbatimIndex::new(sources, max_chars);
    let mut text = text.to_string();

    for _ in 0..MAX_PASSES {
        let spans = index.spans(&text);
        if spans.is_empty() {
            return text;
        }
        text = replace_spans(&text, &spans, |span| compress(span, max_chars / 2));
    }

    loop {
        let spans = index.spans(&text);
        if spans.is_empty() {
            return text;
        }
        text = replace_spans(&text, &spans, |_| "…".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkRecord;

    fn hit(shortname: &str, section: u32, text: &str) -> Hit {
        Hit {
            record: ChunkRecord {
                id: format!("{}-{}", shortname, section),
                doc_key: format!("{}.pdf", shortname),
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

    fn hits() -> Vec<Hit> {
        vec![
            hit("Risk_Playbook", 3, "risk text"),
            hit("Breakout_Guide", 1, "breakout text"),
        ]
    }

    #[test]
    fn test_numeric_references() {
        let out = rewrite_references("Cut losers fast [1]. Wait for volume [2].", &hits());
        assert_eq!(
            out,
            "Cut losers fast [Risk_Playbook §3]. Wait for volume [Breakout_Guide §1]."
        );
    }

    #[test]
    fn test_named_references_are_normalized() {
        let out = rewrite_references(
            "Size small [risk playbook, section 3] and [Breakout Guide p. 1].",
            &hits(),
        );
        assert_eq!(out, "Size small [Risk_Playbook §3] and [Breakout_Guide §1].");
    }

    #[test]
    fn test_source_parenthetical() {
        let out = rewrite_references(
            "Respect the stop (Source: Risk Playbook §3; breakout-guide section 1).",
            &hits(),
        );
        assert_eq!(out, "Respect the stop [Risk_Playbook §3] [Breakout_Guide §1].");
    }

    #[test]
    fn test_unknown_and_out_of_range_references_dropped() {
        let out = rewrite_references("Claim [Made_Up §4] and [7] here.", &hits());
        assert_eq!(out, "Claim and here.");
    }

    #[test]
    fn test_wrong_section_maps_to_retrieved_chunk() {
        let out = rewrite_references("See [Risk_Playbook §9].", &hits());
        assert_eq!(out, "See [Risk_Playbook §3].");
    }

    #[test]
    fn test_keyword_inside_a_word_is_not_a_reference() {
        let out = rewrite_references(
            "Compare with [Counterpart 2] and [Depart 3], then [Risk Playbook part 3].",
            &hits(),
        );
        assert_eq!(
            out,
            "Compare with [Counterpart 2] and [Depart 3], then [Risk_Playbook §3]."
        );
    }

    #[test]
    fn test_canonical_labels_untouched() {
        let text = "Fine as is [Risk_Playbook §3].\nSecond line [Breakout_Guide §1].";
        assert_eq!(rewrite_references(text, &hits()), text);
    }

    #[test]
    fn test_missing_labels_and_sources_line() {
        let labels = labels(&hits());
        let missing = missing_labels("only [Risk_Playbook §3]", &labels);
        assert_eq!(missing, vec!["[Breakout_Guide §1]".to_string()]);
        assert_eq!(sources_line(&missing), "Sources: [Breakout_Guide §1]");
    }

    #[test]
    fn test_long_copy_is_compressed() {
        let source = "Traders who move their stop further away after entry are converting a \
                      defined risk trade into an open ended hope trade, which is the fastest way \
                      to turn a small loss into a large one.";
        let answer = format!("Coach says: {} Stay disciplined.", source);
        assert!(has_verbatim_run(&answer, &[source], 90));
        let fixed = enforce_paraphrase(&answer, &[source], 90);
        assert!(!has_verbatim_run(&fixed, &[source], 90));
        assert!(fixed.starts_with("Coach says: "));
        assert!(fixed.contains('…'));
        assert!(fixed.ends_with("Stay disciplined."));
    }

    #[test]
    fn test_short_quotes_allowed() {
        let source = "Never add to a losing position.";
        let answer = "Remember: Never add to a losing position.";
        assert_eq!(enforce_paraphrase(answer, &[source], 90), answer);
    }

    #[test]
    fn test_whitespace_variants_caught() {
        let source = "Position size is the one variable you fully control\n\nwhen every other \
                      input to the trade is uncertain and noisy.";
        let answer = "Position size is the one variable you fully control when every other input \
                      to the trade is uncertain and noisy.";
        assert!(has_verbatim_run(answer, &[source], 40));
        assert!(!has_verbatim_run(&enforce_paraphrase(answer, &[source], 40), &[source], 40));
    }

    #[test]
    fn test_compress_budget() {
        let c = compress("the quick brown fox jumps over the lazy dog and keeps running", 20);
        assert!(c.chars().count() <= 20);
        assert!(c.ends_with('…'));
        assert!(!c.starts_with("the "));
    }
}
