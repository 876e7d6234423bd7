//! Paragraph-boundary text chunker.
//!
//! Splits extracted document text into [`Chunk`]s that respect a configurable
//! `max_tokens` limit. Splitting happens on paragraph boundaries (blank
//! lines) so a chunk's section number points at a coherent passage.
//!
//! Each chunk's id is derived from its document key and ordinal, so the same
//! document chunked twice yields the same ids. The SHA-256 of the chunk text
//! is kept alongside for change detection.
//!
//! # Algorithm
//!
//! 1. Convert `max_tokens` to `max_chars` using a 4 chars/token ratio.
//! 2. Split on blank lines and collapse whitespace inside each paragraph.
//! 3. Accumulate paragraphs into a buffer until adding the next one would
//!    exceed `max_chars`, then flush.
//! 4. Hard-split a single oversized paragraph at the last space before the
//!    limit.
//! 5. Text with no visible characters yields no chunks at all.

use sha2::{Digest, Sha256};

use crate::models::Chunk;

/// Approximate characters-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Maximum snippet length in characters.
pub const SNIPPET_CHARS: usize = 240;

/// Split text into chunks on paragraph boundaries, respecting `max_tokens`.
///
/// Ordinals are contiguous from 0. Returns an empty vector when the text
/// contains nothing but whitespace; callers treat that as an unreadable
/// document.
pub fn chunk_text(doc_key: &str, text: &str, max_tokens: usize) -> Vec<Chunk> {
    let max_chars = (max_tokens * CHARS_PER_TOKEN).max(1);

    let mut chunks = Vec::new();
    let mut current_buf = String::new();
    let mut ordinal: u32 = 0;

    for para in paragraphs(text) {
        let would_be = if current_buf.is_empty() {
            para.len()
        } else {
            current_buf.len() + 2 + para.len()
        };

        if would_be > max_chars && !current_buf.is_empty() {
            chunks.push(make_chunk(doc_key, ordinal, &current_buf));
            ordinal += 1;
            current_buf.clear();
        }

        if para.len() > max_chars {
            let mut remaining = para.as_str();
            while !remaining.is_empty() {
                let split_at = split_point(remaining, max_chars);
                let piece = remaining[..split_at].trim();
                if !piece.is_empty() {
                    chunks.push(make_chunk(doc_key, ordinal, piece));
                    ordinal += 1;
                }
                remaining = &remaining[split_at..];
            }
        } else {
            if !current_buf.is_empty() {
                current_buf.push_str("\n\n");
            }
            current_buf.push_str(&para);
        }
    }

    if !current_buf.is_empty() {
        chunks.push(make_chunk(doc_key, ordinal, &current_buf));
    }

    chunks
}

/// Paragraphs with internal whitespace collapsed to single spaces.
fn paragraphs(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                out.push(collapse_whitespace(&current.join(" ")));
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        out.push(collapse_whitespace(&current.join(" ")));
    }
    out.retain(|p| !p.is_empty());
    out
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Byte offset at which to cut `s` so the head fits in `max_chars`,
/// preferring the last space. Always makes progress.
fn split_point(s: &str, max_chars: usize) -> usize {
    if s.len() <= max_chars {
        return s.len();
    }
    let hard = snap_to_char_boundary(s, max_chars);
    let cut = s[..hard].rfind(' ').map(|pos| pos + 1).unwrap_or(hard);
    if cut == 0 {
        s.char_indices().nth(1).map(|(i, _)| i).unwrap_or(s.len())
    } else {
        cut
    }
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Stable chunk id: first 16 bytes of `sha256(doc_key \0 ordinal)`, hex.
pub fn chunk_id(doc_key: &str, ordinal: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(doc_key.as_bytes());
    hasher.update([0u8]);
    hasher.update(ordinal.to_le_bytes());
    hex::encode(&hasher.finalize()[..16])
}

pub fn content_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

fn make_chunk(doc_key: &str, ordinal: u32, text: &str) -> Chunk {
    Chunk {
        id: chunk_id(doc_key, ordinal),
        doc_key: doc_key.to_string(),
        ordinal,
        text: text.to_string(),
        hash: content_hash(text),
    }
}

/// Whitespace-collapsed preview of at most [`SNIPPET_CHARS`] characters.
pub fn snippet(text: &str) -> String {
    let squished = collapse_whitespace(text);
    if squished.chars().count() <= SNIPPET_CHARS {
        return squished;
    }
    let head: String = squished.chars().take(SNIPPET_CHARS - 1).collect();
    format!("{}…", head.trim_end())
}
