//! # Playbook RAG
//!
//! A local-first retrieval and synthesis engine that answers questions from
//! a directory of playbook documents with short, paraphrased, citation-backed
//! summaries.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌──────────┐   ┌──────────────┐
//! │  Corpus  │──▶│ Change detect│──▶│ Extract  │──▶│ Chunk + Embed│
//! │ PDF/DOCX │   │ size + mtime │   │          │   │              │
//! └──────────┘   └──────────────┘   └──────────┘   └──────┬───────┘
//!                                                         ▼
//!                                          ┌──────────────────────────┐
//!                                          │ gen-<uuid>/ meta + HNSW  │
//!                                          │ CURRENT (atomic swap)    │
//!                                          └────────────┬─────────────┘
//!                                                       ▼
//!   query ──▶ Retriever ──▶ Synthesizer (providers → heuristic) ──▶ Citation formatter
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! kb rebuild                                  # index ./knowledge
//! kb search "stop placement"                  # ranked snippets
//! kb ask "How should I size a breakout trade?"
//! kb explain AAPL "opening range breakout" --timeframe 5m
//! kb serve                                    # JSON HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy and build warnings |
//! | [`corpus`] | Corpus directory walk |
//! | [`extract`] | PDF, DOCX and text extraction |
//! | [`chunk`] | Paragraph-aligned chunking |
//! | [`change`] | Fingerprint-based change classification |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`vector_index`] | HNSW vector index |
//! | [`store`] | Persisted generations and atomic swap |
//! | [`builder`] | Incremental index build |
//! | [`retriever`] | Vector + lexical retrieval with source diversity |
//! | [`synth`] | Provider chain and heuristic summaries |
//! | [`citation`] | Citation labels and the verbatim limit |
//! | [`engine`] | Query interface over the live snapshot |
//! | [`progress`] | Build progress reporting |
//! | [`status`] | Index summary |
//! | [`server`] | HTTP API |

pub mod builder;
pub mod change;
pub mod chunk;
pub mod citation;
pub mod config;
pub mod corpus;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod extract;
pub mod models;
pub mod progress;
pub mod retriever;
pub mod server;
pub mod status;
pub mod store;
pub mod synth;
pub mod vector_index;
