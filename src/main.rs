//! # Playbook CLI (`kb`)
//!
//! Builds the playbook index and queries it from the shell.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kb rebuild` | Incrementally (re)build the index from the corpus |
//! | `kb status` | Summarize the live index |
//! | `kb search "<query>"` | Ranked snippets with citations |
//! | `kb ask "<question>"` | Paraphrased, cited answer |
//! | `kb explain <ticker> <setup>` | Signal brief (thesis, entry, invalidation, risk, watch-outs) |
//! | `kb serve` | Start the JSON HTTP API |
//! | `kb completions <shell>` | Print shell completions |
//!
//! Logs go to stderr (`RUST_LOG` overrides the default `info` filter);
//! command output goes to stdout.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use playbook_rag::builder::BuildReport;
use playbook_rag::config::{self, Config};
use playbook_rag::engine::Engine;
use playbook_rag::models::{Answer, SearchHit};
use playbook_rag::progress::ProgressMode;
use playbook_rag::{server, status};

/// Playbook RAG: cited, paraphrased answers from a local document corpus.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/kb.example.toml` for a full example.
#[derive(Parser)]
#[command(name = "kb", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kb.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan the corpus and update the index.
    ///
    /// Only new and changed documents are extracted and embedded; removed
    /// documents are pruned. Nothing is written when the corpus is unchanged.
    Rebuild {
        /// Progress output on stderr. Defaults to `human` on a TTY, else `off`.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,

        /// Print the build report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show what the live index contains.
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Search indexed chunks.
    Search {
        query: String,

        /// Maximum number of results (defaults to `[retrieval].search_k`).
        #[arg(long)]
        limit: Option<usize>,

        #[arg(long)]
        json: bool,
    },

    /// Answer a question with citations.
    Ask {
        question: String,

        #[arg(long)]
        json: bool,
    },

    /// Explain a trading setup for a ticker.
    Explain {
        ticker: String,
        setup: String,

        /// Chart timeframe, e.g. `5m`, `1h`, `1D`.
        #[arg(long)]
        timeframe: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve,

    /// Print shell completions.
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Commands that don't require config
    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "kb", &mut std::io::stdout());
        return Ok(());
    }

    init_tracing();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Rebuild { progress, json } => {
            let engine = open_engine(cfg)?;
            let reporter = progress.unwrap_or_else(ProgressMode::default_for_tty).reporter();
            let report = engine.rebuild(reporter.as_ref()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
        }
        Commands::Status { json } => {
            status::run_status(&cfg, json)?;
        }
        Commands::Search { query, limit, json } => {
            let engine = open_engine(cfg)?;
            let hits = engine.search(&query, limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&hits)?);
            } else {
                print_hits(&hits);
            }
        }
        Commands::Ask { question, json } => {
            let engine = open_engine(cfg)?;
            let answer = engine.ask(&question).await?;
            print_answer(&answer, json)?;
        }
        Commands::Explain {
            ticker,
            setup,
            timeframe,
            json,
        } => {
            let engine = open_engine(cfg)?;
            let answer = engine
                .explain(&ticker, &setup, timeframe.as_deref())
                .await?;
            print_answer(&answer, json)?;
        }
        Commands::Serve => {
            let engine = Arc::new(open_engine(cfg)?);
            server::run_server(engine).await?;
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn open_engine(cfg: Config) -> Result<Engine> {
    Engine::open(cfg).context("Failed to initialize engine")
}

fn print_report(report: &BuildReport) {
    if report.published {
        println!(
            "Published {} ({} chunks, {} newly embedded).",
            report.generation.as_deref().unwrap_or("-"),
            report.chunks,
            report.embedded_chunks
        );
    } else {
        println!("Index up to date ({} chunks).", report.chunks);
    }
    println!(
        "Documents: {} total, {} unchanged, {} changed, {} new, {} removed",
        report.documents, report.unchanged, report.changed, report.new, report.removed
    );
    for skipped in &report.skipped {
        println!("  skipped  {}  ({})", skipped.doc, skipped.reason);
    }
    for warning in &report.warnings {
        println!("  warning  {}", warning);
    }
}

fn print_hits(hits: &[SearchHit]) {
    if hits.is_empty() {
        println!("No results.");
        return;
    }
    for (i, hit) in hits.iter().enumerate() {
        println!("{}. {}  (score: {:.3})", i + 1, hit.citation.label, hit.score);
        println!("   {}", hit.snippet);
        println!();
    }
}

fn print_answer(answer: &Answer, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(answer)?);
    } else {
        println!("{}", answer.text);
    }
    Ok(())
}
