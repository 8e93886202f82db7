use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use docrag::{KnowledgeBase, Settings};

#[derive(Parser)]
#[command(name = "docrag")]
#[command(version = "0.1")]
#[command(about = "Question answering over a growing collection of PDFs", long_about = None)]
struct Cli {
    /// Log retrieval and persistence details to stderr
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Knowledge store directory (overrides DOCRAG_STORE_PATH)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a question from the indexed documents
    Ask {
        question: String,
        #[arg(short)]
        k: Option<usize>,
    },
    /// Add a single PDF to the knowledge base
    Upload {
        file: PathBuf,
        /// Name to index the document under (defaults to the file name)
        #[arg(long)]
        name: Option<String>,
    },
    /// Add every PDF in a directory that is not indexed yet
    Ingest { dir: Option<PathBuf> },
    /// Rebuild the whole store from a directory of PDFs
    Rebuild { dir: Option<PathBuf> },
    Stats,
    Config,
}

/// `RUST_LOG` sets the baseline (default `info`); verbose raises it to debug.
fn log_filter(verbose: bool, rust_log: Option<&str>) -> EnvFilter {
    let filter = rust_log
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    if verbose {
        filter.add_directive(LevelFilter::DEBUG.into())
    } else {
        filter
    }
}

fn init_tracing(verbose: bool) {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(log_filter(verbose, rust_log.as_deref()))
        .with_writer(std::io::stderr)
        .try_init();
}

fn ask_command(kb: &KnowledgeBase, question: &str, k: Option<usize>) -> Result<()> {
    let k = k.unwrap_or(kb.settings().top_k);
    let answer = kb.ask_with_k(question, k)?;
    println!("{}", serde_json::to_string(&answer)?);
    Ok(())
}

fn upload_command(kb: &KnowledgeBase, file: &Path, name: Option<String>) -> Result<()> {
    let name = match name {
        Some(name) => name,
        None => file
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .with_context(|| format!("cannot derive a document name from '{}'", file.display()))?,
    };
    let bytes = fs::read(file).with_context(|| format!("Failed to read '{}'", file.display()))?;
    let chunks_added = kb
        .upload_pdf(&name, &bytes)
        .with_context(|| format!("Failed to upload '{}'", name))?;

    let output = serde_json::json!({
        "document": name,
        "chunks_added": chunks_added,
    });
    println!("{}", serde_json::to_string(&output)?);
    Ok(())
}

fn ingest_command(kb: &KnowledgeBase, dir: Option<PathBuf>) -> Result<()> {
    let dir = dir.unwrap_or_else(|| kb.settings().source_dir.clone());
    let report = kb
        .ingest_directory(&dir)
        .with_context(|| format!("Bulk ingest of '{}' failed", dir.display()))?;
    println!("{}", serde_json::to_string(&report)?);
    Ok(())
}

fn rebuild_command(kb: &KnowledgeBase, dir: Option<PathBuf>) -> Result<()> {
    let dir = dir.unwrap_or_else(|| kb.settings().source_dir.clone());
    let report = kb
        .rebuild(&dir)
        .with_context(|| format!("Rebuild from '{}' failed", dir.display()))?;
    println!("{}", serde_json::to_string(&report)?);
    Ok(())
}

fn stats_command(kb: &KnowledgeBase) -> Result<()> {
    let stats = kb.stats()?;
    println!("{}", serde_json::to_string(&stats)?);
    Ok(())
}

fn main() -> Result<()> {
    let args = Cli::parse();
    let mut settings = Settings::load().context("Invalid configuration")?;
    if let Some(store) = args.store {
        settings.store_path = store;
    }
    init_tracing(args.verbose || settings.verbose);

    let open = || KnowledgeBase::from_settings(settings.clone());
    match args.command {
        Commands::Ask { question, k } => ask_command(&open()?, &question, k)?,
        Commands::Upload { file, name } => upload_command(&open()?, &file, name)?,
        Commands::Ingest { dir } => ingest_command(&open()?, dir)?,
        Commands::Rebuild { dir } => rebuild_command(&open()?, dir)?,
        Commands::Stats => stats_command(&open()?)?,
        Commands::Config => settings.print_config(),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_raises_level_over_rust_log() {
        let filter = log_filter(true, Some("warn"));
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::DEBUG));

        let filter = log_filter(false, Some("warn"));
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::WARN));

        let filter = log_filter(false, None);
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::INFO));
    }
}
