use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::chunker;
use crate::config::{Number, PagePolicy, Settings};
use crate::database::{KnowledgeStore, StoreFiles};
use crate::embedder::{EmbedRole, Embedder};
use crate::error::{KbError, Result};
use crate::extract::PageExtractor;
use crate::models::{Chunk, Page};

/// Chunking parameters shared by every ingestion entry point.
#[derive(Debug, Clone, Copy)]
pub struct IngestOptions {
    pub chunk_words: usize,
    pub page_policy: PagePolicy,
}

impl From<&Settings> for IngestOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            chunk_words: settings.chunk_words,
            page_policy: settings.page_boundaries,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestedDocument {
    pub name: String,
    pub chunks: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedDocument {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct BulkReport {
    pub ingested: Vec<IngestedDocument>,
    pub skipped: Vec<String>,
    pub failed: Vec<FailedDocument>,
}

impl BulkReport {
    pub fn chunks_added(&self) -> usize {
        self.ingested.iter().map(|d| d.chunks).sum()
    }
}

/// Chunks, embeds and appends one document. The file name is the only
/// duplicate key; an already-indexed name is rejected with the store
/// untouched. A document with no text adds nothing and is not an error.
pub fn ingest(
    document_name: &str,
    pages: &[Page],
    store: &mut KnowledgeStore,
    embedder: &Embedder,
    options: IngestOptions,
) -> Result<usize> {
    let start = Instant::now();
    let Some((vectors, chunks)) = prepare(document_name, pages, store, embedder, options)? else {
        return Ok(0);
    };
    let added = store.append(vectors, chunks)?;
    info!(
        "Ingested '{}': {} chunks in {:?}",
        document_name,
        added,
        start.elapsed()
    );
    Ok(added)
}

fn prepare(
    document_name: &str,
    pages: &[Page],
    store: &KnowledgeStore,
    embedder: &Embedder,
    options: IngestOptions,
) -> Result<Option<(Vec<Vec<Number>>, Vec<Chunk>)>> {
    if document_name.trim().is_empty() {
        return Err(KbError::InvalidInput("document name must not be empty".into()));
    }
    if store.contains_document(document_name) {
        return Err(KbError::DuplicateDocument(document_name.to_string()));
    }

    let chunks = chunker::chunk(document_name, pages, options.chunk_words, options.page_policy)?;
    if chunks.is_empty() {
        info!("'{}' contains no extractable text, nothing to add", document_name);
        return Ok(None);
    }

    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let vectors = embedder.embed(&texts, EmbedRole::Passage)?;
    Ok(Some((vectors, chunks)))
}

/// PDFs under `dir`, sorted by path so bulk loads are reproducible.
pub fn list_pdfs(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(KbError::InvalidInput(format!(
            "'{}' is not a directory",
            dir.display()
        )));
    }
    let mut paths: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            p.extension()
                .and_then(|ext| ext.to_str())
                .map_or(false, |ext| ext.eq_ignore_ascii_case("pdf"))
        })
        .collect();
    paths.sort();
    Ok(paths)
}

fn read_document(path: &Path, extractor: &dyn PageExtractor) -> Result<(String, Vec<Page>)> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| KbError::InvalidInput(format!("bad file name '{}'", path.display())))?
        .to_string();
    let bytes = fs::read(path).map_err(|e| KbError::Extraction {
        document: name.clone(),
        reason: e.to_string(),
    })?;
    let pages = extractor.extract(&name, &bytes)?;
    Ok((name, pages))
}

/// Ingests every PDF in `dir` that is not already indexed. Each document is
/// committed on its own; one that cannot be read is reported and skipped.
pub fn ingest_directory(
    dir: &Path,
    store: &mut KnowledgeStore,
    embedder: &Embedder,
    extractor: &dyn PageExtractor,
    options: IngestOptions,
) -> Result<BulkReport> {
    let mut report = BulkReport::default();

    for path in list_pdfs(dir)? {
        let outcome = read_document(&path, extractor)
            .and_then(|(name, pages)| {
                ingest(&name, &pages, store, embedder, options).map(|n| (name, n))
            });
        match outcome {
            Ok((name, chunks)) => report.ingested.push(IngestedDocument { name, chunks }),
            Err(KbError::DuplicateDocument(name)) => {
                info!("'{}' already indexed, skipping", name);
                report.skipped.push(name);
            }
            Err(KbError::Extraction { document, reason }) => {
                warn!("Skipping '{}': {}", document, reason);
                report.failed.push(FailedDocument {
                    name: document,
                    reason,
                });
            }
            Err(e) => return Err(e),
        }
    }

    info!(
        "Bulk ingest of '{}': {} documents, {} chunks, {} skipped, {} failed",
        dir.display(),
        report.ingested.len(),
        report.chunks_added(),
        report.skipped.len(),
        report.failed.len()
    );
    Ok(report)
}

/// Re-derives the whole store from the documents in `dir` and replaces the
/// persisted pair in a single commit. Nothing on disk changes if this fails.
pub fn rebuild(
    dir: &Path,
    files: &StoreFiles,
    embedder: &Embedder,
    extractor: &dyn PageExtractor,
    options: IngestOptions,
) -> Result<(KnowledgeStore, BulkReport)> {
    let start = Instant::now();
    let mut fresh = KnowledgeStore::empty(files.clone());
    let mut report = BulkReport::default();

    for path in list_pdfs(dir)? {
        let (name, pages) = match read_document(&path, extractor) {
            Ok(document) => document,
            Err(KbError::Extraction { document, reason }) => {
                warn!("Leaving '{}' out of rebuild: {}", document, reason);
                report.failed.push(FailedDocument {
                    name: document,
                    reason,
                });
                continue;
            }
            Err(e) => return Err(e),
        };

        match prepare(&name, &pages, &fresh, embedder, options) {
            Ok(Some((vectors, chunks))) => {
                let added = fresh.stage(vectors, chunks)?;
                report.ingested.push(IngestedDocument { name, chunks: added });
            }
            Ok(None) => report.ingested.push(IngestedDocument { name, chunks: 0 }),
            Err(KbError::DuplicateDocument(name)) => report.skipped.push(name),
            Err(e) => return Err(e),
        }
    }

    fresh.persist()?;
    info!(
        "Rebuilt store from '{}': {} chunks across {} documents in {:?}",
        dir.display(),
        fresh.len(),
        report.ingested.len(),
        start.elapsed()
    );
    Ok((fresh, report))
}
