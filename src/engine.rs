//! The surface handed to front ends: `ask`, `upload`, `stats`, plus the bulk
//! and rebuild maintenance operations.
//!
//! Writers are serialized by a mutex on the knowledge base and always start
//! from a fresh load of the persisted store. Readers either reload per query
//! or share a cached snapshot that every successful write replaces,
//! depending on [`Freshness`].

use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info};

use crate::config::{Freshness, Settings, DECLINE_MESSAGE};
use crate::database::{KnowledgeStats, KnowledgeStore, StoreFiles};
use crate::embedder::Embedder;
use crate::error::{KbError, Result};
use crate::extract::{PageExtractor, PdfExtractor};
use crate::generator::{self, build_context, finalize_answer, Generator};
use crate::ingest::{self, BulkReport, IngestOptions};
use crate::models::{Citation, Page, RetrievalResult};
use crate::search::Retriever;
use crate::source_filter::filter_sources_with_fallback;

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub question: String,
    pub answer: String,
    pub sources: Vec<Citation>,
}

pub struct KnowledgeBase {
    settings: Settings,
    files: StoreFiles,
    embedder: Embedder,
    generator: Box<dyn Generator>,
    extractor: Box<dyn PageExtractor>,
    cache: RwLock<ReaderCache>,
    writer: Mutex<()>,
}

/// Shared snapshot for cached readers. `generation` advances on every
/// publish, so a reader that loaded before a commit cannot install its
/// older copy over the newer one.
#[derive(Default)]
struct ReaderCache {
    generation: u64,
    store: Option<Arc<KnowledgeStore>>,
}

impl KnowledgeBase {
    pub fn new(
        settings: Settings,
        embedder: Embedder,
        generator: Box<dyn Generator>,
        extractor: Box<dyn PageExtractor>,
    ) -> Self {
        let files = StoreFiles::new(&settings.store_path);
        Self {
            settings,
            files,
            embedder,
            generator,
            extractor,
            cache: RwLock::new(ReaderCache::default()),
            writer: Mutex::new(()),
        }
    }

    pub fn from_settings(settings: Settings) -> Result<Self> {
        settings.validate()?;
        let embedder = Embedder::from_settings(&settings)?;
        let generator = generator::from_settings(&settings)?;
        info!(
            "Knowledge base at '{}' (embedding: {}, generation: {}, freshness: {})",
            settings.store_path.display(),
            embedder.backend_name(),
            generator.name(),
            settings.freshness
        );
        Ok(Self::new(settings, embedder, generator, Box::new(PdfExtractor::new())))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn options(&self) -> IngestOptions {
        IngestOptions::from(&self.settings)
    }

    fn snapshot(&self) -> Result<Arc<KnowledgeStore>> {
        if self.settings.freshness == Freshness::Reload {
            return Ok(Arc::new(KnowledgeStore::load(self.files.clone())?));
        }

        let generation = {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some(store) = cache.store.as_ref() {
                return Ok(Arc::clone(store));
            }
            cache.generation
        };
        let store = Arc::new(KnowledgeStore::load(self.files.clone())?);
        Ok(self.install(generation, store))
    }

    /// Caches `store` unless a commit was published after `generation` was
    /// read, in which case the published store wins.
    fn install(&self, generation: u64, store: Arc<KnowledgeStore>) -> Arc<KnowledgeStore> {
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        if cache.generation != generation {
            if let Some(current) = cache.store.as_ref() {
                debug!("Discarding a snapshot loaded before the latest commit");
                return Arc::clone(current);
            }
        }
        cache.store = Some(Arc::clone(&store));
        store
    }

    /// Makes a committed store visible to cached readers.
    fn publish(&self, store: KnowledgeStore) {
        if self.settings.freshness == Freshness::Cached {
            let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
            cache.generation += 1;
            cache.store = Some(Arc::new(store));
            debug!("Reader cache refreshed after commit");
        }
    }

    fn write<T>(&self, op: impl FnOnce(&mut KnowledgeStore) -> Result<T>) -> Result<T> {
        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let mut store = KnowledgeStore::load(self.files.clone())?;
        let before = store.len();
        // Bulk ingestion commits per document, so a later failure can still
        // leave earlier commits to publish.
        let result = op(&mut store);
        if store.len() != before {
            self.publish(store);
        }
        result
    }

    pub fn retrieve(&self, question: &str, k: usize) -> Result<RetrievalResult> {
        let store = self.snapshot()?;
        Retriever::new(&self.embedder).retrieve(&store, question, k)
    }

    pub fn ask(&self, question: &str) -> Result<Answer> {
        self.ask_with_k(question, self.settings.top_k)
    }

    /// An empty store produces the decline message instead of an error.
    pub fn ask_with_k(&self, question: &str, k: usize) -> Result<Answer> {
        let retrieved = match self.retrieve(question, k) {
            Err(KbError::EmptyStore) => {
                info!("Question asked against an empty knowledge base");
                return Ok(Answer {
                    question: question.to_string(),
                    answer: DECLINE_MESSAGE.to_string(),
                    sources: Vec::new(),
                });
            }
            result => result?,
        };

        let context = build_context(&retrieved, self.settings.max_context_words);
        debug!(
            "Generating with {} context chunks via '{}'",
            context.len(),
            self.generator.name()
        );
        let raw = self.generator.generate(question, &context)?;
        let answer = finalize_answer(&raw, self.settings.min_answer_chars);
        let sources =
            filter_sources_with_fallback(&answer, &retrieved, self.settings.fallback_citations);

        Ok(Answer {
            question: question.to_string(),
            answer,
            sources,
        })
    }

    pub fn upload(&self, document_name: &str, pages: &[Page]) -> Result<usize> {
        let options = self.options();
        self.write(|store| ingest::ingest(document_name, pages, store, &self.embedder, options))
    }

    /// Extracts the PDF first; an unreadable file commits nothing.
    pub fn upload_pdf(&self, document_name: &str, bytes: &[u8]) -> Result<usize> {
        let pages = self.extractor.extract(document_name, bytes)?;
        self.upload(document_name, &pages)
    }

    pub fn ingest_directory(&self, dir: &Path) -> Result<BulkReport> {
        let options = self.options();
        self.write(|store| {
            ingest::ingest_directory(dir, store, &self.embedder, self.extractor.as_ref(), options)
        })
    }

    pub fn rebuild(&self, dir: &Path) -> Result<BulkReport> {
        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let (store, report) = ingest::rebuild(
            dir,
            &self.files,
            &self.embedder,
            self.extractor.as_ref(),
            self.options(),
        )?;
        self.publish(store);
        Ok(report)
    }

    pub fn stats(&self) -> Result<KnowledgeStats> {
        KnowledgeStore::read_stats(&self.files)
    }
}
