use std::fs;
use std::sync::Arc;
use std::thread;

use docrag::config::{Freshness, DECLINE_MESSAGE};
use docrag::embedder::HashEmbedder;
use docrag::extract::PageExtractor;
use docrag::generator::Generator;
use docrag::{
    filter_sources, Chunk, Citation, Embedder, KbError, KnowledgeBase, KnowledgeStore, Page,
    Result, Settings, StoreFiles,
};
use tempfile::TempDir;

/// Plain-text "PDFs": pages separated by form feeds.
struct TextExtractor;

impl PageExtractor for TextExtractor {
    fn extract(&self, document_name: &str, bytes: &[u8]) -> Result<Vec<Page>> {
        let text = std::str::from_utf8(bytes).map_err(|e| KbError::Extraction {
            document: document_name.to_string(),
            reason: e.to_string(),
        })?;
        Ok(text
            .split('\u{c}')
            .enumerate()
            .map(|(i, page)| Page::new(i as u32 + 1, page))
            .collect())
    }
}

struct FixedAnswer(String);

impl Generator for FixedAnswer {
    fn name(&self) -> &str {
        "fixed"
    }

    fn generate(&self, _question: &str, _context: &[Chunk]) -> Result<String> {
        Ok(self.0.clone())
    }
}

fn knowledge_base(root: &TempDir, freshness: Freshness, answer: &str) -> KnowledgeBase {
    let settings = Settings {
        store_path: root.path().join("vectorstore"),
        chunk_words: 6,
        freshness,
        ..Settings::default()
    };
    KnowledgeBase::new(
        settings,
        Embedder::new(Box::new(HashEmbedder::new(96)), 4),
        Box::new(FixedAnswer(answer.to_string())),
        Box::new(TextExtractor),
    )
}

fn write_docs(dir: &std::path::Path, docs: &[(&str, &str)]) {
    fs::create_dir_all(dir).unwrap();
    for (name, contents) in docs {
        fs::write(dir.join(name), contents).unwrap();
    }
}

#[test]
fn store_stays_aligned_across_reloads() {
    let root = TempDir::new().unwrap();
    let kb = knowledge_base(&root, Freshness::Reload, "unused");

    kb.upload("vat.pdf", &[Page::new(1, "value added tax on supplied goods")])
        .unwrap();
    kb.upload(
        "customs.pdf",
        &[
            Page::new(1, "import duty charged at the border"),
            Page::new(2, "bonded warehouses defer payment"),
        ],
    )
    .unwrap();

    let store = KnowledgeStore::load(StoreFiles::new(root.path().join("vectorstore"))).unwrap();
    assert_eq!(store.vector_count(), store.len());
    assert_eq!(store.len(), 3);
    assert_eq!(store.chunks()[0].source, "vat.pdf");
    assert_eq!(store.chunks()[2].page, 2);

    let first = store.vector(0).unwrap().to_vec();
    let results = store.search(&first, 1).unwrap();
    assert_eq!(results[0].chunk.source, "vat.pdf");
    assert!(results[0].distance.abs() < 1e-4);
}

#[test]
fn ask_after_bulk_ingest() {
    let root = TempDir::new().unwrap();
    let pdfs = root.path().join("pdfs");
    write_docs(
        &pdfs,
        &[
            ("income_tax.pdf", "companies pay income tax on profits\u{c}losses carry forward five years"),
            ("Excise-Duty.PDF", "excise duty applies to fuel and tobacco"),
            ("notes.txt", "not a document"),
        ],
    );
    let kb = knowledge_base(
        &root,
        Freshness::Cached,
        "Per the income tax guide, losses carry forward for five years.",
    );

    let report = kb.ingest_directory(&pdfs).unwrap();
    assert_eq!(report.ingested.len(), 2);
    assert!(report.failed.is_empty());

    let stats = kb.stats().unwrap();
    assert_eq!(stats.total_pdfs, 2);
    assert_eq!(stats.pdf_files, vec!["Excise-Duty.PDF", "income_tax.pdf"]);

    let answer = kb.ask_with_k("how long do losses carry forward", 10).unwrap();
    assert_eq!(answer.sources.len(), 2);
    assert!(answer.sources.iter().all(|c| c.file == "income_tax.pdf"));

    let again = kb.ingest_directory(&pdfs).unwrap();
    assert!(again.ingested.is_empty());
    assert_eq!(again.skipped.len(), 2);
    assert_eq!(kb.stats().unwrap().total_chunks, stats.total_chunks);
}

#[test]
fn rebuild_replaces_the_store() {
    let root = TempDir::new().unwrap();
    let pdfs = root.path().join("pdfs");
    write_docs(&pdfs, &[("a.pdf", "alpha beta gamma")]);
    let kb = knowledge_base(&root, Freshness::Cached, "unused");

    kb.upload("stale.pdf", &[Page::new(1, "old content")]).unwrap();
    let report = kb.rebuild(&pdfs).unwrap();
    assert_eq!(report.chunks_added(), 1);

    let stats = kb.stats().unwrap();
    assert_eq!(stats.pdf_files, vec!["a.pdf"]);
    assert_eq!(kb.retrieve("alpha", 5).unwrap().len(), 1);
}

#[test]
fn duplicate_and_empty_cases() {
    let root = TempDir::new().unwrap();
    let kb = knowledge_base(&root, Freshness::Reload, "unused");

    let answer = kb.ask("anything at all").unwrap();
    assert_eq!(answer.answer, DECLINE_MESSAGE);
    assert!(answer.sources.is_empty());

    kb.upload("X.pdf", &[Page::new(1, "first version")]).unwrap();
    let err = kb.upload("X.pdf", &[Page::new(1, "second version")]).unwrap_err();
    assert!(matches!(err, KbError::DuplicateDocument(name) if name == "X.pdf"));
    assert_eq!(kb.stats().unwrap().total_chunks, 1);

    assert_eq!(kb.upload("blank.pdf", &[Page::new(1, "   ")]).unwrap(), 0);
    assert_eq!(kb.stats().unwrap().total_pdfs, 1);
}

#[test]
fn concurrent_uploads_are_serialized() {
    let root = TempDir::new().unwrap();
    let kb = Arc::new(knowledge_base(&root, Freshness::Cached, "unused"));

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let kb = Arc::clone(&kb);
            thread::spawn(move || {
                let name = format!("doc{}.pdf", i);
                kb.upload(&name, &[Page::new(1, format!("document number {} text", i))])
                    .unwrap()
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), 1);
    }

    let stats = kb.stats().unwrap();
    assert_eq!(stats.total_chunks, 4);
    assert_eq!(stats.total_pdfs, 4);
    assert_eq!(kb.retrieve("document", 10).unwrap().len(), 4);
}

#[test]
fn filter_sources_on_retrieved_chunks() {
    let root = TempDir::new().unwrap();
    let kb = knowledge_base(&root, Freshness::Reload, "unused");
    kb.upload("A.pdf", &[Page::new(2, "rates for resident companies")]).unwrap();
    kb.upload("B.pdf", &[Page::new(5, "rates for individuals")]).unwrap();

    let retrieved = kb.retrieve("rates", 10).unwrap();
    let cited = filter_sources("As stated in B.pdf, individuals pay less.", &retrieved);
    assert_eq!(
        cited,
        vec![Citation {
            file: "B.pdf".into(),
            page: 5
        }]
    );

    let fallback = filter_sources("Rates vary.", &retrieved);
    assert_eq!(fallback.len(), 2);
}
