use lopdf::Document;
use tracing::debug;

use crate::error::{KbError, Result};
use crate::models::Page;

/// Turns a document into ordered, 1-based page texts.
pub trait PageExtractor: Send + Sync {
    fn extract(&self, document_name: &str, bytes: &[u8]) -> Result<Vec<Page>>;
}

/// Text-layer extraction for text-native PDFs. No OCR: scanned pages come
/// back empty and simply yield no chunks.
#[derive(Debug, Default, Clone, Copy)]
pub struct PdfExtractor;

impl PdfExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl PageExtractor for PdfExtractor {
    fn extract(&self, document_name: &str, bytes: &[u8]) -> Result<Vec<Page>> {
        let failed = |reason: String| KbError::Extraction {
            document: document_name.to_string(),
            reason,
        };

        let doc = Document::load_mem(bytes).map_err(|e| failed(format!("failed to load PDF: {}", e)))?;

        // Any unreadable page fails the whole document; no partial ingest.
        let mut pages = Vec::new();
        for page_number in doc.get_pages().keys().copied() {
            let text = doc
                .extract_text(&[page_number])
                .map_err(|e| failed(format!("page {}: {}", page_number, e)))?;
            pages.push(Page::new(page_number, text.trim()));
        }

        debug!("Extracted {} pages from '{}'", pages.len(), document_name);
        Ok(pages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_bytes_are_an_extraction_error() {
        let result = PdfExtractor::new().extract("broken.pdf", b"definitely not a pdf");
        match result {
            Err(KbError::Extraction { document, .. }) => assert_eq!(document, "broken.pdf"),
            other => panic!("expected extraction error, got {:?}", other.map(|p| p.len())),
        }
    }
}
