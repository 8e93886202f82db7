use crate::config::Number;
use serde::{Deserialize, Serialize};

/// Extracted text of one PDF page; `number` is 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub number: u32,
    pub text: String,
}

impl Page {
    pub fn new(number: u32, text: impl Into<String>) -> Self {
        Self {
            number,
            text: text.into(),
        }
    }
}

/// A retrievable span of document text with its provenance.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Chunk {
    pub text: String,
    pub source: String,
    pub page: u32,
}

/// A chunk paired with its squared Euclidean distance to the query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub distance: Number,
}

/// Nearest-first; never longer than the requested k.
pub type RetrievalResult = Vec<ScoredChunk>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Citation {
    pub file: String,
    pub page: u32,
}

impl From<&Chunk> for Citation {
    fn from(chunk: &Chunk) -> Self {
        Self {
            file: chunk.source.clone(),
            page: chunk.page,
        }
    }
}
