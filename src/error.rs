use thiserror::Error;

#[derive(Error, Debug)]
pub enum KbError {
    #[error("knowledge base is empty; ingest at least one document first")]
    EmptyStore,

    #[error("document '{0}' is already indexed")]
    DuplicateDocument(String),

    #[error("knowledge store is corrupt: {0}")]
    CorruptStore(String),

    #[error("could not extract text from '{document}': {reason}")]
    Extraction { document: String, reason: String },

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, KbError>;
