//! Retrieval and knowledge-base maintenance for question answering over PDF
//! collections.
//!
//! Documents are split into word-count chunks tagged with file and page,
//! embedded, and appended to a [`KnowledgeStore`]: a flat vector index and a
//! metadata sequence that never fall out of positional alignment. Queries
//! are answered by exact nearest-neighbour search, and [`filter_sources`]
//! narrows the retrieved chunks to the citations a generated answer relies on.

pub mod chunker;
pub mod config;
pub mod database;
pub mod embedder;
pub mod engine;
pub mod error;
pub mod extract;
pub mod generator;
pub mod ingest;
pub mod models;
pub mod search;
pub mod source_filter;
pub mod vector_ops;

pub use config::Settings;
pub use database::{KnowledgeStats, KnowledgeStore, StoreFiles};
pub use embedder::{EmbedRole, Embedder};
pub use engine::{Answer, KnowledgeBase};
pub use error::{KbError, Result};
pub use models::{Chunk, Citation, Page, RetrievalResult, ScoredChunk};
pub use search::Retriever;
pub use source_filter::filter_sources;
