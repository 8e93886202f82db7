use tracing::debug;

use crate::database::KnowledgeStore;
use crate::embedder::{EmbedRole, Embedder};
use crate::error::{KbError, Result};
use crate::models::RetrievalResult;

pub struct Retriever<'a> {
    embedder: &'a Embedder,
}

impl<'a> Retriever<'a> {
    pub fn new(embedder: &'a Embedder) -> Self {
        Self { embedder }
    }

    /// Up to `k` nearest chunks, nearest first. No relevance cut-off is
    /// applied; an empty store is an error rather than an empty result.
    pub fn retrieve(
        &self,
        store: &KnowledgeStore,
        question: &str,
        k: usize,
    ) -> Result<RetrievalResult> {
        let question = question.trim();
        if question.is_empty() {
            return Err(KbError::InvalidInput("question must not be empty".into()));
        }
        if k == 0 {
            return Err(KbError::InvalidInput("k must be greater than 0".into()));
        }
        if store.is_empty() {
            return Err(KbError::EmptyStore);
        }

        let query_vector = self.embedder.embed_one(question, EmbedRole::Query)?;
        let results = store.search(&query_vector, k)?;

        debug!(
            "Retrieved {} of {} requested chunks; distances: {:?}",
            results.len(),
            k,
            results.iter().map(|r| r.distance).collect::<Vec<_>>()
        );
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::StoreFiles;
    use crate::embedder::HashEmbedder;
    use crate::models::Chunk;
    use tempfile::TempDir;

    fn embedder() -> Embedder {
        Embedder::new(Box::new(HashEmbedder::new(128)), 16)
    }

    #[test]
    fn empty_store_is_reported() {
        let dir = TempDir::new().unwrap();
        let store = KnowledgeStore::load(StoreFiles::new(dir.path())).unwrap();
        let embedder = embedder();
        let retriever = Retriever::new(&embedder);
        assert!(matches!(
            retriever.retrieve(&store, "anything", 5),
            Err(KbError::EmptyStore)
        ));
    }

    #[test]
    fn rejects_blank_question_and_zero_k() {
        let dir = TempDir::new().unwrap();
        let store = KnowledgeStore::load(StoreFiles::new(dir.path())).unwrap();
        let embedder = embedder();
        let retriever = Retriever::new(&embedder);
        assert!(matches!(
            retriever.retrieve(&store, "   ", 5),
            Err(KbError::InvalidInput(_))
        ));
        assert!(matches!(
            retriever.retrieve(&store, "q", 0),
            Err(KbError::InvalidInput(_))
        ));
    }

    #[test]
    fn most_similar_passage_ranks_first() {
        let dir = TempDir::new().unwrap();
        let mut store = KnowledgeStore::load(StoreFiles::new(dir.path())).unwrap();
        let embedder = embedder();
        let texts = vec![
            "corporate income tax rate for companies is thirty percent".to_string(),
            "value added tax registration threshold".to_string(),
            "social security contribution levy exemptions".to_string(),
        ];
        let vectors = embedder.embed(&texts, EmbedRole::Passage).unwrap();
        let chunks = texts
            .iter()
            .enumerate()
            .map(|(i, t)| Chunk {
                text: t.clone(),
                source: "guide.pdf".into(),
                page: i as u32 + 1,
            })
            .collect();
        store.append(vectors, chunks).unwrap();

        let results = Retriever::new(&embedder)
            .retrieve(&store, "corporate income tax rate", 2)
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk.page, 1);
        assert!(results[0].distance <= results[1].distance);
    }
}
