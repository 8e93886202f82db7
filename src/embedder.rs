//! Text embedding with role-specific prefixes.
//!
//! Backends only turn strings into raw vectors. [`Embedder`] owns the
//! contract callers depend on: the `query: ` / `passage: ` prefix for
//! asymmetric retrieval, batching, positional alignment, and unit length.

use rayon::prelude::*;
use reqwest::blocking::Client as HttpClient;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::debug;

use crate::config::{EmbeddingBackendKind, Number, Settings};
use crate::error::{KbError, Result};
use crate::vector_ops::normalize_vector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedRole {
    Query,
    Passage,
}

impl EmbedRole {
    pub fn prefix(self) -> &'static str {
        match self {
            EmbedRole::Query => "query: ",
            EmbedRole::Passage => "passage: ",
        }
    }
}

pub trait EmbeddingBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Must return one vector per input, in input order.
    fn encode(&self, texts: &[String]) -> Result<Vec<Vec<Number>>>;
}

pub struct Embedder {
    backend: Box<dyn EmbeddingBackend>,
    batch_size: usize,
}

impl Embedder {
    pub fn new(backend: Box<dyn EmbeddingBackend>, batch_size: usize) -> Self {
        Self {
            backend,
            batch_size: batch_size.max(1),
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let backend: Box<dyn EmbeddingBackend> = match settings.embedding_backend {
            EmbeddingBackendKind::Hash => Box::new(HashEmbedder::new(settings.embedding_dimensions)),
            EmbeddingBackendKind::Http => {
                let url = settings.embedding_url.as_deref().ok_or_else(|| {
                    KbError::InvalidInput("embedding_url is required for the http backend".into())
                })?;
                Box::new(HttpEmbedder::new(
                    url,
                    settings.embedding_model.as_deref().unwrap_or("text-embedding-3-small"),
                    settings.embedding_api_key.as_deref(),
                )?)
            }
        };
        Ok(Self::new(backend, settings.embedding_batch_size))
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn embed(&self, texts: &[String], role: EmbedRole) -> Result<Vec<Vec<Number>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let prefixed: Vec<String> = batch
                .iter()
                .map(|text| format!("{}{}", role.prefix(), text))
                .collect();
            let encoded = self.backend.encode(&prefixed)?;
            if encoded.len() != batch.len() {
                return Err(KbError::Embedding(format!(
                    "backend '{}' returned {} vectors for {} texts",
                    self.backend.name(),
                    encoded.len(),
                    batch.len()
                )));
            }
            vectors.extend(encoded);
        }

        for vector in vectors.iter_mut() {
            if !normalize_vector(vector) {
                return Err(KbError::Embedding(
                    "backend produced a zero-length vector".into(),
                ));
            }
        }

        debug!(
            "Embedded {} {:?} texts with '{}'",
            vectors.len(),
            role,
            self.backend.name()
        );
        Ok(vectors)
    }

    pub fn embed_one(&self, text: &str, role: EmbedRole) -> Result<Vec<Number>> {
        self.embed(&[text.to_string()], role)?
            .pop()
            .ok_or_else(|| KbError::Embedding("no vector returned".into()))
    }
}

/// Deterministic feature-hashing embedder. Needs no model, so the tool works
/// offline; retrieval quality is lexical rather than semantic.
pub struct HashEmbedder {
    dimensions: usize,
    seed: u64,
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
            seed: 0x5eed,
        }
    }

    fn embed_text(&self, text: &str) -> Vec<Number> {
        let mut vector = vec![0.0; self.dimensions];
        let tokens: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
            .collect();

        for token in &tokens {
            self.accumulate(&mut vector, token.as_bytes(), 1.0);
        }
        for pair in tokens.windows(2) {
            let bigram = format!("{} {}", pair[0], pair[1]);
            self.accumulate(&mut vector, bigram.as_bytes(), 0.5);
        }
        vector
    }

    fn accumulate(&self, vector: &mut [Number], feature: &[u8], weight: Number) {
        let mut hasher = Sha256::new();
        hasher.update(self.seed.to_le_bytes());
        hasher.update(feature);
        let digest = hasher.finalize();

        let mut slot = [0u8; 8];
        slot.copy_from_slice(&digest[..8]);
        let index = (u64::from_le_bytes(slot) % self.dimensions as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[index] += sign * weight;
    }
}

impl EmbeddingBackend for HashEmbedder {
    fn name(&self) -> &str {
        "hash"
    }

    fn encode(&self, texts: &[String]) -> Result<Vec<Vec<Number>>> {
        Ok(texts.par_iter().map(|text| self.embed_text(text)).collect())
    }
}

/// Client for an OpenAI-compatible `/embeddings` endpoint.
pub struct HttpEmbedder {
    client: HttpClient,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpEmbedder {
    pub fn new(base_url: &str, model: &str, api_key: Option<&str>) -> Result<Self> {
        let client = HttpClient::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.map(str::to_string),
        })
    }
}

impl EmbeddingBackend for HttpEmbedder {
    fn name(&self) -> &str {
        &self.model
    }

    fn encode(&self, texts: &[String]) -> Result<Vec<Vec<Number>>> {
        #[derive(Serialize)]
        struct Request<'a> {
            model: &'a str,
            input: &'a [String],
        }

        #[derive(Deserialize)]
        struct Response {
            data: Vec<ResponseItem>,
        }

        #[derive(Deserialize)]
        struct ResponseItem {
            #[serde(default)]
            index: usize,
            embedding: Vec<f64>,
        }

        let url = format!("{}/embeddings", self.base_url);
        let mut request = self.client.post(url).json(&Request {
            model: &self.model,
            input: texts,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send()?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(KbError::Embedding(format!(
                "embedding request failed ({}): {}",
                status, body
            )));
        }

        let mut body: Response = response.json()?;
        body.data.sort_by_key(|item| item.index);
        Ok(body
            .data
            .into_iter()
            .map(|item| item.embedding.into_iter().map(|v| v as Number).collect())
            .collect())
    }
}
