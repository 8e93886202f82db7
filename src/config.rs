use config::{Config, ConfigError, Environment, File as ConfigFile};
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{KbError, Result};

pub type Number = f32;

pub const EPSILON: f32 = 1e-6;

/// Answer returned whenever the corpus cannot support a response.
pub const DECLINE_MESSAGE: &str = "I don't know based on the provided documents.";

/// How the chunker treats page breaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagePolicy {
    /// Every page boundary ends a chunk.
    Hard,
    /// Words flow across pages; a chunk is cited by the page it starts on.
    Spanning,
}

/// Whether retrieval reloads the persisted store or keeps it in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Reload,
    Cached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingBackendKind {
    Hash,
    Http,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationBackendKind {
    Extractive,
    Http,
}

macro_rules! impl_setting_enum {
    ($ty:ty, $key:literal, { $($text:literal => $variant:path),+ $(,)? }) => {
        impl FromStr for $ty {
            type Err = KbError;

            fn from_str(s: &str) -> Result<Self> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok($variant),)+
                    other => Err(KbError::InvalidInput(format!(
                        "unknown {} '{}'",
                        $key, other
                    ))),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let text = match self {
                    $($variant => $text,)+
                };
                f.write_str(text)
            }
        }
    };
}

impl_setting_enum!(PagePolicy, "page_boundaries", {
    "hard" => PagePolicy::Hard,
    "spanning" => PagePolicy::Spanning,
});

impl_setting_enum!(Freshness, "freshness", {
    "reload" => Freshness::Reload,
    "cached" => Freshness::Cached,
});

impl_setting_enum!(EmbeddingBackendKind, "embedding_backend", {
    "hash" => EmbeddingBackendKind::Hash,
    "http" => EmbeddingBackendKind::Http,
});

impl_setting_enum!(GenerationBackendKind, "generation_backend", {
    "extractive" => GenerationBackendKind::Extractive,
    "http" => GenerationBackendKind::Http,
});

#[derive(Deserialize)]
pub struct DocragConfig {
    pub store_path: Option<String>,
    pub source_dir: Option<String>,
    pub chunk_words: Option<usize>,
    pub page_boundaries: Option<String>,
    pub top_k: Option<usize>,
    pub fallback_citations: Option<usize>,
    pub freshness: Option<String>,
    pub embedding_backend: Option<String>,
    pub embedding_url: Option<String>,
    pub embedding_model: Option<String>,
    pub embedding_api_key: Option<String>,
    pub embedding_dimensions: Option<usize>,
    pub embedding_batch_size: Option<usize>,
    pub generation_backend: Option<String>,
    pub generation_url: Option<String>,
    pub generation_model: Option<String>,
    pub generation_api_key: Option<String>,
    pub max_context_words: Option<usize>,
    pub min_answer_chars: Option<usize>,
    pub verbose: Option<bool>,
}

impl DocragConfig {
    pub fn try_from(config: &Config) -> std::result::Result<Self, ConfigError> {
        Ok(DocragConfig {
            store_path: config.get("store_path").ok(),
            source_dir: config.get("source_dir").ok(),
            chunk_words: config.get("chunk_words").ok(),
            page_boundaries: config.get("page_boundaries").ok(),
            top_k: config.get("top_k").ok(),
            fallback_citations: config.get("fallback_citations").ok(),
            freshness: config.get("freshness").ok(),
            embedding_backend: config.get("embedding_backend").ok(),
            embedding_url: config.get("embedding_url").ok(),
            embedding_model: config.get("embedding_model").ok(),
            embedding_api_key: config.get("embedding_api_key").ok(),
            embedding_dimensions: config.get("embedding_dimensions").ok(),
            embedding_batch_size: config.get("embedding_batch_size").ok(),
            generation_backend: config.get("generation_backend").ok(),
            generation_url: config.get("generation_url").ok(),
            generation_model: config.get("generation_model").ok(),
            generation_api_key: config.get("generation_api_key").ok(),
            max_context_words: config.get("max_context_words").ok(),
            min_answer_chars: config.get("min_answer_chars").ok(),
            verbose: config.get("verbose").ok(),
        })
    }
}

/// Effective settings after layering file, environment and defaults.
#[derive(Debug, Clone)]
pub struct Settings {
    pub store_path: PathBuf,
    pub source_dir: PathBuf,
    /// Canonical `max_words` shared by bulk ingestion, upload and rebuild.
    pub chunk_words: usize,
    pub page_boundaries: PagePolicy,
    pub top_k: usize,
    pub fallback_citations: usize,
    pub freshness: Freshness,
    pub embedding_backend: EmbeddingBackendKind,
    pub embedding_url: Option<String>,
    pub embedding_model: Option<String>,
    pub embedding_api_key: Option<String>,
    pub embedding_dimensions: usize,
    pub embedding_batch_size: usize,
    pub generation_backend: GenerationBackendKind,
    pub generation_url: Option<String>,
    pub generation_model: Option<String>,
    pub generation_api_key: Option<String>,
    pub max_context_words: usize,
    pub min_answer_chars: usize,
    pub verbose: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("vectorstore"),
            source_dir: PathBuf::from("data/pdfs"),
            chunk_words: 200,
            page_boundaries: PagePolicy::Hard,
            top_k: 15,
            fallback_citations: 3,
            freshness: Freshness::Reload,
            embedding_backend: EmbeddingBackendKind::Hash,
            embedding_url: None,
            embedding_model: None,
            embedding_api_key: None,
            embedding_dimensions: 384,
            embedding_batch_size: 32,
            generation_backend: GenerationBackendKind::Extractive,
            generation_url: None,
            generation_model: None,
            generation_api_key: None,
            max_context_words: 400,
            min_answer_chars: 10,
            verbose: false,
        }
    }
}

impl Settings {
    /// Reads `docrag_config.*` from the working directory, then `DOCRAG_*`
    /// environment variables.
    pub fn load() -> anyhow::Result<Self> {
        let config = Config::builder()
            .add_source(ConfigFile::with_name("docrag_config").required(false))
            .add_source(Environment::with_prefix("DOCRAG"))
            .build()?;

        let settings = Self::from_config(DocragConfig::try_from(&config)?)?;
        Ok(settings)
    }

    pub fn from_config(raw: DocragConfig) -> Result<Self> {
        let defaults = Settings::default();

        let settings = Self {
            store_path: raw.store_path.map(PathBuf::from).unwrap_or(defaults.store_path),
            source_dir: raw.source_dir.map(PathBuf::from).unwrap_or(defaults.source_dir),
            chunk_words: raw.chunk_words.unwrap_or(defaults.chunk_words),
            page_boundaries: parse_or(raw.page_boundaries, defaults.page_boundaries)?,
            top_k: raw.top_k.unwrap_or(defaults.top_k),
            fallback_citations: raw.fallback_citations.unwrap_or(defaults.fallback_citations),
            freshness: parse_or(raw.freshness, defaults.freshness)?,
            embedding_backend: parse_or(raw.embedding_backend, defaults.embedding_backend)?,
            embedding_url: raw.embedding_url,
            embedding_model: raw.embedding_model,
            embedding_api_key: raw.embedding_api_key,
            embedding_dimensions: raw
                .embedding_dimensions
                .unwrap_or(defaults.embedding_dimensions),
            embedding_batch_size: raw
                .embedding_batch_size
                .unwrap_or(defaults.embedding_batch_size),
            generation_backend: parse_or(raw.generation_backend, defaults.generation_backend)?,
            generation_url: raw.generation_url,
            generation_model: raw.generation_model,
            generation_api_key: raw.generation_api_key,
            max_context_words: raw.max_context_words.unwrap_or(defaults.max_context_words),
            min_answer_chars: raw.min_answer_chars.unwrap_or(defaults.min_answer_chars),
            verbose: raw.verbose.unwrap_or(defaults.verbose),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_words == 0 {
            return Err(KbError::InvalidInput("chunk_words must be greater than 0".into()));
        }
        if self.top_k == 0 {
            return Err(KbError::InvalidInput("top_k must be greater than 0".into()));
        }
        if self.embedding_dimensions == 0 {
            return Err(KbError::InvalidInput(
                "embedding_dimensions must be greater than 0".into(),
            ));
        }
        if self.embedding_batch_size == 0 {
            return Err(KbError::InvalidInput(
                "embedding_batch_size must be greater than 0".into(),
            ));
        }
        if self.embedding_backend == EmbeddingBackendKind::Http && self.embedding_url.is_none() {
            return Err(KbError::InvalidInput(
                "embedding_backend=http requires embedding_url".into(),
            ));
        }
        if self.generation_backend == GenerationBackendKind::Http && self.generation_url.is_none()
        {
            return Err(KbError::InvalidInput(
                "generation_backend=http requires generation_url".into(),
            ));
        }
        Ok(())
    }

    pub fn print_config(&self) {
        println!("store_path={}", self.store_path.display());
        println!("source_dir={}", self.source_dir.display());
        println!("chunk_words={}", self.chunk_words);
        println!("page_boundaries={}", self.page_boundaries);
        println!("top_k={}", self.top_k);
        println!("fallback_citations={}", self.fallback_citations);
        println!("freshness={}", self.freshness);
        println!("embedding_backend={}", self.embedding_backend);
        println!("embedding_url={}", self.embedding_url.as_deref().unwrap_or(""));
        println!("embedding_model={}", self.embedding_model.as_deref().unwrap_or(""));
        println!("embedding_dimensions={}", self.embedding_dimensions);
        println!("embedding_batch_size={}", self.embedding_batch_size);
        println!("generation_backend={}", self.generation_backend);
        println!("generation_url={}", self.generation_url.as_deref().unwrap_or(""));
        println!("generation_model={}", self.generation_model.as_deref().unwrap_or(""));
        println!("max_context_words={}", self.max_context_words);
        println!("min_answer_chars={}", self.min_answer_chars);
    }
}

fn parse_or<T: FromStr<Err = KbError>>(value: Option<String>, default: T) -> Result<T> {
    value.map(|v| v.parse()).transpose().map(|v| v.unwrap_or(default))
}
