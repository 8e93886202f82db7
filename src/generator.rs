//! The text-generation collaborator and the glue around it: context
//! budgeting, prompt layout and answer clean-up.

use reqwest::blocking::Client as HttpClient;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::{GenerationBackendKind, Settings, DECLINE_MESSAGE};
use crate::error::{KbError, Result};
use crate::models::{Chunk, ScoredChunk};

/// A trailing chunk is only cut to fit when at least this many words of
/// budget remain.
const MIN_PARTIAL_WORDS: usize = 50;

const EXTRACTIVE_ANSWER_WORDS: usize = 60;

pub trait Generator: Send + Sync {
    fn name(&self) -> &str;

    fn generate(&self, question: &str, context: &[Chunk]) -> Result<String>;
}

pub fn from_settings(settings: &Settings) -> Result<Box<dyn Generator>> {
    Ok(match settings.generation_backend {
        GenerationBackendKind::Extractive => Box::new(ExtractiveGenerator),
        GenerationBackendKind::Http => {
            let url = settings.generation_url.as_deref().ok_or_else(|| {
                KbError::InvalidInput("generation_url is required for the http backend".into())
            })?;
            Box::new(HttpGenerator::new(
                url,
                settings.generation_model.as_deref().unwrap_or("gpt-4o-mini"),
                settings.generation_api_key.as_deref(),
            )?)
        }
    })
}

/// Takes retrieved chunks in rank order until `max_words` is spent.
pub fn build_context(retrieved: &[ScoredChunk], max_words: usize) -> Vec<Chunk> {
    let mut context = Vec::new();
    let mut total_words = 0;

    for scored in retrieved {
        let words: Vec<&str> = scored.chunk.text.split_whitespace().collect();
        if total_words + words.len() > max_words {
            let remaining = max_words - total_words;
            if remaining > MIN_PARTIAL_WORDS {
                context.push(Chunk {
                    text: words[..remaining].join(" "),
                    ..scored.chunk.clone()
                });
            }
            break;
        }
        total_words += words.len();
        context.push(scored.chunk.clone());
    }
    context
}

pub fn build_prompt(question: &str, context: &[Chunk]) -> String {
    let passages = context
        .iter()
        .map(|c| format!("[{}, page {}]\n{}", c.source, c.page, c.text))
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "Answer the question using only the context below. \
         Name the document you relied on. If the context does not contain \
         the answer, reply exactly: \"{}\"\n\nContext:\n{}\n\nQuestion: {}\n\nAnswer:",
        DECLINE_MESSAGE, passages, question
    )
}

/// Replaces answers too short to be useful with the decline message.
pub fn finalize_answer(answer: &str, min_chars: usize) -> String {
    let answer = answer.trim();
    if answer.chars().count() < min_chars && !answer.to_lowercase().contains("don't know") {
        DECLINE_MESSAGE.to_string()
    } else {
        answer.to_string()
    }
}

/// Answers with the opening of the best passage, naming where it came from.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExtractiveGenerator;

impl Generator for ExtractiveGenerator {
    fn name(&self) -> &str {
        "extractive"
    }

    fn generate(&self, _question: &str, context: &[Chunk]) -> Result<String> {
        let Some(best) = context.first() else {
            return Ok(DECLINE_MESSAGE.to_string());
        };
        let excerpt = best
            .text
            .split_whitespace()
            .take(EXTRACTIVE_ANSWER_WORDS)
            .collect::<Vec<_>>()
            .join(" ");
        Ok(format!(
            "According to {} (page {}): {}",
            best.source, best.page, excerpt
        ))
    }
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
pub struct HttpGenerator {
    client: HttpClient,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpGenerator {
    pub fn new(base_url: &str, model: &str, api_key: Option<&str>) -> Result<Self> {
        let client = HttpClient::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.map(str::to_string),
        })
    }
}

impl Generator for HttpGenerator {
    fn name(&self) -> &str {
        &self.model
    }

    fn generate(&self, question: &str, context: &[Chunk]) -> Result<String> {
        #[derive(Serialize)]
        struct Message<'a> {
            role: &'a str,
            content: &'a str,
        }

        #[derive(Serialize)]
        struct Request<'a> {
            model: &'a str,
            messages: Vec<Message<'a>>,
            temperature: f32,
        }

        #[derive(Deserialize)]
        struct Response {
            choices: Vec<Choice>,
        }

        #[derive(Deserialize)]
        struct Choice {
            message: ResponseMessage,
        }

        #[derive(Deserialize)]
        struct ResponseMessage {
            content: String,
        }

        let prompt = build_prompt(question, context);
        let url = format!("{}/chat/completions", self.base_url);
        let mut request = self.client.post(url).json(&Request {
            model: &self.model,
            messages: vec![Message {
                role: "user",
                content: &prompt,
            }],
            temperature: 0.0,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send()?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(KbError::Generation(format!(
                "completion request failed ({}): {}",
                status, body
            )));
        }

        let body: Response = response.json()?;
        body.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| KbError::Generation("response contained no choices".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scored(source: &str, page: u32, words: usize) -> ScoredChunk {
        ScoredChunk {
            chunk: Chunk {
                text: vec!["word"; words].join(" "),
                source: source.to_string(),
                page,
            },
            distance: 0.0,
        }
    }

    #[test]
    fn context_respects_word_budget() {
        let retrieved = vec![scored("a.pdf", 1, 200), scored("a.pdf", 2, 150), scored("b.pdf", 1, 200)];
        let context = build_context(&retrieved, 400);
        assert_eq!(context.len(), 2);
        assert_eq!(context[1].page, 2);

        let retrieved = vec![scored("a.pdf", 1, 300), scored("b.pdf", 4, 200)];
        let context = build_context(&retrieved, 400);
        assert_eq!(context.len(), 2);
        assert_eq!(context[1].text.split_whitespace().count(), 100);
        assert_eq!(context[1].source, "b.pdf");
    }

    #[test]
    fn prompt_names_sources_and_decline_instruction() {
        let context = vec![Chunk {
            text: "Companies pay 30%.".into(),
            source: "rates.pdf".into(),
            page: 2,
        }];
        let prompt = build_prompt("What is the rate?", &context);
        assert!(prompt.contains("[rates.pdf, page 2]"));
        assert!(prompt.contains(DECLINE_MESSAGE));
        assert!(prompt.ends_with("Answer:"));
    }

    #[test]
    fn short_answers_become_declines() {
        assert_eq!(finalize_answer("30%", 10), DECLINE_MESSAGE);
        assert_eq!(finalize_answer("I don't know", 20), "I don't know");
        assert_eq!(
            finalize_answer("  The rate is 30 percent.  ", 10),
            "The rate is 30 percent."
        );
    }

    #[test]
    fn extractive_answer_names_best_source() {
        let context = vec![Chunk {
            text: "SET is a social security levy.".into(),
            source: "SET_Guide.pdf".into(),
            page: 3,
        }];
        let answer = ExtractiveGenerator.generate("What is SET?", &context).unwrap();
        assert!(answer.starts_with("According to SET_Guide.pdf (page 3)"));
        assert_eq!(ExtractiveGenerator.generate("q", &[]).unwrap(), DECLINE_MESSAGE);
    }
}
