//! Picks the citations an answer actually leans on.
//!
//! If the answer names any retrieved document, only those documents are
//! cited, with every page retrieved for them. Otherwise the nearest few
//! chunks are cited so some provenance is always shown.

use std::collections::HashSet;
use std::path::Path;

use crate::models::{Citation, ScoredChunk};

pub const DEFAULT_FALLBACK_CITATIONS: usize = 3;

/// Shortest file stem accepted as a mention on its own; shorter stems match
/// ordinary words too easily.
const MIN_STEM_CHARS: usize = 4;

pub fn filter_sources(answer_text: &str, retrieved: &[ScoredChunk]) -> Vec<Citation> {
    filter_sources_with_fallback(answer_text, retrieved, DEFAULT_FALLBACK_CITATIONS)
}

pub fn filter_sources_with_fallback(
    answer_text: &str,
    retrieved: &[ScoredChunk],
    fallback: usize,
) -> Vec<Citation> {
    if retrieved.is_empty() {
        return Vec::new();
    }

    let documents = distinct_documents(retrieved);
    let answer = normalize(answer_text);
    let mentioned: HashSet<&str> = documents
        .iter()
        .filter(|doc| {
            mention_forms(doc, &documents)
                .iter()
                .any(|form| answer.contains(form.as_str()))
        })
        .copied()
        .collect();

    let cited: Vec<&ScoredChunk> = if mentioned.is_empty() {
        retrieved.iter().take(fallback).collect()
    } else {
        retrieved
            .iter()
            .filter(|r| mentioned.contains(r.chunk.source.as_str()))
            .collect()
    };

    let mut seen = HashSet::new();
    cited
        .into_iter()
        .map(|r| Citation::from(&r.chunk))
        .filter(|c| seen.insert(c.clone()))
        .collect()
}

fn distinct_documents(retrieved: &[ScoredChunk]) -> Vec<&str> {
    let mut seen = HashSet::new();
    retrieved
        .iter()
        .map(|r| r.chunk.source.as_str())
        .filter(|s| seen.insert(*s))
        .collect()
}

/// Lowercases and treats `_` and `-` as spaces, so "SET_Guide-2023.pdf" and
/// "set guide 2023.pdf" compare equal.
fn normalize(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '_' | '-' => ' ',
            other => other.to_ascii_lowercase(),
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn stem(name: &str) -> &str {
    Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name)
}

/// The full name always counts. The bare stem counts only when it is long
/// enough and no other retrieved document's stem contains it.
fn mention_forms(document: &str, all: &[&str]) -> Vec<String> {
    let mut forms = vec![normalize(document)];

    let own_stem = normalize(stem(document));
    let ambiguous = all
        .iter()
        .filter(|other| **other != document)
        .any(|other| normalize(stem(other)).contains(own_stem.as_str()));
    if own_stem.chars().count() >= MIN_STEM_CHARS && !ambiguous && own_stem != forms[0] {
        forms.push(own_stem);
    }
    forms
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Chunk;

    fn scored(source: &str, page: u32, distance: f32) -> ScoredChunk {
        ScoredChunk {
            chunk: Chunk {
                text: format!("text from {} p{}", source, page),
                source: source.to_string(),
                page,
            },
            distance,
        }
    }

    fn citation(file: &str, page: u32) -> Citation {
        Citation {
            file: file.to_string(),
            page,
        }
    }

    #[test]
    fn mentioned_documents_only() {
        let retrieved = vec![
            scored("B.pdf", 4, 0.1),
            scored("A.pdf", 2, 0.2),
            scored("A.pdf", 7, 0.3),
            scored("B.pdf", 5, 0.4),
        ];
        let citations = filter_sources("As stated in A.pdf, the rate is 30%.", &retrieved);
        assert_eq!(citations, vec![citation("A.pdf", 2), citation("A.pdf", 7)]);
    }

    #[test]
    fn fallback_takes_top_three_deduplicated() {
        let retrieved = vec![
            scored("A.pdf", 1, 0.1),
            scored("A.pdf", 1, 0.2),
            scored("B.pdf", 3, 0.3),
            scored("C.pdf", 9, 0.4),
        ];
        let citations = filter_sources("The rate is 30%.", &retrieved);
        assert_eq!(citations, vec![citation("A.pdf", 1), citation("B.pdf", 3)]);

        let distinct = vec![
            scored("A.pdf", 1, 0.1),
            scored("B.pdf", 3, 0.3),
            scored("C.pdf", 9, 0.4),
            scored("D.pdf", 2, 0.5),
        ];
        assert_eq!(
            filter_sources("No names here.", &distinct),
            vec![citation("A.pdf", 1), citation("B.pdf", 3), citation("C.pdf", 9)]
        );
    }

    #[test]
    fn empty_retrieval_gives_no_citations() {
        assert!(filter_sources("A.pdf says so", &[]).is_empty());
    }

    #[test]
    fn normalized_names_and_stems_count_as_mentions() {
        let retrieved = vec![
            scored("SET_Guide_2023.pdf", 3, 0.1),
            scored("Corporate-Tax.pdf", 1, 0.2),
        ];
        let citations = filter_sources("See the set guide 2023 for exemptions.", &retrieved);
        assert_eq!(citations, vec![citation("SET_Guide_2023.pdf", 3)]);

        let citations = filter_sources("Per CORPORATE TAX.PDF, companies pay 30%.", &retrieved);
        assert_eq!(citations, vec![citation("Corporate-Tax.pdf", 1)]);
    }

    #[test]
    fn short_or_ambiguous_stems_are_not_mentions() {
        let retrieved = vec![scored("tax.pdf", 1, 0.1), scored("tax_rates.pdf", 2, 0.2)];
        // "tax" is short and also inside "tax rates", so only the fallback applies.
        let citations = filter_sources("The tax is due in March.", &retrieved);
        assert_eq!(citations, vec![citation("tax.pdf", 1), citation("tax_rates.pdf", 2)]);

        let citations = filter_sources("tax rates are listed", &retrieved);
        assert_eq!(citations, vec![citation("tax_rates.pdf", 2)]);
    }
}
