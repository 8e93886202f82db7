//! Word-count chunking of extracted pages.
//!
//! Chunks never overlap. Under [`PagePolicy::Hard`] every page starts a new
//! chunk so each chunk has exactly one page to cite; under
//! [`PagePolicy::Spanning`] words flow across page breaks and the chunk is
//! attributed to the page its first word came from.

use crate::config::PagePolicy;
use crate::error::{KbError, Result};
use crate::models::{Chunk, Page};

pub fn chunk(
    source: &str,
    pages: &[Page],
    max_words: usize,
    policy: PagePolicy,
) -> Result<Vec<Chunk>> {
    if max_words == 0 {
        return Err(KbError::InvalidInput("max_words must be greater than 0".into()));
    }

    let chunks = match policy {
        PagePolicy::Hard => chunk_per_page(source, pages, max_words),
        PagePolicy::Spanning => chunk_across_pages(source, pages, max_words),
    };
    Ok(chunks)
}

fn chunk_per_page(source: &str, pages: &[Page], max_words: usize) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    for page in pages {
        let words: Vec<&str> = page.text.split_whitespace().collect();
        for group in words.chunks(max_words) {
            chunks.push(Chunk {
                text: group.join(" "),
                source: source.to_string(),
                page: page.number,
            });
        }
    }
    chunks
}

fn chunk_across_pages(source: &str, pages: &[Page], max_words: usize) -> Vec<Chunk> {
    let words: Vec<(u32, &str)> = pages
        .iter()
        .flat_map(|page| page.text.split_whitespace().map(move |w| (page.number, w)))
        .collect();

    words
        .chunks(max_words)
        .map(|group| Chunk {
            text: group.iter().map(|(_, w)| *w).collect::<Vec<_>>().join(" "),
            source: source.to_string(),
            page: group[0].0,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(n: usize) -> String {
        (0..n).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn exact_page_yields_one_chunk_and_one_more_word_yields_two() {
        let pages = vec![Page::new(1, words(5))];
        let chunks = chunk("a.pdf", &pages, 5, PagePolicy::Hard).unwrap();
        assert_eq!(chunks.len(), 1);

        let pages = vec![Page::new(1, words(6))];
        let chunks = chunk("a.pdf", &pages, 5, PagePolicy::Hard).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].text, "w5");
    }

    #[test]
    fn hard_policy_never_spans_pages() {
        let pages = vec![
            Page::new(1, words(3)),
            Page::new(2, "  \n\t "),
            Page::new(3, words(7)),
        ];
        let chunks = chunk("doc.pdf", &pages, 5, PagePolicy::Hard).unwrap();
        let pages_cited: Vec<u32> = chunks.iter().map(|c| c.page).collect();
        assert_eq!(pages_cited, vec![1, 3, 3]);
        assert!(chunks.iter().all(|c| c.source == "doc.pdf"));
        assert!(chunks.iter().all(|c| c.text.split_whitespace().count() <= 5));
    }

    #[test]
    fn whitespace_is_collapsed() {
        let pages = vec![Page::new(4, "alpha\n\nbeta   gamma\tdelta")];
        let chunks = chunk("x.pdf", &pages, 10, PagePolicy::Hard).unwrap();
        assert_eq!(chunks[0].text, "alpha beta gamma delta");
        assert_eq!(chunks[0].page, 4);
    }

    #[test]
    fn spanning_policy_cites_first_page() {
        let pages = vec![Page::new(1, "a b c"), Page::new(2, "d e f g")];
        let chunks = chunk("x.pdf", &pages, 4, PagePolicy::Spanning).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "a b c d");
        assert_eq!(chunks[0].page, 1);
        assert_eq!(chunks[1].text, "e f g");
        assert_eq!(chunks[1].page, 2);
    }

    #[test]
    fn empty_document_and_zero_size() {
        assert!(chunk("x.pdf", &[], 10, PagePolicy::Hard).unwrap().is_empty());
        assert!(chunk("x.pdf", &[Page::new(1, "a")], 0, PagePolicy::Hard).is_err());
    }
}
