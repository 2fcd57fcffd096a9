//! Chunking and enrichment of the cleaned document text.
//!
//! Chunking is strictly sequential: it must see the full cleaned document
//! to assign contiguous character offsets, so it is never parallelised.
//! Page texts arrive already sorted by page index; they are concatenated
//! and sliced into overlapping windows that prefer to break at a newline
//! near the boundary, so chunks rarely split a sentence mid-word.
//!
//! Enrichment runs after all chunks exist: each chunk is annotated with the
//! most recent heading-like line above it (its `section`) and a cheap
//! whitespace token estimate used for embedding cost accounting.

use serde::{Deserialize, Serialize};

/// One contiguous slice of the cleaned document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: usize,
    /// Character offset of the chunk start within the assembled document.
    pub start: usize,
    /// Exclusive character offset of the chunk end.
    pub end: usize,
    pub text: String,
    /// Nearest preceding heading-like line, filled in by enrichment.
    pub section: Option<String>,
    /// Whitespace-delimited token estimate, filled in by enrichment.
    pub token_estimate: usize,
    /// Embedding vector, filled in by vectorization.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// Join per-page cleaned texts into one document with a blank line between
/// pages. Offsets produced by [`chunk_text`] are relative to this string.
pub fn assemble_document(page_texts: &[String]) -> String {
    page_texts
        .iter()
        .map(|t| t.trim_end())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Slice the document into overlapping chunks with contiguous offsets.
///
/// Window size and overlap come from the batch config; overlap < size is
/// enforced at config build so this always makes forward progress. The cut
/// point backs up to the last newline inside the final fifth of the window
/// when one exists, keeping paragraph boundaries intact.
pub fn chunk_text(document: &str, chunk_size: usize, overlap: usize) -> Vec<Chunk> {
    let chars: Vec<char> = document.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut index = 0usize;

    while start < chars.len() {
        let hard_end = (start + chunk_size).min(chars.len());
        let end = if hard_end < chars.len() {
            preferred_break(&chars, start, hard_end, chunk_size)
        } else {
            hard_end
        };

        let text: String = chars[start..end].iter().collect();
        chunks.push(Chunk {
            index,
            start,
            end,
            text,
            section: None,
            token_estimate: 0,
            embedding: None,
        });
        index += 1;

        if end == chars.len() {
            break;
        }
        start = end.saturating_sub(overlap).max(start + 1);
    }

    chunks
}

/// Back the cut point up to the last newline in the final fifth of the
/// window, when one exists.
fn preferred_break(chars: &[char], start: usize, hard_end: usize, chunk_size: usize) -> usize {
    let search_from = hard_end.saturating_sub(chunk_size / 5).max(start + 1);
    chars[search_from..hard_end]
        .iter()
        .rposition(|c| *c == '\n')
        .map(|pos| search_from + pos + 1)
        .unwrap_or(hard_end)
}

/// Annotate chunks with section labels and token estimates.
///
/// A heading-like line is short (< 80 chars), non-empty, and either starts
/// with `#` or contains no sentence-ending punctuation — a heuristic that
/// matches both markdown-style and plain extracted headings.
pub fn enrich(chunks: &mut [Chunk], document: &str) {
    let headings = collect_headings(document);

    for chunk in chunks.iter_mut() {
        chunk.token_estimate = chunk.text.split_whitespace().count();
        chunk.section = headings
            .iter()
            .rev()
            .find(|(offset, _)| *offset <= chunk.start)
            .map(|(_, title)| title.clone());
    }
}

/// All heading-like lines with their character offsets, in document order.
fn collect_headings(document: &str) -> Vec<(usize, String)> {
    let mut headings = Vec::new();
    let mut offset = 0usize;
    for line in document.split('\n') {
        let trimmed = line.trim();
        if looks_like_heading(trimmed) {
            let title = trimmed.trim_start_matches('#').trim().to_string();
            headings.push((offset, title));
        }
        offset += line.chars().count() + 1;
    }
    headings
}

fn looks_like_heading(line: &str) -> bool {
    if line.is_empty() || line.chars().count() >= 80 {
        return false;
    }
    if line.starts_with('#') {
        return true;
    }
    // Short line with no terminal punctuation reads as a heading.
    line.chars().count() < 60
        && !line.ends_with(['.', ',', ';', ':', '!', '?'])
        && line.split_whitespace().count() <= 8
        && line.chars().next().is_some_and(|c| c.is_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assemble_skips_empty_pages() {
        let doc = assemble_document(&[
            "page one\n".to_string(),
            String::new(),
            "page three\n".to_string(),
        ]);
        assert_eq!(doc, "page one\n\npage three");
    }

    #[test]
    fn offsets_are_contiguous_and_cover_the_document() {
        let doc = "word ".repeat(600); // 3000 chars
        let chunks = chunk_text(&doc, 1000, 100);
        assert!(chunks.len() >= 3);
        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks.last().unwrap().end, doc.chars().count());
        for pair in chunks.windows(2) {
            // Each chunk starts inside (or at the end of) the previous one:
            // overlap, no gaps.
            assert!(pair[1].start <= pair[0].end);
            assert!(pair[1].start > pair[0].start);
        }
        for c in &chunks {
            assert_eq!(c.text.chars().count(), c.end - c.start);
        }
    }

    #[test]
    fn short_document_is_one_chunk() {
        let chunks = chunk_text("just a few words", 1000, 100);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "just a few words");
    }

    #[test]
    fn empty_document_has_no_chunks() {
        assert!(chunk_text("", 1000, 100).is_empty());
    }

    #[test]
    fn break_prefers_newline_near_boundary() {
        let mut doc = "a".repeat(950);
        doc.push('\n');
        doc.push_str(&"b".repeat(500));
        let chunks = chunk_text(&doc, 1000, 0);
        // First chunk should end right after the newline at 951, not at 1000.
        assert_eq!(chunks[0].end, 951);
        assert!(chunks[0].text.ends_with('\n'));
    }

    #[test]
    fn enrich_assigns_nearest_preceding_heading() {
        let doc = format!(
            "# Introduction\n{}\n# Methods\n{}",
            "intro text. ".repeat(100),
            "methods text. ".repeat(100)
        );
        let mut chunks = chunk_text(&doc, 800, 100);
        enrich(&mut chunks, &doc);

        assert_eq!(chunks[0].section.as_deref(), Some("Introduction"));
        assert_eq!(
            chunks.last().unwrap().section.as_deref(),
            Some("Methods")
        );
        assert!(chunks.iter().all(|c| c.token_estimate > 0));
    }

    #[test]
    fn heading_heuristics() {
        assert!(looks_like_heading("# Results"));
        assert!(looks_like_heading("Quarterly Overview"));
        assert!(!looks_like_heading("This is a full sentence, with punctuation."));
        assert!(!looks_like_heading(""));
    }
}
