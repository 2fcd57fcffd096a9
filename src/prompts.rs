//! Prompt templates for the parse and clean generator calls.
//!
//! All prompt engineering lives here so it can be tuned without touching
//! rate-limiting, guardrail, or retry logic in the pipeline modules.

/// System prompt for the vision extraction call.
///
/// The model must answer with a bare JSON array of
/// `{"kind": ..., "text": ...}` elements — the guardrail validates exactly
/// that shape, so the prompt and the schema validator move together.
pub const PARSE_PROMPT: &str = "\
You are a document extraction engine. Read the attached page image and \
return its content as a JSON array of elements, in reading order. Each \
element is an object with exactly two string fields: \"kind\" (one of \
heading, paragraph, list, table, figure, caption, footnote) and \"text\" \
(the element's full text). Preserve reading order across columns. Return \
ONLY the JSON array — no code fences, no commentary.";

/// System prompt for the text-cleaning call.
pub const CLEAN_PROMPT: &str = "\
You are a text normalisation engine. Rewrite the following extracted page \
text with hyphenation repaired, hard line-wraps joined, and obvious OCR \
artefacts fixed. Do not summarise, reorder, or drop content. Return ONLY \
the cleaned text.";

/// Build the user prompt for the cleaning call.
pub fn clean_request(raw_text: &str) -> String {
    format!("{CLEAN_PROMPT}\n\n---\n{raw_text}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_prompt_names_the_schema_fields() {
        assert!(PARSE_PROMPT.contains("\"kind\""));
        assert!(PARSE_PROMPT.contains("\"text\""));
    }

    #[test]
    fn clean_request_embeds_the_text() {
        let req = clean_request("some page text");
        assert!(req.starts_with(CLEAN_PROMPT));
        assert!(req.ends_with("some page text"));
    }
}
