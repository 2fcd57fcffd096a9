//! Deterministic cleanup of generator-extracted text.
//!
//! ## Why is cleanup necessary?
//!
//! Even a well-prompted model introduces artefacts that are semantically
//! harmless but structurally wrong for downstream chunking:
//!
//! - wrapping output in ` ``` ` fences despite instructions not to
//! - Windows-style `\r\n` line endings
//! - literal `\n` escape sequences where a real newline was meant
//! - runs of blank lines that inflate chunk offsets
//! - invisible Unicode (zero-width spaces, BOM, soft hyphens)
//!
//! These rules are cheap, deterministic string/regex passes with no shared
//! state — each is a pure `&str → String` function, independently testable,
//! applied in a fixed order. Keeping them here rather than in the prompt
//! keeps the prompt focused on *what to extract*.

use once_cell::sync::Lazy;
use regex::Regex;

/// Apply all cleanup rules to raw extracted text, in order:
///
/// 1. Strip outer code fences
/// 2. Normalise line endings (CRLF → LF)
/// 3. Unescape literal `\n` sequences
/// 4. Trim trailing whitespace per line
/// 5. Collapse 3+ consecutive blank lines down to 2
/// 6. Strip invisible Unicode
/// 7. Ensure the text ends with exactly one newline
pub fn clean_text(input: &str) -> String {
    let s = strip_code_fences(input);
    let s = normalise_line_endings(&s);
    let s = unescape_newlines(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    let s = remove_invisible_chars(&s);
    ensure_final_newline(&s)
}

// ── Rule 1: Strip outer code fences ──────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[a-zA-Z]*\n(.*)\n```\s*$").unwrap());

/// Remove a single outer ` ```lang … ``` ` wrapper if present.
///
/// Also used by the guardrail's schema validator, since models wrap JSON in
/// fences just as readily as they wrap prose.
pub fn strip_code_fences(input: &str) -> String {
    if let Some(caps) = RE_OUTER_FENCES.captures(input.trim()) {
        caps[1].to_string()
    } else {
        input.to_string()
    }
}

// ── Rule 2: Normalise line endings ───────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 3: Unescape literal \n sequences ────────────────────────────────
//
// Salvaged partial output and some providers deliver `\n` as two literal
// characters. Converting them restores real structure; a lone backslash
// before any other character is left untouched.

fn unescape_newlines(input: &str) -> String {
    input.replace("\\n", "\n")
}

// ── Rule 4: Trim trailing whitespace per line ────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 5: Collapse excessive blank lines ───────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{4,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n\n").to_string()
}

// ── Rule 6: Remove invisible Unicode characters ──────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

// ── Rule 7: Ensure single final newline ──────────────────────────────────

fn ensure_final_newline(input: &str) -> String {
    let trimmed = input.trim_end();
    if trimmed.is_empty() {
        String::from("\n")
    } else {
        format!("{}\n", trimmed)
    }
}
