//! Stream guardrail: bounded-abort monitoring of generator output.
//!
//! ## Why a guardrail?
//!
//! A degenerate model can emit the same character, a wall of newlines, or
//! escaped-newline soup *indefinitely*. Left unchecked, one bad page would
//! hang its pipeline and burn API budget forever. The guardrail wraps the
//! incremental chunk stream in a small state machine that converts an
//! open-ended stream into a bounded, inspectable outcome — it never raises
//! on degenerate input, it classifies and stops pulling.
//!
//! ## State machine
//!
//! Starts in **streaming**. Each chunk is appended and four monitors are
//! updated per character:
//!
//! * total length vs `max_chars`
//! * trailing run of literal `\n` vs `max_consecutive_newlines`
//! * dominant-character ratio inside a sliding window vs `repetition_threshold`
//! * escaped-newline (`\` + `n` as two literal characters) ratio inside the
//!   same window vs 0.5
//!
//! The first trigger moves the machine to **aborted** with a distinct
//! reason; a normal end of stream moves it to **completed**. Classification
//! then turns the accumulated buffer into a [`GuardrailVerdict`]: aborted
//! with zero salvageable elements is `failed`, aborted with partial content
//! is `partial` (reason attached), completed output is validated against
//! the extraction schema.

use crate::config::BatchConfig;
use crate::error::{GeneratorError, PageFailure};
use crate::job::ParseStatus;
use crate::ports::ChunkStream;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tokio_stream::StreamExt;
use tracing::warn;

/// One structured element extracted from a page.
///
/// The extraction schema: the generator is prompted to return a JSON array
/// of these. Anything else is a schema violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageElement {
    /// Element kind: "heading", "paragraph", "table", "figure", ...
    pub kind: String,
    pub text: String,
}

/// Why a stream was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    RepetitionLoop,
    ExcessiveNewlines,
    ExcessiveEscapedNewlines,
    MaxLengthExceeded,
}

impl From<AbortReason> for PageFailure {
    fn from(reason: AbortReason) -> Self {
        match reason {
            AbortReason::RepetitionLoop => PageFailure::RepetitionLoop,
            AbortReason::ExcessiveNewlines => PageFailure::ExcessiveNewlines,
            AbortReason::ExcessiveEscapedNewlines => PageFailure::ExcessiveEscapedNewlines,
            AbortReason::MaxLengthExceeded => PageFailure::MaxLengthExceeded,
        }
    }
}

/// Guardrail thresholds, copied out of [`BatchConfig`] at stream start.
#[derive(Debug, Clone)]
pub struct GuardrailConfig {
    pub max_chars: usize,
    pub window: usize,
    pub repetition_threshold: f64,
    pub max_consecutive_newlines: usize,
}

impl GuardrailConfig {
    pub fn from_batch(config: &BatchConfig) -> Self {
        Self {
            max_chars: config.guardrail_max_chars,
            window: config.guardrail_window,
            repetition_threshold: config.repetition_threshold,
            max_consecutive_newlines: config.max_consecutive_newlines,
        }
    }
}

/// Escaped-newline ratio that triggers an abort. Fixed, not configurable:
/// half the window being `\n` escapes is degenerate under any prompt.
const ESCAPED_NEWLINE_RATIO: f64 = 0.5;

/// One window slot: the character and whether it is part of a `\n` escape pair.
struct Slot {
    ch: char,
    escaped_pair: bool,
}

/// Stateful monitor over one streaming generator call.
///
/// Scoped to a single call; create a fresh one per stream.
pub struct StreamGuardrail {
    config: GuardrailConfig,
    buffer: String,
    total_chars: usize,
    newline_run: usize,
    window: VecDeque<Slot>,
    counts: HashMap<char, usize>,
    escaped_in_window: usize,
    aborted: Option<AbortReason>,
}

impl StreamGuardrail {
    pub fn new(config: GuardrailConfig) -> Self {
        Self {
            window: VecDeque::with_capacity(config.window),
            config,
            buffer: String::new(),
            total_chars: 0,
            newline_run: 0,
            counts: HashMap::new(),
            escaped_in_window: 0,
            aborted: None,
        }
    }

    /// Accumulated text so far.
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// The abort reason, if a threshold was crossed.
    pub fn abort_reason(&self) -> Option<AbortReason> {
        self.aborted
    }

    /// Append a chunk, updating all monitors per character.
    ///
    /// Returns the abort reason on the call that crosses a threshold and on
    /// every call after it; the caller stops pulling chunks at that point.
    pub fn feed(&mut self, chunk: &str) -> Option<AbortReason> {
        if self.aborted.is_some() {
            return self.aborted;
        }
        for ch in chunk.chars() {
            self.buffer.push(ch);
            self.total_chars += 1;

            if self.total_chars > self.config.max_chars {
                return self.trip(AbortReason::MaxLengthExceeded);
            }

            if ch == '\n' {
                self.newline_run += 1;
                if self.newline_run > self.config.max_consecutive_newlines {
                    return self.trip(AbortReason::ExcessiveNewlines);
                }
            } else {
                self.newline_run = 0;
            }

            self.push_window(ch);

            // Ratio checks only make sense over a full window; a 3-char
            // prefix of "aaa" is not evidence of a loop.
            if self.window.len() == self.config.window {
                let len = self.window.len() as f64;
                let dominant = *self.counts.get(&ch).unwrap_or(&0) as f64;
                if dominant / len > self.config.repetition_threshold {
                    return self.trip(AbortReason::RepetitionLoop);
                }
                if self.escaped_in_window as f64 / len > ESCAPED_NEWLINE_RATIO {
                    return self.trip(AbortReason::ExcessiveEscapedNewlines);
                }
            }
        }
        None
    }

    fn trip(&mut self, reason: AbortReason) -> Option<AbortReason> {
        warn!(?reason, chars = self.total_chars, "guardrail aborted stream");
        self.aborted = Some(reason);
        self.aborted
    }

    fn push_window(&mut self, ch: char) {
        if self.window.len() == self.config.window {
            if let Some(evicted) = self.window.pop_front() {
                if let Some(count) = self.counts.get_mut(&evicted.ch) {
                    *count -= 1;
                    if *count == 0 {
                        self.counts.remove(&evicted.ch);
                    }
                }
                if evicted.escaped_pair {
                    self.escaped_in_window -= 1;
                }
            }
        }

        // Pair this 'n' with an immediately preceding backslash that is not
        // already part of another pair. Both slots are flagged so eviction
        // decrements the window count one character at a time.
        let mut escaped_pair = false;
        if ch == 'n' {
            if let Some(prev) = self.window.back_mut() {
                if prev.ch == '\\' && !prev.escaped_pair {
                    prev.escaped_pair = true;
                    escaped_pair = true;
                    self.escaped_in_window += 2;
                }
            }
        }

        *self.counts.entry(ch).or_insert(0) += 1;
        self.window.push_back(Slot { ch, escaped_pair });
    }

    /// Classify the finished (completed or aborted) stream.
    pub fn classify(self) -> GuardrailVerdict {
        match self.aborted {
            Some(reason) => {
                let elements = salvage_elements(&self.buffer);
                if elements.is_empty() {
                    GuardrailVerdict {
                        parse: ParseStatus::Failed,
                        failure: Some(reason.into()),
                        elements,
                    }
                } else {
                    GuardrailVerdict {
                        parse: ParseStatus::Partial,
                        failure: Some(reason.into()),
                        elements,
                    }
                }
            }
            None => match validate_schema(&self.buffer) {
                Ok(elements) => GuardrailVerdict {
                    parse: ParseStatus::Success,
                    failure: None,
                    elements,
                },
                Err(detail) => GuardrailVerdict {
                    parse: ParseStatus::Failed,
                    failure: Some(PageFailure::SchemaValidation { detail }),
                    elements: Vec::new(),
                },
            },
        }
    }
}

/// The bounded, inspectable outcome of one supervised stream.
#[derive(Debug, Clone)]
pub struct GuardrailVerdict {
    pub parse: ParseStatus,
    pub failure: Option<PageFailure>,
    pub elements: Vec<PageElement>,
}

impl GuardrailVerdict {
    /// Concatenate element texts into the page's forward-flowing text.
    pub fn joined_text(&self) -> String {
        self.elements
            .iter()
            .map(|e| e.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Pull a chunk stream through a guardrail until abort or end of stream,
/// returning the guardrail for inspection.
///
/// Transport errors from the stream itself propagate as `Err` — the page
/// processor classifies those as `exception`, distinct from guardrail
/// aborts which are classified outcomes. The parse path follows up with
/// [`StreamGuardrail::classify`]; the cleaning path reads the buffer and
/// abort reason directly because its output is plain text, not schema JSON.
pub async fn supervise(
    mut stream: ChunkStream,
    mut guardrail: StreamGuardrail,
) -> Result<StreamGuardrail, GeneratorError> {
    while let Some(item) = stream.next().await {
        let chunk = item?;
        if guardrail.feed(&chunk).is_some() {
            // Stop pulling; drop the stream without draining it.
            break;
        }
    }
    Ok(guardrail)
}

/// Supervise a stream and classify the result against the extraction schema.
pub async fn drive(
    stream: ChunkStream,
    guardrail: StreamGuardrail,
) -> Result<GuardrailVerdict, GeneratorError> {
    Ok(supervise(stream, guardrail).await?.classify())
}

// ── Schema validation & salvage ──────────────────────────────────────────

/// Strict validation of a completed buffer against the extraction schema.
///
/// Models occasionally wrap JSON in markdown fences despite instructions;
/// fences are stripped before parsing, mirroring the cleanup stage.
fn validate_schema(buffer: &str) -> Result<Vec<PageElement>, String> {
    let trimmed = crate::pipeline::cleanup::strip_code_fences(buffer);
    serde_json::from_str::<Vec<PageElement>>(trimmed.trim()).map_err(|e| e.to_string())
}

/// Recover complete top-level objects from a truncated JSON array.
///
/// An aborted stream usually ends mid-element:
/// `[{"kind":"heading","text":"A"},{"kind":"para` — the first object is
/// complete and worth keeping. This scans brace depth (string-aware) and
/// parses each balanced `{...}` individually, skipping any that do not
/// match the schema.
fn salvage_elements(buffer: &str) -> Vec<PageElement> {
    let mut elements = Vec::new();
    let mut depth = 0usize;
    let mut start: Option<usize> = None;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in buffer.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        if let Some(s) = start.take() {
                            let candidate = &buffer[s..=i];
                            if let Ok(el) = serde_json::from_str::<PageElement>(candidate) {
                                elements.push(el);
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }
    elements
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GuardrailConfig {
        GuardrailConfig {
            max_chars: 50_000,
            window: 200,
            repetition_threshold: 0.8,
            max_consecutive_newlines: 100,
        }
    }

    fn valid_page_json() -> String {
        serde_json::to_string(&vec![
            PageElement {
                kind: "heading".into(),
                text: "Quarterly results".into(),
            },
            PageElement {
                kind: "paragraph".into(),
                text: "Revenue grew in all segments.".into(),
            },
        ])
        .unwrap()
    }

    #[test]
    fn clean_stream_validates_as_success() {
        let mut g = StreamGuardrail::new(config());
        assert!(g.feed(&valid_page_json()).is_none());
        let verdict = g.classify();
        assert_eq!(verdict.parse, ParseStatus::Success);
        assert_eq!(verdict.elements.len(), 2);
        assert!(verdict.failure.is_none());
    }

    #[test]
    fn three_hundred_newlines_abort_as_excessive_newlines() {
        let mut g = StreamGuardrail::new(config());
        let reason = g.feed(&"\n".repeat(300));
        assert_eq!(reason, Some(AbortReason::ExcessiveNewlines));
        let verdict = g.classify();
        assert_eq!(verdict.parse, ParseStatus::Failed);
        assert_eq!(verdict.failure, Some(PageFailure::ExcessiveNewlines));
    }

    #[test]
    fn newline_run_resets_on_other_characters() {
        let mut g = StreamGuardrail::new(config());
        // 500 newlines in total, but never more than 50 in a row and never
        // dominant inside the window.
        for _ in 0..10 {
            assert!(g.feed(&"\n".repeat(50)).is_none());
            assert!(g.feed("interleaved prose keeps the run short and varied. ").is_none());
        }
    }

    #[test]
    fn repeated_character_aborts_as_repetition_loop() {
        let mut g = StreamGuardrail::new(config());
        // Mixed prefix, then a long run of a single character.
        assert!(g.feed("[{\"kind\":\"p\",").is_none());
        let reason = g.feed(&"a".repeat(400));
        assert_eq!(reason, Some(AbortReason::RepetitionLoop));
    }

    #[test]
    fn escaped_newline_flood_aborts() {
        let mut g = StreamGuardrail::new(config());
        let reason = g.feed(&"\\n".repeat(200));
        assert_eq!(reason, Some(AbortReason::ExcessiveEscapedNewlines));
    }

    #[test]
    fn literal_backslash_n_text_passes_at_normal_density() {
        let mut g = StreamGuardrail::new(config());
        // Occasional escapes inside real prose should not trip the ratio.
        let text = "some prose with a line break\\n and more prose following it "
            .repeat(20);
        assert!(g.feed(&text).is_none());
    }

    #[test]
    fn oversize_stream_aborts_as_max_length() {
        let mut cfg = config();
        cfg.max_chars = 100;
        let mut g = StreamGuardrail::new(cfg);
        // Varied content so no other monitor fires first.
        let reason = g.feed(
            &(0..50)
                .map(|i| format!("w{} ", i))
                .collect::<String>(),
        );
        assert_eq!(reason, Some(AbortReason::MaxLengthExceeded));
    }

    #[test]
    fn abort_with_zero_elements_is_failed() {
        let mut g = StreamGuardrail::new(config());
        g.feed(&"\n".repeat(300));
        let verdict = g.classify();
        assert_eq!(verdict.parse, ParseStatus::Failed);
        assert!(verdict.elements.is_empty());
    }

    #[test]
    fn abort_with_salvaged_elements_is_partial() {
        let mut g = StreamGuardrail::new(config());
        g.feed("[{\"kind\":\"heading\",\"text\":\"Intro\"},{\"kind\":\"para");
        g.feed(&"\n".repeat(300));
        let verdict = g.classify();
        assert_eq!(verdict.parse, ParseStatus::Partial);
        assert_eq!(verdict.failure, Some(PageFailure::ExcessiveNewlines));
        assert_eq!(verdict.elements.len(), 1);
        assert_eq!(verdict.elements[0].text, "Intro");
    }

    #[test]
    fn completed_invalid_json_is_schema_violation() {
        let mut g = StreamGuardrail::new(config());
        g.feed("this is not json at all");
        let verdict = g.classify();
        assert_eq!(verdict.parse, ParseStatus::Failed);
        assert!(matches!(
            verdict.failure,
            Some(PageFailure::SchemaValidation { .. })
        ));
    }

    #[test]
    fn fenced_json_still_validates() {
        let mut g = StreamGuardrail::new(config());
        g.feed(&format!("```json\n{}\n```", valid_page_json()));
        let verdict = g.classify();
        assert_eq!(verdict.parse, ParseStatus::Success);
    }

    #[test]
    fn feed_after_abort_is_inert() {
        let mut g = StreamGuardrail::new(config());
        let first = g.feed(&"\n".repeat(300));
        let second = g.feed("more text");
        assert_eq!(first, second);
    }

    #[test]
    fn salvage_ignores_nested_braces_inside_strings() {
        let elements = salvage_elements(r#"[{"kind":"code","text":"fn f() { }"},{"kind":"#);
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].text, "fn f() { }");
    }

    #[tokio::test]
    async fn drive_consumes_stream_to_verdict() {
        let json = valid_page_json();
        let chunks: Vec<Result<String, GeneratorError>> = json
            .as_bytes()
            .chunks(7)
            .map(|c| Ok(String::from_utf8(c.to_vec()).unwrap()))
            .collect();
        let stream: ChunkStream = Box::pin(tokio_stream::iter(chunks));
        let verdict = drive(stream, StreamGuardrail::new(config())).await.unwrap();
        assert_eq!(verdict.parse, ParseStatus::Success);
        assert_eq!(verdict.elements.len(), 2);
    }

    #[tokio::test]
    async fn drive_surfaces_transport_errors() {
        let chunks: Vec<Result<String, GeneratorError>> = vec![
            Ok("[".into()),
            Err(GeneratorError::Transport("connection reset".into())),
        ];
        let stream: ChunkStream = Box::pin(tokio_stream::iter(chunks));
        let res = drive(stream, StreamGuardrail::new(config())).await;
        assert!(res.is_err());
    }
}
