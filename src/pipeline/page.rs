//! Page processor: per-page parse and clean calls under rate and guardrail
//! discipline.
//!
//! ## Contract
//!
//! [`PageProcessor::process`] always returns a [`ProcessedPage`] — it never
//! propagates an error upward, so a single degenerate page cannot abort its
//! document. The classification rules:
//!
//! * no rendered image → `failed` / `missing_input`, no call is made
//! * guardrail abort with nothing salvaged → `failed` with the abort reason
//! * guardrail abort with partial content → `partial` with the reason
//! * transport error or per-call timeout → `failed` / `exception`, message
//!   retained
//! * completed stream failing schema validation → `failed` /
//!   `schema_validation`
//!
//! Every outbound call first acquires budget from the shared rate limiter.
//! Page fan-out (how many pages are in flight) is bounded separately by
//! `page_concurrency` — the two knobs are orthogonal by design.

use crate::config::BatchConfig;
use crate::error::{GeneratorError, PageFailure};
use crate::guardrail::{supervise, GuardrailConfig, StreamGuardrail};
use crate::job::{PageOutcome, ParseStatus};
use crate::pipeline::cleanup;
use crate::ports::{Generator, Pixmap, Prompt};
use crate::prompts;
use crate::ratelimit::RateLimiter;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

/// Input to one page attempt: the index and the render result, if any.
pub struct PageInput {
    pub page_index: usize,
    /// `None` when rendering failed or produced nothing for this page.
    pub pixmap: Option<Pixmap>,
}

/// A page outcome plus the cleaned text carried forward to chunking.
pub struct ProcessedPage {
    pub outcome: PageOutcome,
    pub text: String,
}

/// Orchestrates parse + clean calls for the pages of one document.
pub struct PageProcessor {
    generator: Arc<dyn Generator>,
    limiter: Arc<RateLimiter>,
    config: Arc<BatchConfig>,
}

impl PageProcessor {
    pub fn new(
        generator: Arc<dyn Generator>,
        limiter: Arc<RateLimiter>,
        config: Arc<BatchConfig>,
    ) -> Self {
        Self {
            generator,
            limiter,
            config,
        }
    }

    /// Process every page with bounded fan-out, returning results sorted by
    /// page index.
    pub async fn process_all(&self, pages: Vec<PageInput>) -> Vec<ProcessedPage> {
        let mut results: Vec<ProcessedPage> = stream::iter(pages)
            .map(|page| self.process(page))
            .buffer_unordered(self.config.page_concurrency)
            .collect()
            .await;
        results.sort_by_key(|p| p.outcome.page_index);
        results
    }

    /// Process a single page. Never returns an error; see module docs for
    /// the classification rules.
    pub async fn process(&self, page: PageInput) -> ProcessedPage {
        let idx = page.page_index;

        let Some(pixmap) = page.pixmap else {
            return ProcessedPage {
                outcome: PageOutcome::failed(idx, PageFailure::MissingInput),
                text: String::new(),
            };
        };

        // Parse call.
        let verdict = match self
            .guarded_stream(Prompt::with_image(prompts::PARSE_PROMPT, pixmap))
            .await
        {
            Ok(guardrail) => guardrail.classify(),
            Err(failure) => {
                warn!(page = idx, %failure, "parse call failed");
                return ProcessedPage {
                    outcome: PageOutcome::failed(idx, failure),
                    text: String::new(),
                };
            }
        };

        if verdict.parse == ParseStatus::Failed {
            let failure = verdict
                .failure
                .unwrap_or_else(|| PageFailure::Exception {
                    detail: "parse produced no classified failure".into(),
                });
            return ProcessedPage {
                outcome: PageOutcome::failed(idx, failure),
                text: String::new(),
            };
        }

        // Clean call, same rate and guardrail discipline. A degenerate
        // cleaning stream downgrades the page rather than discarding the
        // parse: the raw extracted text is kept and cleaned locally.
        let raw_text = verdict.joined_text();
        let (text, clean_aborted): (String, Option<PageFailure>) = match self
            .guarded_stream(Prompt::text_only(prompts::clean_request(&raw_text)))
            .await
        {
            Ok(guardrail) => match guardrail.abort_reason() {
                None => (cleanup::clean_text(guardrail.buffer()), None),
                Some(reason) => {
                    warn!(page = idx, ?reason, "clean call aborted, keeping raw text");
                    (cleanup::clean_text(&raw_text), Some(reason.into()))
                }
            },
            Err(failure) => {
                warn!(page = idx, %failure, "clean call failed");
                return ProcessedPage {
                    outcome: PageOutcome::failed(idx, failure),
                    text: String::new(),
                };
            }
        };

        debug!(
            page = idx,
            elements = verdict.elements.len(),
            chars = text.len(),
            "page processed"
        );

        let outcome = match (verdict.failure, clean_aborted) {
            (None, None) => PageOutcome::success(idx, verdict.elements.len(), text.len()),
            (Some(failure), _) | (None, Some(failure)) => {
                PageOutcome::partial(idx, failure, verdict.elements.len(), text.len())
            }
        };

        ProcessedPage { outcome, text }
    }

    /// Acquire rate budget, open the stream, and supervise it through a
    /// fresh guardrail under the per-call timeout.
    async fn guarded_stream(&self, prompt: Prompt) -> Result<StreamGuardrail, PageFailure> {
        self.limiter.acquire(1).await;

        let call_timeout = Duration::from_secs(self.config.call_timeout_secs);
        let guardrail = StreamGuardrail::new(GuardrailConfig::from_batch(&self.config));

        let supervised = timeout(call_timeout, async {
            let stream = self.generator.stream(&prompt).await?;
            supervise(stream, guardrail).await
        })
        .await;

        match supervised {
            Ok(Ok(guardrail)) => Ok(guardrail),
            Ok(Err(e)) => Err(exception_from(e)),
            Err(_) => Err(PageFailure::Exception {
                detail: format!("call timed out after {}s", self.config.call_timeout_secs),
            }),
        }
    }
}

fn exception_from(e: GeneratorError) -> PageFailure {
    PageFailure::Exception {
        detail: e.to_string(),
    }
}
