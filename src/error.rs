//! Error types for the docbatch library.
//!
//! Three distinct error types reflect three distinct failure modes:
//!
//! * [`BatchError`] — **Fatal**: the batch cannot be submitted or run at all
//!   (invalid configuration, empty batch, unknown batch id). Returned as
//!   `Err(BatchError)` from [`crate::orchestrator::BatchOrchestrator`]
//!   entry points and surfaced immediately, never deferred into job state.
//!
//! * [`PageFailure`] — **Non-fatal**: a single page (or document, for the
//!   policy-cancellation variant) failed but siblings are fine. Stored
//!   inside [`crate::job::PageOutcome`] so callers can inspect partial
//!   success rather than losing the whole batch to one degenerate stream.
//!
//! * [`GeneratorError`] — the error surface of the external ports
//!   ([`crate::ports::Generator`] / [`crate::ports::Embedder`]). The
//!   pipeline converts these into `PageFailure::Exception` at the page
//!   boundary; they never propagate past a `PageOutcome`.
//!
//! The separation lets callers decide their own tolerance: abort on the
//! first failed document, log and continue, or collect everything for a
//! post-run report.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// All fatal errors returned by the docbatch library.
///
/// Page-level failures use [`PageFailure`] and are stored in
/// [`crate::job::PageOutcome`] rather than propagated here.
#[derive(Debug, Error)]
pub enum BatchError {
    /// Builder or submission-time validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A batch was submitted with zero documents.
    #[error("Batch contains no documents")]
    EmptyBatch,

    /// No batch with this id is known to the orchestrator.
    #[error("Unknown batch id: {0}")]
    UnknownBatch(Uuid),

    /// Unexpected internal error (task join failure etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal, classified failure for a single page.
///
/// Produced by the stream guardrail and the page processor; stored inside
/// [`crate::job::PageOutcome`]. The pipeline continues unless every page of
/// a document carries one of these.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PageFailure {
    /// The sliding window was dominated by a single repeated character —
    /// the generator is stuck in a repetition loop.
    #[error("generator entered a repetition loop")]
    RepetitionLoop,

    /// Too many consecutive literal newline characters.
    #[error("generator emitted an excessive newline run")]
    ExcessiveNewlines,

    /// The trailing window was dominated by escaped-newline (`\n` as two
    /// literal characters) sequences.
    #[error("generator emitted an excessive run of escaped newlines")]
    ExcessiveEscapedNewlines,

    /// The accumulated stream exceeded the configured maximum length.
    #[error("generator output exceeded the maximum length")]
    MaxLengthExceeded,

    /// No rendered image existed for the page, so no call was made.
    #[error("no rendered image available for this page")]
    MissingInput,

    /// The stream completed but the buffer did not validate against the
    /// expected extraction schema.
    #[error("completed output failed schema validation: {detail}")]
    SchemaValidation { detail: String },

    /// An unexpected upstream failure (network, timeout) from the generator
    /// call itself, with the message captured.
    #[error("generator call failed: {detail}")]
    Exception { detail: String },

    /// The document was never started because the batch's `fail_all`
    /// strategy triggered before it was admitted.
    #[error("cancelled by batch failure policy")]
    CancelledByPolicy,
}

/// Errors raised by the external generator and embedder ports.
///
/// Port implementations map their transport's failures onto these; the
/// page processor converts them into [`PageFailure::Exception`].
#[derive(Debug, Clone, Error)]
pub enum GeneratorError {
    /// Network-level failure (connection reset, DNS, TLS).
    #[error("transport error: {0}")]
    Transport(String),

    /// The call exceeded the configured per-call timeout.
    #[error("call timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// The API returned a non-retryable error response.
    #[error("API error: {0}")]
    Api(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_failure_serialises_with_kind_tag() {
        let f = PageFailure::SchemaValidation {
            detail: "expected array".into(),
        };
        let json = serde_json::to_string(&f).unwrap();
        assert!(json.contains("\"kind\":\"schema_validation\""), "got: {json}");
        assert!(json.contains("expected array"));
    }

    #[test]
    fn exception_display_retains_detail() {
        let f = PageFailure::Exception {
            detail: "connection reset by peer".into(),
        };
        assert!(f.to_string().contains("connection reset"));
    }

    #[test]
    fn invalid_config_display() {
        let e = BatchError::InvalidConfig("requests_per_minute must be > 0".into());
        assert!(e.to_string().contains("requests_per_minute"));
    }

    #[test]
    fn generator_timeout_display() {
        let e = GeneratorError::Timeout { elapsed_ms: 5000 };
        assert!(e.to_string().contains("5000ms"));
    }
}
