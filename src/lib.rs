//! # docbatch
//!
//! Batch orchestration and streaming guardrails for document extraction
//! pipelines.
//!
//! ## Why this crate?
//!
//! Feeding a corpus of documents through a language model is mostly not a
//! model problem — it is a coordination problem. Rate limits must be
//! respected across every concurrent call, a rasteriser that cannot be
//! shared across threads must still keep many documents in flight, and a
//! model that wanders into a degenerate loop (endless newlines, one token
//! repeated forever) must be cut off mid-stream instead of billing you for
//! fifty thousand junk characters. This crate packages those concerns as a
//! library: callers wire in a [`ports::Generator`], [`ports::Embedder`],
//! and [`ports::Rasterizer`], submit batches, and poll or subscribe for
//! progress.
//!
//! ## Pipeline Overview
//!
//! ```text
//! submit(docs)
//!  │
//!  ├─ 1. Admission      semaphore caps concurrent documents, in order
//!  ├─ 2. Ingestion      rasterise pages (CPU-bound, spawn_blocking pool)
//!  ├─ 3. Parsing        streamed extraction per page, guardrail-supervised
//!  ├─ 4. Cleaning       model cleanup call + deterministic text rules
//!  ├─ 5. Chunking       sequential, contiguous character offsets
//!  ├─ 6. Enrichment     section labels + token estimates
//!  └─ 7. Vectorization  rate-limited embedding fan-out
//! ```
//!
//! Every model call — extraction, cleaning, embedding — draws from one
//! shared token-bucket [`ratelimit::RateLimiter`], so concurrency settings
//! shape latency while the request rate stays pinned to the configured
//! budget.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use docbatch::{BatchConfig, BatchOrchestrator, FailureStrategy, SubmittedDocument};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BatchConfig::builder()
//!         .max_concurrent_documents(4)
//!         .requests_per_minute(120)
//!         .build()?;
//!     let orchestrator = BatchOrchestrator::new(config, generator, embedder, rasterizer);
//!
//!     let batch_id = orchestrator
//!         .submit(
//!             vec![SubmittedDocument::new("report.pdf", bytes)],
//!             FailureStrategy::Continue,
//!         )
//!         .await?;
//!
//!     let snapshot = orchestrator.snapshot(batch_id).await?;
//!     println!("{:?} {:.0}%", snapshot.status, snapshot.progress_percent());
//!     Ok(())
//! }
//! ```
//!
//! ## Failure philosophy
//!
//! Failures isolate at the smallest useful scope: a degenerate stream
//! fails one page, a failed page degrades one document, a failed document
//! (under the default `Continue` strategy) leaves its siblings untouched.
//! Every failure is classified — see [`error::PageFailure`] — and recorded
//! on the job, never silently dropped.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod guardrail;
pub mod job;
pub mod orchestrator;
pub mod pipeline;
pub mod ports;
pub mod prompts;
pub mod ratelimit;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{BatchConfig, BatchConfigBuilder};
pub use error::{BatchError, GeneratorError, PageFailure};
pub use guardrail::{GuardrailVerdict, PageElement, StreamGuardrail};
pub use job::{
    BatchJob, BatchStatus, DocumentJob, DocumentStatus, FailureStrategy, PageOutcome, ParseStatus,
    Stage, StageStatus,
};
pub use orchestrator::{BatchOrchestrator, OrchestratorBuilder, SubmittedDocument};
pub use ratelimit::RateLimiter;
