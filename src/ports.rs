//! Ports: the narrow interfaces the engine consumes.
//!
//! The concrete language-model call, the rasteriser's rendering internals,
//! persistence, and the push-notification channel are all external
//! collaborators. The engine depends on them only through the traits in
//! this module, so tests script them and hosts wire in real backends
//! without the core knowing anything about transports or storage.
//!
//! Defaults are shipped for the collaborators a library user may not care
//! about: [`InMemoryJobRepository`], [`NoopProgressSink`], and
//! [`TracingRecorder`]. All of them are safe under concurrent use from
//! multiple document pipelines.

use crate::error::GeneratorError;
use crate::job::{BatchJob, DocumentJob, DocumentStatus, Stage, StageStatus};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_stream::Stream;
use uuid::Uuid;

/// A boxed stream of incremental text chunks from the generator.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, GeneratorError>> + Send>>;

/// A rasterised page image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pixmap {
    pub width: u32,
    pub height: u32,
    /// Encoded image bytes (format is the rasteriser's choice; the engine
    /// treats them as opaque payload for the generator call).
    pub bytes: Vec<u8>,
}

// ── Generator / Embedder ─────────────────────────────────────────────────

/// One generator request: instruction text plus an optional page image for
/// vision-based extraction.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub text: String,
    pub image: Option<Pixmap>,
}

impl Prompt {
    pub fn text_only(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            image: None,
        }
    }

    pub fn with_image(text: impl Into<String>, image: Pixmap) -> Self {
        Self {
            text: text.into(),
            image: Some(image),
        }
    }
}

/// The external language-model capability.
///
/// `stream` is the path the guardrail wraps: the engine pulls discrete
/// chunks and may stop pulling at any point, so implementations must not
/// require the stream to be drained. `complete` exists for short auxiliary
/// calls that do not need guardrail supervision.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn complete(&self, prompt: &Prompt) -> Result<String, GeneratorError>;
    async fn stream(&self, prompt: &Prompt) -> Result<ChunkStream, GeneratorError>;
}

/// The external embedding capability, one vector per input text.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, GeneratorError>;
}

// ── Rasterizer ───────────────────────────────────────────────────────────

/// Factory for per-worker rasteriser handles.
///
/// The underlying rendering library is assumed unsafe to share across
/// concurrent calls, so every render-pool worker opens its **own** handle
/// on the document via [`Rasterizer::open`] and keeps it private for the
/// worker's lifetime.
pub trait Rasterizer: Send + Sync {
    fn open(&self, document: &[u8]) -> Result<Box<dyn RasterHandle>, String>;
}

/// A private, single-owner handle on one opened document.
pub trait RasterHandle: Send {
    fn page_count(&self) -> usize;
    /// Render one page. A per-page failure (corrupt page, decoder error)
    /// is an `Err` here and becomes a per-page render error, never a pool
    /// abort.
    fn render_page(&mut self, index: usize) -> Result<Pixmap, String>;
}

// ── JobRepository ────────────────────────────────────────────────────────

/// Persistence for batch and document records.
///
/// Multiple document pipelines save sibling records of the same batch
/// concurrently, so implementations must tolerate concurrent partial
/// updates (read-modify-write per record or equivalent).
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn save_batch(&self, job: &BatchJob);
    async fn save_document(&self, job: &DocumentJob);
    async fn load_batch(&self, id: Uuid) -> Option<BatchJob>;
    async fn load_document(&self, id: Uuid) -> Option<DocumentJob>;
}

/// In-memory repository backed by `RwLock<HashMap>`.
///
/// The default for library users and the workhorse of the test suite.
#[derive(Default)]
pub struct InMemoryJobRepository {
    batches: RwLock<HashMap<Uuid, BatchJob>>,
    documents: RwLock<HashMap<Uuid, DocumentJob>>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn save_batch(&self, job: &BatchJob) {
        self.batches.write().await.insert(job.id, job.clone());
    }

    async fn save_document(&self, job: &DocumentJob) {
        self.documents.write().await.insert(job.id, job.clone());
    }

    async fn load_batch(&self, id: Uuid) -> Option<BatchJob> {
        self.batches.read().await.get(&id).cloned()
    }

    async fn load_document(&self, id: Uuid) -> Option<DocumentJob> {
        self.documents.read().await.get(&id).cloned()
    }
}

// ── ProgressSink ─────────────────────────────────────────────────────────

/// Failure to publish a progress event. Logged and swallowed by the
/// orchestrator — a broken notification channel never fails the pipeline.
#[derive(Debug, Error)]
#[error("progress publish failed: {0}")]
pub struct SinkError(pub String);

/// Events the orchestrator publishes after every state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    BatchStarted {
        total_documents: usize,
    },
    DocumentStageChanged {
        document_id: Uuid,
        stage: Stage,
        status: StageStatus,
        progress_percent: f32,
    },
    DocumentFinished {
        document_id: Uuid,
        status: DocumentStatus,
        progress_percent: f32,
    },
    BatchFinished {
        status: crate::job::BatchStatus,
    },
}

/// Push channel for batch progress (server-push UI, webhook, broadcast).
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn publish(&self, batch_id: Uuid, event: ProgressEvent) -> Result<(), SinkError>;
}

/// Sink that discards every event. The default when no channel is wired.
pub struct NoopProgressSink;

#[async_trait]
impl ProgressSink for NoopProgressSink {
    async fn publish(&self, _batch_id: Uuid, _event: ProgressEvent) -> Result<(), SinkError> {
        Ok(())
    }
}

// ── ObservabilityRecorder ────────────────────────────────────────────────

/// Structured event emission, fire-and-forget. Implementations must never
/// block or fail the caller.
pub trait ObservabilityRecorder: Send + Sync {
    fn record(&self, stage: Stage, details: &str);
}

/// Recorder that forwards events to the `tracing` subscriber.
pub struct TracingRecorder;

impl ObservabilityRecorder for TracingRecorder {
    fn record(&self, stage: Stage, details: &str) {
        tracing::debug!(stage = stage.name(), details, "pipeline event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::FailureStrategy;

    #[tokio::test]
    async fn in_memory_repository_round_trips() {
        let repo = InMemoryJobRepository::new();
        let batch = BatchJob::new(vec![Uuid::new_v4()], FailureStrategy::Continue);
        repo.save_batch(&batch).await;

        let loaded = repo.load_batch(batch.id).await.unwrap();
        assert_eq!(loaded.id, batch.id);
        assert_eq!(loaded.documents, batch.documents);
        assert!(repo.load_batch(Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn noop_sink_accepts_everything() {
        let sink = NoopProgressSink;
        let res = sink
            .publish(
                Uuid::new_v4(),
                ProgressEvent::BatchStarted { total_documents: 3 },
            )
            .await;
        assert!(res.is_ok());
    }

    #[test]
    fn progress_event_serialises_with_event_tag() {
        let ev = ProgressEvent::BatchFinished {
            status: crate::job::BatchStatus::Completed,
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"event\":\"batch_finished\""), "got: {json}");
    }
}
