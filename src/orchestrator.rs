//! Batch orchestrator: admission, failure policy, and progress.
//!
//! ## Contract
//!
//! [`BatchOrchestrator::submit`] creates the job records, spawns the batch
//! driver task, and returns the batch id immediately — pipelines run in the
//! background. [`BatchOrchestrator::snapshot`] returns the current
//! [`BatchJob`] state at any time, safe to poll; with no intervening
//! transitions, repeated snapshots are identical.
//!
//! ## Admission
//!
//! Documents are admitted in submission order through a counting semaphore
//! sized `max_concurrent_documents`: at most that many document pipelines
//! are ever in the running state, and as each finishes the next queued
//! document is admitted.
//!
//! ## Failure strategy
//!
//! `Continue` isolates failures per document — the batch always runs every
//! document to a terminal state. `FailAll` sets an abort flag on the first
//! document failure: documents not yet admitted go straight to `failed`
//! with a `cancelled_by_policy` marker, while documents already running
//! are never preempted — they finish and their real outcome is recorded.
//!
//! After every document or stage transition the orchestrator persists the
//! affected records and publishes a [`ProgressEvent`]; a failing progress
//! sink is logged and ignored, it never fails the pipeline.

use crate::config::BatchConfig;
use crate::error::BatchError;
use crate::job::{BatchJob, DocumentJob, DocumentStatus, FailureStrategy, Stage, StageStatus};
use crate::pipeline::document::{DocumentPipeline, StageObserver};
use crate::pipeline::page::PageProcessor;
use crate::pipeline::render::PixmapRenderPool;
use crate::ports::{
    Embedder, Generator, InMemoryJobRepository, JobRepository, NoopProgressSink,
    ObservabilityRecorder, ProgressEvent, ProgressSink, Rasterizer, TracingRecorder,
};
use crate::ratelimit::RateLimiter;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};
use tracing::{info, warn};
use uuid::Uuid;

/// One document handed to `submit`: a caller-side identity plus the raw
/// document bytes.
pub struct SubmittedDocument {
    pub source_id: String,
    pub bytes: Vec<u8>,
}

impl SubmittedDocument {
    pub fn new(source_id: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            source_id: source_id.into(),
            bytes,
        }
    }
}

/// The batch engine's entry point. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct BatchOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<BatchConfig>,
    generator: Arc<dyn Generator>,
    embedder: Arc<dyn Embedder>,
    rasterizer: Arc<dyn Rasterizer>,
    repository: Arc<dyn JobRepository>,
    sink: Arc<dyn ProgressSink>,
    recorder: Arc<dyn ObservabilityRecorder>,
    /// Live batch records, the source of truth for snapshots. Batches are
    /// mutated only by their own driver task.
    batches: RwLock<HashMap<Uuid, BatchJob>>,
    /// Batch ids in creation order, for `list_recent`.
    created_order: RwLock<Vec<Uuid>>,
}

/// Builder over the three required ports. The repository, sink, and
/// recorder default to the in-process implementations.
pub struct OrchestratorBuilder {
    config: BatchConfig,
    generator: Arc<dyn Generator>,
    embedder: Arc<dyn Embedder>,
    rasterizer: Arc<dyn Rasterizer>,
    repository: Arc<dyn JobRepository>,
    sink: Arc<dyn ProgressSink>,
    recorder: Arc<dyn ObservabilityRecorder>,
}

impl OrchestratorBuilder {
    pub fn repository(mut self, repository: Arc<dyn JobRepository>) -> Self {
        self.repository = repository;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn recorder(mut self, recorder: Arc<dyn ObservabilityRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn build(self) -> BatchOrchestrator {
        BatchOrchestrator {
            inner: Arc::new(Inner {
                config: Arc::new(self.config),
                generator: self.generator,
                embedder: self.embedder,
                rasterizer: self.rasterizer,
                repository: self.repository,
                sink: self.sink,
                recorder: self.recorder,
                batches: RwLock::new(HashMap::new()),
                created_order: RwLock::new(Vec::new()),
            }),
        }
    }
}

impl BatchOrchestrator {
    /// Create an orchestrator over the three required ports, with an
    /// in-memory repository, no-op progress sink, and tracing recorder.
    pub fn new(
        config: BatchConfig,
        generator: Arc<dyn Generator>,
        embedder: Arc<dyn Embedder>,
        rasterizer: Arc<dyn Rasterizer>,
    ) -> Self {
        Self::builder(config, generator, embedder, rasterizer).build()
    }

    /// Start a builder for wiring non-default collaborators.
    pub fn builder(
        config: BatchConfig,
        generator: Arc<dyn Generator>,
        embedder: Arc<dyn Embedder>,
        rasterizer: Arc<dyn Rasterizer>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            generator,
            embedder,
            rasterizer,
            repository: Arc::new(InMemoryJobRepository::new()),
            sink: Arc::new(NoopProgressSink),
            recorder: Arc::new(TracingRecorder),
        }
    }

    /// Submit a batch. Returns the batch id immediately; pipelines run in
    /// a background task.
    pub async fn submit(
        &self,
        documents: Vec<SubmittedDocument>,
        strategy: FailureStrategy,
    ) -> Result<Uuid, BatchError> {
        if documents.is_empty() {
            return Err(BatchError::EmptyBatch);
        }

        let mut jobs = Vec::with_capacity(documents.len());
        for submitted in documents {
            // batch_id is patched below once the BatchJob exists.
            jobs.push((DocumentJob::new(Uuid::nil(), submitted.source_id), submitted.bytes));
        }

        let batch = BatchJob::new(jobs.iter().map(|(d, _)| d.id).collect(), strategy);
        let batch_id = batch.id;
        for (doc, _) in jobs.iter_mut() {
            doc.batch_id = batch_id;
        }

        self.inner.repository.save_batch(&batch).await;
        for (doc, _) in &jobs {
            self.inner.repository.save_document(doc).await;
        }
        self.inner.batches.write().await.insert(batch_id, batch);
        self.inner.created_order.write().await.push(batch_id);

        info!(%batch_id, documents = jobs.len(), "batch submitted");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            run_batch(inner, batch_id, jobs, strategy).await;
        });

        Ok(batch_id)
    }

    /// Current state of a batch. Identical across calls when no transition
    /// happened in between.
    pub async fn snapshot(&self, batch_id: Uuid) -> Result<BatchJob, BatchError> {
        self.inner
            .batches
            .read()
            .await
            .get(&batch_id)
            .cloned()
            .ok_or(BatchError::UnknownBatch(batch_id))
    }

    /// Current state of one document, from the repository.
    pub async fn document(&self, document_id: Uuid) -> Option<DocumentJob> {
        self.inner.repository.load_document(document_id).await
    }

    /// The most recently created batches, newest first.
    pub async fn list_recent(&self, limit: usize) -> Vec<BatchJob> {
        let order = self.inner.created_order.read().await;
        let batches = self.inner.batches.read().await;
        order
            .iter()
            .rev()
            .take(limit)
            .filter_map(|id| batches.get(id).cloned())
            .collect()
    }
}

// ── Batch driver ─────────────────────────────────────────────────────────

async fn run_batch(
    inner: Arc<Inner>,
    batch_id: Uuid,
    documents: Vec<(DocumentJob, Vec<u8>)>,
    strategy: FailureStrategy,
) {
    let limiter = RateLimiter::new(inner.config.requests_per_minute, inner.config.burst_capacity);
    let pipeline = Arc::new(DocumentPipeline::new(
        PixmapRenderPool::new(Arc::clone(&inner.rasterizer), inner.config.render_workers),
        PageProcessor::new(
            Arc::clone(&inner.generator),
            Arc::clone(&limiter),
            Arc::clone(&inner.config),
        ),
        Arc::clone(&inner.embedder),
        limiter,
        Arc::clone(&inner.config),
        Arc::clone(&inner.recorder),
    ));

    let semaphore = Arc::new(Semaphore::new(inner.config.max_concurrent_documents));
    let aborted = Arc::new(AtomicBool::new(false));

    {
        let mut batches = inner.batches.write().await;
        if let Some(batch) = batches.get_mut(&batch_id) {
            batch.mark_running();
            inner.repository.save_batch(batch).await;
        }
    }
    let total_documents = documents.len();
    publish(
        &inner,
        batch_id,
        ProgressEvent::BatchStarted { total_documents },
    )
    .await;

    let mut handles = Vec::with_capacity(documents.len());
    for (mut doc, bytes) in documents {
        // Queued-side policy check: once fail_all fires, everything not
        // yet started transitions straight to failed/cancelled_by_policy.
        if aborted.load(Ordering::SeqCst) {
            cancel_document(&inner, batch_id, &mut doc).await;
            continue;
        }

        let permit = match Arc::clone(&semaphore).acquire_owned().await {
            Ok(p) => p,
            Err(_) => break, // semaphore closed, process shutting down
        };

        // The flag may have been set while we waited for admission; a
        // permit in hand does not entitle a cancelled document to run.
        if aborted.load(Ordering::SeqCst) {
            drop(permit);
            cancel_document(&inner, batch_id, &mut doc).await;
            continue;
        }

        let inner = Arc::clone(&inner);
        let pipeline = Arc::clone(&pipeline);
        let aborted = Arc::clone(&aborted);
        handles.push(tokio::spawn(async move {
            let observer = OrchestratorObserver {
                inner: Arc::clone(&inner),
                batch_id,
            };
            let _chunks = pipeline.run(&mut doc, &bytes, &observer).await;

            // The flag must be visible before the permit frees the next
            // queued document, or that document could slip past the
            // post-admission check.
            if doc.status == DocumentStatus::Failed && strategy == FailureStrategy::FailAll {
                warn!(%batch_id, document = %doc.source_id, "fail_all triggered");
                aborted.store(true, Ordering::SeqCst);
            }
            drop(permit);

            document_finished(&inner, batch_id, &doc).await;
            doc.status
        }));
    }

    let mut any_partial = false;
    for handle in handles {
        match handle.await {
            Ok(status) => any_partial |= status == DocumentStatus::Partial,
            Err(e) => warn!(%batch_id, "document task panicked: {e}"),
        }
    }

    let terminal = {
        let mut batches = inner.batches.write().await;
        match batches.get_mut(&batch_id) {
            Some(batch) => {
                batch.finalize(any_partial);
                inner.repository.save_batch(batch).await;
                batch.status
            }
            None => return,
        }
    };
    info!(%batch_id, status = ?terminal, "batch finished");
    publish(&inner, batch_id, ProgressEvent::BatchFinished { status: terminal }).await;
}

/// Mark a never-admitted document as cancelled and fold it into the batch.
async fn cancel_document(inner: &Arc<Inner>, batch_id: Uuid, doc: &mut DocumentJob) {
    doc.cancel_by_policy();
    document_finished(inner, batch_id, doc).await;
}

/// Terminal bookkeeping for one document: batch counters, persistence, and
/// the progress event. Called exactly once per document.
async fn document_finished(inner: &Arc<Inner>, batch_id: Uuid, doc: &DocumentJob) {
    let progress = {
        let mut batches = inner.batches.write().await;
        match batches.get_mut(&batch_id) {
            Some(batch) => {
                batch.record_document_terminal(doc.status);
                inner.repository.save_batch(batch).await;
                batch.progress_percent()
            }
            None => 0.0,
        }
    };
    inner.repository.save_document(doc).await;
    publish(
        inner,
        batch_id,
        ProgressEvent::DocumentFinished {
            document_id: doc.id,
            status: doc.status,
            progress_percent: progress,
        },
    )
    .await;
}

/// Publish a progress event, swallowing sink failures.
async fn publish(inner: &Arc<Inner>, batch_id: Uuid, event: ProgressEvent) {
    if let Err(e) = inner.sink.publish(batch_id, event).await {
        warn!(%batch_id, "progress publish failed: {e}");
    }
}

/// Persists and publishes per-stage transitions as the pipeline runs.
struct OrchestratorObserver {
    inner: Arc<Inner>,
    batch_id: Uuid,
}

#[async_trait]
impl StageObserver for OrchestratorObserver {
    async fn on_transition(&self, doc: &DocumentJob, stage: Stage, status: StageStatus) {
        self.inner.repository.save_document(doc).await;
        let progress = self
            .inner
            .batches
            .read()
            .await
            .get(&self.batch_id)
            .map(|b| b.progress_percent())
            .unwrap_or(0.0);
        publish(
            &self.inner,
            self.batch_id,
            ProgressEvent::DocumentStageChanged {
                document_id: doc.id,
                stage,
                status,
                progress_percent: progress,
            },
        )
        .await;
    }
}
