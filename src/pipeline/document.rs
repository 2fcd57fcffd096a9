//! Document pipeline: the ordered stage sequence for one document.
//!
//! Stages run strictly in order: ingestion (render), parsing (page
//! fan-out), cleaning (folded into the per-page clean call; the stage
//! records the aggregate), chunking (sequential — it must see the full
//! cleaned document to assign contiguous offsets), enrichment, and
//! vectorization. Each stage records its start time, duration, and status.
//!
//! Failure semantics: a stage that produces *no* usable output fails the
//! document and short-circuits the remainder — every page failing to parse
//! stops the pipeline before cleaning. Degraded-but-usable stages are
//! `partial` and simply propagate reduced content forward; a later partial
//! never retroactively fails an earlier completed stage.

use crate::config::BatchConfig;
use crate::job::{DocumentJob, DocumentStatus, Stage, StageStatus};
use crate::pipeline::chunk::{self, Chunk};
use crate::pipeline::page::{PageInput, PageProcessor};
use crate::pipeline::render::PixmapRenderPool;
use crate::ports::{Embedder, ObservabilityRecorder};
use crate::ratelimit::RateLimiter;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Hook the orchestrator implements to persist and publish every stage
/// transition as it happens. Kept async so the repository save and sink
/// publish can ride the same call.
#[async_trait]
pub trait StageObserver: Send + Sync {
    async fn on_transition(&self, doc: &DocumentJob, stage: Stage, status: StageStatus);
}

/// No-op observer for direct library use of the pipeline.
pub struct NoopStageObserver;

#[async_trait]
impl StageObserver for NoopStageObserver {
    async fn on_transition(&self, _doc: &DocumentJob, _stage: Stage, _status: StageStatus) {}
}

/// Runs one document through the full stage sequence.
pub struct DocumentPipeline {
    render_pool: PixmapRenderPool,
    pages: PageProcessor,
    embedder: Arc<dyn Embedder>,
    limiter: Arc<RateLimiter>,
    config: Arc<BatchConfig>,
    recorder: Arc<dyn ObservabilityRecorder>,
}

impl DocumentPipeline {
    pub fn new(
        render_pool: PixmapRenderPool,
        pages: PageProcessor,
        embedder: Arc<dyn Embedder>,
        limiter: Arc<RateLimiter>,
        config: Arc<BatchConfig>,
        recorder: Arc<dyn ObservabilityRecorder>,
    ) -> Self {
        Self {
            render_pool,
            pages,
            embedder,
            limiter,
            config,
            recorder,
        }
    }

    /// Run all stages, mutating `doc` to its terminal state.
    ///
    /// Returns the enriched (and possibly embedded) chunks so callers can
    /// hand them to downstream storage; the engine itself only records
    /// counts.
    pub async fn run(
        &self,
        doc: &mut DocumentJob,
        document_bytes: &[u8],
        observer: &dyn StageObserver,
    ) -> Vec<Chunk> {
        doc.status = DocumentStatus::Running;
        info!(document = %doc.source_id, "pipeline started");

        // ── Ingestion: rasterise every page ──────────────────────────────
        self.start_stage(doc, Stage::Ingestion, observer).await;
        let rendered = self.render_pool.render_all(document_bytes).await;
        let (ingestion_status, rendered) = match rendered {
            Err(e) => {
                warn!(document = %doc.source_id, "ingestion failed: {e}");
                doc.error_summary.push(format!("ingestion: {e}"));
                self.finish_stage(doc, Stage::Ingestion, StageStatus::Failed, observer)
                    .await;
                doc.resolve_status();
                return Vec::new();
            }
            Ok(pages) => {
                let failures = pages.iter().filter(|p| p.result.is_err()).count();
                for page in pages.iter().filter(|p| p.result.is_err()) {
                    if let Err(ref e) = page.result {
                        doc.error_summary
                            .push(format!("render page {}: {e}", page.page_index));
                    }
                }
                let status = if failures == 0 {
                    StageStatus::Succeeded
                } else if failures < pages.len() {
                    StageStatus::Partial
                } else {
                    // Every page failed to render; parsing would be all
                    // missing_input, so fail here with a clear summary.
                    StageStatus::Failed
                };
                (status, pages)
            }
        };
        self.finish_stage(doc, Stage::Ingestion, ingestion_status, observer)
            .await;
        if ingestion_status == StageStatus::Failed {
            doc.resolve_status();
            return Vec::new();
        }

        // ── Parsing: per-page extraction fan-out ─────────────────────────
        self.start_stage(doc, Stage::Parsing, observer).await;
        let parse_start = Instant::now();
        let inputs: Vec<PageInput> = rendered
            .into_iter()
            .map(|p| PageInput {
                page_index: p.page_index,
                pixmap: p.result.ok(),
            })
            .collect();
        let processed = self.pages.process_all(inputs).await;

        for page in &processed {
            if let Some(ref failure) = page.outcome.failure {
                doc.error_summary
                    .push(format!("page {}: {failure}", page.outcome.page_index));
            }
            doc.pages.push(page.outcome.clone());
        }

        let usable = processed
            .iter()
            .filter(|p| p.outcome.parse != crate::job::ParseStatus::Failed)
            .count();
        let parsing_status = if usable == 0 {
            StageStatus::Failed
        } else if usable == processed.len() {
            // Pages may still be partial; only fully clean pages make the
            // stage succeeded.
            if processed
                .iter()
                .all(|p| p.outcome.parse == crate::job::ParseStatus::Success)
            {
                StageStatus::Succeeded
            } else {
                StageStatus::Partial
            }
        } else {
            StageStatus::Partial
        };
        doc.stage_finished(
            Stage::Parsing,
            parsing_status,
            parse_start.elapsed().as_millis() as u64,
        );
        observer.on_transition(doc, Stage::Parsing, parsing_status).await;
        self.recorder.record(
            Stage::Parsing,
            &format!("{usable}/{} pages usable", processed.len()),
        );

        if parsing_status == StageStatus::Failed {
            // Zero pages extracted: short-circuit before cleaning.
            warn!(document = %doc.source_id, "every page failed, short-circuiting");
            doc.resolve_status();
            return Vec::new();
        }

        // ── Cleaning: performed per page inside the parse fan-out ────────
        // The clean model call already ran under the same rate/guardrail
        // discipline; this stage records the aggregate outcome.
        self.start_stage(doc, Stage::Cleaning, observer).await;
        self.finish_stage(doc, Stage::Cleaning, parsing_status, observer)
            .await;

        // ── Chunking: sequential, contiguous offsets ─────────────────────
        self.start_stage(doc, Stage::Chunking, observer).await;
        let chunk_start = Instant::now();
        let page_texts: Vec<String> = processed.into_iter().map(|p| p.text).collect();
        let assembled = chunk::assemble_document(&page_texts);
        let mut chunks = chunk::chunk_text(&assembled, self.config.chunk_size, self.config.chunk_overlap);
        doc.chunk_count = chunks.len();

        let chunking_status = if chunks.is_empty() {
            doc.error_summary
                .push("chunking: no usable text survived parsing".into());
            StageStatus::Failed
        } else {
            StageStatus::Succeeded
        };
        doc.stage_finished(
            Stage::Chunking,
            chunking_status,
            chunk_start.elapsed().as_millis() as u64,
        );
        observer.on_transition(doc, Stage::Chunking, chunking_status).await;
        self.recorder
            .record(Stage::Chunking, &format!("{} chunks", chunks.len()));

        if chunking_status == StageStatus::Failed {
            doc.resolve_status();
            return Vec::new();
        }

        // ── Enrichment: section labels + token estimates ─────────────────
        self.start_stage(doc, Stage::Enrichment, observer).await;
        let enrich_start = Instant::now();
        chunk::enrich(&mut chunks, &assembled);
        doc.stage_finished(
            Stage::Enrichment,
            StageStatus::Succeeded,
            enrich_start.elapsed().as_millis() as u64,
        );
        observer
            .on_transition(doc, Stage::Enrichment, StageStatus::Succeeded)
            .await;

        // ── Vectorization: rate-limited embedding fan-out ────────────────
        self.start_stage(doc, Stage::Vectorization, observer).await;
        let embed_start = Instant::now();
        let (embed_status, embedded) = crate::pipeline::embed::vectorize(
            &mut chunks,
            Arc::clone(&self.embedder),
            Arc::clone(&self.limiter),
            &self.config,
        )
        .await;
        doc.embedded_chunks = embedded;
        doc.stage_finished(
            Stage::Vectorization,
            embed_status,
            embed_start.elapsed().as_millis() as u64,
        );
        observer.on_transition(doc, Stage::Vectorization, embed_status).await;
        self.recorder.record(
            Stage::Vectorization,
            &format!("{embedded}/{} chunks embedded", chunks.len()),
        );

        doc.resolve_status();
        info!(document = %doc.source_id, status = ?doc.status, "pipeline finished");
        chunks
    }

    async fn start_stage(&self, doc: &mut DocumentJob, stage: Stage, observer: &dyn StageObserver) {
        doc.stage_started(stage);
        observer.on_transition(doc, stage, StageStatus::Running).await;
    }

    async fn finish_stage(
        &self,
        doc: &mut DocumentJob,
        stage: Stage,
        status: StageStatus,
        observer: &dyn StageObserver,
    ) {
        let duration = doc
            .stages
            .get(&stage)
            .and_then(|r| r.started_at)
            .map(|t| (chrono::Utc::now() - t).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        doc.stage_finished(stage, status, duration);
        observer.on_transition(doc, stage, status).await;
    }
}
