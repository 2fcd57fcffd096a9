//! Job records: the observable state of a batch and its documents.
//!
//! Three record types mirror the three aggregation levels:
//!
//! * [`BatchJob`] — one per `submit()`. Owned exclusively by the
//!   orchestrator and mutated only through its transition methods; once a
//!   terminal status is reached the record never changes again, so a
//!   `snapshot()` of a finished batch is stable forever.
//! * [`DocumentJob`] — one per submitted document, carrying a per-stage
//!   status map and every [`PageOutcome`] the parse stage produced.
//! * [`PageOutcome`] — one per page per parse attempt, immutable after
//!   creation. A retry creates a new outcome, it never rewrites history.
//!
//! All records derive `Serialize`/`Deserialize` so repositories and
//! progress sinks can persist or ship them without translation.

use crate::error::PageFailure;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// ── Status enums ─────────────────────────────────────────────────────────

/// Batch-level lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl BatchStatus {
    /// A terminal batch never transitions again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::CompletedWithErrors | BatchStatus::Failed
        )
    }
}

/// How one document's failure affects its siblings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStrategy {
    /// A failed document does not affect others; the batch runs to the end. (default)
    #[default]
    Continue,
    /// On the first failed document, stop admitting new documents and mark
    /// everything not yet started as cancelled. Running documents finish.
    FailAll,
}

/// The ordered pipeline stages.
///
/// The discriminant order is the execution order; [`Stage::ALL`] iterates
/// them in sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Ingestion,
    Parsing,
    Cleaning,
    Chunking,
    Enrichment,
    Vectorization,
}

impl Stage {
    /// All stages in execution order.
    pub const ALL: [Stage; 6] = [
        Stage::Ingestion,
        Stage::Parsing,
        Stage::Cleaning,
        Stage::Chunking,
        Stage::Enrichment,
        Stage::Vectorization,
    ];

    /// Stable lowercase name, used in observability events and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Ingestion => "ingestion",
            Stage::Parsing => "parsing",
            Stage::Cleaning => "cleaning",
            Stage::Chunking => "chunking",
            Stage::Enrichment => "enrichment",
            Stage::Vectorization => "vectorization",
        }
    }
}

/// Per-stage status within a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    /// The stage produced usable but incomplete output (e.g. some pages
    /// degraded). Later stages still run on the reduced content.
    Partial,
    /// The stage produced no usable output; the document cannot proceed.
    Failed,
}

/// Document-level terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Partial,
    Failed,
}

impl DocumentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DocumentStatus::Succeeded | DocumentStatus::Partial | DocumentStatus::Failed
        )
    }
}

/// Classification of a single page's parse attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseStatus {
    Success,
    Partial,
    Failed,
}

// ── Records ──────────────────────────────────────────────────────────────

/// The outcome of one parse attempt for one page.
///
/// Immutable after creation. `element_count` is the number of structured
/// elements extracted before the stream ended or was aborted — it decides
/// `failed` (zero) vs `partial` (at least one) when the guardrail fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageOutcome {
    /// 0-indexed page number within the source document.
    pub page_index: usize,
    pub parse: ParseStatus,
    /// Classified failure, present for `partial` and `failed` outcomes.
    pub failure: Option<PageFailure>,
    /// Structured elements extracted from the page.
    pub element_count: usize,
    /// Length of the cleaned text carried forward to chunking.
    pub cleaned_len: usize,
}

impl PageOutcome {
    pub fn success(page_index: usize, element_count: usize, cleaned_len: usize) -> Self {
        Self {
            page_index,
            parse: ParseStatus::Success,
            failure: None,
            element_count,
            cleaned_len,
        }
    }

    pub fn partial(
        page_index: usize,
        failure: PageFailure,
        element_count: usize,
        cleaned_len: usize,
    ) -> Self {
        Self {
            page_index,
            parse: ParseStatus::Partial,
            failure: Some(failure),
            element_count,
            cleaned_len,
        }
    }

    pub fn failed(page_index: usize, failure: PageFailure) -> Self {
        Self {
            page_index,
            parse: ParseStatus::Failed,
            failure: Some(failure),
            element_count: 0,
            cleaned_len: 0,
        }
    }
}

/// Timing and status record for one pipeline stage of one document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageRecord {
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

/// The full state of one document moving through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentJob {
    pub id: Uuid,
    pub batch_id: Uuid,
    /// Caller-supplied identity of the source document.
    pub source_id: String,
    pub status: DocumentStatus,
    /// Per-stage status map, keyed by stage in execution order.
    pub stages: BTreeMap<Stage, StageRecord>,
    pub pages: Vec<PageOutcome>,
    /// Human-readable summaries of page/stage failures, for reports.
    pub error_summary: Vec<String>,
    pub chunk_count: usize,
    pub embedded_chunks: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentJob {
    pub fn new(batch_id: Uuid, source_id: impl Into<String>) -> Self {
        let now = Utc::now();
        let stages = Stage::ALL
            .iter()
            .map(|s| (*s, StageRecord::default()))
            .collect();
        Self {
            id: Uuid::new_v4(),
            batch_id,
            source_id: source_id.into(),
            status: DocumentStatus::Pending,
            stages,
            pages: Vec::new(),
            error_summary: Vec::new(),
            chunk_count: 0,
            embedded_chunks: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Mark a stage as running, recording its start time.
    pub fn stage_started(&mut self, stage: Stage) {
        let rec = self.stages.entry(stage).or_default();
        rec.status = StageStatus::Running;
        rec.started_at = Some(Utc::now());
        self.updated_at = Utc::now();
    }

    /// Record a stage's final status and duration.
    pub fn stage_finished(&mut self, stage: Stage, status: StageStatus, duration_ms: u64) {
        let rec = self.stages.entry(stage).or_default();
        rec.status = status;
        rec.duration_ms = Some(duration_ms);
        self.updated_at = Utc::now();
    }

    pub fn stage_status(&self, stage: Stage) -> StageStatus {
        self.stages.get(&stage).map(|r| r.status).unwrap_or_default()
    }

    /// Derive the document's terminal status from its stage map.
    ///
    /// `Succeeded` iff every stage succeeded; `Failed` if any stage failed
    /// outright; `Partial` otherwise (some stage degraded but the document
    /// still produced usable output).
    pub fn resolve_status(&mut self) {
        let statuses: Vec<StageStatus> = Stage::ALL.iter().map(|s| self.stage_status(*s)).collect();
        self.status = if statuses.iter().any(|s| *s == StageStatus::Failed) {
            DocumentStatus::Failed
        } else if statuses.iter().all(|s| *s == StageStatus::Succeeded) {
            DocumentStatus::Succeeded
        } else {
            DocumentStatus::Partial
        };
        self.updated_at = Utc::now();
    }

    /// Mark the document failed before any stage ran (policy cancellation).
    pub fn cancel_by_policy(&mut self) {
        self.status = DocumentStatus::Failed;
        self.error_summary
            .push(PageFailure::CancelledByPolicy.to_string());
        self.updated_at = Utc::now();
    }
}

/// The top-level state of one submitted batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: Uuid,
    /// Document ids in submission order.
    pub documents: Vec<Uuid>,
    pub status: BatchStatus,
    pub strategy: FailureStrategy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Terminal documents (succeeded + partial + failed) seen so far.
    pub completed_documents: usize,
    pub failed_documents: usize,
}

impl BatchJob {
    pub fn new(documents: Vec<Uuid>, strategy: FailureStrategy) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            documents,
            status: BatchStatus::Pending,
            strategy,
            created_at: now,
            updated_at: now,
            completed_documents: 0,
            failed_documents: 0,
        }
    }

    /// Fraction of documents that reached a terminal state, 0–100.
    pub fn progress_percent(&self) -> f32 {
        if self.documents.is_empty() {
            return 100.0;
        }
        (self.completed_documents as f32 / self.documents.len() as f32) * 100.0
    }

    pub fn mark_running(&mut self) {
        debug_assert!(!self.status.is_terminal());
        self.status = BatchStatus::Running;
        self.updated_at = Utc::now();
    }

    /// Fold one document's terminal status into the batch counters.
    pub fn record_document_terminal(&mut self, status: DocumentStatus) {
        debug_assert!(status.is_terminal());
        self.completed_documents += 1;
        if status == DocumentStatus::Failed {
            self.failed_documents += 1;
        }
        self.updated_at = Utc::now();
    }

    /// Compute the terminal batch status once every document is terminal.
    ///
    /// `Completed` when nothing failed or degraded, `Failed` when every
    /// document failed, `CompletedWithErrors` otherwise.
    pub fn finalize(&mut self, any_partial: bool) {
        debug_assert_eq!(self.completed_documents, self.documents.len());
        self.status = if self.failed_documents == self.documents.len() {
            BatchStatus::Failed
        } else if self.failed_documents > 0 || any_partial {
            BatchStatus::CompletedWithErrors
        } else {
            BatchStatus::Completed
        };
        self.updated_at = Utc::now();
    }
}
