//! End-to-end batch tests over fully scripted ports.
//!
//! Every collaborator (generator, embedder, rasteriser) is a deterministic
//! mock, so these run in CI without network access. Documents whose bytes
//! are `b"poison"` make every parse call fail; everything else extracts,
//! cleans, chunks, and embeds successfully.
//!
//! Run with:
//!   cargo test --test orchestrator -- --nocapture

use async_trait::async_trait;
use docbatch::ports::{
    ChunkStream, Embedder, Generator, Pixmap, Prompt, RasterHandle, Rasterizer,
};
use docbatch::{
    BatchConfig, BatchError, BatchJob, BatchOrchestrator, BatchStatus, DocumentStatus,
    FailureStrategy, GeneratorError, PageElement, Stage, StageStatus, SubmittedDocument,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use uuid::Uuid;

// ── Test helpers ─────────────────────────────────────────────────────────

/// Tracks the high-water mark of concurrent generator calls.
#[derive(Default)]
struct Gauge {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl Gauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    fn high_water(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

fn page_json() -> String {
    let elements = vec![
        PageElement {
            kind: "heading".into(),
            text: "# Quarterly Report".into(),
        },
        PageElement {
            kind: "paragraph".into(),
            text: "Revenue grew in every region this quarter.".into(),
        },
    ];
    serde_json::to_string(&elements).unwrap()
}

fn chunked(s: &str) -> ChunkStream {
    let chunks: Vec<Result<String, GeneratorError>> = s
        .as_bytes()
        .chunks(13)
        .map(|c| Ok(String::from_utf8(c.to_vec()).unwrap()))
        .collect();
    Box::pin(tokio_stream::iter(chunks))
}

/// Parse calls return scripted page JSON; clean calls echo the raw text
/// back. Pages rendered from `b"poison"` documents fail with a transport
/// error. `delay_ms` holds each call open so concurrency is observable.
struct MockGenerator {
    gauge: Arc<Gauge>,
    delay_ms: u64,
}

impl MockGenerator {
    fn new() -> Self {
        Self {
            gauge: Arc::new(Gauge::default()),
            delay_ms: 0,
        }
    }
}

#[async_trait]
impl Generator for MockGenerator {
    async fn complete(&self, prompt: &Prompt) -> Result<String, GeneratorError> {
        Ok(prompt.text.clone())
    }

    async fn stream(&self, prompt: &Prompt) -> Result<ChunkStream, GeneratorError> {
        self.gauge.enter();
        if self.delay_ms > 0 {
            sleep(Duration::from_millis(self.delay_ms)).await;
        }
        self.gauge.exit();

        if let Some(image) = &prompt.image {
            if image.bytes == b"poison" {
                return Err(GeneratorError::Transport("model rejected page".into()));
            }
            return Ok(chunked(&page_json()));
        }
        // Clean call: echo the raw text portion of the request.
        let cleaned = prompt.text.rsplit("---\n").next().unwrap_or("").to_string();
        Ok(chunked(&cleaned))
    }
}

struct MockEmbedder;

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, GeneratorError> {
        Ok(texts.iter().map(|t| vec![t.len() as f32, 0.5]).collect())
    }
}

/// One-page documents whose rendered pixmap carries the document bytes, so
/// the generator can tell documents apart.
struct MockRasterizer;

struct MockHandle {
    document: Vec<u8>,
}

impl Rasterizer for MockRasterizer {
    fn open(&self, document: &[u8]) -> Result<Box<dyn RasterHandle>, String> {
        Ok(Box::new(MockHandle {
            document: document.to_vec(),
        }))
    }
}

impl RasterHandle for MockHandle {
    fn page_count(&self) -> usize {
        1
    }

    fn render_page(&mut self, _index: usize) -> Result<Pixmap, String> {
        Ok(Pixmap {
            width: 100,
            height: 140,
            bytes: self.document.clone(),
        })
    }
}

fn config(max_concurrent: usize) -> BatchConfig {
    BatchConfig::builder()
        .max_concurrent_documents(max_concurrent)
        .requests_per_minute(60_000)
        .burst_capacity(1_000)
        .render_workers(1)
        .page_concurrency(2)
        .build()
        .unwrap()
}

/// Wire a subscriber so `RUST_LOG=docbatch=debug cargo test` shows the
/// pipeline's tracing output; idempotent across tests.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn orchestrator(max_concurrent: usize, generator: Arc<dyn Generator>) -> BatchOrchestrator {
    init_tracing();
    BatchOrchestrator::new(
        config(max_concurrent),
        generator,
        Arc::new(MockEmbedder),
        Arc::new(MockRasterizer),
    )
}

fn docs(names: &[&str]) -> Vec<SubmittedDocument> {
    names
        .iter()
        .map(|n| {
            let bytes = if n.starts_with("poison") {
                b"poison".to_vec()
            } else {
                format!("document bytes for {n}").into_bytes()
            };
            SubmittedDocument::new(*n, bytes)
        })
        .collect()
}

/// Poll until the batch reaches a terminal status.
async fn wait_terminal(orch: &BatchOrchestrator, batch_id: Uuid) -> BatchJob {
    for _ in 0..500 {
        let snap = orch.snapshot(batch_id).await.unwrap();
        if snap.status.is_terminal() {
            return snap;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("batch {batch_id} never reached a terminal status");
}

// ── Tests ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn empty_batch_is_rejected() {
    let orch = orchestrator(2, Arc::new(MockGenerator::new()));
    let err = orch.submit(Vec::new(), FailureStrategy::Continue).await;
    assert!(matches!(err, Err(BatchError::EmptyBatch)));
}

#[tokio::test]
async fn unknown_batch_snapshot_errors() {
    let orch = orchestrator(2, Arc::new(MockGenerator::new()));
    let missing = Uuid::new_v4();
    assert!(matches!(
        orch.snapshot(missing).await,
        Err(BatchError::UnknownBatch(id)) if id == missing
    ));
}

#[tokio::test]
async fn clean_batch_completes_with_full_stage_records() {
    let orch = orchestrator(2, Arc::new(MockGenerator::new()));
    let batch_id = orch
        .submit(docs(&["a.pdf", "b.pdf"]), FailureStrategy::Continue)
        .await
        .unwrap();

    let batch = wait_terminal(&orch, batch_id).await;
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(batch.progress_percent(), 100.0);
    assert_eq!(batch.failed_documents, 0);

    for doc_id in &batch.documents {
        let doc = orch.document(*doc_id).await.unwrap();
        assert_eq!(doc.status, DocumentStatus::Succeeded);
        for stage in Stage::ALL {
            assert_eq!(
                doc.stage_status(stage),
                StageStatus::Succeeded,
                "stage {} of {}",
                stage.name(),
                doc.source_id
            );
            assert!(doc.stages[&stage].duration_ms.is_some());
        }
        assert!(doc.chunk_count > 0);
        assert_eq!(doc.embedded_chunks, doc.chunk_count);
        assert!(doc.error_summary.is_empty());
    }
}

#[tokio::test]
async fn continue_strategy_isolates_a_failed_document() {
    let orch = orchestrator(3, Arc::new(MockGenerator::new()));
    let batch_id = orch
        .submit(
            docs(&["first.pdf", "poison.pdf", "third.pdf"]),
            FailureStrategy::Continue,
        )
        .await
        .unwrap();

    let batch = wait_terminal(&orch, batch_id).await;
    assert_eq!(batch.status, BatchStatus::CompletedWithErrors);
    assert_eq!(batch.failed_documents, 1);
    assert_eq!(batch.progress_percent(), 100.0);

    let statuses: Vec<DocumentStatus> = {
        let mut v = Vec::new();
        for id in &batch.documents {
            v.push(orch.document(*id).await.unwrap().status);
        }
        v
    };
    assert_eq!(
        statuses,
        vec![
            DocumentStatus::Succeeded,
            DocumentStatus::Failed,
            DocumentStatus::Succeeded
        ]
    );

    let poisoned = orch.document(batch.documents[1]).await.unwrap();
    assert_eq!(poisoned.stage_status(Stage::Parsing), StageStatus::Failed);
    // Short-circuited: nothing after parsing ever started.
    assert_eq!(poisoned.stage_status(Stage::Chunking), StageStatus::Pending);
    assert!(!poisoned.error_summary.is_empty());
    assert!(poisoned.pages.iter().all(|p| p.failure.is_some()));
}

#[tokio::test]
async fn document_concurrency_never_exceeds_the_cap() {
    let generator = Arc::new(MockGenerator {
        gauge: Arc::new(Gauge::default()),
        delay_ms: 30,
    });
    let gauge = Arc::clone(&generator.gauge);

    let orch = orchestrator(2, generator);
    let batch_id = orch
        .submit(
            docs(&["d1", "d2", "d3", "d4", "d5", "d6"]),
            FailureStrategy::Continue,
        )
        .await
        .unwrap();

    let batch = wait_terminal(&orch, batch_id).await;
    assert_eq!(batch.status, BatchStatus::Completed);
    // One page per document and page_concurrency >= 1, so concurrent
    // generator calls can only come from distinct admitted documents.
    assert!(
        gauge.high_water() <= 2,
        "saw {} concurrent calls with a cap of 2",
        gauge.high_water()
    );
    assert!(gauge.high_water() >= 1);
}

#[tokio::test]
async fn fail_all_cancels_queued_documents_but_not_running_ones() {
    // poison fails fast; the sibling admitted with it is held open by the
    // generator delay so it is still running when the abort flag trips.
    let generator = Arc::new(MockGenerator {
        gauge: Arc::new(Gauge::default()),
        delay_ms: 80,
    });
    let orch = orchestrator(2, generator);
    let batch_id = orch
        .submit(
            docs(&["poison.pdf", "slow.pdf", "q3", "q4", "q5"]),
            FailureStrategy::FailAll,
        )
        .await
        .unwrap();

    let batch = wait_terminal(&orch, batch_id).await;
    // poison failed, the running sibling finished for real, the queue was
    // cancelled: a mixed outcome.
    assert_eq!(batch.status, BatchStatus::CompletedWithErrors);
    assert_eq!(batch.progress_percent(), 100.0);
    assert_eq!(batch.failed_documents, 4);

    let slow = orch.document(batch.documents[1]).await.unwrap();
    assert_eq!(slow.status, DocumentStatus::Succeeded);
    assert_eq!(slow.stage_status(Stage::Vectorization), StageStatus::Succeeded);

    for id in &batch.documents[2..] {
        let doc = orch.document(*id).await.unwrap();
        assert_eq!(doc.status, DocumentStatus::Failed, "{}", doc.source_id);
        // Cancelled before admission: no stage ever ran.
        assert_eq!(doc.stage_status(Stage::Ingestion), StageStatus::Pending);
        assert!(doc
            .error_summary
            .iter()
            .any(|e| e.contains("cancelled")), "{:?}", doc.error_summary);
    }
}

#[tokio::test]
async fn snapshot_of_a_finished_batch_is_idempotent() {
    let orch = orchestrator(2, Arc::new(MockGenerator::new()));
    let batch_id = orch
        .submit(docs(&["only.pdf"]), FailureStrategy::Continue)
        .await
        .unwrap();

    let first = wait_terminal(&orch, batch_id).await;
    sleep(Duration::from_millis(20)).await;
    let second = orch.snapshot(batch_id).await.unwrap();

    assert_eq!(
        serde_json::to_value(&first).unwrap(),
        serde_json::to_value(&second).unwrap()
    );
}

#[tokio::test]
async fn list_recent_returns_newest_first() {
    let orch = orchestrator(2, Arc::new(MockGenerator::new()));
    let first = orch
        .submit(docs(&["one.pdf"]), FailureStrategy::Continue)
        .await
        .unwrap();
    let second = orch
        .submit(docs(&["two.pdf"]), FailureStrategy::Continue)
        .await
        .unwrap();

    let recent = orch.list_recent(10).await;
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].id, second);
    assert_eq!(recent[1].id, first);

    wait_terminal(&orch, first).await;
    wait_terminal(&orch, second).await;
    assert_eq!(orch.list_recent(1).await.len(), 1);
}
