//! Pixmap render pool: bounded, isolated rasterisation of document pages.
//!
//! ## Why spawn_blocking?
//!
//! Rasterisation is CPU-bound and the underlying library is not safe to
//! call from async contexts. `tokio::task::spawn_blocking` moves each
//! worker onto the dedicated blocking pool so document pipelines awaiting
//! generator I/O are never stalled behind a render.
//!
//! ## Why one handle per worker?
//!
//! The rasteriser cannot be shared across concurrent calls in one process,
//! so every worker opens its **own** handle on the document bytes via
//! [`Rasterizer::open`] and keeps it private for its lifetime. Workers pull
//! page indices from a shared queue; completion order is whatever the
//! scheduler gives, and the pool re-sorts into page order before returning
//! because chunk offsets downstream depend on page ordering.

use crate::ports::{Pixmap, Rasterizer};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// One page's render result. A failed page is captured here and never
/// aborts its siblings.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub page_index: usize,
    pub result: Result<Pixmap, String>,
}

/// A fixed-size pool of rasterisation workers.
pub struct PixmapRenderPool {
    rasterizer: Arc<dyn Rasterizer>,
    workers: usize,
}

impl PixmapRenderPool {
    pub fn new(rasterizer: Arc<dyn Rasterizer>, workers: usize) -> Self {
        Self {
            rasterizer,
            workers: workers.max(1),
        }
    }

    /// Probe the document's page count without rendering anything.
    ///
    /// Opens (and drops) one handle on the blocking pool. An unopenable or
    /// empty document is an error — there is nothing to ingest.
    pub async fn page_count(&self, document: &[u8]) -> Result<usize, String> {
        let rasterizer = Arc::clone(&self.rasterizer);
        let document: Arc<[u8]> = Arc::from(document);
        let count = tokio::task::spawn_blocking(move || {
            rasterizer.open(&document).map(|h| h.page_count())
        })
        .await
        .map_err(|e| format!("probe task panicked: {e}"))??;

        if count == 0 {
            return Err("document has no pages".into());
        }
        Ok(count)
    }

    /// Rasterise every page of the document, sorted by page index.
    pub async fn render_all(&self, document: &[u8]) -> Result<Vec<RenderedPage>, String> {
        let total = self.page_count(document).await?;
        let indices: Vec<usize> = (0..total).collect();
        Ok(self.render(document, &indices).await)
    }

    /// Rasterise the given pages, returning results sorted by page index.
    ///
    /// Spawns up to `workers` blocking tasks; each opens a private handle
    /// and drains the shared index queue. Callers await without blocking
    /// sibling document pipelines.
    pub async fn render(&self, document: &[u8], page_indices: &[usize]) -> Vec<RenderedPage> {
        if page_indices.is_empty() {
            return Vec::new();
        }

        let document: Arc<[u8]> = Arc::from(document);
        let queue: Arc<Mutex<VecDeque<usize>>> =
            Arc::new(Mutex::new(page_indices.iter().copied().collect()));
        let worker_count = self.workers.min(page_indices.len());

        let mut handles = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let rasterizer = Arc::clone(&self.rasterizer);
            let document = Arc::clone(&document);
            let queue = Arc::clone(&queue);

            handles.push(tokio::task::spawn_blocking(move || {
                run_worker(worker_id, &*rasterizer, &document, &queue)
            }));
        }

        let mut pages = Vec::with_capacity(page_indices.len());
        for handle in handles {
            match handle.await {
                Ok(mut rendered) => pages.append(&mut rendered),
                Err(e) => warn!("render worker panicked: {e}"),
            }
        }

        pages.sort_by_key(|p| p.page_index);
        pages
    }
}

/// Drain the index queue with one private rasteriser handle.
fn run_worker(
    worker_id: usize,
    rasterizer: &dyn Rasterizer,
    document: &[u8],
    queue: &Mutex<VecDeque<usize>>,
) -> Vec<RenderedPage> {
    let mut out = Vec::new();

    let mut handle = match rasterizer.open(document) {
        Ok(h) => h,
        Err(e) => {
            // The handle could not be opened; every index this worker can
            // claim is reported as a per-page error so siblings on other
            // workers still render.
            warn!(worker_id, "rasterizer open failed: {e}");
            while let Some(idx) = pop(queue) {
                out.push(RenderedPage {
                    page_index: idx,
                    result: Err(format!("open failed: {e}")),
                });
            }
            return out;
        }
    };

    let total = handle.page_count();
    while let Some(idx) = pop(queue) {
        let result = if idx >= total {
            Err(format!("page {idx} out of range (document has {total} pages)"))
        } else {
            handle.render_page(idx)
        };
        if let Err(ref e) = result {
            warn!(worker_id, page = idx, "render failed: {e}");
        } else {
            debug!(worker_id, page = idx, "rendered");
        }
        out.push(RenderedPage {
            page_index: idx,
            result,
        });
    }
    out
}

fn pop(queue: &Mutex<VecDeque<usize>>) -> Option<usize> {
    queue.lock().expect("render queue poisoned").pop_front()
}
