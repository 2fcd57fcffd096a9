//! Vectorization: rate-limited embedding fan-out over chunks.
//!
//! I/O-bound like parsing, and throttled by the same shared rate limiter —
//! embedding traffic and extraction traffic draw on one API budget. A
//! failed embedding leaves its chunk unembedded and degrades the stage to
//! `partial`; only a total failure (zero embedded chunks) fails the stage.

use crate::config::BatchConfig;
use crate::job::StageStatus;
use crate::pipeline::chunk::Chunk;
use crate::ports::Embedder;
use crate::ratelimit::RateLimiter;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::time::{timeout, Duration};
use tracing::warn;

/// Embed every chunk in place, returning the stage status and the count of
/// successfully embedded chunks.
pub async fn vectorize(
    chunks: &mut [Chunk],
    embedder: Arc<dyn Embedder>,
    limiter: Arc<RateLimiter>,
    config: &BatchConfig,
) -> (StageStatus, usize) {
    if chunks.is_empty() {
        // Nothing to embed is vacuous success (the document stage map
        // already failed earlier if no usable text existed).
        return (StageStatus::Succeeded, 0);
    }

    let call_timeout = Duration::from_secs(config.call_timeout_secs);

    // Owned inputs so the fan-out future borrows nothing from the slice;
    // the mutable writes happen after the collect.
    let inputs: Vec<(usize, String)> = chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| (i, chunk.text.clone()))
        .collect();

    let results: Vec<(usize, Option<Vec<f32>>)> = stream::iter(inputs)
        .map(|(i, text)| {
            let embedder = Arc::clone(&embedder);
            let limiter = Arc::clone(&limiter);
            async move {
                limiter.acquire(1).await;
                let embedded = match timeout(call_timeout, embedder.embed(&[text])).await {
                    Ok(Ok(mut vectors)) if !vectors.is_empty() => Some(vectors.remove(0)),
                    Ok(Ok(_)) => {
                        warn!(chunk = i, "embedder returned no vector");
                        None
                    }
                    Ok(Err(e)) => {
                        warn!(chunk = i, "embedding failed: {e}");
                        None
                    }
                    Err(_) => {
                        warn!(chunk = i, "embedding timed out");
                        None
                    }
                };
                (i, embedded)
            }
        })
        .buffer_unordered(config.page_concurrency)
        .collect()
        .await;

    let mut embedded_count = 0usize;
    for (i, embedding) in results {
        if let Some(vector) = embedding {
            chunks[i].embedding = Some(vector);
            embedded_count += 1;
        }
    }

    let status = if embedded_count == chunks.len() {
        StageStatus::Succeeded
    } else if embedded_count > 0 {
        StageStatus::Partial
    } else {
        StageStatus::Failed
    };
    (status, embedded_count)
}
