//! Pipeline stages for batch document extraction.
//!
//! Each submodule implements exactly one transformation step. Keeping
//! stages separate makes each independently testable and lets us swap
//! implementations (e.g. a different chunking policy) without touching
//! other stages.
//!
//! ## Data Flow
//!
//! ```text
//! render ──▶ page ──▶ cleanup ──▶ chunk ──▶ embed
//! (pixmaps)  (parse+clean calls)  (offsets)  (vectors)
//!      └────────────── document.rs drives the sequence ──────────────┘
//! ```
//!
//! 1. [`render`]   — bounded worker pool over the rasteriser port; runs in
//!    `spawn_blocking` because the rasteriser is not async-safe
//! 2. [`page`]     — per-page parse + clean generator calls under rate and
//!    guardrail discipline; the only stage with network I/O besides embed
//! 3. [`cleanup`]  — deterministic text-cleanup rules for model quirks
//! 4. [`chunk`]    — sequential chunking with contiguous offsets, plus
//!    enrichment (section labels, token estimates)
//! 5. [`embed`]    — rate-limited embedding fan-out over chunks
//! 6. [`document`] — the ordered stage sequence and status aggregation

pub mod chunk;
pub mod cleanup;
pub mod document;
pub mod embed;
pub mod page;
pub mod render;
