//! Background refresh: pulls archive changes, embeds what changed and
//! publishes new index generations.
//!
//! ```text
//!           tick / notification / queued task
//!   Idle ───────────────────────────────────────► Pulling
//!    ▲                                               │ changes applied to the corpus
//!    │                                               ▼
//!    │                                           Embedding
//!    │                                               │ pending records embedded
//!    │             generation swapped                ▼
//!    └───────────────────────────────────────── Publishing
//! ```
//!
//! Any failure or cancellation returns to `Idle`. The published index is only
//! ever replaced by a complete, validated generation.

pub mod scheduler;
pub mod task_queue;

pub use scheduler::{CycleReport, RefreshScheduler, ShutdownHandle, ShutdownSignal};
pub use task_queue::{RefreshTask, TaskPriority, TaskQueue, TaskQueueConfig, TaskQueueError};

use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshPhase {
    #[default]
    Idle,
    Pulling,
    Embedding,
    Publishing,
}

/// What a refresh cycle does. Ordered so that a full rebuild outranks an
/// incremental cycle of the same priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleMode {
    /// Pull changes since the stored cursor and patch the index
    Incremental,
    /// Pull the full snapshot and build a fresh generation
    FullRebuild,
}
