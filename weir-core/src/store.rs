//! Durable stores behind object-safe traits so workers share them as `Arc<dyn …>`.
//!
//! The checkpoint store is the authority for partition progress: one conditionally
//! updatable document per (group, partition) holding the committed offset, the fencing
//! generation, and the window-state snapshot. Committing it is the atomicity boundary
//! for "this batch's effects are durable". The raw objects and aggregates written
//! before it are idempotent, so a crash between writes and commit only costs rework.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::window::engine::WindowSnapshot;

pub(crate) mod memory;
pub(crate) mod object;
pub(crate) mod relational;

/// The per-partition progress document. Mutated only through [CheckpointStore::commit]
/// by the owning worker of the current generation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub(crate) struct Checkpoint {
    /// Highest offset whose side effects are durable.
    pub(crate) offset: i64,
    /// Generation of the worker that committed.
    pub(crate) generation: u64,
    /// Window-engine state as of `offset`; restoring it and replaying from
    /// `offset + 1` reproduces the live state exactly.
    pub(crate) windows: WindowSnapshot,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum CommitOutcome {
    Committed,
    /// The stored document belongs to a newer generation; the committer must stop.
    Fenced { current_generation: u64 },
}

#[async_trait]
pub(crate) trait CheckpointStore: Send + Sync {
    async fn load(&self, group: &str, partition: u16) -> Result<Option<Checkpoint>>;

    /// Compare-and-set commit. Rejects a committer whose generation is older than the
    /// stored one with [CommitOutcome::Fenced]; offsets must advance strictly.
    async fn commit(
        &self,
        group: &str,
        partition: u16,
        checkpoint: Checkpoint,
    ) -> Result<CommitOutcome>;
}
