//! The partition log is an external collaborator: an ordered, append-only, partitioned
//! event log. The pipeline only ever fetches from it; offset commits are carried by
//! the checkpoint store, which is the single authority for "how far did we get".
//!
//! The trait is object-safe so workers can share one client as `Arc<dyn PartitionLog>`.

use async_trait::async_trait;

use crate::error::Result;
use crate::message::Event;

/// [Generator] synthesizes user-activity traffic for load testing and local runs.
pub(crate) mod generator;
/// In-memory log used by tests and standalone runs.
pub(crate) mod memory;

#[async_trait]
pub(crate) trait PartitionLog: Send + Sync {
    /// Returns events with offsets in `[from_offset, from_offset + max_batch)`, in
    /// offset order. An empty vector means the partition is (currently) drained.
    async fn fetch(&self, partition: u16, from_offset: i64, max_batch: usize)
    -> Result<Vec<Event>>;
}
