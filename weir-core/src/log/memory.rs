use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::Result;
use crate::log::PartitionLog;
use crate::message::Event;

/// An in-memory partition log. Offsets are dense and start at 0, which mirrors the
/// contract the external log provides: total order within a partition, immutable
/// events, at-least-once fetch.
#[derive(Debug, Default)]
pub(crate) struct InMemoryLog {
    partitions: Mutex<HashMap<u16, Vec<Event>>>,
}

impl InMemoryLog {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Appends one event and returns its assigned offset.
    pub(crate) fn append(
        &self,
        partition: u16,
        key: &str,
        event_time: DateTime<Utc>,
        payload: Bytes,
    ) -> i64 {
        let mut partitions = self.partitions.lock();
        let events = partitions.entry(partition).or_default();
        let offset = events.len() as i64;
        events.push(Event {
            partition,
            offset,
            key: Arc::from(key),
            event_time,
            payload,
        });
        offset
    }
}

#[async_trait]
impl PartitionLog for InMemoryLog {
    async fn fetch(
        &self,
        partition: u16,
        from_offset: i64,
        max_batch: usize,
    ) -> Result<Vec<Event>> {
        let partitions = self.partitions.lock();
        let Some(events) = partitions.get(&partition) else {
            return Ok(Vec::new());
        };
        let start = from_offset.max(0) as usize;
        if start >= events.len() {
            return Ok(Vec::new());
        }
        let end = (start + max_batch).min(events.len());
        Ok(events[start..end].to_vec())
    }
}
