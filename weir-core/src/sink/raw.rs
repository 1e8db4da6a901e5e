//! Raw-batch checkpointing. Every fetched batch is persisted as one or more immutable
//! objects before any transformation runs, so the raw stream can be replayed or
//! audited independently of the pipeline. Object names are derived from the offset
//! range (`<partition>/<start>-<end>.obj`, end exclusive); a retried write targets the
//! same name with the same content and is a no-op at the store.

use std::sync::Arc;

use base64::Engine as _;
use base64::prelude::BASE64_STANDARD;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::RawSinkConfig;
use crate::error::{Error, Result};
use crate::message::{Event, raw_object_name};
use crate::store::object::ObjectStore;

/// Serialized form of one raw batch object.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RawBatchObject {
    pub(crate) partition: u16,
    pub(crate) start_offset: i64,
    /// Exclusive.
    pub(crate) end_offset: i64,
    pub(crate) events: Vec<RawBatchEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RawBatchEntry {
    pub(crate) offset: i64,
    pub(crate) key: String,
    pub(crate) event_time: DateTime<Utc>,
    /// The wire payload exactly as fetched.
    pub(crate) payload_b64: String,
}

pub(crate) struct RawBatchSink {
    store: Arc<dyn ObjectStore>,
    partition: u16,
    max_object_bytes: usize,
}

impl RawBatchSink {
    pub(crate) fn new(store: Arc<dyn ObjectStore>, partition: u16, cfg: &RawSinkConfig) -> Self {
        Self {
            store,
            partition,
            max_object_bytes: cfg.max_object_bytes,
        }
    }

    /// Rough serialized size of one entry; used only to split oversized batches.
    fn entry_size(event: &Event) -> usize {
        event.payload.len() * 4 / 3 + event.key.len() + 96
    }

    /// Persists the batch, splitting it so no single object exceeds the configured
    /// size. Returns the object names written. `events` must be non-empty and in
    /// offset order.
    pub(crate) async fn write_batch(&self, events: &[Event]) -> Result<Vec<String>> {
        if events.is_empty() {
            return Err(Error::RawSink("refusing to write an empty batch".into()));
        }

        let mut names = Vec::new();
        let mut chunk_start = 0usize;
        let mut chunk_bytes = 0usize;
        for (idx, event) in events.iter().enumerate() {
            let size = Self::entry_size(event);
            if idx > chunk_start && chunk_bytes + size > self.max_object_bytes {
                names.push(self.write_object(&events[chunk_start..idx]).await?);
                chunk_start = idx;
                chunk_bytes = 0;
            }
            chunk_bytes += size;
        }
        names.push(self.write_object(&events[chunk_start..]).await?);
        Ok(names)
    }

    async fn write_object(&self, events: &[Event]) -> Result<String> {
        let start_offset = events.first().expect("chunk is non-empty").offset;
        let end_offset = events.last().expect("chunk is non-empty").offset + 1;
        let name = raw_object_name(self.partition, start_offset, end_offset);

        let object = RawBatchObject {
            partition: self.partition,
            start_offset,
            end_offset,
            events: events
                .iter()
                .map(|event| RawBatchEntry {
                    offset: event.offset,
                    key: event.key.to_string(),
                    event_time: event.event_time,
                    payload_b64: BASE64_STANDARD.encode(&event.payload),
                })
                .collect(),
        };
        let body = serde_json::to_vec(&object)
            .map_err(|e| Error::RawSink(format!("encoding {name}: {e}")))?;

        let outcome = self.store.put(&name, Bytes::from(body)).await?;
        debug!(partition = self.partition, name, ?outcome, "raw batch object written");
        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::object::InMemoryObjectStore;

    fn event(offset: i64, payload: &'static [u8]) -> Event {
        Event {
            partition: 0,
            offset,
            key: Arc::from("view"),
            event_time: Utc::now(),
            payload: Bytes::from_static(payload),
        }
    }

    #[tokio::test]
    async fn test_write_batch_names_by_offset_range() {
        let store = Arc::new(InMemoryObjectStore::new());
        let sink = RawBatchSink::new(Arc::clone(&store) as _, 0, &RawSinkConfig::default());

        let events: Vec<Event> = (100..150).map(|o| event(o, b"{\"a\":1}")).collect();
        let names = sink.write_batch(&events).await.unwrap();
        assert_eq!(names, vec!["0/100-150.obj".to_string()]);

        let body = store.get("0/100-150.obj").await.unwrap().unwrap();
        let object: RawBatchObject = serde_json::from_slice(&body).unwrap();
        assert_eq!(object.start_offset, 100);
        assert_eq!(object.end_offset, 150);
        assert_eq!(object.events.len(), 50);
        assert_eq!(
            BASE64_STANDARD.decode(&object.events[0].payload_b64).unwrap(),
            b"{\"a\":1}"
        );
    }

    #[tokio::test]
    async fn test_rewrite_after_timeout_is_a_noop() {
        let store = Arc::new(InMemoryObjectStore::new());
        let sink = RawBatchSink::new(Arc::clone(&store) as _, 0, &RawSinkConfig::default());

        let events: Vec<Event> = (100..150).map(|o| event(o, b"{}")).collect();
        sink.write_batch(&events).await.unwrap();
        // a retry writes the identical object under the identical name
        sink.write_batch(&events).await.unwrap();

        assert_eq!(store.object_count(), 1);
    }

    #[tokio::test]
    async fn test_oversized_batch_is_split() {
        let store = Arc::new(InMemoryObjectStore::new());
        let cfg = RawSinkConfig {
            max_object_bytes: 600,
        };
        let sink = RawBatchSink::new(Arc::clone(&store) as _, 0, &cfg);

        let events: Vec<Event> = (0..10).map(|o| event(o, b"xxxxxxxxxxxxxxxxxxxx")).collect();
        let names = sink.write_batch(&events).await.unwrap();
        assert!(names.len() > 1, "expected the batch to split, got {names:?}");

        // the ranges tile the batch without gaps
        let mut next = 0;
        for name in &names {
            let object: RawBatchObject =
                serde_json::from_slice(&store.get(name).await.unwrap().unwrap()).unwrap();
            assert_eq!(object.start_offset, next);
            next = object.end_offset;
        }
        assert_eq!(next, 10);
    }

    #[tokio::test]
    async fn test_empty_batch_is_rejected() {
        let store = Arc::new(InMemoryObjectStore::new());
        let sink = RawBatchSink::new(store as _, 0, &RawSinkConfig::default());
        assert!(sink.write_batch(&[]).await.is_err());
    }
}
