//! Dead-letter channel for events that fail wire-contract validation. The raw payload
//! is preserved as an object under `dead-letter/<partition>/<offset>.json` so it can
//! be inspected and replayed by an operator; the pipeline moves on to the next event.

use std::sync::Arc;

use backoff::Retry;
use backoff::strategy::fixed;
use base64::Engine as _;
use base64::prelude::BASE64_STANDARD;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;
use crate::message::Event;
use crate::store::object::ObjectStore;

const PUBLISH_RETRIES: usize = 3;
const PUBLISH_RETRY_INTERVAL_MS: u64 = 50;

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct DeadLetterRecord {
    pub(crate) partition: u16,
    pub(crate) offset: i64,
    pub(crate) reason: String,
    pub(crate) event_time: DateTime<Utc>,
    pub(crate) payload_b64: String,
}

pub(crate) struct DeadLetterSink {
    store: Arc<dyn ObjectStore>,
}

impl DeadLetterSink {
    pub(crate) fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Preserves a malformed event. A dead-letter write that itself fails is logged
    /// and dropped; a broken payload must never stall the partition.
    pub(crate) async fn publish(&self, event: &Event, reason: &str) {
        if let Err(e) = self.try_publish(event, reason).await {
            warn!(event = %event, %e, "failed to preserve dead-letter record");
        }
    }

    async fn try_publish(&self, event: &Event, reason: &str) -> Result<()> {
        let name = format!("dead-letter/{}/{}.json", event.partition, event.offset);
        let record = DeadLetterRecord {
            partition: event.partition,
            offset: event.offset,
            reason: reason.to_string(),
            event_time: event.event_time,
            payload_b64: BASE64_STANDARD.encode(&event.payload),
        };
        let body = Bytes::from(serde_json::to_vec(&record).expect("record is serializable"));

        Retry::new(
            fixed::Interval::from_millis(PUBLISH_RETRY_INTERVAL_MS).take(PUBLISH_RETRIES),
            async || self.store.put(&name, body.clone()).await,
            |e: &crate::error::Error| e.is_transient(),
        )
        .await?;
        Ok(())
    }
}
