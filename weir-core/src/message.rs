//! The events that flow through the pipeline. An [Event] is what the partition log
//! hands us: immutable once fetched, totally ordered within its partition by offset.
//! The payload is the producer's JSON and is validated into an [ActivityRecord] before
//! it is folded into window state; payloads that fail validation are dead-lettered and
//! processing moves on.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A single record fetched from the partition log.
/// NOTE: It is cheap to clone.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Event {
    /// Partition the event was fetched from.
    pub(crate) partition: u16,
    /// Partition-local, monotonically increasing position marker.
    pub(crate) offset: i64,
    /// Aggregation key (the producer sets this to the action).
    pub(crate) key: Arc<str>,
    /// Event time assigned by the producer.
    pub(crate) event_time: DateTime<Utc>,
    /// The raw wire payload, persisted as-is by the raw sink.
    pub(crate) payload: Bytes,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.partition, self.offset)
    }
}

/// The producer wire contract: required core fields plus an open map so additive
/// fields are preserved, never rejected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub(crate) struct ActivityRecord {
    pub(crate) user_id: i64,
    pub(crate) action: String,
    pub(crate) timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub(crate) extra: HashMap<String, serde_json::Value>,
}

impl ActivityRecord {
    /// Validates a raw payload against the wire contract. Unknown fields are kept in
    /// `extra`; a missing or mistyped required field is a schema violation.
    pub(crate) fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| Error::Worker(format!("invalid payload: {e}")))
    }

    pub(crate) fn to_payload(&self) -> Bytes {
        serde_json::to_vec(self)
            .expect("activity record is always serializable")
            .into()
    }
}

/// One emitted aggregate for one closed (or re-triggered) window. Both sinks key on
/// `idempotency_key`, so re-emission after a late event updates in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub(crate) struct AggregateRecord {
    pub(crate) metric_key: String,
    pub(crate) window_start: DateTime<Utc>,
    pub(crate) window_end: DateTime<Utc>,
    pub(crate) value: u64,
    pub(crate) idempotency_key: String,
}

/// Deterministic identity for one logical aggregate. The same partition, window and
/// metric always produce the same key, so a replaying worker (any generation) lands on
/// the row its predecessor wrote instead of minting a duplicate.
pub(crate) fn idempotency_key(
    partition: u16,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    metric_key: &str,
) -> String {
    format!(
        "p{}-{}-{}-{}",
        partition,
        window_start.timestamp_millis(),
        window_end.timestamp_millis(),
        metric_key,
    )
}

/// Deterministic raw-batch object name; retried writes of the same offset range target
/// the same object.
pub(crate) fn raw_object_name(partition: u16, start_offset: i64, end_offset: i64) -> String {
    format!("{partition}/{start_offset}-{end_offset}.obj")
}
