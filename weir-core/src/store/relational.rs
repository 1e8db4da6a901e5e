//! Relational store seam for the fixed `aggregated_metrics` table:
//! `(metric_id PK, metric_name, metric_value, created_at, idempotency_key UNIQUE)`.
//! The upsert keys on the idempotency column, so a retried or re-emitted aggregate
//! updates its row in place and never duplicates it.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::Result;
use crate::message::AggregateRecord;

/// One row of `aggregated_metrics`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct MetricRow {
    pub(crate) metric_id: u64,
    pub(crate) metric_name: String,
    pub(crate) metric_value: f64,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) idempotency_key: String,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum UpsertOutcome {
    Inserted,
    Updated,
    /// Row already held this exact value; the write had no effect.
    Unchanged,
}

#[async_trait]
pub(crate) trait RelationalStore: Send + Sync {
    async fn upsert_metric(&self, record: &AggregateRecord) -> Result<UpsertOutcome>;

    async fn metric_by_key(&self, idempotency_key: &str) -> Result<Option<MetricRow>>;
}

#[derive(Debug, Default)]
struct Table {
    by_key: HashMap<String, MetricRow>,
    next_id: u64,
}

/// In-memory stand-in for the relational store, enforcing the unique idempotency
/// column exactly as the table's constraint would.
#[derive(Debug, Default)]
pub(crate) struct InMemoryRelationalStore {
    table: Mutex<Table>,
}

impl InMemoryRelationalStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn row_count(&self) -> usize {
        self.table.lock().by_key.len()
    }
}

#[async_trait]
impl RelationalStore for InMemoryRelationalStore {
    async fn upsert_metric(&self, record: &AggregateRecord) -> Result<UpsertOutcome> {
        let mut table = self.table.lock();
        match table.by_key.get_mut(&record.idempotency_key) {
            Some(row) => {
                if row.metric_value == record.value as f64 {
                    return Ok(UpsertOutcome::Unchanged);
                }
                row.metric_value = record.value as f64;
                Ok(UpsertOutcome::Updated)
            }
            None => {
                table.next_id += 1;
                let row = MetricRow {
                    metric_id: table.next_id,
                    metric_name: record.metric_key.clone(),
                    metric_value: record.value as f64,
                    created_at: Utc::now(),
                    idempotency_key: record.idempotency_key.clone(),
                };
                table.by_key.insert(record.idempotency_key.clone(), row);
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    async fn metric_by_key(&self, idempotency_key: &str) -> Result<Option<MetricRow>> {
        Ok(self.table.lock().by_key.get(idempotency_key).cloned())
    }
}
