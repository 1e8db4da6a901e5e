//! Writes each emitted aggregate to two heterogeneous stores: an append to the object
//! store and an upsert into the relational store, both keyed by the record's
//! idempotency key. The two writes are not atomic with each other and do not need to
//! be: each is independently idempotent and is retried until durable, and the offset
//! commit that follows is the real atomicity boundary. Retries share the commit retry
//! budget from the configuration.

use std::sync::Arc;

use backoff::Retry;
use backoff::strategy::exponential::Exponential;
use bytes::Bytes;
use tracing::{debug, warn};

use crate::config::CommitConfig;
use crate::error::{Error, Result};
use crate::message::AggregateRecord;
use crate::store::object::ObjectStore;
use crate::store::relational::RelationalStore;

pub(crate) struct DualSinkWriter {
    objects: Arc<dyn ObjectStore>,
    relational: Arc<dyn RelationalStore>,
    retry: CommitConfig,
}

impl DualSinkWriter {
    pub(crate) fn new(
        objects: Arc<dyn ObjectStore>,
        relational: Arc<dyn RelationalStore>,
        retry: CommitConfig,
    ) -> Self {
        Self {
            objects,
            relational,
            retry,
        }
    }

    fn strategy(&self) -> Exponential {
        Exponential::from_millis(
            self.retry.retry_base_ms,
            self.retry.retry_max_ms,
            Some(self.retry.retry_max_attempts),
        )
    }

    /// Persists every record to both stores. Returns only once all writes are
    /// durable; a store that stays down past the retry budget fails the call, which
    /// holds back the offset commit.
    pub(crate) async fn write(&self, records: &[AggregateRecord]) -> Result<()> {
        for record in records {
            self.append_object(record).await?;
            self.upsert_row(record).await?;
        }
        Ok(())
    }

    async fn append_object(&self, record: &AggregateRecord) -> Result<()> {
        let name = format!("aggregates/{}.json", record.idempotency_key);
        let body = Bytes::from(
            serde_json::to_vec(record).map_err(|e| Error::Sink(format!("encoding {name}: {e}")))?,
        );

        let outcome = Retry::new(
            self.strategy(),
            async || self.objects.put(&name, body.clone()).await,
            |e: &Error| e.is_transient(),
        )
        .await
        .inspect_err(|e| warn!(name, %e, "object append exhausted retries"))?;

        debug!(name, ?outcome, "aggregate object written");
        Ok(())
    }

    async fn upsert_row(&self, record: &AggregateRecord) -> Result<()> {
        let outcome = Retry::new(
            self.strategy(),
            async || self.relational.upsert_metric(record).await,
            |e: &Error| e.is_transient(),
        )
        .await
        .inspect_err(
            |e| warn!(key = record.idempotency_key, %e, "relational upsert exhausted retries"),
        )?;

        debug!(key = record.idempotency_key, ?outcome, "aggregate row upserted");
        Ok(())
    }
}
