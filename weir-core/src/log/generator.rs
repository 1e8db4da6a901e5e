use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;

use crate::config::GeneratorConfig;
use crate::error::Result;
use crate::log::PartitionLog;
use crate::message::{ActivityRecord, Event};

/// A builtin that synthesizes user-activity events, used for load testing and for
/// running the pipeline without a real log in front of it. Offsets are dense per
/// partition; event time is the generation time, so watermarks advance naturally.
pub(crate) struct GeneratorLog {
    cfg: GeneratorConfig,
    cursors: Mutex<HashMap<u16, i64>>,
}

impl GeneratorLog {
    pub(crate) fn new(cfg: GeneratorConfig) -> Self {
        Self {
            cfg,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    fn synthesize(&self, partition: u16, offset: i64) -> Event {
        let mut rng = rand::rng();
        let action = &self.cfg.actions[rng.random_range(0..self.cfg.actions.len())];
        let record = ActivityRecord {
            user_id: rng.random_range(0..self.cfg.users),
            action: action.clone(),
            timestamp: Utc::now(),
            extra: HashMap::new(),
        };
        Event {
            partition,
            offset,
            key: Arc::from(action.as_str()),
            event_time: record.timestamp,
            payload: record.to_payload(),
        }
    }
}

#[async_trait]
impl PartitionLog for GeneratorLog {
    async fn fetch(
        &self,
        partition: u16,
        from_offset: i64,
        max_batch: usize,
    ) -> Result<Vec<Event>> {
        let count = max_batch.min(self.cfg.events_per_fetch);
        let mut cursors = self.cursors.lock();
        let cursor = cursors.entry(partition).or_insert(0);
        // a re-fetch after a crash replays nothing here; the generator is a firehose,
        // not a durable log, so it simply continues from its own cursor
        *cursor = (*cursor).max(from_offset);
        let start = *cursor;
        *cursor += count as i64;
        drop(cursors);

        Ok((start..start + count as i64)
            .map(|offset| self.synthesize(partition, offset))
            .collect())
    }
}
