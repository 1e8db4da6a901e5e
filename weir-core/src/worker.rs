//! The partition worker owns exactly one partition end-to-end: fetch a bounded batch,
//! durably checkpoint the raw bytes, validate and fold events into window state, hand
//! closed windows to the dual sink, then conditionally commit the offset tagged with
//! its generation. The loop is strictly sequential (the accumulator updates are
//! data-race-free by construction) and every suspension point is cancellation-aware,
//! so a revoked assignment aborts in-flight work quickly; whatever was in flight is
//! idempotent and will be redone by the next owner.
//!
//! Transient failures retry with bounded exponential backoff. A fenced commit is
//! never retried: the worker stops and releases the partition. Exhausted retries
//! surface as an error so the pipeline can report the failure for reassignment.

use std::sync::Arc;

use backoff::Retry;
use backoff::strategy::exponential::Exponential;
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backpressure::BackpressureController;
use crate::config::{CommitConfig, FetchConfig};
use crate::error::{Error, Result};
use crate::log::PartitionLog;
use crate::message::{ActivityRecord, Event};
use crate::metrics::{partition_labels, pipeline_metrics};
use crate::sink::dead_letter::DeadLetterSink;
use crate::sink::dual::DualSinkWriter;
use crate::sink::raw::RawBatchSink;
use crate::store::{Checkpoint, CheckpointStore, CommitOutcome};
use crate::window::engine::{FoldOutcome, WindowEngine};

pub(crate) struct PartitionWorker {
    pub(crate) group: String,
    pub(crate) partition: u16,
    pub(crate) generation: u64,
    pub(crate) log: Arc<dyn PartitionLog>,
    pub(crate) checkpoints: Arc<dyn CheckpointStore>,
    pub(crate) raw_sink: RawBatchSink,
    pub(crate) dual_sink: DualSinkWriter,
    pub(crate) dead_letters: DeadLetterSink,
    pub(crate) engine: WindowEngine,
    pub(crate) backpressure: Arc<BackpressureController>,
    pub(crate) fetch_cfg: FetchConfig,
    pub(crate) commit_cfg: CommitConfig,
    pub(crate) cln_token: CancellationToken,
}

impl PartitionWorker {
    pub(crate) async fn run(mut self) -> Result<()> {
        let labels = partition_labels(&self.group, self.partition);

        let mut next_offset = match self.checkpoints.load(&self.group, self.partition).await? {
            Some(checkpoint) => {
                info!(
                    partition = self.partition,
                    generation = self.generation,
                    offset = checkpoint.offset,
                    "Resuming from checkpoint"
                );
                let offset = checkpoint.offset;
                self.engine.restore(checkpoint.windows);
                offset + 1
            }
            None => 0,
        };

        info!(
            partition = self.partition,
            generation = self.generation,
            next_offset,
            "Partition worker started"
        );

        loop {
            if self.cln_token.is_cancelled() {
                info!(
                    partition = self.partition,
                    late_dropped = self.engine.late_dropped(),
                    "Assignment revoked, releasing partition"
                );
                return Ok(());
            }

            if let Some(delay) = self.backpressure.fetch_delay() {
                tokio::select! {
                    _ = self.cln_token.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let batch_size = self.backpressure.batch_size();
            pipeline_metrics()
                .fetch_batch_size
                .get_or_create(&labels)
                .set(batch_size as i64);

            let events = tokio::select! {
                _ = self.cln_token.cancelled() => return Ok(()),
                fetched = self.fetch_with_retry(next_offset, batch_size) => fetched?,
            };
            if events.is_empty() {
                tokio::select! {
                    _ = self.cln_token.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(self.fetch_cfg.idle_delay()) => {}
                }
                continue;
            }

            pipeline_metrics()
                .read_total
                .get_or_create(&labels)
                .inc_by(events.len() as u64);
            let last_offset = events.last().expect("batch is non-empty").offset;

            // 1. the raw bytes become durable before anything interprets them
            let started = Instant::now();
            tokio::select! {
                _ = self.cln_token.cancelled() => return Ok(()),
                written = self.write_raw_with_retry(&events) => written?,
            };
            let raw_elapsed = started.elapsed();
            self.backpressure.observe(raw_elapsed);
            pipeline_metrics()
                .raw_write_time
                .get_or_create(&labels)
                .observe(raw_elapsed.as_secs_f64());

            // 2. validate and fold, in offset order
            let mut max_event_time: Option<DateTime<Utc>> = None;
            for event in &events {
                match ActivityRecord::decode(&event.payload) {
                    Ok(_) => {
                        max_event_time = Some(match max_event_time {
                            Some(max) => max.max(event.event_time),
                            None => event.event_time,
                        });
                        if self.engine.fold(&event.key, event.event_time)
                            == FoldOutcome::LateDropped
                        {
                            pipeline_metrics()
                                .late_dropped_total
                                .get_or_create(&labels)
                                .inc();
                        }
                    }
                    Err(e) => {
                        self.dead_letters.publish(event, &e.to_string()).await;
                        pipeline_metrics()
                            .dead_letter_total
                            .get_or_create(&labels)
                            .inc();
                    }
                }
            }
            if let Some(max_event_time) = max_event_time {
                self.engine.advance_watermark(max_event_time);
            }

            // 3. closed (or re-triggered) windows go to both sinks before the commit
            let aggregates = self.engine.drain_emissions();
            if !aggregates.is_empty() {
                let started = Instant::now();
                tokio::select! {
                    _ = self.cln_token.cancelled() => return Ok(()),
                    written = self.dual_sink.write(&aggregates) => written?,
                };
                let sink_elapsed = started.elapsed();
                self.backpressure.observe(sink_elapsed);
                pipeline_metrics()
                    .sink_write_time
                    .get_or_create(&labels)
                    .observe(sink_elapsed.as_secs_f64());
                pipeline_metrics()
                    .windows_emitted_total
                    .get_or_create(&labels)
                    .inc_by(aggregates.len() as u64);
            }

            // 4. close the observation interval and commit conditionally
            self.backpressure.evaluate();
            let outcome = tokio::select! {
                _ = self.cln_token.cancelled() => return Ok(()),
                committed = self.commit_with_retry(last_offset) => committed?,
            };
            match outcome {
                CommitOutcome::Committed => {
                    pipeline_metrics().commit_total.get_or_create(&labels).inc();
                    next_offset = last_offset + 1;
                }
                CommitOutcome::Fenced { current_generation } => {
                    pipeline_metrics().fenced_total.get_or_create(&labels).inc();
                    warn!(
                        partition = self.partition,
                        generation = self.generation,
                        current_generation,
                        "Commit fenced by newer generation, releasing partition"
                    );
                    return Err(Error::Fenced {
                        partition: self.partition,
                        current_generation,
                    });
                }
            }
        }
    }

    fn retry_strategy(&self) -> Exponential {
        Exponential::from_millis(
            self.commit_cfg.retry_base_ms,
            self.commit_cfg.retry_max_ms,
            Some(self.commit_cfg.retry_max_attempts),
        )
    }

    async fn fetch_with_retry(&self, from_offset: i64, batch_size: usize) -> Result<Vec<Event>> {
        Retry::new(
            self.retry_strategy(),
            async || self.log.fetch(self.partition, from_offset, batch_size).await,
            |e: &Error| e.is_transient(),
        )
        .await
    }

    async fn write_raw_with_retry(&self, events: &[Event]) -> Result<Vec<String>> {
        Retry::new(
            self.retry_strategy(),
            async || self.raw_sink.write_batch(events).await,
            |e: &Error| e.is_transient(),
        )
        .await
    }

    async fn commit_with_retry(&self, offset: i64) -> Result<CommitOutcome> {
        let checkpoint = Checkpoint {
            offset,
            generation: self.generation,
            windows: self.engine.snapshot(),
        };
        Retry::new(
            self.retry_strategy(),
            async || {
                self.checkpoints
                    .commit(&self.group, self.partition, checkpoint.clone())
                    .await
            },
            |e: &Error| e.is_transient(),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use chrono::TimeZone;

    use super::*;
    use crate::config::{BackpressureConfig, RawSinkConfig, WindowConfig};
    use crate::log::memory::InMemoryLog;
    use crate::store::memory::InMemoryCheckpointStore;
    use crate::store::object::{InMemoryObjectStore, ObjectStore};
    use crate::store::relational::{InMemoryRelationalStore, RelationalStore};
    use crate::window::Windower;

    struct Fixture {
        log: Arc<InMemoryLog>,
        checkpoints: Arc<InMemoryCheckpointStore>,
        objects: Arc<InMemoryObjectStore>,
        relational: Arc<InMemoryRelationalStore>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                log: Arc::new(InMemoryLog::new()),
                checkpoints: Arc::new(InMemoryCheckpointStore::new()),
                objects: Arc::new(InMemoryObjectStore::new()),
                relational: Arc::new(InMemoryRelationalStore::new()),
            }
        }

        fn append_activity(&self, partition: u16, user_id: i64, action: &str, at_millis: i64) {
            let timestamp = Utc.timestamp_millis_opt(at_millis).unwrap();
            let record = ActivityRecord {
                user_id,
                action: action.to_string(),
                timestamp,
                extra: Default::default(),
            };
            self.log
                .append(partition, action, timestamp, record.to_payload());
        }

        fn worker(
            &self,
            partition: u16,
            generation: u64,
            cln_token: CancellationToken,
        ) -> PartitionWorker {
            self.worker_with_checkpoints(
                partition,
                generation,
                Arc::clone(&self.checkpoints) as Arc<dyn CheckpointStore>,
                cln_token,
            )
        }

        fn worker_with_checkpoints(
            &self,
            partition: u16,
            generation: u64,
            checkpoints: Arc<dyn CheckpointStore>,
            cln_token: CancellationToken,
        ) -> PartitionWorker {
            // 10s tumbling windows, no lateness allowance, no grace, fast retries
            let window_cfg = WindowConfig {
                window_size_ms: 10_000,
                allowed_lateness_ms: 0,
                grace_period_ms: 0,
                ..Default::default()
            };
            let fetch_cfg = FetchConfig {
                max_batch_size: 100,
                min_batch_size: 10,
                idle_delay_ms: 5,
            };
            let commit_cfg = CommitConfig {
                retry_max_attempts: 3,
                retry_base_ms: 1,
                retry_max_ms: 2,
            };
            let engine = WindowEngine::new(
                partition,
                Windower::from_config(&window_cfg).unwrap(),
                window_cfg.allowed_lateness(),
                window_cfg.grace_period(),
            );
            PartitionWorker {
                group: "weir-test".to_string(),
                partition,
                generation,
                log: Arc::clone(&self.log) as _,
                checkpoints,
                raw_sink: RawBatchSink::new(
                    Arc::clone(&self.objects) as _,
                    partition,
                    &RawSinkConfig::default(),
                ),
                dual_sink: DualSinkWriter::new(
                    Arc::clone(&self.objects) as _,
                    Arc::clone(&self.relational) as _,
                    commit_cfg.clone(),
                ),
                dead_letters: DeadLetterSink::new(Arc::clone(&self.objects) as _),
                engine,
                backpressure: Arc::new(BackpressureController::new(
                    BackpressureConfig::default(),
                    &fetch_cfg,
                )),
                fetch_cfg,
                commit_cfg,
                cln_token,
            }
        }

        async fn wait_for_commit(&self, partition: u16, offset: i64) {
            tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    if let Some(checkpoint) =
                        self.checkpoints.load("weir-test", partition).await.unwrap()
                        && checkpoint.offset >= offset
                    {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("worker did not commit in time");
        }
    }

    #[tokio::test]
    async fn test_worker_processes_commits_and_emits() {
        let fixture = Fixture::new();
        let t0 = 60_000;
        fixture.append_activity(0, 1, "purchase", t0);
        fixture.append_activity(0, 1, "purchase", t0 + 5_000);
        fixture.append_activity(0, 2, "view", t0 + 12_000);

        let cln_token = CancellationToken::new();
        let worker = fixture.worker(0, 1, cln_token.clone());
        let handle = tokio::spawn(worker.run());

        fixture.wait_for_commit(0, 2).await;
        cln_token.cancel();
        handle.await.unwrap().unwrap();

        // the first window closed with both purchases
        let row = fixture
            .relational
            .metric_by_key("p0-60000-70000-purchase_count")
            .await
            .unwrap()
            .expect("window aggregate row");
        assert_eq!(row.metric_value, 2.0);

        // the raw batch was checkpointed under its offset range
        assert!(
            fixture.objects.get("0/0-3.obj").await.unwrap().is_some(),
            "raw batch object missing"
        );

        // the checkpoint carries the generation and the live window state
        let checkpoint = fixture.checkpoints.load("weir-test", 0).await.unwrap().unwrap();
        assert_eq!(checkpoint.offset, 2);
        assert_eq!(checkpoint.generation, 1);
    }

    #[tokio::test]
    async fn test_malformed_event_is_dead_lettered_not_fatal() {
        let fixture = Fixture::new();
        fixture.append_activity(0, 1, "purchase", 60_000);
        fixture
            .log
            .append(0, "garbage", Utc.timestamp_millis_opt(61_000).unwrap(), Bytes::from_static(b"not json"));
        fixture.append_activity(0, 2, "view", 72_000);

        let cln_token = CancellationToken::new();
        let handle = tokio::spawn(fixture.worker(0, 1, cln_token.clone()).run());
        fixture.wait_for_commit(0, 2).await;
        cln_token.cancel();
        handle.await.unwrap().unwrap();

        // the malformed payload is preserved for inspection
        assert!(
            fixture
                .objects
                .get("dead-letter/0/1.json")
                .await
                .unwrap()
                .is_some()
        );
        // processing continued: the window still closed with the valid purchase
        let row = fixture
            .relational
            .metric_by_key("p0-60000-70000-purchase_count")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.metric_value, 1.0);
    }

    #[tokio::test]
    async fn test_stale_generation_stops_the_worker() {
        let fixture = Fixture::new();
        // the partition has already been handed to generation 5
        fixture
            .checkpoints
            .commit(
                "weir-test",
                0,
                Checkpoint {
                    offset: 0,
                    generation: 5,
                    windows: Default::default(),
                },
            )
            .await
            .unwrap();
        fixture.append_activity(0, 1, "view", 60_000);
        fixture.append_activity(0, 1, "view", 61_000);

        let cln_token = CancellationToken::new();
        let worker = fixture.worker(0, 1, cln_token.clone());
        let err = worker.run().await.unwrap_err();
        assert!(matches!(err, Error::Fenced { partition: 0, current_generation: 5 }));

        // the stale worker never moved the checkpoint
        let checkpoint = fixture.checkpoints.load("weir-test", 0).await.unwrap().unwrap();
        assert_eq!((checkpoint.offset, checkpoint.generation), (0, 5));
    }

    /// Checkpoint store whose commits always time out; used to simulate a worker
    /// crashing after its sink writes but before its commit.
    struct CommitlessCheckpointStore {
        inner: InMemoryCheckpointStore,
    }

    #[async_trait::async_trait]
    impl CheckpointStore for CommitlessCheckpointStore {
        async fn load(&self, group: &str, partition: u16) -> Result<Option<Checkpoint>> {
            self.inner.load(group, partition).await
        }

        async fn commit(
            &self,
            _group: &str,
            _partition: u16,
            _checkpoint: Checkpoint,
        ) -> Result<CommitOutcome> {
            Err(Error::CheckpointStore("injected commit timeout".into()))
        }
    }

    #[tokio::test]
    async fn test_crash_before_commit_leaves_no_duplicates_after_reassignment() {
        let fixture = Fixture::new();
        let t0 = 60_000;
        fixture.append_activity(0, 1, "purchase", t0);
        fixture.append_activity(0, 1, "purchase", t0 + 5_000);
        fixture.append_activity(0, 2, "view", t0 + 12_000);

        // generation 1 writes its sinks but dies before any commit lands
        let doomed = fixture.worker_with_checkpoints(
            0,
            1,
            Arc::new(CommitlessCheckpointStore {
                inner: InMemoryCheckpointStore::new(),
            }),
            CancellationToken::new(),
        );
        let err = doomed.run().await.unwrap_err();
        assert!(matches!(err, Error::CheckpointStore(_)));
        assert_eq!(fixture.relational.row_count(), 1);

        // generation 2 takes over from the last committed offset (none) and replays
        let cln_token = CancellationToken::new();
        let handle = tokio::spawn(fixture.worker(0, 2, cln_token.clone()).run());
        fixture.wait_for_commit(0, 2).await;
        cln_token.cancel();
        handle.await.unwrap().unwrap();

        // both sinks hold exactly one durable record per idempotency key
        assert_eq!(fixture.relational.row_count(), 1);
        let row = fixture
            .relational
            .metric_by_key("p0-60000-70000-purchase_count")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.metric_value, 2.0);
        assert!(
            fixture
                .objects
                .get("aggregates/p0-60000-70000-purchase_count.json")
                .await
                .unwrap()
                .is_some()
        );
    }
}
