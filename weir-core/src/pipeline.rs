//! One pipeline process is one group member. It joins the coordinator, heartbeats on
//! the configured interval, and runs exactly one [PartitionWorker] task per assigned
//! partition. A generation bump (observed via heartbeat or join) revokes every
//! running worker: all are cancelled and fresh workers are spawned under the new
//! generation, so no task ever commits with a stale token. Worker failures are
//! reported back to the coordinator, which reassigns the partition.
//!
//! The standalone runtime wires the built-in backends (generator or in-memory log,
//! filesystem object store, in-memory checkpoint and relational stores); a deployment
//! substitutes its durable implementations behind the same traits.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backpressure::BackpressureController;
use crate::config::{Settings, SourceConfig, config};
use crate::coordinator::{AssignmentSet, CoordinatorHandle, HeartbeatOutcome};
use crate::error::{Error, Result};
use crate::log::PartitionLog;
use crate::log::generator::GeneratorLog;
use crate::log::memory::InMemoryLog;
use crate::metrics::start_metrics_http_server;
use crate::sink::dead_letter::DeadLetterSink;
use crate::sink::dual::DualSinkWriter;
use crate::sink::raw::RawBatchSink;
use crate::store::CheckpointStore;
use crate::store::memory::InMemoryCheckpointStore;
use crate::store::object::{LocalObjectStore, ObjectStore};
use crate::store::relational::{InMemoryRelationalStore, RelationalStore};
use crate::window::Windower;
use crate::window::engine::WindowEngine;
use crate::worker::PartitionWorker;

struct WorkerEntry {
    token: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

pub(crate) struct Pipeline {
    settings: Settings,
    worker_id: String,
    coordinator: CoordinatorHandle,
    log: Arc<dyn PartitionLog>,
    checkpoints: Arc<dyn CheckpointStore>,
    objects: Arc<dyn ObjectStore>,
    relational: Arc<dyn RelationalStore>,
    workers: HashMap<u16, WorkerEntry>,
    /// Cancelled workers from previous generations, awaited opportunistically.
    draining: Vec<JoinHandle<Result<()>>>,
    current_generation: u64,
    cln_token: CancellationToken,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        settings: Settings,
        coordinator: CoordinatorHandle,
        log: Arc<dyn PartitionLog>,
        checkpoints: Arc<dyn CheckpointStore>,
        objects: Arc<dyn ObjectStore>,
        relational: Arc<dyn RelationalStore>,
        cln_token: CancellationToken,
    ) -> Self {
        Self {
            settings,
            worker_id: format!("worker-{}", Uuid::new_v4()),
            coordinator,
            log,
            checkpoints,
            objects,
            relational,
            workers: HashMap::new(),
            draining: Vec::new(),
            current_generation: 0,
            cln_token,
        }
    }

    pub(crate) async fn run(mut self) -> Result<()> {
        let assignment = self.coordinator.join(&self.worker_id).await?;
        info!(
            worker_id = self.worker_id,
            generation = assignment.generation,
            partitions = ?assignment.partitions,
            "Joined group"
        );
        self.apply_assignment(assignment)?;

        let mut heartbeat =
            tokio::time::interval(self.settings.coordinator.heartbeat_interval());
        loop {
            tokio::select! {
                _ = self.cln_token.cancelled() => break,
                _ = heartbeat.tick() => {
                    self.reap_finished_workers().await;
                    let outcome = match self.coordinator.heartbeat(&self.worker_id).await {
                        Ok(outcome) => outcome,
                        // the coordinator is gone; during shutdown that is expected
                        Err(_) if self.cln_token.is_cancelled() => break,
                        Err(e) => return Err(e),
                    };
                    match outcome {
                        HeartbeatOutcome::Ok(assignment) => self.apply_assignment(assignment)?,
                        HeartbeatOutcome::Fenced => {
                            // presumed dead by the coordinator; rejoin under a fresh
                            // generation, abandoning all current workers
                            warn!(worker_id = self.worker_id, "Expired from group, rejoining");
                            let assignment = self.coordinator.join(&self.worker_id).await?;
                            self.apply_assignment(assignment)?;
                        }
                    }
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Reconciles the worker set with a (possibly new) assignment. Any generation
    /// change revokes every running worker first; a revoked worker must release its
    /// partition within one heartbeat interval.
    fn apply_assignment(&mut self, assignment: AssignmentSet) -> Result<()> {
        if assignment.generation == self.current_generation {
            return Ok(());
        }
        info!(
            generation = assignment.generation,
            partitions = ?assignment.partitions,
            "Assignment changed, restarting partition workers"
        );

        for (_, entry) in self.workers.drain() {
            entry.token.cancel();
            self.draining.push(entry.handle);
        }
        self.current_generation = assignment.generation;
        for partition in assignment.partitions {
            self.spawn_worker(partition)?;
        }
        Ok(())
    }

    fn spawn_worker(&mut self, partition: u16) -> Result<()> {
        let token = self.cln_token.child_token();
        let window_cfg = &self.settings.window;
        let engine = WindowEngine::new(
            partition,
            Windower::from_config(window_cfg)?,
            window_cfg.allowed_lateness(),
            window_cfg.grace_period(),
        );
        let worker = PartitionWorker {
            group: self.settings.group_id.0.clone(),
            partition,
            generation: self.current_generation,
            log: Arc::clone(&self.log),
            checkpoints: Arc::clone(&self.checkpoints),
            raw_sink: RawBatchSink::new(
                Arc::clone(&self.objects),
                partition,
                &self.settings.raw_sink,
            ),
            dual_sink: DualSinkWriter::new(
                Arc::clone(&self.objects),
                Arc::clone(&self.relational),
                self.settings.commit.clone(),
            ),
            dead_letters: DeadLetterSink::new(Arc::clone(&self.objects)),
            engine,
            backpressure: Arc::new(BackpressureController::new(
                self.settings.backpressure.clone(),
                &self.settings.fetch,
            )),
            fetch_cfg: self.settings.fetch.clone(),
            commit_cfg: self.settings.commit.clone(),
            cln_token: token.clone(),
        };
        let handle = tokio::spawn(worker.run());
        self.workers.insert(partition, WorkerEntry { token, handle });
        Ok(())
    }

    async fn reap_finished_workers(&mut self) {
        let finished: Vec<u16> = self
            .workers
            .iter()
            .filter(|(_, entry)| entry.handle.is_finished())
            .map(|(partition, _)| *partition)
            .collect();
        for partition in finished {
            let entry = self
                .workers
                .remove(&partition)
                .expect("finished worker is present");
            match entry.handle.await {
                Ok(Ok(())) => {
                    info!(partition, "Partition worker released its assignment");
                }
                Ok(Err(Error::Fenced { .. })) => {
                    // the coordinator already reassigned it; nothing to report
                    warn!(partition, "Partition worker was fenced");
                }
                Ok(Err(e)) => {
                    error!(partition, %e, "Partition worker failed, reporting for reassignment");
                    let _ = self.coordinator.report_failure(&self.worker_id, partition).await;
                }
                Err(e) => {
                    error!(partition, %e, "Partition worker panicked, reporting for reassignment");
                    let _ = self.coordinator.report_failure(&self.worker_id, partition).await;
                }
            }
        }

        self.draining.retain(|handle| !handle.is_finished());
    }

    async fn shutdown(mut self) {
        info!(worker_id = self.worker_id, "Shutting down pipeline");
        let _ = self.coordinator.leave(&self.worker_id).await;
        for (_, entry) in self.workers.drain() {
            entry.token.cancel();
            let _ = entry.handle.await;
        }
        for handle in self.draining.drain(..) {
            let _ = handle.await;
        }
    }
}

/// Runs the pipeline with the configured built-in backends until a shutdown signal.
pub async fn run() -> Result<()> {
    let settings = config().clone();
    let cln_token = CancellationToken::new();

    let shutdown_token = cln_token.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(?e, "Failed to listen for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let metrics_port = settings.metrics_listen_port.0;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_http_server(metrics_port).await {
            error!(?e, "Metrics server stopped");
        }
    });

    let coordinator = CoordinatorHandle::new(
        settings.partitions.0.clone(),
        &settings.coordinator,
        cln_token.clone(),
    );
    let log: Arc<dyn PartitionLog> = match &settings.source {
        SourceConfig::Generator(cfg) => Arc::new(GeneratorLog::new(cfg.clone())),
        SourceConfig::Memory => Arc::new(InMemoryLog::new()),
    };
    let objects: Arc<dyn ObjectStore> =
        Arc::new(LocalObjectStore::new(settings.object_store_root.0.clone()).await?);
    let checkpoints: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    let relational: Arc<dyn RelationalStore> = Arc::new(InMemoryRelationalStore::new());

    Pipeline::new(
        settings,
        coordinator,
        log,
        checkpoints,
        objects,
        relational,
        cln_token,
    )
    .run()
    .await
}
