//! The group coordinator owns partition ownership: workers join, heartbeat, and
//! leave; membership changes (including heartbeat timeouts, the sole liveness
//! signal) trigger a rebalance that bumps the global generation and recomputes a
//! sticky assignment. A worker that misses enough heartbeats is simply removed.
//! False positives are tolerated: commits are generation-fenced downstream, so a
//! presumed-dead worker can at worst reprocess, never double-commit.
//!
//! The coordinator runs as an actor task; [CoordinatorHandle] is the cloneable
//! front-end the pipeline talks to.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::CoordinatorConfig;
use crate::error::{Error, Result};

pub(crate) mod assignment;

/// The partitions a worker owns, tagged with the generation they were assigned
/// under. Every mutation the worker performs carries this generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AssignmentSet {
    pub(crate) generation: u64,
    /// Sorted partition ids.
    pub(crate) partitions: Vec<u16>,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum HeartbeatOutcome {
    Ok(AssignmentSet),
    /// The worker was expired from the group; it must stop processing immediately.
    Fenced,
}

enum ActorMessage {
    Join {
        worker_id: String,
        respond_to: oneshot::Sender<AssignmentSet>,
    },
    Leave {
        worker_id: String,
        respond_to: oneshot::Sender<()>,
    },
    Heartbeat {
        worker_id: String,
        respond_to: oneshot::Sender<HeartbeatOutcome>,
    },
    /// A partition worker died (e.g. exhausted retries); reassign that partition
    /// under a new generation.
    ReportFailure {
        worker_id: String,
        partition: u16,
        respond_to: oneshot::Sender<()>,
    },
}

struct Member {
    last_heartbeat: Instant,
}

struct CoordinatorActor {
    receiver: mpsc::Receiver<ActorMessage>,
    partitions: Vec<u16>,
    heartbeat_timeout: Duration,
    check_interval: Duration,
    generation: u64,
    members: HashMap<String, Member>,
    assignments: HashMap<u16, String>,
}

impl CoordinatorActor {
    async fn run(mut self, cln_token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.check_interval);
        loop {
            tokio::select! {
                _ = cln_token.cancelled() => {
                    info!("Coordinator shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.expire_members();
                }
                msg = self.receiver.recv() => {
                    let Some(msg) = msg else {
                        break;
                    };
                    self.handle_message(msg);
                }
            }
        }
    }

    fn handle_message(&mut self, msg: ActorMessage) {
        match msg {
            ActorMessage::Join {
                worker_id,
                respond_to,
            } => {
                info!(worker_id, "Worker joining group");
                self.members.insert(
                    worker_id.clone(),
                    Member {
                        last_heartbeat: Instant::now(),
                    },
                );
                self.rebalance();
                let _ = respond_to.send(self.assignment_for(&worker_id));
            }
            ActorMessage::Leave {
                worker_id,
                respond_to,
            } => {
                info!(worker_id, "Worker leaving group");
                if self.members.remove(&worker_id).is_some() {
                    self.rebalance();
                }
                let _ = respond_to.send(());
            }
            ActorMessage::Heartbeat {
                worker_id,
                respond_to,
            } => {
                let outcome = match self.members.get_mut(&worker_id) {
                    Some(member) => {
                        member.last_heartbeat = Instant::now();
                        HeartbeatOutcome::Ok(self.assignment_for(&worker_id))
                    }
                    // expired between heartbeats; the worker must fence itself
                    None => HeartbeatOutcome::Fenced,
                };
                let _ = respond_to.send(outcome);
            }
            ActorMessage::ReportFailure {
                worker_id,
                partition,
                respond_to,
            } => {
                warn!(worker_id, partition, "Worker reported partition failure");
                self.assignments.remove(&partition);
                self.rebalance();
                let _ = respond_to.send(());
            }
        }
    }

    /// Drops members whose heartbeat is older than the timeout and rebalances if
    /// anything changed.
    fn expire_members(&mut self) {
        let expired: Vec<String> = self
            .members
            .iter()
            .filter(|(_, member)| member.last_heartbeat.elapsed() >= self.heartbeat_timeout)
            .map(|(worker_id, _)| worker_id.clone())
            .collect();
        if expired.is_empty() {
            return;
        }

        for worker_id in &expired {
            warn!(worker_id, "Worker missed heartbeats, removing from group");
            self.members.remove(worker_id);
        }
        self.rebalance();
    }

    fn rebalance(&mut self) {
        self.generation += 1;
        let workers: Vec<String> = self.members.keys().cloned().collect();
        self.assignments = assignment::rebalance(&self.partitions, &workers, &self.assignments);
        info!(
            generation = self.generation,
            assignments = ?self.assignments,
            "Rebalanced partition assignments"
        );
    }

    fn assignment_for(&self, worker_id: &str) -> AssignmentSet {
        let mut partitions: Vec<u16> = self
            .assignments
            .iter()
            .filter(|(_, owner)| owner.as_str() == worker_id)
            .map(|(partition, _)| *partition)
            .collect();
        partitions.sort_unstable();
        AssignmentSet {
            generation: self.generation,
            partitions,
        }
    }
}

#[derive(Clone)]
pub(crate) struct CoordinatorHandle {
    sender: mpsc::Sender<ActorMessage>,
}

impl CoordinatorHandle {
    pub(crate) fn new(
        partitions: Vec<u16>,
        cfg: &CoordinatorConfig,
        cln_token: CancellationToken,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(16);
        let actor = CoordinatorActor {
            receiver,
            partitions,
            heartbeat_timeout: cfg.heartbeat_timeout(),
            check_interval: cfg.heartbeat_interval(),
            generation: 0,
            members: HashMap::new(),
            assignments: HashMap::new(),
        };
        tokio::spawn(actor.run(cln_token));
        Self { sender }
    }

    pub(crate) async fn join(&self, worker_id: &str) -> Result<AssignmentSet> {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .sender
            .send(ActorMessage::Join {
                worker_id: worker_id.to_string(),
                respond_to: tx,
            })
            .await;
        rx.await
            .map_err(|e| Error::ActorPatternRecv(e.to_string()))
    }

    pub(crate) async fn leave(&self, worker_id: &str) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .sender
            .send(ActorMessage::Leave {
                worker_id: worker_id.to_string(),
                respond_to: tx,
            })
            .await;
        rx.await
            .map_err(|e| Error::ActorPatternRecv(e.to_string()))
    }

    pub(crate) async fn heartbeat(&self, worker_id: &str) -> Result<HeartbeatOutcome> {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .sender
            .send(ActorMessage::Heartbeat {
                worker_id: worker_id.to_string(),
                respond_to: tx,
            })
            .await;
        rx.await
            .map_err(|e| Error::ActorPatternRecv(e.to_string()))
    }

    pub(crate) async fn report_failure(&self, worker_id: &str, partition: u16) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .sender
            .send(ActorMessage::ReportFailure {
                worker_id: worker_id.to_string(),
                partition,
                respond_to: tx,
            })
            .await;
        rx.await
            .map_err(|e| Error::ActorPatternRecv(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(interval_ms: u64, timeout_ms: u64) -> CoordinatorConfig {
        CoordinatorConfig {
            heartbeat_interval_ms: interval_ms,
            heartbeat_timeout_ms: timeout_ms,
        }
    }

    #[tokio::test]
    async fn test_single_worker_owns_everything() {
        let cln_token = CancellationToken::new();
        let handle = CoordinatorHandle::new(vec![0, 1, 2], &cfg(100, 1_000), cln_token.clone());

        let assignment = handle.join("w-a").await.unwrap();
        assert_eq!(assignment.generation, 1);
        assert_eq!(assignment.partitions, vec![0, 1, 2]);
        cln_token.cancel();
    }

    #[tokio::test]
    async fn test_join_rebalances_and_bumps_generation() {
        let cln_token = CancellationToken::new();
        let handle = CoordinatorHandle::new(vec![0, 1, 2, 3], &cfg(100, 1_000), cln_token.clone());

        let first = handle.join("w-a").await.unwrap();
        assert_eq!(first.generation, 1);
        assert_eq!(first.partitions.len(), 4);

        let second = handle.join("w-b").await.unwrap();
        assert_eq!(second.generation, 2);
        assert_eq!(second.partitions.len(), 2);

        // w-a observes the new generation and its shrunken set on its next heartbeat
        let HeartbeatOutcome::Ok(refreshed) = handle.heartbeat("w-a").await.unwrap() else {
            panic!("expected Ok heartbeat");
        };
        assert_eq!(refreshed.generation, 2);
        assert_eq!(refreshed.partitions.len(), 2);
        cln_token.cancel();
    }

    #[tokio::test]
    async fn test_leave_hands_partitions_to_survivors() {
        let cln_token = CancellationToken::new();
        let handle = CoordinatorHandle::new(vec![0, 1], &cfg(100, 1_000), cln_token.clone());

        handle.join("w-a").await.unwrap();
        handle.join("w-b").await.unwrap();
        handle.leave("w-b").await.unwrap();

        let HeartbeatOutcome::Ok(assignment) = handle.heartbeat("w-a").await.unwrap() else {
            panic!("expected Ok heartbeat");
        };
        assert_eq!(assignment.generation, 3);
        assert_eq!(assignment.partitions, vec![0, 1]);
        cln_token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_timeout_fences_the_silent_worker() {
        let cln_token = CancellationToken::new();
        let handle = CoordinatorHandle::new(vec![0, 1], &cfg(50, 200), cln_token.clone());

        handle.join("w-a").await.unwrap();
        handle.join("w-b").await.unwrap();

        // w-b goes silent; only w-a keeps heartbeating
        for _ in 0..10 {
            tokio::time::advance(Duration::from_millis(50)).await;
            handle.heartbeat("w-a").await.unwrap();
        }

        assert_eq!(
            handle.heartbeat("w-b").await.unwrap(),
            HeartbeatOutcome::Fenced
        );
        let HeartbeatOutcome::Ok(assignment) = handle.heartbeat("w-a").await.unwrap() else {
            panic!("expected Ok heartbeat");
        };
        assert_eq!(assignment.partitions, vec![0, 1]);
        cln_token.cancel();
    }

    #[tokio::test]
    async fn test_report_failure_reassigns_under_new_generation() {
        let cln_token = CancellationToken::new();
        let handle = CoordinatorHandle::new(vec![0, 1], &cfg(100, 1_000), cln_token.clone());

        let before = handle.join("w-a").await.unwrap();
        handle.report_failure("w-a", 0).await.unwrap();

        let HeartbeatOutcome::Ok(after) = handle.heartbeat("w-a").await.unwrap() else {
            panic!("expected Ok heartbeat");
        };
        assert_eq!(after.generation, before.generation + 1);
        // sole worker gets the partition back, but under the new generation
        assert_eq!(after.partitions, vec![0, 1]);
        cln_token.cancel();
    }
}
