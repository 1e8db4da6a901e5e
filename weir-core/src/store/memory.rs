use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::store::{Checkpoint, CheckpointStore, CommitOutcome};

/// Checkpoint store backed by a process-local map. The conditional-update semantics
/// match what the durable deployment store provides, which is what the fencing and
/// recovery tests exercise.
#[derive(Debug, Default)]
pub(crate) struct InMemoryCheckpointStore {
    entries: Mutex<HashMap<(String, u16), Checkpoint>>,
}

impl InMemoryCheckpointStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, group: &str, partition: u16) -> Result<Option<Checkpoint>> {
        let entries = self.entries.lock();
        Ok(entries.get(&(group.to_string(), partition)).cloned())
    }

    async fn commit(
        &self,
        group: &str,
        partition: u16,
        checkpoint: Checkpoint,
    ) -> Result<CommitOutcome> {
        let mut entries = self.entries.lock();
        let slot = (group.to_string(), partition);

        if let Some(current) = entries.get(&slot) {
            if checkpoint.generation < current.generation {
                return Ok(CommitOutcome::Fenced {
                    current_generation: current.generation,
                });
            }
            if checkpoint.offset <= current.offset {
                return Err(Error::CheckpointStore(format!(
                    "non-monotonic commit for {group}/{partition}: {} after {}",
                    checkpoint.offset, current.offset
                )));
            }
        }

        entries.insert(slot, checkpoint);
        Ok(CommitOutcome::Committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::engine::WindowSnapshot;

    fn checkpoint(offset: i64, generation: u64) -> Checkpoint {
        Checkpoint {
            offset,
            generation,
            windows: WindowSnapshot::default(),
        }
    }

    #[tokio::test]
    async fn test_commit_and_load_round_trip() {
        let store = InMemoryCheckpointStore::new();
        assert_eq!(store.load("g", 0).await.unwrap(), None);

        let outcome = store.commit("g", 0, checkpoint(10, 1)).await.unwrap();
        assert_eq!(outcome, CommitOutcome::Committed);
        assert_eq!(store.load("g", 0).await.unwrap().unwrap().offset, 10);
    }

    #[tokio::test]
    async fn test_stale_generation_is_fenced() {
        let store = InMemoryCheckpointStore::new();
        store.commit("g", 0, checkpoint(10, 2)).await.unwrap();

        let outcome = store.commit("g", 0, checkpoint(20, 1)).await.unwrap();
        assert_eq!(
            outcome,
            CommitOutcome::Fenced {
                current_generation: 2
            }
        );
        // the fenced commit must not have mutated the stored document
        let stored = store.load("g", 0).await.unwrap().unwrap();
        assert_eq!((stored.offset, stored.generation), (10, 2));
    }

    #[tokio::test]
    async fn test_offsets_are_strictly_monotonic() {
        let store = InMemoryCheckpointStore::new();
        store.commit("g", 0, checkpoint(10, 1)).await.unwrap();

        assert!(store.commit("g", 0, checkpoint(10, 1)).await.is_err());
        assert!(store.commit("g", 0, checkpoint(9, 1)).await.is_err());
        assert_eq!(
            store.commit("g", 0, checkpoint(11, 1)).await.unwrap(),
            CommitOutcome::Committed
        );
    }

    #[tokio::test]
    async fn test_newer_generation_takes_over() {
        let store = InMemoryCheckpointStore::new();
        store.commit("g", 0, checkpoint(10, 1)).await.unwrap();

        let outcome = store.commit("g", 0, checkpoint(25, 3)).await.unwrap();
        assert_eq!(outcome, CommitOutcome::Committed);
        let stored = store.load("g", 0).await.unwrap().unwrap();
        assert_eq!((stored.offset, stored.generation), (25, 3));
    }

    #[tokio::test]
    async fn test_partitions_are_independent() {
        let store = InMemoryCheckpointStore::new();
        store.commit("g", 0, checkpoint(10, 5)).await.unwrap();
        assert_eq!(
            store.commit("g", 1, checkpoint(3, 1)).await.unwrap(),
            CommitOutcome::Committed
        );
    }
}
