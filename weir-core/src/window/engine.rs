//! The per-partition window state engine. Each window moves through
//! `Open -> Closing -> Emitted`:
//!
//! - `Open` while the watermark has not passed the window end; events fold into the
//!   per-key accumulators.
//! - `Closing` once the watermark passes the end. The window's aggregates are emitted,
//!   but for a grace period late in-window events are still folded and re-trigger
//!   emission under the same idempotency keys (the downstream upsert absorbs the
//!   update).
//! - `Emitted` once the watermark passes `end + grace`; the state is evicted. Whether
//!   a window was emitted is derivable from the watermark alone, so eviction frees the
//!   memory without losing the ability to recognize (and drop) post-grace stragglers.
//!
//! The accumulator is a per-key event count: an associative, order-insensitive fold,
//! so replaying the same events after a crash lands on the same result.
//!
//! The watermark is `max(event time seen) - allowed_lateness` and only moves forward.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::message::{AggregateRecord, idempotency_key};
use crate::window::{Window, Windower};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum WindowPhase {
    Open,
    Closing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct WindowState {
    phase: WindowPhase,
    /// Per-key event counts. BTreeMap keeps emission order deterministic.
    counts: BTreeMap<String, u64>,
    /// Set when the accumulator changed since the last emission.
    dirty: bool,
}

impl WindowState {
    fn new() -> Self {
        Self {
            phase: WindowPhase::Open,
            counts: BTreeMap::new(),
            dirty: false,
        }
    }
}

/// What [WindowEngine::fold] did with an event.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum FoldOutcome {
    Folded,
    /// Every window the event maps to is already past its grace period; the event was
    /// dropped and counted.
    LateDropped,
}

pub(crate) struct WindowEngine {
    partition: u16,
    windower: Windower,
    allowed_lateness: chrono::Duration,
    grace_period: chrono::Duration,
    watermark: Option<DateTime<Utc>>,
    states: BTreeMap<Window, WindowState>,
    late_dropped: u64,
}

impl WindowEngine {
    pub(crate) fn new(
        partition: u16,
        windower: Windower,
        allowed_lateness: chrono::Duration,
        grace_period: chrono::Duration,
    ) -> Self {
        Self {
            partition,
            windower,
            allowed_lateness,
            grace_period,
            watermark: None,
            states: BTreeMap::new(),
            late_dropped: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn watermark(&self) -> Option<DateTime<Utc>> {
        self.watermark
    }

    /// Number of events dropped because they arrived after their window's grace
    /// period. Reported, never fatal.
    pub(crate) fn late_dropped(&self) -> u64 {
        self.late_dropped
    }

    #[cfg(test)]
    pub(crate) fn open_window_count(&self) -> usize {
        self.states.len()
    }

    /// A window whose grace period the watermark has passed is gone from memory; its
    /// aggregates were emitted when it closed.
    fn past_grace(&self, window: &Window) -> bool {
        match self.watermark {
            Some(watermark) => window.end_time + self.grace_period <= watermark,
            None => false,
        }
    }

    /// Folds one event into every window its event time maps to. Windows already past
    /// their grace period reject the event; if none accepts it, the event is counted
    /// late-dropped.
    pub(crate) fn fold(&mut self, key: &str, event_time: DateTime<Utc>) -> FoldOutcome {
        let mut folded = false;
        for window in self.windower.assign(event_time) {
            if self.past_grace(&window) {
                continue;
            }
            let state = self.states.entry(window).or_insert_with(WindowState::new);
            *state.counts.entry(key.to_string()).or_insert(0) += 1;
            state.dirty = true;
            folded = true;
        }

        if folded {
            FoldOutcome::Folded
        } else {
            self.late_dropped += 1;
            debug!(partition = self.partition, %event_time, key, "late event dropped");
            FoldOutcome::LateDropped
        }
    }

    /// Advances the watermark from the newest event time seen in a batch. The
    /// watermark never regresses.
    pub(crate) fn advance_watermark(&mut self, max_event_time: DateTime<Utc>) {
        let candidate = max_event_time - self.allowed_lateness;
        self.watermark = Some(match self.watermark {
            Some(current) => current.max(candidate),
            None => candidate,
        });
    }

    /// Runs the phase machine against the current watermark and returns every
    /// aggregate whose window closed or re-triggered since the last call. Call after
    /// each batch, before checkpointing.
    pub(crate) fn drain_emissions(&mut self) -> Vec<AggregateRecord> {
        let Some(watermark) = self.watermark else {
            return Vec::new();
        };

        let mut records = Vec::new();
        for (window, state) in self.states.iter_mut() {
            if state.phase == WindowPhase::Open && window.end_time <= watermark {
                state.phase = WindowPhase::Closing;
                state.dirty = true;
            }
            if state.phase == WindowPhase::Closing && state.dirty {
                for (key, count) in &state.counts {
                    let metric_key = format!("{key}_count");
                    records.push(AggregateRecord {
                        idempotency_key: idempotency_key(
                            self.partition,
                            window.start_time,
                            window.end_time,
                            &metric_key,
                        ),
                        metric_key,
                        window_start: window.start_time,
                        window_end: window.end_time,
                        value: *count,
                    });
                }
                state.dirty = false;
            }
        }

        // evict windows whose grace period has passed; everything they had to say
        // has been emitted above
        let evicted: Vec<Window> = self
            .states
            .keys()
            .take_while(|window| window.end_time + self.grace_period <= watermark)
            .cloned()
            .collect();
        for window in evicted {
            debug!(partition = self.partition, window_end = %window.end_time, "window emitted and evicted");
            self.states.remove(&window);
        }

        records
    }

    /// Serializable copy of the full engine state, taken after [Self::drain_emissions]
    /// so it carries no pending emissions.
    pub(crate) fn snapshot(&self) -> WindowSnapshot {
        WindowSnapshot {
            watermark: self.watermark,
            late_dropped: self.late_dropped,
            windows: self
                .states
                .iter()
                .map(|(window, state)| WindowStateSnapshot {
                    window: window.clone(),
                    state: state.clone(),
                })
                .collect(),
        }
    }

    /// Rebuilds the engine from a checkpointed snapshot. State becomes a pure function
    /// of the snapshot plus the events replayed after it.
    pub(crate) fn restore(&mut self, snapshot: WindowSnapshot) {
        self.watermark = snapshot.watermark;
        self.late_dropped = snapshot.late_dropped;
        self.states = snapshot
            .windows
            .into_iter()
            .map(|entry| (entry.window, entry.state))
            .collect();
    }
}

/// Engine state as persisted inside a checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub(crate) struct WindowSnapshot {
    watermark: Option<DateTime<Utc>>,
    #[serde(default)]
    late_dropped: u64,
    windows: Vec<WindowStateSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct WindowStateSnapshot {
    window: Window,
    state: WindowState,
}
