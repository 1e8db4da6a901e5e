//! Event-time windowing. A [Window] is a half-open `[start, end)` interval; the
//! [Windower] decides which window(s) an event time falls into, and the
//! [engine::WindowEngine] owns the per-window accumulators and their lifecycle.

use std::cmp::Ordering;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{WindowConfig, WindowKind};
use crate::error::{Error, Result};

pub(crate) mod engine;
/// Fixed (tumbling) window assignment.
pub(crate) mod fixed;
/// Sliding window assignment; one event can fall into several windows.
pub(crate) mod sliding;

use fixed::FixedWindower;
use sliding::SlidingWindower;

/// A window is identified by its time interval. All events whose event time falls
/// within `[start_time, end_time)` are folded into the accumulators associated with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Window {
    pub(crate) start_time: DateTime<Utc>,
    pub(crate) end_time: DateTime<Utc>,
}

impl Ord for Window {
    fn cmp(&self, other: &Self) -> Ordering {
        self.end_time
            .cmp(&other.end_time)
            .then_with(|| self.start_time.cmp(&other.start_time))
    }
}

impl PartialOrd for Window {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Window {
    pub(crate) fn new(start_time: DateTime<Utc>, end_time: DateTime<Utc>) -> Self {
        Self {
            start_time,
            end_time,
        }
    }

    pub(crate) fn contains(&self, event_time: DateTime<Utc>) -> bool {
        self.start_time <= event_time && event_time < self.end_time
    }
}

/// Truncates a timestamp to the nearest lower multiple of the given duration.
pub(crate) fn truncate_to_duration(timestamp_millis: i64, duration_millis: i64) -> i64 {
    (timestamp_millis / duration_millis) * duration_millis
}

pub(crate) fn window_from_millis(start_millis: i64, end_millis: i64) -> Window {
    Window::new(
        Utc.timestamp_millis_opt(start_millis)
            .single()
            .expect("window start in valid range"),
        Utc.timestamp_millis_opt(end_millis)
            .single()
            .expect("window end in valid range"),
    )
}

/// Windower dispatches assignment to the configured window shape.
#[derive(Debug, Clone)]
pub(crate) enum Windower {
    Fixed(FixedWindower),
    Sliding(SlidingWindower),
}

impl Windower {
    pub(crate) fn from_config(cfg: &WindowConfig) -> Result<Self> {
        match cfg.kind {
            WindowKind::Fixed => Ok(Windower::Fixed(FixedWindower::new(cfg.window_size()))),
            WindowKind::Sliding => {
                let slide = cfg
                    .slide()
                    .ok_or_else(|| Error::Window("sliding windows require a slide".into()))?;
                Ok(Windower::Sliding(SlidingWindower::new(
                    cfg.window_size(),
                    slide,
                )))
            }
        }
    }

    /// Windows the event time falls into. Never empty; fixed windowing returns
    /// exactly one.
    pub(crate) fn assign(&self, event_time: DateTime<Utc>) -> Vec<Window> {
        match self {
            Windower::Fixed(windower) => windower.assign(event_time),
            Windower::Sliding(windower) => windower.assign(event_time),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_ordering_by_end_time() {
        let a = window_from_millis(0, 60_000);
        let b = window_from_millis(60_000, 120_000);
        assert!(a < b);

        // same end, earlier start sorts first (sliding windows overlap)
        let c = window_from_millis(30_000, 120_000);
        assert!(c < b);
    }

    #[test]
    fn test_contains_is_half_open() {
        let window = window_from_millis(0, 60_000);
        assert!(window.contains(Utc.timestamp_millis_opt(0).unwrap()));
        assert!(window.contains(Utc.timestamp_millis_opt(59_999).unwrap()));
        assert!(!window.contains(Utc.timestamp_millis_opt(60_000).unwrap()));
    }

    #[test]
    fn test_truncate_to_duration() {
        assert_eq!(truncate_to_duration(65_000, 60_000), 60_000);
        assert_eq!(truncate_to_duration(60_000, 60_000), 60_000);
        assert_eq!(truncate_to_duration(59_999, 60_000), 0);
    }
}
