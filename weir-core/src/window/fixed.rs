use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::window::{Window, truncate_to_duration, window_from_millis};

/// Tumbling windows: fixed, non-overlapping intervals aligned to multiples of the
/// window length. Every event time maps to exactly one window.
#[derive(Debug, Clone)]
pub(crate) struct FixedWindower {
    window_length_millis: i64,
}

impl FixedWindower {
    pub(crate) fn new(window_length: Duration) -> Self {
        Self {
            window_length_millis: window_length.as_millis() as i64,
        }
    }

    pub(crate) fn assign(&self, event_time: DateTime<Utc>) -> Vec<Window> {
        let start_millis =
            truncate_to_duration(event_time.timestamp_millis(), self.window_length_millis);
        vec![window_from_millis(
            start_millis,
            start_millis + self.window_length_millis,
        )]
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_assign_truncates_to_window_start() {
        let windower = FixedWindower::new(Duration::from_secs(60));
        let event_time = Utc.timestamp_millis_opt(65_000).unwrap();

        let windows = windower.assign(event_time);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0], window_from_millis(60_000, 120_000));
        assert!(windows[0].contains(event_time));
    }

    #[test]
    fn test_boundary_event_goes_to_next_window() {
        let windower = FixedWindower::new(Duration::from_secs(10));
        // an event exactly at a window end belongs to the next window
        let windows = windower.assign(Utc.timestamp_millis_opt(10_000).unwrap());
        assert_eq!(windows[0], window_from_millis(10_000, 20_000));
    }
}
