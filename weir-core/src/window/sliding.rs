use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::window::{Window, truncate_to_duration, window_from_millis};

/// Sliding windows generalize tumbling ones: window starts are aligned to multiples
/// of the slide, and any event belongs to every window whose interval covers it. With
/// length 30s and slide 10s, an event at t=65s lands in `[40,70)`, `[50,80)` and
/// `[60,90)`.
#[derive(Debug, Clone)]
pub(crate) struct SlidingWindower {
    window_length_millis: i64,
    slide_millis: i64,
}

impl SlidingWindower {
    pub(crate) fn new(window_length: Duration, slide: Duration) -> Self {
        Self {
            window_length_millis: window_length.as_millis() as i64,
            slide_millis: slide.as_millis() as i64,
        }
    }

    pub(crate) fn assign(&self, event_time: DateTime<Utc>) -> Vec<Window> {
        // Start from the latest window that can contain the event (the highest
        // multiple of the slide at or below the event time) and walk back one slide
        // at a time while the interval still covers it.
        let mut start_millis =
            truncate_to_duration(event_time.timestamp_millis(), self.slide_millis);
        let mut windows = Vec::new();
        loop {
            let window =
                window_from_millis(start_millis, start_millis + self.window_length_millis);
            if !window.contains(event_time) {
                break;
            }
            windows.push(window);
            start_millis -= self.slide_millis;
        }
        windows
    }
}
