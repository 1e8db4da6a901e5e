//! Per-partition fetch pacing. The worker reports every durable-write latency here;
//! once per loop iteration it asks the controller to evaluate the interval and then
//! sizes its next fetch accordingly. Control is AIMD: a p99 above the configured
//! threshold halves the batch size (never below the floor) and arms an inter-fetch
//! delay; after enough consecutive healthy intervals the batch grows additively back
//! toward the maximum. The aim is to bound in-flight window state without ever
//! starving a partition.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::config::{BackpressureConfig, FetchConfig};

struct Inner {
    batch_size: usize,
    samples: VecDeque<Duration>,
    healthy_streak: u32,
    degraded: bool,
}

pub(crate) struct BackpressureController {
    cfg: BackpressureConfig,
    min_batch_size: usize,
    max_batch_size: usize,
    inner: Mutex<Inner>,
}

impl BackpressureController {
    pub(crate) fn new(cfg: BackpressureConfig, fetch: &FetchConfig) -> Self {
        Self {
            min_batch_size: fetch.min_batch_size,
            max_batch_size: fetch.max_batch_size,
            inner: Mutex::new(Inner {
                batch_size: fetch.max_batch_size,
                samples: VecDeque::with_capacity(cfg.sample_capacity),
                healthy_streak: 0,
                degraded: false,
            }),
            cfg,
        }
    }

    /// Records one observed write latency (raw sink or dual sink).
    pub(crate) fn observe(&self, latency: Duration) {
        let mut inner = self.inner.lock();
        if inner.samples.len() == self.cfg.sample_capacity {
            inner.samples.pop_front();
        }
        inner.samples.push_back(latency);
    }

    /// Closes the current observation interval: computes the p99 over the interval's
    /// samples and adjusts the batch size. An interval with no samples counts as
    /// healthy, so an idle partition is allowed to recover.
    pub(crate) fn evaluate(&self) {
        let mut inner = self.inner.lock();
        let p99 = percentile_99(inner.samples.drain(..).collect());

        if p99 > self.cfg.latency_threshold() {
            let halved = (inner.batch_size / 2).max(self.min_batch_size);
            if halved != inner.batch_size {
                debug!(p99_ms = p99.as_millis(), batch_size = halved, "sink latency over threshold, shrinking fetch batch");
            }
            inner.batch_size = halved;
            inner.healthy_streak = 0;
            inner.degraded = true;
            return;
        }

        inner.healthy_streak = inner.healthy_streak.saturating_add(1);
        if inner.degraded && inner.healthy_streak >= self.cfg.recovery_intervals {
            inner.batch_size = (inner.batch_size + self.cfg.increase_step).min(self.max_batch_size);
            if inner.batch_size == self.max_batch_size {
                inner.degraded = false;
                debug!("fetch batch fully recovered");
            }
        }
    }

    pub(crate) fn batch_size(&self) -> usize {
        self.inner.lock().batch_size
    }

    /// Delay to insert before the next fetch, while degraded.
    pub(crate) fn fetch_delay(&self) -> Option<Duration> {
        if self.inner.lock().degraded {
            Some(self.cfg.degraded_fetch_delay())
        } else {
            None
        }
    }
}

fn percentile_99(mut samples: Vec<Duration>) -> Duration {
    if samples.is_empty() {
        return Duration::ZERO;
    }
    samples.sort_unstable();
    let rank = ((samples.len() as f64) * 0.99).ceil() as usize;
    samples[rank.clamp(1, samples.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> BackpressureController {
        BackpressureController::new(
            BackpressureConfig {
                latency_threshold_ms: 500,
                sample_capacity: 64,
                recovery_intervals: 5,
                increase_step: 10,
                degraded_fetch_delay_ms: 50,
            },
            &FetchConfig {
                max_batch_size: 100,
                min_batch_size: 25,
                idle_delay_ms: 100,
            },
        )
    }

    fn slow_interval(controller: &BackpressureController) {
        for _ in 0..10 {
            controller.observe(Duration::from_millis(900));
        }
        controller.evaluate();
    }

    #[test]
    fn test_breach_halves_batch_down_to_the_floor() {
        let controller = controller();
        assert_eq!(controller.batch_size(), 100);

        slow_interval(&controller);
        assert_eq!(controller.batch_size(), 50);

        slow_interval(&controller);
        assert_eq!(controller.batch_size(), 25);

        // never below the configured floor
        slow_interval(&controller);
        assert_eq!(controller.batch_size(), 25);
    }

    #[test]
    fn test_recovery_is_additive_per_healthy_interval() {
        let controller = controller();
        slow_interval(&controller);
        assert_eq!(controller.batch_size(), 50);

        // four healthy intervals: not yet enough consecutive recovery
        for _ in 0..4 {
            controller.observe(Duration::from_millis(10));
            controller.evaluate();
        }
        assert_eq!(controller.batch_size(), 50);

        // fifth healthy interval starts the additive ramp, one step per interval
        controller.evaluate();
        assert_eq!(controller.batch_size(), 60);
        controller.evaluate();
        assert_eq!(controller.batch_size(), 70);
    }

    #[test]
    fn test_breach_resets_the_healthy_streak() {
        let controller = controller();
        slow_interval(&controller);
        for _ in 0..4 {
            controller.evaluate();
        }
        slow_interval(&controller);
        // the breach reset the streak; four more healthy intervals do not ramp yet
        for _ in 0..4 {
            controller.evaluate();
        }
        assert_eq!(controller.batch_size(), 25);
    }

    #[test]
    fn test_fetch_delay_only_while_degraded() {
        let controller = controller();
        assert_eq!(controller.fetch_delay(), None);

        slow_interval(&controller);
        assert_eq!(controller.fetch_delay(), Some(Duration::from_millis(50)));

        // ramp all the way back to max; degradation clears
        for _ in 0..20 {
            controller.evaluate();
        }
        assert_eq!(controller.batch_size(), 100);
        assert_eq!(controller.fetch_delay(), None);
    }

    #[test]
    fn test_p99_picks_the_tail() {
        let controller = controller();
        // 99 fast samples and one slow one: p99 of 100 samples is the 99th value
        for _ in 0..99 {
            controller.observe(Duration::from_millis(10));
        }
        controller.observe(Duration::from_millis(2_000));
        controller.evaluate();
        // sample_capacity is 64, so the slow sample is still in the window
        assert_eq!(controller.batch_size(), 50);
    }
}
