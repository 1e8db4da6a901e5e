use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use pin_project::pin_project;
use tokio::time::{Instant, Sleep, sleep_until};

use crate::{Condition, Operation};

/// A retry is a state machine flipping between two futures: the attempt itself and the
/// cool-off sleep the strategy prescribes between attempts. An `Ok` or a non-retryable
/// `Err` resolves the future; a retryable `Err` consumes the next interval from the
/// strategy, and an exhausted strategy resolves with the last error.
#[pin_project(project = AttemptStateProj)]
enum AttemptState<O>
where
    O: Operation,
{
    Attempting(#[pin] O::Future),
    CoolingOff(#[pin] Sleep),
}

/// Future returned by [`Retry::new`]; drives the operation to completion under the
/// given backoff strategy.
#[pin_project]
pub struct Retry<I, O, C>
where
    O: Operation,
{
    #[pin]
    state: AttemptState<O>,
    strategy: I,
    operation: O,
    condition: C,
}

impl<I, O, C> Retry<I, O, C>
where
    I: Iterator<Item = Duration>,
    O: Operation,
    C: Condition<O::Error>,
{
    pub fn new<II: IntoIterator<IntoIter = I, Item = I::Item>>(
        strategy: II,
        mut operation: O,
        condition: C,
    ) -> Self {
        Self {
            state: AttemptState::Attempting(operation.run()),
            strategy: strategy.into_iter(),
            operation,
            condition,
        }
    }

    /// Moves to the cool-off state, or returns the error when the strategy is exhausted.
    fn cool_off(mut self: Pin<&mut Self>, err: O::Error) -> Result<(), O::Error> {
        match self.as_mut().project().strategy.next() {
            None => Err(err),
            Some(interval) => {
                let wake_at = sleep_until(Instant::now() + interval);
                self.as_mut()
                    .project()
                    .state
                    .set(AttemptState::CoolingOff(wake_at));
                Ok(())
            }
        }
    }

    /// Starts the next attempt after the cool-off has elapsed.
    fn reattempt(mut self: Pin<&mut Self>) {
        let next = {
            let this = self.as_mut().project();
            this.operation.run()
        };
        self.as_mut()
            .project()
            .state
            .set(AttemptState::Attempting(next));
    }
}

impl<I, O, C> Future for Retry<I, O, C>
where
    I: Iterator<Item = Duration>,
    O: Operation,
    C: Condition<O::Error>,
{
    type Output = Result<O::Item, O::Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.as_mut().project().state.project() {
            AttemptStateProj::Attempting(attempt) => match attempt.poll(cx) {
                Poll::Ready(Ok(item)) => Poll::Ready(Ok(item)),
                Poll::Ready(Err(e)) => {
                    if self.as_mut().condition.can_retry(&e) {
                        match self.as_mut().cool_off(e) {
                            Ok(()) => self.poll(cx),
                            Err(e) => Poll::Ready(Err(e)),
                        }
                    } else {
                        Poll::Ready(Err(e))
                    }
                }
                Poll::Pending => Poll::Pending,
            },
            AttemptStateProj::CoolingOff(sleep) => match sleep.poll(cx) {
                Poll::Ready(()) => {
                    self.as_mut().reattempt();
                    self.poll(cx)
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::future;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::strategy::fixed;

    #[tokio::test]
    async fn first_attempt_succeeds() {
        let strategy = fixed::Interval::from_millis(1);
        let result = Retry::new(strategy, || future::ready(Ok::<_, ()>(7)), |_: &()| true).await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&attempts);

        let result = Retry::new(
            fixed::Interval::from_millis(1),
            move || {
                counted.fetch_add(1, Ordering::SeqCst);
                future::ready(Err::<(), &str>("permanent"))
            },
            |_: &&str| false,
        )
        .await;

        assert_eq!(result, Err("permanent"));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_condition_rejects() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&attempts);

        let result = Retry::new(
            fixed::Interval::from_millis(1).take(10),
            move || {
                let n = counted.fetch_add(1, Ordering::SeqCst);
                future::ready(Err::<(), usize>(n + 1))
            },
            |e: &usize| *e < 4,
        )
        .await;

        assert_eq!(result, Err(4));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn exhausted_strategy_returns_last_error() {
        let retries = 3;
        let attempts = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&attempts);

        let result = Retry::new(
            fixed::Interval::from_millis(1).take(retries),
            move || {
                let n = counted.fetch_add(1, Ordering::SeqCst);
                future::ready(Err::<(), usize>(n + 1))
            },
            |_: &usize| true,
        )
        .await;

        // the first run is not a retry, so attempts = retries + 1
        assert_eq!(result, Err(retries + 1));
        assert_eq!(attempts.load(Ordering::SeqCst), retries + 1);
    }
}
