//! Bounded readiness polling
//!
//! A poll evaluates its predicate immediately, then sleeps a fixed interval
//! between evaluations until the attempt budget is spent. There is no backoff
//! and no jitter: the worst case is always `(attempts - 1) * interval`.

use std::future::Future;
use tokio::sync::watch;
use tokio::time::sleep;

use svcrig_config::PollBudget;

/// How a poll ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// predicate held on evaluation number `attempts`
    Ready { attempts: u32 },
    /// predicate never held
    TimedOut { attempts: u32 },
    /// abandoned on a cancellation signal
    Cancelled,
}

impl PollOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, PollOutcome::Ready { .. })
    }
}

/// Sending side of a cancellation signal
#[derive(Debug)]
pub struct Canceller {
    tx: watch::Sender<bool>,
}

impl Canceller {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Receiving side of a cancellation signal, cheap to clone
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn new() -> (Canceller, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (Canceller { tx }, CancelSignal { rx })
    }

    /// A signal that never fires
    pub fn never() -> CancelSignal {
        Self::new().1
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancelled; never resolves if the canceller was dropped
    /// without firing
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::never()
    }
}

/// Poll `check` until it holds, the budget is spent, or `cancel` fires
pub async fn poll_until<F, Fut>(mut check: F, budget: PollBudget, cancel: &CancelSignal) -> PollOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    if cancel.is_cancelled() {
        return PollOutcome::Cancelled;
    }

    let attempts = budget.attempts.max(1);
    for attempt in 1..=attempts {
        if check().await {
            return PollOutcome::Ready { attempts: attempt };
        }
        if attempt == attempts {
            break;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return PollOutcome::Cancelled,
            _ = sleep(budget.interval) => {}
        }
    }

    PollOutcome::TimedOut { attempts }
}

/// Boolean form of [`poll_until`] without a cancellation source
pub async fn await_condition<F, Fut>(check: F, max_attempts: u32, interval: std::time::Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    poll_until(check, PollBudget::new(max_attempts, interval), &CancelSignal::never())
        .await
        .is_ready()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_never_true_uses_every_attempt() {
        for (attempts, interval_ms) in [(1u32, 100u64), (3, 0), (5, 250), (60, 1000)] {
            let count = AtomicU32::new(0);
            let interval = Duration::from_millis(interval_ms);
            let start = Instant::now();

            let ok = await_condition(
                || {
                    count.fetch_add(1, Ordering::SeqCst);
                    async { false }
                },
                attempts,
                interval,
            )
            .await;

            let elapsed = start.elapsed();
            let expected = interval * (attempts - 1);
            assert!(!ok);
            assert_eq!(count.load(Ordering::SeqCst), attempts);
            assert!(elapsed >= expected, "elapsed {:?} < {:?}", elapsed, expected);
            assert!(elapsed < expected + Duration::from_millis(5));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_true_on_kth_evaluation() {
        for (k, n) in [(1u32, 1u32), (1, 10), (4, 10), (10, 10)] {
            let count = AtomicU32::new(0);
            let outcome = poll_until(
                || {
                    let seen = count.fetch_add(1, Ordering::SeqCst) + 1;
                    async move { seen >= k }
                },
                PollBudget::new(n, Duration::from_millis(50)),
                &CancelSignal::never(),
            )
            .await;

            assert_eq!(outcome, PollOutcome::Ready { attempts: k });
            assert_eq!(count.load(Ordering::SeqCst), k);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_sleeping() {
        let (canceller, cancel) = CancelSignal::new();
        let count = Arc::new(AtomicU32::new(0));

        tokio::spawn(async move {
            sleep(Duration::from_millis(250)).await;
            canceller.cancel();
        });

        let counter = count.clone();
        let outcome = poll_until(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { false }
            },
            PollBudget::new(10, Duration::from_millis(100)),
            &cancel,
        )
        .await;

        assert_eq!(outcome, PollOutcome::Cancelled);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_already_cancelled_skips_evaluation() {
        let (canceller, cancel) = CancelSignal::new();
        canceller.cancel();

        let count = AtomicU32::new(0);
        let outcome = poll_until(
            || {
                count.fetch_add(1, Ordering::SeqCst);
                async { true }
            },
            PollBudget::new(3, Duration::from_millis(10)),
            &cancel,
        )
        .await;

        assert_eq!(outcome, PollOutcome::Cancelled);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dropped_canceller_never_fires() {
        let cancel = CancelSignal::never();
        let outcome = poll_until(
            || async { false },
            PollBudget::new(2, Duration::from_millis(1)),
            &cancel,
        )
        .await;
        assert_eq!(outcome, PollOutcome::TimedOut { attempts: 2 });
    }
}
