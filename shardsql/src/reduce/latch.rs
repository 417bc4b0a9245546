use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;

/// Countdown latch gating the reduce phase on the expected number of first
/// pages. The event path can force it to zero so a waiting orchestrator
/// resumes and re-inspects the run state.
pub(crate) struct CountDownLatch {
    count: AtomicUsize,
    zero: Notify,
}

impl CountDownLatch {
    pub(crate) fn new(count: usize) -> CountDownLatch {
        CountDownLatch {
            count: AtomicUsize::new(count),
            zero: Notify::new(),
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Decrements once, saturating at zero.
    pub(crate) fn count_down(&self) {
        let mut cur = self.count.load(Ordering::SeqCst);
        loop {
            if cur == 0 {
                return;
            }
            match self.count.compare_exchange(
                cur,
                cur - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    if cur == 1 {
                        self.zero.notify_waiters();
                    }
                    return;
                }
                Err(actual) => cur = actual,
            }
        }
    }

    pub(crate) fn force_zero(&self) {
        self.count.store(0, Ordering::SeqCst);
        self.zero.notify_waiters();
    }

    pub(crate) async fn wait(&self) {
        loop {
            let notified = self.zero.notified();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn counts_down_to_zero_and_releases_waiters() {
        let latch = Arc::new(CountDownLatch::new(2));
        let waiter = latch.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });

        latch.count_down();
        assert_eq!(latch.count(), 1);
        latch.count_down();

        handle.await.unwrap();
        assert_eq!(latch.count(), 0);
    }

    #[tokio::test]
    async fn never_underflows() {
        let latch = CountDownLatch::new(1);
        latch.count_down();
        latch.count_down();
        assert_eq!(latch.count(), 0);
    }

    #[tokio::test]
    async fn force_zero_releases_waiters() {
        let latch = Arc::new(CountDownLatch::new(100));
        let waiter = latch.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });

        latch.force_zero();
        handle.await.unwrap();
    }
}
