//! ============================================================================
//! Debouncer - Cancel-and-reschedule deferred actions
//! ============================================================================
//! `schedule` arms a timer that runs the action after a quiet period; calling
//! it again before the timer fires replaces the pending action and restarts
//! the timer. At most one action is pending per debouncer.
//! ============================================================================

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;

pub struct Debouncer {
    delay: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Mutex::new(None),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Run `action` after the quiet period, replacing any pending action.
    /// Must be called from within a tokio runtime.
    pub fn schedule<F>(&self, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let delay = self.delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            action.await;
        });

        let previous = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Drop the pending action without running it.
    /// Returns whether one was pending.
    pub fn cancel(&self) -> bool {
        match self.take() {
            Some(handle) => {
                let was_pending = !handle.is_finished();
                handle.abort();
                was_pending
            }
            None => false,
        }
    }

    /// Wait until the pending action (if any) has run
    pub async fn settle(&self) {
        if let Some(handle) = self.take() {
            // an aborted handle just means a newer schedule replaced it
            let _ = handle.await;
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn take(&self) -> Option<JoinHandle<()>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        if let Some(handle) = self.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_action(counter: &Arc<AtomicUsize>) -> impl Future<Output = ()> + Send + 'static {
        let counter = Arc::clone(counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_schedules_run_once() {
        let debouncer = Debouncer::new(Duration::from_millis(2000));
        let runs = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            debouncer.schedule(counting_action(&runs));
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        debouncer.settle().await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_restarts_on_each_schedule() {
        let debouncer = Debouncer::new(Duration::from_millis(2000));
        let runs = Arc::new(AtomicUsize::new(0));

        debouncer.schedule(counting_action(&runs));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        debouncer.schedule(counting_action(&runs));
        tokio::time::sleep(Duration::from_millis(1500)).await;

        // 3000ms after the first call, but only 1500ms after the last
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(debouncer.is_pending());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel() {
        let debouncer = Debouncer::new(Duration::from_millis(500));
        let runs = Arc::new(AtomicUsize::new(0));

        debouncer.schedule(counting_action(&runs));
        assert!(debouncer.cancel());
        assert!(!debouncer.cancel());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_without_pending_returns() {
        let debouncer = Debouncer::new(Duration::from_millis(500));
        debouncer.settle().await;
        assert!(!debouncer.is_pending());
    }
}
