use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

/// Wake/sleep coordination between the store and background subsystems.
///
/// Client writes bump a counter and wake waiters; a waiter passes its last
/// observed counter value to [`WorkContext::wait_for_work`] and learns
/// whether it was woken by new work (`true`) or by the timeout (`false`).
/// `do_work` flips to false exactly once, on database shutdown.
pub struct WorkContext {
    counter: AtomicU64,
    do_work: AtomicBool,
    notify: Notify,
}

impl Default for WorkContext {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkContext {
    /// Creates a context in the running state.
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
            do_work: AtomicBool::new(true),
            notify: Notify::new(),
        }
    }

    /// Signals that new work was committed.
    pub fn notify_about_work(&self) {
        self.counter.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Current value of the work counter.
    pub fn work_counter(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    /// Whether background subsystems should keep running.
    pub fn should_continue(&self) -> bool {
        self.do_work.load(Ordering::SeqCst)
    }

    /// Begins shutdown; wakes every waiter.
    pub fn stop(&self) {
        self.do_work.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Resolves once [`WorkContext::stop`] has been called.
    pub async fn stopped(&self) {
        loop {
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();
            if !self.should_continue() {
                return;
            }
            notified.await;
        }
    }

    /// Blocks until new work is signalled (`true`) or `timeout` expires
    /// (`false`). `last_seen` carries the caller's view of the work counter
    /// between calls so a signal landing while the caller was busy is not
    /// lost. Returns `false` immediately once shutdown has begun.
    pub async fn wait_for_work(&self, timeout: Duration, last_seen: &mut u64, name: &str) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !self.should_continue() {
                return false;
            }
            // Register with the notifier before sampling the counter, so a
            // signal landing in between cannot be lost.
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();
            let current = self.work_counter();
            if current != *last_seen {
                *last_seen = current;
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let current = self.work_counter();
                if current != *last_seen {
                    *last_seen = current;
                    return true;
                }
                tracing::trace!(waiter = name, "wait for work timed out");
                return false;
            }
        }
    }
}
