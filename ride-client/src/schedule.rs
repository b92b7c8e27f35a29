//! Cancellable one-shot timers.
//!
//! A [`ScheduledTask`] belongs to whoever created it. Dropping it cancels the
//! timer, so ending a ride session (which drops its tasks) can never leave a
//! stale poll or retry running against an old booking id.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::trace;

/// A spawned delayed action that is aborted when dropped.
#[derive(Debug)]
pub struct ScheduledTask {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Run `action` once after `delay`.
    pub fn after<F>(name: &'static str, delay: Duration, action: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::spawn(name, async move {
            tokio::time::sleep(delay).await;
            action();
        })
    }

    /// Run a future to completion; cancelled with the task.
    pub fn spawn<F>(name: &'static str, work: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        trace!(task = name, "scheduled");
        Self {
            name,
            handle: tokio::spawn(work),
        }
    }

    /// Task name, for logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the action already ran (or was aborted).
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel explicitly. Same as dropping.
    pub fn cancel(self) {}
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        if !self.handle.is_finished() {
            trace!(task = self.name, "cancelled");
            self.handle.abort();
        }
    }
}
