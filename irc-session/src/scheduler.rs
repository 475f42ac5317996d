//! Cancellable timers on a tokio runtime.

use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Spawns delayed and periodic work onto a runtime.
#[derive(Clone, Debug)]
pub struct Scheduler {
    handle: Handle,
}

impl Scheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Scheduler for the runtime this is called from, if any.
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }

    /// Run `task` once after `delay`.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> ScheduledTask
    where
        F: FnOnce() + Send + 'static,
    {
        tracing::debug!(delay_ms = delay.as_millis() as u64, "Scheduling one-shot task");
        let handle = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });
        ScheduledTask { handle }
    }

    /// Run `task` every `period`, starting one period from now.
    pub fn schedule_repeating<F>(&self, period: Duration, task: F) -> ScheduledTask
    where
        F: Fn() + Send + Sync + 'static,
    {
        tracing::debug!(period_ms = period.as_millis() as u64, "Scheduling repeating task");
        let handle = self.handle.spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                task();
            }
        });
        ScheduledTask { handle }
    }

    /// Run blocking work off the calling thread.
    pub fn spawn_blocking<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.spawn_blocking(task);
    }
}

/// Handle to a scheduled task. Dropping it leaves the task running.
#[derive(Debug)]
pub struct ScheduledTask {
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Stop the task. A task that already started its body runs to completion.
    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn one_shot_fires_after_delay() {
        let scheduler = Scheduler::current().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let task = scheduler.schedule(Duration::from_secs(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(task.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_task_never_fires() {
        let scheduler = Scheduler::current().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let task = scheduler.schedule(Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        task.cancel();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn repeating_task_ticks_each_period() {
        let scheduler = Scheduler::current().unwrap();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let task = scheduler.schedule_repeating(Duration::from_secs(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        task.cancel();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }
}
