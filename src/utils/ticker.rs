use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

const ENABLE_LOGS: bool = true;

use crate::log_debug;

struct ActiveTicker {
    cancel_token: CancellationToken,
    // Owned by this run only, so a restart never revives an old loop.
    running: Arc<AtomicBool>,
    // Kept so the task is not detached from its owner; never awaited.
    _handle: JoinHandle<()>,
}

/// A named periodic job on a tokio runtime with idempotent start/stop.
///
/// A tick that fires after `stop` returns early on its run's flag, so
/// stopping never depends on cancellation being observed instantly.
pub struct PeriodicTask {
    name: &'static str,
    active: Mutex<Option<ActiveTicker>>,
}

impl PeriodicTask {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            active: Mutex::new(None),
        }
    }

    /// Start ticking every `period`. The first tick happens one full period
    /// after start. Returns `false` if the task was already running.
    pub fn start<F>(&self, handle: &Handle, period: Duration, tick: F) -> bool
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut active = self.lock_active();
        if active.is_some() {
            return false;
        }

        let cancel_token = CancellationToken::new();
        let token_clone = cancel_token.clone();
        let running = Arc::new(AtomicBool::new(true));
        let task_running = Arc::clone(&running);
        let name = self.name;

        let task = handle.spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if !task_running.load(Ordering::SeqCst) {
                            break;
                        }
                        tick();
                    }
                    _ = token_clone.cancelled() => {
                        log_debug!("{name} ticker shutting down");
                        break;
                    }
                }
            }
        });

        *active = Some(ActiveTicker {
            cancel_token,
            running,
            _handle: task,
        });
        true
    }

    /// Stop ticking. Safe to call repeatedly or before `start`.
    pub fn stop(&self) {
        if let Some(active) = self.lock_active().take() {
            active.running.store(false, Ordering::SeqCst);
            active.cancel_token.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock_active()
            .as_ref()
            .is_some_and(|active| active.running.load(Ordering::SeqCst))
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<ActiveTicker>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn ticks_until_stopped() {
        let count = Arc::new(AtomicUsize::new(0));
        let task = PeriodicTask::new("test");
        let counter = Arc::clone(&count);
        assert!(task.start(&Handle::current(), Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(!task.start(&Handle::current(), Duration::from_millis(10), || {}));

        tokio::time::sleep(Duration::from_millis(60)).await;
        task.stop();
        let after_stop = count.load(Ordering::SeqCst);
        assert!(after_stop >= 1);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(count.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_allows_restart() {
        let task = PeriodicTask::new("test");
        task.stop();
        assert!(!task.is_running());

        assert!(task.start(&Handle::current(), Duration::from_secs(60), || {}));
        task.stop();
        task.stop();
        assert!(!task.is_running());

        assert!(task.start(&Handle::current(), Duration::from_secs(60), || {}));
        assert!(task.is_running());
        task.stop();
    }

    #[tokio::test]
    async fn restart_does_not_revive_the_previous_run() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let task = PeriodicTask::new("test");

        let counter = Arc::clone(&first);
        task.start(&Handle::current(), Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(30)).await;

        task.stop();
        let first_after_stop = first.load(Ordering::SeqCst);
        let counter = Arc::clone(&second);
        assert!(task.start(&Handle::current(), Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        tokio::time::sleep(Duration::from_millis(50)).await;
        task.stop();
        assert_eq!(first.load(Ordering::SeqCst), first_after_stop);
        assert!(second.load(Ordering::SeqCst) >= 1);
    }
}
