use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Token an iteration uses to tell the loop it's still alive. Not touching
/// it for `watchdog_timeout` is treated the same as a hung iteration: a
/// counted failure, not a crash.
#[derive(Clone)]
pub struct Watchdog {
    last_touch_ms: Arc<AtomicU64>,
    notify: Arc<Notify>,
}

impl Watchdog {
    pub(crate) fn new() -> Self {
        Self {
            last_touch_ms: Arc::new(AtomicU64::new(0)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn touch(&self) {
        self.last_touch_ms.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

/// Parameters mirroring spec.md §4.3's Iterator contract exactly:
/// `maxIterationTime`, `watchdogTimeout`, `maxConsecutiveFailures`, `interval`.
#[derive(Clone, Debug)]
pub struct IteratorConfig {
    pub interval: Duration,
    pub max_iteration_time: Duration,
    pub watchdog_timeout: Duration,
    pub max_consecutive_failures: u32,
}

/// Raised to the owner once `max_consecutive_failures` consecutive
/// iterations have failed (timed out, watchdog-starved, or returned `Err`).
#[derive(Debug, Clone)]
pub struct FatalFailure {
    pub loop_name: String,
    pub consecutive_failures: u32,
}

/// Races a handler future against repeated watchdog-timeout windows: each
/// `touch()` resets the window, so the handler only fails this race if it
/// goes `watchdog_timeout` without calling `touch()`, not from overall
/// elapsed time (that bound is `max_iteration_time`, enforced by the caller).
async fn run_with_watchdog<Fut>(
    fut: Fut,
    watchdog: Watchdog,
    watchdog_timeout: Duration,
) -> anyhow::Result<()>
where
    Fut: Future<Output = anyhow::Result<()>>,
{
    tokio::pin!(fut);
    loop {
        let notified = watchdog.notify.notified();
        tokio::select! {
            res = &mut fut => return res,
            _ = tokio::time::sleep(watchdog_timeout) => {
                anyhow::bail!("watchdog starved for {:?}", watchdog_timeout);
            }
            _ = notified => continue,
        }
    }
}

/// A reusable periodic driver: repeatedly invoke a handler with a watchdog,
/// bound per-iteration time, count consecutive failures, sleep between
/// iterations. Generalizes the shape every one of teacher's `*_job::run()`
/// loops hand-rolls around its own `tokio::time::interval` into one
/// reusable combinator, per spec.md §4.3.
pub struct PeriodicLoop {
    name: String,
    config: IteratorConfig,
    stop: Arc<Notify>,
    stopped: Arc<std::sync::atomic::AtomicBool>,
    consecutive_failures: Arc<AtomicU32>,
}

impl PeriodicLoop {
    pub fn new(name: impl Into<String>, config: IteratorConfig) -> Self {
        Self {
            name: name.into(),
            config,
            stop: Arc::new(Notify::new()),
            stopped: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            consecutive_failures: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Launches the background loop, returning a handle the caller can
    /// await on shutdown and a closure to request a stop.
    pub fn start<F, Fut>(&self, mut handler: F, on_fatal: impl Fn(FatalFailure) + Send + 'static) -> JoinHandle<()>
    where
        F: FnMut(Watchdog) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send,
    {
        let name = self.name.clone();
        let config = self.config.clone();
        let stop = self.stop.clone();
        let stopped = self.stopped.clone();
        let consecutive_failures = self.consecutive_failures.clone();

        tokio::spawn(async move {
            loop {
                let stop_wait = stop.notified();
                tokio::select! {
                    _ = stop_wait => {
                        stopped.store(true, Ordering::SeqCst);
                        break;
                    }
                    _ = tokio::time::sleep(config.interval) => {}
                }

                let watchdog = Watchdog::new();
                let iteration = handler(watchdog.clone());
                let watched = run_with_watchdog(iteration, watchdog, config.watchdog_timeout);
                let timed = tokio::time::timeout(config.max_iteration_time, watched).await;

                let failed = match timed {
                    Ok(Ok(())) => false,
                    Ok(Err(e)) => {
                        tracing::warn!(loop_name = %name, error = %e, "iteration failed");
                        true
                    }
                    Err(_) => {
                        tracing::warn!(loop_name = %name, "iteration exceeded max_iteration_time or watchdog, abandoned");
                        true
                    }
                };

                if failed {
                    let count = consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    if count >= config.max_consecutive_failures {
                        on_fatal(FatalFailure {
                            loop_name: name.clone(),
                            consecutive_failures: count,
                        });
                    }
                } else {
                    consecutive_failures.store(0, Ordering::SeqCst);
                }
            }
        })
    }

    pub fn stop(&self) {
        self.stop.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn resets_failure_count_after_success() {
        let config = IteratorConfig {
            interval: Duration::from_millis(5),
            max_iteration_time: Duration::from_millis(50),
            watchdog_timeout: Duration::from_millis(50),
            max_consecutive_failures: 3,
        };
        let iterator = PeriodicLoop::new("test-loop", config);
        let calls = Arc::new(AtomicUsize::new(0));
        let fatal_count = Arc::new(AtomicUsize::new(0));

        let calls_clone = calls.clone();
        let handle = iterator.start(
            move |_wd| {
                let calls = calls_clone.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n == 1 {
                        anyhow::bail!("synthetic failure");
                    }
                    Ok(())
                }
            },
            {
                let fatal_count = fatal_count.clone();
                move |_f| {
                    fatal_count.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        iterator.stop();
        let _ = tokio::time::timeout(Duration::from_millis(100), handle).await;

        assert!(calls.load(Ordering::SeqCst) >= 3);
        assert_eq!(fatal_count.load(Ordering::SeqCst), 0);
    }
}
