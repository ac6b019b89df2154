use crate::error::Result;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{trace, warn};

/// Debounced, coalescing runner for one async task.
///
/// `schedule` only sets a flag. A dedicated worker runs the task whenever the
/// flag is set, at most one run at a time, and sleeps `interval` after every
/// run. Any number of `schedule` calls made while a run is active collapse
/// into exactly one follow-up run. A run that returns an error is logged and
/// scheduled again.
#[derive(Clone)]
pub struct UpdateScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    scheduled: AtomicBool,
    closed: AtomicBool,
    wake: Notify,
    runs: watch::Sender<RunState>,
}

#[derive(Debug, Clone, Copy, Default)]
struct RunState {
    started: u64,
    completed: u64,
    closed: bool,
}

impl UpdateScheduler {
    /// Spawn the worker. The returned handle completes once the scheduler is
    /// closed and any in-flight run has finished.
    pub fn spawn<F, Fut>(interval: Duration, mut task: F) -> (Self, JoinHandle<()>)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (runs, _) = watch::channel(RunState::default());
        let inner = Arc::new(SchedulerInner {
            scheduled: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            wake: Notify::new(),
            runs,
        });

        let worker = {
            let inner = inner.clone();
            tokio::spawn(async move {
                loop {
                    if inner.closed.load(Ordering::SeqCst) {
                        break;
                    }
                    if !inner.scheduled.swap(false, Ordering::SeqCst) {
                        inner.wake.notified().await;
                        continue;
                    }

                    inner.runs.send_modify(|state| state.started += 1);
                    if let Err(e) = task().await {
                        warn!("scheduled task failed, retrying next run: {}", e);
                        inner.scheduled.store(true, Ordering::SeqCst);
                    }
                    inner.runs.send_modify(|state| state.completed += 1);
                    trace!("scheduled task run complete");

                    // Rate limit. Schedule requests stay flagged for the next
                    // run; only close cuts the pause short.
                    let pause = tokio::time::sleep(interval);
                    tokio::pin!(pause);
                    loop {
                        tokio::select! {
                            _ = &mut pause => break,
                            _ = inner.wake.notified() => {
                                if inner.closed.load(Ordering::SeqCst) {
                                    break;
                                }
                            }
                        }
                    }
                }
                inner.runs.send_modify(|state| state.closed = true);
            })
        };

        (Self { inner }, worker)
    }

    /// Request a run. Never blocks and never performs the work itself.
    pub fn schedule(&self) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        self.inner.scheduled.store(true, Ordering::SeqCst);
        self.inner.wake.notify_one();
    }

    /// Schedule a run and wait until a run that started after this call has
    /// completed. Returns early if the scheduler is closed.
    pub async fn flush(&self) {
        let mut runs = self.inner.runs.subscribe();
        let target = runs.borrow().started + 1;
        self.schedule();
        let _ = runs
            .wait_for(|state| state.closed || state.completed >= target)
            .await;
    }

    /// Stop accepting work. A run in progress finishes; pending requests are
    /// dropped.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.scheduled.store(false, Ordering::SeqCst);
        self.inner.wake.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::AtomicU64;

    fn counting(interval: Duration) -> (UpdateScheduler, JoinHandle<()>, Arc<AtomicU64>) {
        let count = Arc::new(AtomicU64::new(0));
        let (scheduler, worker) = {
            let count = count.clone();
            UpdateScheduler::spawn(interval, move || {
                let count = count.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        };
        (scheduler, worker, count)
    }

    #[tokio::test]
    async fn test_flush_runs_once() {
        let (scheduler, _worker, count) = counting(Duration::from_millis(1));
        scheduler.flush().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_schedules_coalesce() {
        let (scheduler, _worker, count) = counting(Duration::from_millis(1));
        for _ in 0..10 {
            scheduler.schedule();
        }
        scheduler.flush().await;
        assert!(count.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_schedule_during_run_gives_one_more_run() {
        let gate = Arc::new(Notify::new());
        let count = Arc::new(AtomicU64::new(0));
        let (scheduler, _worker) = {
            let gate = gate.clone();
            let count = count.clone();
            UpdateScheduler::spawn(Duration::from_millis(1), move || {
                let gate = gate.clone();
                let count = count.clone();
                async move {
                    if count.fetch_add(1, Ordering::SeqCst) == 0 {
                        gate.notified().await;
                    }
                    Ok(())
                }
            })
        };

        scheduler.schedule();
        while count.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        // first run is blocked; these collapse into a single follow-up
        scheduler.schedule();
        scheduler.schedule();
        scheduler.schedule();
        gate.notify_one();

        scheduler.flush().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_run_is_retried() {
        let count = Arc::new(AtomicU64::new(0));
        let (scheduler, _worker) = {
            let count = count.clone();
            UpdateScheduler::spawn(Duration::from_millis(1), move || {
                let count = count.clone();
                async move {
                    if count.fetch_add(1, Ordering::SeqCst) == 0 {
                        return Err(Error::Closed("test"));
                    }
                    Ok(())
                }
            })
        };

        scheduler.schedule();
        while count.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test]
    async fn test_close_drops_pending_work() {
        let (scheduler, worker, count) = counting(Duration::from_millis(1));
        scheduler.flush().await;
        scheduler.close();
        scheduler.schedule();
        scheduler.flush().await;
        worker.await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(scheduler.is_closed());
    }
}
