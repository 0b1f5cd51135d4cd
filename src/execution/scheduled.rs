use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_channel::{bounded, Receiver, Sender};
use log::*;
use parking_lot::Mutex;

use crate::error::{CacheError, Result};

/// One-shot delayed jobs. Each handle can be shut down on its own; stopping the
/// execution service shuts down every handle of the pool.
#[derive(Debug, Clone)]
pub struct ScheduledExecutor {
    pool: String,
    pool_shutdown: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    timers: Arc<Mutex<Vec<ScheduledTask>>>,
}

/// a scheduled job that has not fired yet can be cancelled
///
/// Cancelling wakes the sleeping timer task, so it ends right away instead of
/// sitting out the rest of its delay.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    cancelled: Arc<AtomicBool>,
    fired: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl ScheduledTask {
    fn new() -> ScheduledTask {
        let (wake_tx, wake_rx) = bounded(1);
        ScheduledTask {
            cancelled: Arc::new(AtomicBool::new(false)),
            fired: Arc::new(AtomicBool::new(false)),
            finished: Arc::new(AtomicBool::new(false)),
            wake_tx,
            wake_rx,
        }
    }

    /// true when this call prevented the job from running
    pub fn cancel(&self) -> bool {
        let first = !self.cancelled.swap(true, Ordering::AcqRel);
        if first {
            let _ = self.wake_tx.try_send(());
        }
        first && !self.fired.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    fn is_settled(&self) -> bool {
        self.is_cancelled() || self.has_fired()
    }

    /// the timer task has ended, whether or not the job ran
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

impl ScheduledExecutor {
    pub(crate) fn new(pool: &str, pool_shutdown: Arc<AtomicBool>) -> ScheduledExecutor {
        ScheduledExecutor {
            pool: pool.to_string(),
            pool_shutdown,
            shutdown: Arc::new(AtomicBool::new(false)),
            timers: Arc::new(Mutex::new(vec![])),
        }
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire) || self.pool_shutdown.load(Ordering::Acquire)
    }

    /// timers of this handle still waiting to fire
    pub fn pending(&self) -> usize {
        self.timers.lock().iter().filter(|t| !t.is_settled()).count()
    }

    pub fn schedule<F>(&self, delay: Duration, job: F) -> Result<ScheduledTask>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_shutdown() {
            return Err(CacheError::QueueClosed(format!(
                "scheduler for pool {} is shut down",
                self.pool
            )));
        }

        let task = ScheduledTask::new();
        let timer = task.clone();
        let executor = self.clone();

        {
            let mut timers = self.timers.lock();
            timers.retain(|t| !t.is_settled());
            timers.push(task.clone());
        }

        async_std::task::spawn(async move {
            // woken early only by cancel or shutdown
            let woken = async_std::future::timeout(delay, timer.wake_rx.recv()).await;
            if woken.is_ok() || timer.is_cancelled() || executor.is_shutdown() {
                trace!("scheduled job on pool {} skipped", executor.pool);
                timer.finished.store(true, Ordering::Release);
                return;
            }
            timer.fired.store(true, Ordering::Release);
            let outcome = async_std::task::spawn_blocking(move || {
                std::panic::catch_unwind(AssertUnwindSafe(job))
            })
            .await;
            if outcome.is_err() {
                error!("scheduled job on pool {} panicked", executor.pool);
            }
            timer.finished.store(true, Ordering::Release);
        });

        Ok(task)
    }

    /// discard every job of this handle that has not fired yet
    pub fn shutdown_now(&self) {
        self.shutdown.store(true, Ordering::Release);
        let timers: Vec<ScheduledTask> = self.timers.lock().drain(..).collect();
        for timer in timers {
            timer.cancel();
        }
    }
}
