/// an ordered executor: one background task draining a bounded command queue in FIFO order
///
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use async_channel::{bounded, Receiver, Sender};
use log::*;

use crate::error::{CacheError, Result};
use crate::worker::{create_worker_id, format_uptime, JsonString, WorkerState, WorkerStatus};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub enum Command {
    Run(Job),
    Status(Sender<JsonString>), // request the executor's status
    Shutdown,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Run(_) => f.write_str("Run"),
            Command::Status(_) => f.write_str("Status"),
            Command::Shutdown => f.write_str("Shutdown"),
        }
    }
}

// the handler loop; `_done` is dropped on exit, which is what `shutdown` waits for
pub async fn handler(
    id: String,
    pool: String,
    rx: Receiver<Command>,
    _done: Sender<()>,
) -> anyhow::Result<()> {
    let started = Instant::now();
    let mut state = WorkerState::Idle;
    let mut processed = 0u64;
    let mut error_count = 0u16;

    while let Ok(cmd) = rx.recv().await {
        match cmd {
            Command::Run(job) => {
                // jobs call blocking collaborators, run them off the async worker threads
                let outcome = async_std::task::spawn_blocking(move || {
                    std::panic::catch_unwind(AssertUnwindSafe(job))
                })
                .await;

                processed += 1;
                if outcome.is_err() {
                    error_count = error_count.saturating_add(1);
                    error!("executor {} job panicked", id);
                }
            }
            Command::Status(tx) => {
                let status = WorkerStatus::new(
                    id.clone(),
                    pool.clone(),
                    state,
                    format_uptime(started.elapsed().as_secs()),
                )
                .with_counts(processed, error_count);

                let msg = status.to_json();
                debug!("status response: {}", msg);
                if tx.send(msg).await.is_err() {
                    error_count = error_count.saturating_add(1);
                    error!("error returning status to channel: {:?}", tx);
                }
            }
            Command::Shutdown => {
                state = WorkerState::Shutdown;
                info!("executor id: {}, pool: {}, state: {:?}", id, pool, state);
                break;
            }
        }
    }

    rx.close();

    Ok(())
}

#[derive(Debug, Clone)]
pub struct OrderedExecutor {
    id: String,
    pool: String,
    request_tx: Sender<Command>,
    done_rx: Receiver<()>,
}

impl OrderedExecutor {
    /// create and start a new executor with room for `capacity` queued commands
    pub(crate) fn new(pool: &str, capacity: usize) -> OrderedExecutor {
        let id = create_worker_id();
        let (request_tx, request_rx) = bounded(capacity.max(1));
        let (done_tx, done_rx) = bounded(1);

        info!("starting ordered executor, id: {}, pool: {}", id, pool);

        let handler_id = id.clone();
        let handler_pool = pool.to_string();
        async_std::task::spawn(async move {
            let id = handler_id.clone();
            match handler(handler_id, handler_pool, request_rx, done_tx).await {
                Ok(()) => info!("executor handler exit for id: {}", id),
                Err(e) => error!("executor exit with error: {:?}", e),
            }
        });

        OrderedExecutor {
            id,
            pool: pool.to_string(),
            request_tx,
            done_rx,
        }
    }

    pub fn id(&self) -> String {
        self.id.to_string()
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    /// queue a job behind every job already submitted; blocks while the queue is full
    pub fn submit<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.request_tx
            .send_blocking(Command::Run(Box::new(job)))
            .map_err(|_| CacheError::QueueClosed(format!("executor {}", self.id)))
    }

    /// commands queued but not yet picked up by the handler
    pub fn pending(&self) -> usize {
        self.request_tx.len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.request_tx.is_closed()
    }

    pub fn status(&self) -> Result<JsonString> {
        let request_tx = self.request_tx.clone();
        let id = self.id.clone();
        async_std::task::block_on(async move {
            let (responder, rx) = bounded(1);
            request_tx
                .send(Command::Status(responder))
                .await
                .map_err(|_| CacheError::QueueClosed(format!("executor {}", id)))?;
            rx.recv()
                .await
                .map_err(|_| CacheError::QueueClosed(format!("executor {}", id)))
        })
    }

    /// Drains every job queued so far, then stops the handler. Returns false when the
    /// drain did not finish within `timeout`.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.request_shutdown();
        self.await_termination(timeout)
    }

    /// queue the shutdown command behind the pending jobs without waiting for them
    pub fn request_shutdown(&self) {
        if self.request_tx.send_blocking(Command::Shutdown).is_err() {
            debug!("executor {} already shut down", self.id);
        }
    }

    /// wait for the handler to exit; false on timeout
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let done = self.done_rx.clone();
        async_std::task::block_on(async move {
            async_std::future::timeout(timeout, done.recv()).await.is_ok()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::OK;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn runs_jobs_in_order() {
        let executor = OrderedExecutor::new("default", 16);
        let seen = Arc::new(Mutex::new(vec![]));

        for n in 0..10 {
            let seen = seen.clone();
            executor
                .submit(move || {
                    // later jobs finish faster; order must still hold
                    std::thread::sleep(Duration::from_millis(10 - n));
                    seen.lock().push(n);
                })
                .unwrap();
        }

        assert!(executor.shutdown(Duration::from_secs(5)));
        assert_eq!(seen.lock().clone(), (0..10).collect::<Vec<u64>>());
        assert!(executor.is_shutdown());
        assert!(executor.submit(|| {}).is_err());
    }

    #[test]
    fn status() {
        let executor = OrderedExecutor::new("io", 4);
        assert_eq!(executor.id().len(), 16);
        executor.submit(|| {}).unwrap();

        let js = executor.status().expect("status should respond");
        let status: WorkerStatus = serde_json::from_str(&js).unwrap();
        assert_eq!(status.worker_id, executor.id());
        assert_eq!(status.pool, "io");
        assert_eq!(status.status, OK);
        assert_eq!(status.state, WorkerState::Idle);
        assert_eq!(status.processed, 1);
        assert!(status.uptime.starts_with("0 days, 00:00"));

        assert!(executor.shutdown(Duration::from_secs(5)));
        assert!(executor.status().is_err());
    }

    #[test]
    fn panicking_job_does_not_stop_the_executor() {
        let executor = OrderedExecutor::new("default", 4);
        let ran = Arc::new(Mutex::new(false));
        executor.submit(|| panic!("job failure")).unwrap();
        {
            let ran = ran.clone();
            executor.submit(move || *ran.lock() = true).unwrap();
        }

        let status: WorkerStatus = serde_json::from_str(&executor.status().unwrap()).unwrap();
        assert_eq!(status.error_count, 1);
        assert!(executor.shutdown(Duration::from_secs(5)));
        assert!(*ran.lock());
    }

    #[test]
    fn shutdown_is_bounded() {
        let executor = OrderedExecutor::new("default", 4);
        executor
            .submit(|| std::thread::sleep(Duration::from_millis(500)))
            .unwrap();
        assert!(!executor.shutdown(Duration::from_millis(20)));
        assert!(executor.shutdown(Duration::from_secs(5)));
    }

    #[test]
    fn pending_counts_queued_commands() {
        let executor = OrderedExecutor::new("default", 8);
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock();
        {
            let gate = gate.clone();
            executor.submit(move || drop(gate.lock())).unwrap();
        }
        // give the handler time to pick up the blocking job
        std::thread::sleep(Duration::from_millis(50));
        executor.submit(|| {}).unwrap();
        executor.submit(|| {}).unwrap();
        assert_eq!(executor.pending(), 2);

        drop(held);
        assert!(executor.shutdown(Duration::from_secs(5)));
        assert_eq!(executor.pending(), 0);
    }
}
