use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use log::*;
use parking_lot::Mutex;

use super::batch::Batch;
use super::operation::SingleOperation;
use super::{LatestOperations, WriteBehindQueue};
use crate::config::BatchingConfig;
use crate::error::{CacheError, Result};
use crate::execution::{ExecutionService, OrderedExecutor, ScheduledExecutor, ScheduledTask};
use crate::store::{CacheKey, CacheLoaderWriter, CacheValue};

struct OpenBatch<K, V> {
    id: u64,
    batch: Batch<K, V>,
    expiry: Option<ScheduledTask>,
}

struct BatchState<K, V> {
    open: Option<OpenBatch<K, V>>,
    executor: Option<OrderedExecutor>,
    scheduler: Option<ScheduledExecutor>,
}

/// the part of a batching stripe an expiry timer can reach
struct Shared<K, V> {
    loader_writer: Arc<dyn CacheLoaderWriter<K, V>>,
    latest: LatestOperations<K, V>,
    state: Mutex<BatchState<K, V>>,
    batch_ids: AtomicU64,
    batching: BatchingConfig,
}

impl<K: CacheKey, V: CacheValue> Shared<K, V> {
    /// hand a closed batch to the executor; the flush runs after every batch submitted before it
    fn submit(&self, executor: &OrderedExecutor, open: OpenBatch<K, V>) -> Result<()> {
        if let Some(expiry) = &open.expiry {
            expiry.cancel();
        }

        let operations = open.batch.operations();
        let batch = open.batch;
        let loader_writer = self.loader_writer.clone();
        let latest = self.latest.clone();
        let submitted = executor.submit(move || flush(batch, loader_writer.as_ref(), &latest));

        if submitted.is_err() {
            for operation in operations.iter() {
                self.latest
                    .remove_if(operation.key(), |_, current| Arc::ptr_eq(current, operation));
            }
        }
        submitted
    }

    fn expired(&self, id: u64) {
        let mut state = self.state.lock();
        if state.open.as_ref().map(|open| open.id) != Some(id) {
            // already flushed by size or stop
            return;
        }

        let open = state.open.take();
        match (open, state.executor.clone()) {
            (Some(open), Some(executor)) => {
                let count = open.batch.len();
                if let Err(e) = self.submit(&executor, open) {
                    warn!("dropping expired batch of {} operations: {}", count, e);
                }
            }
            (Some(open), None) => {
                warn!(
                    "dropping expired batch of {} operations, queue is stopped",
                    open.batch.len()
                );
            }
            _ => (),
        }
    }
}

/// Runs one batch against the writer as homogeneous bulk calls, then retires its operations.
fn flush<K: CacheKey, V: CacheValue>(
    batch: Batch<K, V>,
    writer: &dyn CacheLoaderWriter<K, V>,
    latest: &DashMap<K, Arc<SingleOperation<K, V>>>,
) {
    for bulk in batch.bulk_operations() {
        if let Err(e) = bulk.perform(writer) {
            warn!(
                "exception while bulk processing {} operations in write-behind queue: {}",
                bulk.len(),
                e
            );
        }
    }

    for operation in batch.operations() {
        latest.remove_if(operation.key(), |_, current| Arc::ptr_eq(current, &operation));
    }
}

/// One stripe that groups operations into batches before handing them to its executor.
///
/// A batch closes when it reaches `batch_size` or when `max_delay` has passed since its
/// first operation, whichever comes first.
pub(crate) struct BatchingQueue<K, V> {
    shared: Arc<Shared<K, V>>,
    execution: Arc<ExecutionService>,
    pool: Option<String>,
    capacity: usize,
    shutdown_timeout: Duration,
}

impl<K: CacheKey, V: CacheValue> BatchingQueue<K, V> {
    pub(crate) fn new(
        loader_writer: Arc<dyn CacheLoaderWriter<K, V>>,
        execution: Arc<ExecutionService>,
        pool: Option<String>,
        batching: BatchingConfig,
        max_queue_size: usize,
        shutdown_timeout: Duration,
    ) -> BatchingQueue<K, V> {
        let capacity = batching.executor_capacity(max_queue_size);
        BatchingQueue {
            shared: Arc::new(Shared {
                loader_writer,
                latest: Arc::new(DashMap::new()),
                state: Mutex::new(BatchState {
                    open: None,
                    executor: None,
                    scheduler: None,
                }),
                batch_ids: AtomicU64::new(0),
                batching,
            }),
            execution,
            pool,
            capacity,
            shutdown_timeout,
        }
    }

    fn open_batch(&self, scheduler: Option<&ScheduledExecutor>) -> OpenBatch<K, V> {
        let id = self.shared.batch_ids.fetch_add(1, Ordering::Relaxed);
        let batching = &self.shared.batching;

        let expiry = scheduler.and_then(|scheduler| {
            let shared: Weak<Shared<K, V>> = Arc::downgrade(&self.shared);
            let timer = scheduler.schedule(batching.max_delay(), move || {
                if let Some(shared) = shared.upgrade() {
                    shared.expired(id);
                }
            });
            match timer {
                Ok(task) => Some(task),
                Err(e) => {
                    warn!("batch {} will only close on size: {}", id, e);
                    None
                }
            }
        });

        OpenBatch {
            id,
            batch: Batch::new(batching.batch_size, batching.coalescing),
            expiry,
        }
    }
}

impl<K: CacheKey, V: CacheValue> WriteBehindQueue<K, V> for BatchingQueue<K, V> {
    fn start(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.executor.is_none() {
            state.executor = Some(
                self.execution
                    .get_ordered_executor(self.pool.as_deref(), self.capacity)?,
            );
        }
        if state.scheduler.is_none() {
            state.scheduler = Some(self.execution.get_scheduled_executor(self.pool.as_deref())?);
        }
        Ok(())
    }

    fn add_operation(&self, operation: Arc<SingleOperation<K, V>>) -> Result<()> {
        let mut state = self.shared.state.lock();
        let executor = state.executor.clone().ok_or_else(|| {
            CacheError::ServiceUnavailable("write-behind queue is not started".to_string())
        })?;

        self.shared
            .latest
            .insert(operation.key().clone(), operation.clone());

        if state.open.is_none() {
            let open = self.open_batch(state.scheduler.as_ref());
            state.open = Some(open);
        }

        let full = match state.open.as_mut() {
            Some(open) => open.batch.add(operation),
            None => false,
        };
        if full {
            if let Some(open) = state.open.take() {
                self.shared.submit(&executor, open)?;
            }
        }
        Ok(())
    }

    fn latest(&self, key: &K) -> Option<Arc<SingleOperation<K, V>>> {
        self.shared.latest.get(key).map(|entry| entry.value().clone())
    }

    fn queue_size(&self) -> usize {
        let state = self.shared.state.lock();
        let open = state.open.as_ref().map_or(0, |open| open.batch.len());
        let queued = state
            .executor
            .as_ref()
            .map_or(0, |executor| executor.pending());
        open + queued * self.shared.batching.batch_size
    }

    fn stop(&self) -> Result<()> {
        let (executor, scheduler) = {
            let mut state = self.shared.state.lock();
            let executor = state.executor.take();
            if let (Some(open), Some(executor)) = (state.open.take(), executor.as_ref()) {
                let count = open.batch.len();
                if let Err(e) = self.shared.submit(executor, open) {
                    warn!("dropping open batch of {} operations on stop: {}", count, e);
                }
            }
            (executor, state.scheduler.take())
        };

        if let Some(scheduler) = scheduler {
            scheduler.shutdown_now();
        }
        if let Some(executor) = executor {
            if !executor.shutdown(self.shutdown_timeout) {
                warn!(
                    "write-behind executor {} did not drain within {:?}",
                    executor.id(),
                    self.shutdown_timeout
                );
            }
        }
        Ok(())
    }
}
