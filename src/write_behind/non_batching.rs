use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::*;
use parking_lot::RwLock;

use super::operation::SingleOperation;
use super::{LatestOperations, WriteBehindQueue};
use crate::error::{CacheError, Result};
use crate::execution::{ExecutionService, OrderedExecutor};
use crate::store::{CacheKey, CacheLoaderWriter, CacheValue};

/// One stripe that hands every operation to its ordered executor individually.
///
/// `latest` only serves reads and queue estimates; nothing is coalesced.
pub(crate) struct NonBatchingQueue<K, V> {
    loader_writer: Arc<dyn CacheLoaderWriter<K, V>>,
    execution: Arc<ExecutionService>,
    pool: Option<String>,
    capacity: usize,
    shutdown_timeout: Duration,
    latest: LatestOperations<K, V>,
    executor: RwLock<Option<OrderedExecutor>>,
}

impl<K: CacheKey, V: CacheValue> NonBatchingQueue<K, V> {
    pub(crate) fn new(
        loader_writer: Arc<dyn CacheLoaderWriter<K, V>>,
        execution: Arc<ExecutionService>,
        pool: Option<String>,
        capacity: usize,
        shutdown_timeout: Duration,
    ) -> NonBatchingQueue<K, V> {
        NonBatchingQueue {
            loader_writer,
            execution,
            pool,
            capacity,
            shutdown_timeout,
            latest: Arc::new(DashMap::new()),
            executor: RwLock::new(None),
        }
    }
}

impl<K: CacheKey, V: CacheValue> WriteBehindQueue<K, V> for NonBatchingQueue<K, V> {
    fn start(&self) -> Result<()> {
        let mut executor = self.executor.write();
        if executor.is_none() {
            *executor = Some(
                self.execution
                    .get_ordered_executor(self.pool.as_deref(), self.capacity)?,
            );
        }
        Ok(())
    }

    fn add_operation(&self, operation: Arc<SingleOperation<K, V>>) -> Result<()> {
        // clone the handle so a full queue blocks without holding the lock
        let executor = self.executor.read().clone().ok_or_else(|| {
            CacheError::ServiceUnavailable("write-behind queue is not started".to_string())
        })?;

        self.latest
            .insert(operation.key().clone(), operation.clone());

        let loader_writer = self.loader_writer.clone();
        let latest = self.latest.clone();
        let queued = operation.clone();
        let submitted = executor.submit(move || {
            if let Err(e) = queued.perform(loader_writer.as_ref()) {
                warn!(
                    "exception while processing key {:?} in write-behind queue: {}",
                    queued.key(),
                    e
                );
            }
            latest.remove_if(queued.key(), |_, current| Arc::ptr_eq(current, &queued));
        });

        if let Err(e) = submitted {
            self.latest
                .remove_if(operation.key(), |_, current| Arc::ptr_eq(current, &operation));
            return Err(e);
        }
        Ok(())
    }

    fn latest(&self, key: &K) -> Option<Arc<SingleOperation<K, V>>> {
        self.latest.get(key).map(|entry| entry.value().clone())
    }

    fn queue_size(&self) -> usize {
        self.executor
            .read()
            .as_ref()
            .map_or(0, |executor| executor.pending())
    }

    fn stop(&self) -> Result<()> {
        let executor = self.executor.write().take();
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionConfig;
    use crate::service::{Service, ServiceFactories, ServiceLocator};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct SlowWriter {
        writes: Mutex<Vec<(u32, u32)>>,
        deletes: Mutex<Vec<u32>>,
    }

    impl CacheLoaderWriter<u32, u32> for SlowWriter {
        fn load(&self, _key: &u32) -> anyhow::Result<Option<u32>> {
            Ok(None)
        }

        fn write(&self, key: &u32, value: &u32) -> anyhow::Result<()> {
            std::thread::sleep(Duration::from_millis(5));
            if *key == 13 {
                anyhow::bail!("unlucky key");
            }
            self.writes.lock().push((*key, *value));
            Ok(())
        }

        fn delete(&self, key: &u32) -> anyhow::Result<()> {
            self.deletes.lock().push(*key);
            Ok(())
        }
    }

    fn execution() -> Arc<ExecutionService> {
        let execution = Arc::new(ExecutionService::new(ExecutionConfig::default()));
        let locator = ServiceLocator::dependency_set(ServiceFactories::new())
            .build()
            .unwrap();
        execution.start(&locator).unwrap();
        execution
    }

    #[test]
    fn not_started() {
        let writer = Arc::new(SlowWriter::default());
        let queue = NonBatchingQueue::new(writer, execution(), None, 8, Duration::from_secs(5));
        let result = queue.add_operation(Arc::new(SingleOperation::write(1, 1)));
        assert!(matches!(result, Err(CacheError::ServiceUnavailable(_))));
        assert!(queue.latest(&1).is_none());
        assert_eq!(queue.queue_size(), 0);
    }

    #[test]
    fn operations_flow_in_order() {
        let writer = Arc::new(SlowWriter::default());
        let queue = NonBatchingQueue::new(
            writer.clone(),
            execution(),
            None,
            64,
            Duration::from_secs(5),
        );
        queue.start().unwrap();

        for n in 0..20u32 {
            queue
                .add_operation(Arc::new(SingleOperation::write(n % 4, n)))
                .unwrap();
        }
        queue
            .add_operation(Arc::new(SingleOperation::delete(3)))
            .unwrap();

        // the last write to key 2 is still pending or done; reads see it either way
        let pending = queue.latest(&2).map(|op| op.pending_value());
        assert!(pending.is_none() || pending == Some(Some(18)));

        queue.stop().unwrap();
        let writes = writer.writes.lock().clone();
        assert_eq!(writes.len(), 20);
        assert_eq!(writes, (0..20u32).map(|n| (n % 4, n)).collect::<Vec<_>>());
        assert_eq!(writer.deletes.lock().clone(), vec![3]);
        assert!(queue.latest(&3).is_none());
        assert_eq!(queue.queue_size(), 0);
    }

    #[test]
    fn writer_failures_do_not_stop_the_queue() {
        let writer = Arc::new(SlowWriter::default());
        let queue = NonBatchingQueue::new(
            writer.clone(),
            execution(),
            None,
            8,
            Duration::from_secs(5),
        );
        queue.start().unwrap();

        for key in [12u32, 13, 14] {
            queue
                .add_operation(Arc::new(SingleOperation::write(key, key)))
                .unwrap();
        }
        queue.stop().unwrap();

        assert_eq!(writer.writes.lock().clone(), vec![(12, 12), (14, 14)]);
        // a failed operation is not retried, and no longer shows as pending
        assert!(queue.latest(&13).is_none());
    }
}
