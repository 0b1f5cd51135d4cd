//! the striped write-behind engine: a `CacheLoaderWriter` that defers writes and deletes to
//! per-stripe ordered executors, optionally batched, while serving reads from pending operations

pub mod batch;
mod batching;
mod non_batching;
pub mod operation;

use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::Arc;

use dashmap::DashMap;
use hashbrown::hash_map::DefaultHashBuilder;
use hashbrown::HashMap;
use log::*;
use parking_lot::RwLock;

use crate::config::WriteBehindConfig;
use crate::error::{CacheError, Result};
use crate::execution::ExecutionService;
use crate::lifecycle::LifeCycled;
use crate::service::{
    lookup, Service, ServiceDescriptor, ServiceFactory, ServiceCreationConfiguration,
    ServiceProvider, ServiceType,
};
use crate::store::{CacheKey, CacheLoaderWriter, CacheValue};
use batching::BatchingQueue;
use non_batching::NonBatchingQueue;
pub use operation::{BatchOperation, SingleOperation};

/// the most recent pending operation per key, shared between a stripe and its flush jobs
pub(crate) type LatestOperations<K, V> = Arc<DashMap<K, Arc<SingleOperation<K, V>>>>;

/// one stripe of the engine; operations within a stripe reach the writer in submission order
pub(crate) trait WriteBehindQueue<K, V>: Send + Sync {
    fn start(&self) -> Result<()>;

    fn add_operation(&self, operation: Arc<SingleOperation<K, V>>) -> Result<()>;

    /// the pending operation a read of `key` must observe, if any
    fn latest(&self, key: &K) -> Option<Arc<SingleOperation<K, V>>>;

    fn queue_size(&self) -> usize;

    fn stop(&self) -> Result<()>;
}

/// A loader-writer whose mutations are persisted asynchronously.
pub trait WriteBehind<K, V>: CacheLoaderWriter<K, V> {
    fn start(&self) -> Result<()>;

    fn stop(&self) -> Result<()>;

    /// operations accepted but not yet handed to the underlying writer
    fn queue_size(&self) -> usize;
}

/// Routes each key to one of `concurrency` stripes by hash.
///
/// Start and stop exclude every other call; reads and submissions only exclude those two.
pub struct StripedWriteBehind<K, V> {
    stripes: Vec<Box<dyn WriteBehindQueue<K, V>>>,
    loader_writer: Arc<dyn CacheLoaderWriter<K, V>>,
    hash_builder: DefaultHashBuilder,
    lock: RwLock<()>,
}

impl<K: CacheKey, V: CacheValue> StripedWriteBehind<K, V> {
    pub fn new(
        execution: Arc<ExecutionService>,
        loader_writer: Arc<dyn CacheLoaderWriter<K, V>>,
        config: &WriteBehindConfig,
    ) -> Result<StripedWriteBehind<K, V>> {
        config.validate()?;
        // fail at construction rather than on the first write
        let pool = execution.resolve_pool(config.thread_pool_alias.as_deref())?;

        let stripes = (0..config.concurrency)
            .map(|_| -> Box<dyn WriteBehindQueue<K, V>> {
                match &config.batching {
                    Some(batching) => Box::new(BatchingQueue::new(
                        loader_writer.clone(),
                        execution.clone(),
                        Some(pool.clone()),
                        batching.clone(),
                        config.max_queue_size,
                        config.shutdown_timeout(),
                    )),
                    None => Box::new(NonBatchingQueue::new(
                        loader_writer.clone(),
                        execution.clone(),
                        Some(pool.clone()),
                        config.max_queue_size,
                        config.shutdown_timeout(),
                    )),
                }
            })
            .collect();

        info!(
            "write-behind created with {} stripes on pool {}, batching: {}",
            config.concurrency,
            pool,
            config.batching.is_some()
        );

        Ok(StripedWriteBehind {
            stripes,
            loader_writer,
            hash_builder: DefaultHashBuilder::default(),
            lock: RwLock::new(()),
        })
    }

    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }

    /// the stripe `key` is routed to; stable for the life of this engine
    pub fn stripe_index(&self, key: &K) -> usize {
        let mut hasher = self.hash_builder.build_hasher();
        key.hash(&mut hasher);
        (hasher.finish() % self.stripes.len() as u64) as usize
    }

    fn stripe(&self, key: &K) -> &dyn WriteBehindQueue<K, V> {
        self.stripes[self.stripe_index(key)].as_ref()
    }

    /// a rejected operation is logged and dropped; the caller is never failed for it
    fn submit(&self, operation: SingleOperation<K, V>) {
        let _guard = self.lock.read();
        let key = operation.key().clone();
        if let Err(e) = self.stripe(&key).add_operation(Arc::new(operation)) {
            warn!("dropping write-behind operation for key {:?}: {}", key, e);
        }
    }
}

impl<K: CacheKey, V: CacheValue> CacheLoaderWriter<K, V> for StripedWriteBehind<K, V> {
    fn load(&self, key: &K) -> anyhow::Result<Option<V>> {
        let _guard = self.lock.read();
        match self.stripe(key).latest(key) {
            Some(pending) => Ok(pending.pending_value()),
            None => self.loader_writer.load(key),
        }
    }

    fn load_all(&self, keys: &[K]) -> anyhow::Result<HashMap<K, Option<V>>> {
        let mut loaded = HashMap::with_capacity(keys.len());
        for key in keys {
            loaded.insert(key.clone(), self.load(key)?);
        }
        Ok(loaded)
    }

    fn write(&self, key: &K, value: &V) -> anyhow::Result<()> {
        self.submit(SingleOperation::write(key.clone(), value.clone()));
        Ok(())
    }

    fn write_all(&self, entries: &[(K, V)]) -> anyhow::Result<()> {
        for (key, value) in entries {
            self.submit(SingleOperation::write(key.clone(), value.clone()));
        }
        Ok(())
    }

    fn delete(&self, key: &K) -> anyhow::Result<()> {
        self.submit(SingleOperation::delete(key.clone()));
        Ok(())
    }

    fn delete_all(&self, keys: &[K]) -> anyhow::Result<()> {
        for key in keys {
            self.submit(SingleOperation::delete(key.clone()));
        }
        Ok(())
    }
}

impl<K: CacheKey, V: CacheValue> WriteBehind<K, V> for StripedWriteBehind<K, V> {
    fn start(&self) -> Result<()> {
        let _guard = self.lock.write();
        for (n, stripe) in self.stripes.iter().enumerate() {
            if let Err(e) = stripe.start() {
                for started in self.stripes[..n].iter() {
                    if let Err(stop_error) = started.stop() {
                        warn!("write-behind stripe failed to stop: {}", stop_error);
                    }
                }
                return Err(e);
            }
        }
        debug!("write-behind started {} stripes", self.stripes.len());
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let _guard = self.lock.write();
        let mut first_error = None;
        for stripe in self.stripes.iter() {
            if let Err(e) = stripe.stop() {
                warn!("write-behind stripe failed to stop: {}", e);
                first_error.get_or_insert(e);
            }
        }
        debug!("write-behind stopped {} stripes", self.stripes.len());
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn queue_size(&self) -> usize {
        let _guard = self.lock.read();
        self.stripes.iter().map(|stripe| stripe.queue_size()).sum()
    }
}

/// the engine follows the lifecycle of the cache it is attached to
impl<K: CacheKey, V: CacheValue> LifeCycled for StripedWriteBehind<K, V> {
    fn init(&self) -> anyhow::Result<()> {
        Ok(WriteBehind::start(self)?)
    }

    fn close(&self) -> anyhow::Result<()> {
        Ok(WriteBehind::stop(self)?)
    }
}

/// The service caches obtain write-behind engines from. Depends on the execution service.
#[derive(Debug, Default)]
pub struct WriteBehindProvider {
    execution: RwLock<Option<Arc<ExecutionService>>>,
}

impl WriteBehindProvider {
    pub fn new() -> WriteBehindProvider {
        WriteBehindProvider::default()
    }

    pub fn create_write_behind<K: CacheKey, V: CacheValue>(
        &self,
        loader_writer: Arc<dyn CacheLoaderWriter<K, V>>,
        config: &WriteBehindConfig,
    ) -> Result<Arc<StripedWriteBehind<K, V>>> {
        let execution = self.execution.read().clone().ok_or_else(|| {
            CacheError::ServiceUnavailable("write-behind provider is not started".to_string())
        })?;
        Ok(Arc::new(StripedWriteBehind::new(
            execution,
            loader_writer,
            config,
        )?))
    }
}

impl Service for WriteBehindProvider {
    fn descriptor(&self) -> ServiceDescriptor {
        ServiceDescriptor::new(ServiceType::of::<WriteBehindProvider>())
            .depends_on(ServiceType::of::<ExecutionService>())
    }

    fn start(&self, provider: &dyn ServiceProvider) -> Result<()> {
        let execution = lookup::<ExecutionService>(provider).ok_or_else(|| {
            CacheError::Dependency {
                service: ServiceType::of::<WriteBehindProvider>().to_string(),
                reason: "no execution service registered".to_string(),
            }
        })?;
        *self.execution.write() = Some(execution);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.execution.write().take();
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WriteBehindProviderFactory;

impl ServiceFactory for WriteBehindProviderFactory {
    fn descriptor(&self) -> ServiceDescriptor {
        ServiceDescriptor::new(ServiceType::of::<WriteBehindProvider>())
            .depends_on(ServiceType::of::<ExecutionService>())
    }

    fn create(&self, _config: Option<&dyn ServiceCreationConfiguration>) -> Result<Arc<dyn Service>> {
        Ok(Arc::new(WriteBehindProvider::new()))
    }
}
