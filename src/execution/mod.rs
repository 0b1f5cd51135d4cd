//! the execution provider: named thread pools handing out ordered executors and schedulers

pub mod ordered;
pub mod scheduled;

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use log::*;
use parking_lot::Mutex;

use crate::config::ExecutionConfig;
use crate::error::{CacheError, Result};
use crate::service::{
    Service, ServiceCreationConfiguration, ServiceDescriptor, ServiceFactory, ServiceProvider,
    ServiceType,
};
pub use ordered::OrderedExecutor;
pub use scheduled::{ScheduledExecutor, ScheduledTask};

/// how long `stop` waits for the outstanding ordered executors to drain
const STOP_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug)]
struct Pool {
    ordered: Vec<OrderedExecutor>,
    scheduled: Vec<ScheduledExecutor>,
    scheduler_shutdown: Arc<AtomicBool>,
}

impl Pool {
    fn new() -> Pool {
        Pool {
            ordered: vec![],
            scheduled: vec![],
            scheduler_shutdown: Arc::new(AtomicBool::new(false)),
        }
    }
}

pub struct ExecutionService {
    config: ExecutionConfig,
    running: AtomicBool,
    pools: Mutex<HashMap<String, Pool>>,
}

impl fmt::Debug for ExecutionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionService")
            .field("config", &self.config)
            .field("running", &self.running.load(Ordering::Acquire))
            .finish()
    }
}

impl ExecutionService {
    pub fn new(config: ExecutionConfig) -> ExecutionService {
        ExecutionService {
            config,
            running: AtomicBool::new(false),
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// the pool for an explicit alias, or the configured default when none is given
    pub fn resolve_pool(&self, alias: Option<&str>) -> Result<String> {
        match alias {
            Some(alias) if self.config.pools.iter().any(|p| p == alias) => Ok(alias.to_string()),
            Some(alias) => Err(CacheError::UnknownPool(alias.to_string())),
            None => self
                .config
                .default_pool
                .clone()
                .ok_or(CacheError::NoDefaultPool),
        }
    }

    pub fn get_ordered_executor(&self, alias: Option<&str>, capacity: usize) -> Result<OrderedExecutor> {
        let pool_name = self.resolve_pool(alias)?;
        let mut pools = self.pools.lock();
        let pool = self.live_pool(&mut pools, &pool_name)?;

        pool.ordered.retain(|e| !e.is_shutdown());
        let executor = OrderedExecutor::new(&pool_name, capacity);
        pool.ordered.push(executor.clone());
        Ok(executor)
    }

    pub fn get_scheduled_executor(&self, alias: Option<&str>) -> Result<ScheduledExecutor> {
        let pool_name = self.resolve_pool(alias)?;
        let mut pools = self.pools.lock();
        let pool = self.live_pool(&mut pools, &pool_name)?;

        pool.scheduled.retain(|s| !s.is_shutdown());
        let executor = ScheduledExecutor::new(&pool_name, pool.scheduler_shutdown.clone());
        pool.scheduled.push(executor.clone());
        Ok(executor)
    }

    fn live_pool<'p>(&self, pools: &'p mut HashMap<String, Pool>, name: &str) -> Result<&'p mut Pool> {
        if !self.is_running() {
            return Err(CacheError::ServiceUnavailable(
                "execution service is not started".to_string(),
            ));
        }
        pools
            .get_mut(name)
            .ok_or_else(|| CacheError::UnknownPool(name.to_string()))
    }
}

impl Service for ExecutionService {
    fn descriptor(&self) -> ServiceDescriptor {
        ServiceDescriptor::new(ServiceType::of::<ExecutionService>())
    }

    fn start(&self, _provider: &dyn ServiceProvider) -> Result<()> {
        self.config.validate()?;

        let mut pools = self.pools.lock();
        pools.clear();
        for name in self.config.pools.iter() {
            pools.insert(name.clone(), Pool::new());
        }
        self.running.store(true, Ordering::Release);

        info!("execution service started with pools {:?}", self.config.pools);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::Release);

        let drained: Vec<(String, Pool)> = self.pools.lock().drain().collect();
        let mut draining = vec![];
        for (name, pool) in drained {
            pool.scheduler_shutdown.store(true, Ordering::Release);
            for scheduler in pool.scheduled.iter() {
                scheduler.shutdown_now();
            }
            for executor in pool.ordered.into_iter().filter(|e| !e.is_shutdown()) {
                executor.request_shutdown();
                draining.push((name.clone(), executor));
            }
        }

        // every executor drains in parallel against one deadline
        let deadline = Instant::now() + STOP_GRACE;
        for (name, executor) in draining {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !executor.await_termination(remaining) {
                warn!(
                    "executor {} in pool {} did not drain within {:?}",
                    executor.id(),
                    name,
                    STOP_GRACE
                );
            }
        }

        info!("execution service stopped");
        Ok(())
    }
}

impl ServiceCreationConfiguration for ExecutionConfig {
    fn service_type(&self) -> ServiceType {
        ServiceType::of::<ExecutionService>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// creates the execution service from an `ExecutionConfig`, or from defaults when requested bare
#[derive(Debug, Default, Clone, Copy)]
pub struct ExecutionServiceFactory;

impl ServiceFactory for ExecutionServiceFactory {
    fn descriptor(&self) -> ServiceDescriptor {
        ServiceDescriptor::new(ServiceType::of::<ExecutionService>())
    }

    fn accepts(&self, config: &dyn ServiceCreationConfiguration) -> bool {
        config.as_any().is::<ExecutionConfig>()
    }

    fn create(&self, config: Option<&dyn ServiceCreationConfiguration>) -> Result<Arc<dyn Service>> {
        let config = config
            .and_then(|c| c.as_any().downcast_ref::<ExecutionConfig>())
            .cloned()
            .unwrap_or_default();
        config.validate()?;
        Ok(Arc::new(ExecutionService::new(config)))
    }
}
