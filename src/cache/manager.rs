/// the cache manager: owns the service locator and every cache created through it
///
use std::sync::Arc;

use hashbrown::HashMap;
use log::*;
use parking_lot::{Condvar, Mutex};

use super::{Cache, CacheBuilder, ManagedCache};
use crate::config::ManagerConfig;
use crate::error::{CacheError, Result};
use crate::execution::ExecutionService;
use crate::lifecycle::{StateChangeListener, Status, StatusTransitioner};
use crate::service::{
    lookup, Service, ServiceCreationConfiguration, ServiceFactories, ServiceFactory,
    ServiceLocator, ServiceType,
};
use crate::store::{CacheKey, CacheValue};
use crate::write_behind::WriteBehindProvider;

/// Publishes a cache exactly once. Readers block until creation has either published the
/// cache or given up, in which case they see nothing.
struct CacheHolder {
    value: Mutex<Option<Option<Arc<dyn ManagedCache>>>>,
    published: Condvar,
}

impl CacheHolder {
    fn new() -> CacheHolder {
        CacheHolder {
            value: Mutex::new(None),
            published: Condvar::new(),
        }
    }

    /// false when a value was already published
    fn publish(&self, cache: Option<Arc<dyn ManagedCache>>) -> bool {
        let mut value = self.value.lock();
        if value.is_some() {
            return false;
        }
        *value = Some(cache);
        self.published.notify_all();
        true
    }

    fn retrieve(&self) -> Option<Arc<dyn ManagedCache>> {
        let mut value = self.value.lock();
        loop {
            if let Some(cache) = value.as_ref() {
                return cache.clone();
            }
            self.published.wait(&mut value);
        }
    }
}

pub struct CacheManagerBuilder {
    config: ManagerConfig,
    services: Vec<Arc<dyn Service>>,
    configurations: Vec<Arc<dyn ServiceCreationConfiguration>>,
    factories: ServiceFactories,
}

impl Default for CacheManagerBuilder {
    fn default() -> Self {
        CacheManagerBuilder {
            config: ManagerConfig::default(),
            services: vec![],
            configurations: vec![],
            factories: ServiceFactories::with_defaults(),
        }
    }
}

impl CacheManagerBuilder {
    pub fn new() -> CacheManagerBuilder {
        CacheManagerBuilder::default()
    }

    pub fn with_config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// a service instance to register as is
    pub fn using(mut self, service: Arc<dyn Service>) -> Self {
        self.services.push(service);
        self
    }

    pub fn with_service_configuration(
        mut self,
        configuration: Arc<dyn ServiceCreationConfiguration>,
    ) -> Self {
        self.configurations.push(configuration);
        self
    }

    pub fn with_factory(mut self, factory: Arc<dyn ServiceFactory>) -> Self {
        self.factories.register(factory);
        self
    }

    /// Resolves the service graph. Configuration errors surface here, before `init`.
    pub fn build(self) -> Result<CacheManager> {
        self.config.validate()?;

        if let Some(logging) = &self.config.logging {
            if let Err(e) = crate::logging::init(logging) {
                warn!("logging not configured: {}", e);
            }
        }

        let execution = ServiceType::of::<ExecutionService>();
        let execution_supplied = self
            .services
            .iter()
            .any(|s| s.descriptor().is_assignable_to(&execution))
            || self
                .configurations
                .iter()
                .any(|c| c.service_type() == execution);

        let mut dependencies = ServiceLocator::dependency_set(self.factories);
        for service in self.services {
            dependencies = dependencies.with_service(service);
        }
        for configuration in self.configurations {
            dependencies = dependencies.with_configuration(configuration);
        }
        if !execution_supplied {
            dependencies = dependencies.with_configuration(Arc::new(self.config.execution.clone()));
        }
        let locator = dependencies
            .with_type(ServiceType::of::<WriteBehindProvider>())
            .build()?;

        debug!(
            "cache manager resolved {} services",
            locator.services().len()
        );

        Ok(CacheManager {
            config: self.config,
            status: StatusTransitioner::new(),
            lifecycle: Mutex::new(()),
            locator,
            caches: Mutex::new(HashMap::new()),
        })
    }
}

pub struct CacheManager {
    config: ManagerConfig,
    status: StatusTransitioner,
    lifecycle: Mutex<()>,
    locator: ServiceLocator,
    caches: Mutex<HashMap<String, Arc<CacheHolder>>>,
}

impl CacheManager {
    pub fn builder() -> CacheManagerBuilder {
        CacheManagerBuilder::new()
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn status(&self) -> Status {
        self.status.current_status()
    }

    pub fn register_listener(&self, listener: Arc<dyn StateChangeListener>) {
        self.status.register_listener(listener);
    }

    /// the first registered service of concrete type `T`
    pub fn service<T: Service>(&self) -> Option<Arc<T>> {
        lookup::<T>(&self.locator)
    }

    /// starts every service in dependency order
    pub fn init(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        let transition = self.status.init()?;
        if let Err(e) = self.locator.start_all_services() {
            error!("cache manager failed to start: {}", e);
            return Err(transition.failed(e));
        }
        transition.succeeded()?;
        info!("cache manager available");
        Ok(())
    }

    /// Closes every cache, then stops every service. The first failure is reported after
    /// the whole sweep.
    pub fn close(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        let transition = self.status.close()?;

        let holders: Vec<(String, Arc<CacheHolder>)> = self.caches.lock().drain().collect();
        let mut first_error: Option<CacheError> = None;
        for (alias, holder) in holders {
            if let Some(cache) = holder.retrieve() {
                if cache.status() == Status::Available {
                    if let Err(e) = cache.close() {
                        error!("cache {} failed to close: {}", alias, e);
                        first_error.get_or_insert(e);
                    }
                }
            }
        }

        if let Err(e) = self.locator.stop_all_services() {
            error!("cache manager failed to stop services: {}", e);
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => Err(transition.failed(e)),
            None => {
                transition.succeeded()?;
                info!("cache manager closed");
                Ok(())
            }
        }
    }

    /// Creates and initializes a cache under `alias`. Concurrent `get_cache` calls for the
    /// alias wait until creation finishes.
    pub fn create_cache<K: CacheKey, V: CacheValue>(
        &self,
        alias: &str,
        builder: CacheBuilder<K, V>,
    ) -> Result<Arc<Cache<K, V>>> {
        self.status.check_available()?;

        let holder = Arc::new(CacheHolder::new());
        {
            let mut caches = self.caches.lock();
            if caches.contains_key(alias) {
                return Err(CacheError::CacheExists(alias.to_string()));
            }
            caches.insert(alias.to_string(), holder.clone());
        }

        match self.build_cache(alias, builder) {
            Ok(cache) => {
                holder.publish(Some(cache.clone() as Arc<dyn ManagedCache>));
                debug!("cache {} created", alias);
                Ok(cache)
            }
            Err(e) => {
                self.caches.lock().remove(alias);
                holder.publish(None);
                warn!("cache {} could not be created: {}", alias, e);
                Err(e)
            }
        }
    }

    fn build_cache<K: CacheKey, V: CacheValue>(
        &self,
        alias: &str,
        builder: CacheBuilder<K, V>,
    ) -> Result<Arc<Cache<K, V>>> {
        builder.validate()?;

        let write_behind = match (&builder.config.write_behind, &builder.loader_writer) {
            (Some(config), Some(loader_writer)) => {
                let provider = self.service::<WriteBehindProvider>().ok_or_else(|| {
                    CacheError::ServiceUnavailable("no write-behind provider".to_string())
                })?;
                Some(provider.create_write_behind(loader_writer.clone(), config)?)
            }
            _ => None,
        };

        let cache = Arc::new(Cache::new(alias, builder, write_behind)?);
        cache.init()?;
        Ok(cache)
    }

    /// None when no cache exists under `alias`, or its creation failed
    pub fn get_cache<K: CacheKey, V: CacheValue>(
        &self,
        alias: &str,
    ) -> Result<Option<Arc<Cache<K, V>>>> {
        self.status.check_available()?;

        let holder = match self.caches.lock().get(alias) {
            Some(holder) => holder.clone(),
            None => return Ok(None),
        };

        match holder.retrieve() {
            Some(cache) => cache
                .as_any()
                .downcast::<Cache<K, V>>()
                .map(Some)
                .map_err(|_| CacheError::CacheTypeMismatch(alias.to_string())),
            None => Ok(None),
        }
    }

    pub fn remove_cache(&self, alias: &str) -> Result<()> {
        self.status.check_available()?;

        let holder = self.caches.lock().remove(alias);
        if let Some(cache) = holder.and_then(|holder| holder.retrieve()) {
            if cache.status() == Status::Available {
                cache.close()?;
            }
        }
        Ok(())
    }

    pub fn cache_aliases(&self) -> Vec<String> {
        self.caches.lock().keys().cloned().collect()
    }
}
