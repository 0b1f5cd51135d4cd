//! manageable caches over a key-value store.
//!
//! A `Cache` reads through its store, falls back to the loader on a miss, and sends every
//! mutation to its writer before applying it to the store. With write-behind configured the
//! writer is a striped engine that persists asynchronously; the engine is a lifecycle hook of
//! the cache, so `init` starts it and `close` drains it.

pub mod manager;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use log::*;

use crate::config::{CacheConfig, WriteBehindConfig};
use crate::error::{CacheError, Result};
use crate::lifecycle::{StateChangeListener, Status, StatusTransitioner};
use crate::store::{CacheKey, CacheLoaderWriter, CacheValue, InMemoryStore, Store};
use crate::write_behind::{StripedWriteBehind, WriteBehind};
pub use manager::{CacheManager, CacheManagerBuilder};

/// what a cache is assembled from; handed to `CacheManager::create_cache`
pub struct CacheBuilder<K, V> {
    config: CacheConfig,
    store: Option<Arc<dyn Store<K, V>>>,
    loader_writer: Option<Arc<dyn CacheLoaderWriter<K, V>>>,
}

impl<K: CacheKey, V: CacheValue> Default for CacheBuilder<K, V> {
    fn default() -> Self {
        CacheBuilder {
            config: CacheConfig::default(),
            store: None,
            loader_writer: None,
        }
    }
}

impl<K: CacheKey, V: CacheValue> CacheBuilder<K, V> {
    pub fn new() -> CacheBuilder<K, V> {
        CacheBuilder::default()
    }

    pub fn with_config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// defaults to an `InMemoryStore`
    pub fn with_store(mut self, store: Arc<dyn Store<K, V>>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_loader_writer(mut self, loader_writer: Arc<dyn CacheLoaderWriter<K, V>>) -> Self {
        self.loader_writer = Some(loader_writer);
        self
    }

    pub fn with_write_behind(mut self, write_behind: WriteBehindConfig) -> Self {
        self.config.write_behind = Some(write_behind);
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub(crate) fn validate(&self) -> Result<()> {
        self.config.validate()?;
        if self.config.write_behind.is_some() && self.loader_writer.is_none() {
            return Err(CacheError::InvalidConfig(
                "write-behind needs a loader-writer".to_string(),
            ));
        }
        Ok(())
    }
}

pub struct Cache<K, V> {
    alias: String,
    status: StatusTransitioner,
    store: Arc<dyn Store<K, V>>,
    loader_writer: Option<Arc<dyn CacheLoaderWriter<K, V>>>,
    write_behind: Option<Arc<StripedWriteBehind<K, V>>>,
}

impl<K, V> fmt::Debug for Cache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("alias", &self.alias)
            .field("status", &self.status)
            .field("write_behind", &self.write_behind.is_some())
            .finish()
    }
}

impl<K: CacheKey, V: CacheValue> Cache<K, V> {
    /// An uninitialized cache. With write-behind the engine replaces the loader-writer on
    /// every path, so pending mutations are visible to loads.
    pub fn new(
        alias: &str,
        builder: CacheBuilder<K, V>,
        write_behind: Option<Arc<StripedWriteBehind<K, V>>>,
    ) -> Result<Cache<K, V>> {
        builder.validate()?;

        let status = StatusTransitioner::new();
        let loader_writer = match &write_behind {
            Some(engine) => {
                status.add_hook(engine.clone())?;
                Some(engine.clone() as Arc<dyn CacheLoaderWriter<K, V>>)
            }
            None => builder.loader_writer,
        };
        let store: Arc<dyn Store<K, V>> = match builder.store {
            Some(store) => store,
            None => Arc::new(InMemoryStore::new()),
        };

        Ok(Cache {
            alias: alias.to_string(),
            status,
            store,
            loader_writer,
            write_behind,
        })
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn status(&self) -> Status {
        self.status.current_status()
    }

    pub fn register_listener(&self, listener: Arc<dyn StateChangeListener>) {
        self.status.register_listener(listener);
    }

    pub fn init(&self) -> Result<()> {
        self.status.init()?.succeeded()?;
        info!("cache {} available", self.alias);
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.status.close()?.succeeded()?;
        info!("cache {} closed", self.alias);
        Ok(())
    }

    /// the store first, then the loader; a loaded value is kept in the store
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        self.status.check_available()?;

        if let Some(value) = self.store.get(key)? {
            return Ok(Some(value));
        }

        let loaded = match &self.loader_writer {
            Some(loader) => loader.load(key)?,
            None => None,
        };
        if let Some(value) = &loaded {
            self.store.put(key.clone(), value.clone())?;
        }
        Ok(loaded)
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        self.status.check_available()?;
        Ok(self.store.contains_key(key)?)
    }

    pub fn put(&self, key: K, value: V) -> Result<()> {
        self.status.check_available()?;
        if let Some(writer) = &self.loader_writer {
            writer.write(&key, &value)?;
        }
        self.store.put(key, value)?;
        Ok(())
    }

    pub fn remove(&self, key: &K) -> Result<()> {
        self.status.check_available()?;
        if let Some(writer) = &self.loader_writer {
            writer.delete(key)?;
        }
        self.store.remove(key)?;
        Ok(())
    }

    pub fn put_all(&self, entries: Vec<(K, V)>) -> Result<()> {
        self.status.check_available()?;
        if let Some(writer) = &self.loader_writer {
            writer.write_all(&entries)?;
        }
        for (key, value) in entries {
            self.store.put(key, value)?;
        }
        Ok(())
    }

    pub fn remove_all(&self, keys: &[K]) -> Result<()> {
        self.status.check_available()?;
        if let Some(writer) = &self.loader_writer {
            writer.delete_all(keys)?;
        }
        for key in keys {
            self.store.remove(key)?;
        }
        Ok(())
    }

    /// operations still waiting for the writer, when write-behind is configured
    pub fn write_behind_queue_size(&self) -> Option<usize> {
        self.write_behind
            .as_ref()
            .map(|engine| WriteBehind::queue_size(engine.as_ref()))
    }
}

/// the type-erased view the manager keeps of each cache
pub(crate) trait ManagedCache: Send + Sync {
    fn status(&self) -> Status;
    fn close(&self) -> Result<()>;
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<K: CacheKey, V: CacheValue> ManagedCache for Cache<K, V> {
    fn status(&self) -> Status {
        Cache::status(self)
    }

    fn close(&self) -> Result<()> {
        Cache::close(self)
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
