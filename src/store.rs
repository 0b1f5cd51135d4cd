/// storage collaborator contracts and an in-memory stand-in for the key-value service
///
use std::fmt::Debug;
use std::hash::Hash;

use hashbrown::HashMap;
use parking_lot::RwLock;

/// bounds every cache key satisfies
pub trait CacheKey: Eq + Hash + Clone + Debug + Send + Sync + 'static {}

impl<T: Eq + Hash + Clone + Debug + Send + Sync + 'static> CacheKey for T {}

/// bounds every cache value satisfies
pub trait CacheValue: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> CacheValue for T {}

/// The key-value service a cache keeps its entries in.
pub trait Store<K, V>: Send + Sync {
    fn get(&self, key: &K) -> anyhow::Result<Option<V>>;
    fn put(&self, key: K, value: V) -> anyhow::Result<()>;
    fn remove(&self, key: &K) -> anyhow::Result<Option<V>>;
    fn contains_key(&self, key: &K) -> anyhow::Result<bool> {
        Ok(self.get(key)?.is_some())
    }
    fn clear(&self) -> anyhow::Result<()>;
    fn len(&self) -> anyhow::Result<usize>;
}

/// Loads missing entries from, and persists mutations to, the system of record.
///
/// The bulk methods only ever receive one kind of operation per call.
pub trait CacheLoaderWriter<K, V>: Send + Sync {
    fn load(&self, key: &K) -> anyhow::Result<Option<V>>;

    fn load_all(&self, keys: &[K]) -> anyhow::Result<HashMap<K, Option<V>>>
    where
        K: CacheKey,
    {
        let mut loaded = HashMap::with_capacity(keys.len());
        for key in keys {
            loaded.insert(key.clone(), self.load(key)?);
        }
        Ok(loaded)
    }

    fn write(&self, key: &K, value: &V) -> anyhow::Result<()>;

    fn write_all(&self, entries: &[(K, V)]) -> anyhow::Result<()> {
        for (key, value) in entries {
            self.write(key, value)?;
        }
        Ok(())
    }

    fn delete(&self, key: &K) -> anyhow::Result<()>;

    fn delete_all(&self, keys: &[K]) -> anyhow::Result<()> {
        for key in keys {
            self.delete(key)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct InMemoryStore<K, V> {
    entries: RwLock<HashMap<K, V>>,
}

impl<K: CacheKey, V: CacheValue> Default for InMemoryStore<K, V> {
    fn default() -> Self {
        InMemoryStore {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<K: CacheKey, V: CacheValue> InMemoryStore<K, V> {
    pub fn new() -> InMemoryStore<K, V> {
        InMemoryStore::default()
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries.read().keys().cloned().collect()
    }
}

impl<K: CacheKey, V: CacheValue> Store<K, V> for InMemoryStore<K, V> {
    fn get(&self, key: &K) -> anyhow::Result<Option<V>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: K, value: V) -> anyhow::Result<()> {
        self.entries.write().insert(key, value);
        Ok(())
    }

    fn remove(&self, key: &K) -> anyhow::Result<Option<V>> {
        Ok(self.entries.write().remove(key))
    }

    fn contains_key(&self, key: &K) -> anyhow::Result<bool> {
        Ok(self.entries.read().contains_key(key))
    }

    fn clear(&self) -> anyhow::Result<()> {
        self.entries.write().clear();
        Ok(())
    }

    fn len(&self) -> anyhow::Result<usize> {
        Ok(self.entries.read().len())
    }
}
