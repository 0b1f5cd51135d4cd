/// configuration records for the manager, execution pools, caches and write-behind.
///
/// Every record deserializes with defaults for missing fields, so a JSON document only
/// needs to name what it changes.
///
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

pub const DEFAULT_POOL: &str = "default";

/// parse any configuration record from a JSON string
pub fn from_json_str<T: DeserializeOwned>(json: &str) -> Result<T> {
    Ok(serde_json::from_str(json)?)
}

/// read any configuration record from a JSON file
pub fn from_json_file<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let text = std::fs::read_to_string(path)?;
    from_json_str(&text)
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub execution: ExecutionConfig,
    pub logging: Option<LoggingConfig>,
}

impl ManagerConfig {
    pub fn validate(&self) -> Result<()> {
        self.execution.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub default_pool: Option<String>,
    pub pools: Vec<String>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        ExecutionConfig {
            default_pool: Some(DEFAULT_POOL.to_string()),
            pools: vec![DEFAULT_POOL.to_string()],
        }
    }
}

impl ExecutionConfig {
    pub fn validate(&self) -> Result<()> {
        for (i, pool) in self.pools.iter().enumerate() {
            if pool.is_empty() {
                return Err(CacheError::InvalidConfig("empty thread pool alias".to_string()));
            }
            if self.pools[..i].contains(pool) {
                return Err(CacheError::InvalidConfig(format!(
                    "duplicate thread pool alias: {}",
                    pool
                )));
            }
        }

        if let Some(default) = &self.default_pool {
            if !self.pools.contains(default) {
                return Err(CacheError::InvalidConfig(format!(
                    "default pool {} is not a configured pool",
                    default
                )));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub write_behind: Option<WriteBehindConfig>,
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        match &self.write_behind {
            Some(write_behind) => write_behind.validate(),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteBehindConfig {
    pub concurrency: usize,
    pub max_queue_size: usize,
    pub thread_pool_alias: Option<String>,
    pub batching: Option<BatchingConfig>,
    pub shutdown_timeout_ms: u64,
}

impl Default for WriteBehindConfig {
    fn default() -> Self {
        WriteBehindConfig {
            concurrency: 1,
            max_queue_size: 1024,
            thread_pool_alias: None,
            batching: None,
            shutdown_timeout_ms: 30_000,
        }
    }
}

impl WriteBehindConfig {
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(CacheError::InvalidConfig(
                "write-behind concurrency must be at least 1".to_string(),
            ));
        }
        if self.max_queue_size == 0 {
            return Err(CacheError::InvalidConfig(
                "write-behind max queue size must be at least 1".to_string(),
            ));
        }
        match &self.batching {
            Some(batching) => batching.validate(),
            None => Ok(()),
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn with_batching(mut self, batching: BatchingConfig) -> Self {
        self.batching = Some(batching);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    pub batch_size: usize,
    pub max_delay_ms: u64,
    pub coalescing: bool,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        BatchingConfig {
            batch_size: 1,
            max_delay_ms: 1_000,
            coalescing: false,
        }
    }
}

impl BatchingConfig {
    pub fn new(batch_size: usize, max_delay: Duration, coalescing: bool) -> BatchingConfig {
        BatchingConfig {
            batch_size,
            max_delay_ms: max_delay.as_millis() as u64,
            coalescing,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(CacheError::InvalidConfig(
                "batch size must be at least 1".to_string(),
            ));
        }
        if self.max_delay_ms == 0 {
            return Err(CacheError::InvalidConfig(
                "batch max delay must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// batches the executor queue holds for a given operation budget
    pub fn executor_capacity(&self, max_queue_size: usize) -> usize {
        (max_queue_size / self.batch_size).max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub config_file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            config_file: None,
        }
    }
}
