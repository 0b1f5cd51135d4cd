#![doc = include_str!("../README.md")]

pub mod cache;
pub mod config;
pub mod error;
pub mod execution;
pub mod lifecycle;
pub mod logging;
pub mod service;
pub mod store;
pub mod worker;
pub mod write_behind;

pub use cache::{Cache, CacheBuilder, CacheManager, CacheManagerBuilder};
pub use error::{CacheError, Result};
pub use lifecycle::Status;
pub use store::{CacheLoaderWriter, InMemoryStore, Store};
pub use write_behind::{StripedWriteBehind, WriteBehind, WriteBehindProvider};

/// the current app version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
