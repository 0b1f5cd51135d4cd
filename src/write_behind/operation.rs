/// single-key operations queued by the write-behind engine and the bulk operations they flush as
///
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::store::{CacheKey, CacheLoaderWriter, CacheValue};

static CLOCK: AtomicU64 = AtomicU64::new(0);

/// a process-wide logical timestamp, strictly increasing across operations
fn next_creation_time() -> u64 {
    CLOCK.fetch_add(1, Ordering::Relaxed) + 1
}

#[derive(Debug, Clone)]
pub enum SingleOperation<K, V> {
    Write { key: K, value: V, created: u64 },
    Delete { key: K, created: u64 },
}

impl<K: CacheKey, V: CacheValue> SingleOperation<K, V> {
    pub fn write(key: K, value: V) -> SingleOperation<K, V> {
        SingleOperation::Write {
            key,
            value,
            created: next_creation_time(),
        }
    }

    pub fn delete(key: K) -> SingleOperation<K, V> {
        SingleOperation::Delete {
            key,
            created: next_creation_time(),
        }
    }

    pub fn key(&self) -> &K {
        match self {
            SingleOperation::Write { key, .. } | SingleOperation::Delete { key, .. } => key,
        }
    }

    pub fn creation_time(&self) -> u64 {
        match self {
            SingleOperation::Write { created, .. } | SingleOperation::Delete { created, .. } => {
                *created
            }
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, SingleOperation::Write { .. })
    }

    /// what a read sees while this operation is pending: the written value, or nothing for a delete
    pub fn pending_value(&self) -> Option<V> {
        match self {
            SingleOperation::Write { value, .. } => Some(value.clone()),
            SingleOperation::Delete { .. } => None,
        }
    }

    pub fn perform(&self, writer: &dyn CacheLoaderWriter<K, V>) -> anyhow::Result<()> {
        match self {
            SingleOperation::Write { key, value, .. } => writer.write(key, value),
            SingleOperation::Delete { key, .. } => writer.delete(key),
        }
    }
}

/// same kind, same key, same creation time; the value does not take part
impl<K: PartialEq, V> PartialEq for SingleOperation<K, V> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                SingleOperation::Write {
                    key: a, created: x, ..
                },
                SingleOperation::Write {
                    key: b, created: y, ..
                },
            ) => a == b && x == y,
            (
                SingleOperation::Delete { key: a, created: x },
                SingleOperation::Delete { key: b, created: y },
            ) => a == b && x == y,
            _ => false,
        }
    }
}

impl<K: Eq, V> Eq for SingleOperation<K, V> {}

/// a homogeneous bulk call on the writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOperation<K, V> {
    WriteAll(Vec<(K, V)>),
    DeleteAll(Vec<K>),
}

impl<K: CacheKey, V: CacheValue> BatchOperation<K, V> {
    pub fn len(&self) -> usize {
        match self {
            BatchOperation::WriteAll(entries) => entries.len(),
            BatchOperation::DeleteAll(keys) => keys.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn perform(&self, writer: &dyn CacheLoaderWriter<K, V>) -> anyhow::Result<()> {
        match self {
            BatchOperation::WriteAll(entries) => writer.write_all(entries),
            BatchOperation::DeleteAll(keys) => writer.delete_all(keys),
        }
    }
}

/// Splits operations into maximal runs of one kind, keeping arrival order.
pub fn monomorphic_batches<'a, K, V, I>(operations: I) -> Vec<BatchOperation<K, V>>
where
    K: CacheKey,
    V: CacheValue,
    I: IntoIterator<Item = &'a Arc<SingleOperation<K, V>>>,
{
    let mut batches: Vec<BatchOperation<K, V>> = vec![];

    for operation in operations {
        match (operation.as_ref(), batches.last_mut()) {
            (SingleOperation::Write { key, value, .. }, Some(BatchOperation::WriteAll(entries))) => {
                entries.push((key.clone(), value.clone()))
            }
            (SingleOperation::Delete { key, .. }, Some(BatchOperation::DeleteAll(keys))) => {
                keys.push(key.clone())
            }
            (SingleOperation::Write { key, value, .. }, _) => {
                batches.push(BatchOperation::WriteAll(vec![(key.clone(), value.clone())]))
            }
            (SingleOperation::Delete { key, .. }, _) => {
                batches.push(BatchOperation::DeleteAll(vec![key.clone()]))
            }
        }
    }

    batches
}
