use std::sync::Arc;

use indexmap::IndexMap;

use super::operation::{monomorphic_batches, BatchOperation, SingleOperation};
use crate::store::{CacheKey, CacheValue};

type Op<K, V> = Arc<SingleOperation<K, V>>;

/// Operations accumulated for one flush.
///
/// An ordered batch keeps every operation; a coalesced batch keeps only the latest
/// operation per key, at the position the key was first added.
#[derive(Debug)]
pub enum Batch<K, V> {
    Ordered { operations: Vec<Op<K, V>>, size: usize },
    Coalesced { operations: IndexMap<K, Op<K, V>>, size: usize },
}

impl<K: CacheKey, V: CacheValue> Batch<K, V> {
    pub fn new(size: usize, coalescing: bool) -> Batch<K, V> {
        if coalescing {
            Batch::Coalesced {
                operations: IndexMap::with_capacity(size),
                size,
            }
        } else {
            Batch::Ordered {
                operations: Vec::with_capacity(size),
                size,
            }
        }
    }

    /// true once the batch has reached its size and should be flushed
    pub fn add(&mut self, operation: Op<K, V>) -> bool {
        match self {
            Batch::Ordered { operations, size } => {
                operations.push(operation);
                operations.len() >= *size
            }
            Batch::Coalesced { operations, size } => {
                operations.insert(operation.key().clone(), operation);
                operations.len() >= *size
            }
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Batch::Ordered { operations, .. } => operations.len(),
            Batch::Coalesced { operations, .. } => operations.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn operations(&self) -> Vec<Op<K, V>> {
        match self {
            Batch::Ordered { operations, .. } => operations.clone(),
            Batch::Coalesced { operations, .. } => operations.values().cloned().collect(),
        }
    }

    pub fn bulk_operations(&self) -> Vec<BatchOperation<K, V>> {
        match self {
            Batch::Ordered { operations, .. } => monomorphic_batches(operations.iter()),
            Batch::Coalesced { operations, .. } => monomorphic_batches(operations.values()),
        }
    }
}
