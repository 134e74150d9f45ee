use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{PoisonError, RwLock};

use super::{KvEngine, KvPair, Namespace, StorageResult, WriteBatch, WriteOp};

type Tree = BTreeMap<Vec<u8>, Vec<u8>>;

/// An engine keeping everything in ordered in-process maps.
///
/// Used when no cache directory is configured, and in tests. A single lock covers both
/// namespaces so that batches are atomic.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    namespaces: RwLock<[Tree; 2]>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys in the given namespace.
    pub fn len(&self, namespace: Namespace) -> usize {
        let namespaces = self.namespaces.read().unwrap_or_else(PoisonError::into_inner);
        namespaces[namespace.index()].len()
    }
}

impl KvEngine for MemoryEngine {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get(&self, namespace: Namespace, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        let namespaces = self.namespaces.read().unwrap_or_else(PoisonError::into_inner);
        Ok(namespaces[namespace.index()].get(key).cloned())
    }

    fn write(&self, batch: WriteBatch) -> StorageResult<usize> {
        let mut namespaces = self
            .namespaces
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut skipped = 0;
        for op in batch {
            match op {
                WriteOp::Put {
                    namespace,
                    key,
                    value,
                } => {
                    namespaces[namespace.index()].insert(key, value);
                }
                WriteOp::Delete { namespace, key } => {
                    namespaces[namespace.index()].remove(&key);
                }
                WriteOp::DeleteIfUnchanged { guard, keys } => {
                    let current = namespaces[guard.namespace.index()].get(&guard.key);
                    if !guard.holds(current.map(Vec::as_slice)) {
                        skipped += 1;
                        continue;
                    }
                    for (namespace, key) in keys {
                        namespaces[namespace.index()].remove(&key);
                    }
                }
            }
        }
        Ok(skipped)
    }

    fn scan_from(
        &self,
        namespace: Namespace,
        lower_bound: &[u8],
        limit: usize,
    ) -> StorageResult<Vec<KvPair>> {
        let namespaces = self.namespaces.read().unwrap_or_else(PoisonError::into_inner);
        let range = (Bound::Included(lower_bound), Bound::Unbounded);
        Ok(namespaces[namespace.index()]
            .range::<[u8], _>(range)
            .take(limit)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}
