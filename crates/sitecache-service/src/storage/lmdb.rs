use std::fs;
use std::ops::Bound;
use std::path::Path;

use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};

use super::{KvEngine, KvPair, Namespace, StorageResult, WriteBatch, WriteOp};

/// An engine storing each namespace as a named database of one LMDB environment.
///
/// LMDB limits keys to 511 bytes. Entry keys are shortened well below that by
/// [`entry_key`](crate::caching::codec::entry_key).
pub struct LmdbEngine {
    env: Env,
    entries: Database<Bytes, Bytes>,
    expiry: Database<Bytes, Bytes>,
}

impl std::fmt::Debug for LmdbEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmdbEngine")
            .field("path", &self.env.path())
            .finish_non_exhaustive()
    }
}

impl LmdbEngine {
    /// Opens (or creates) the environment in the given directory.
    pub fn open(dir: &Path, map_size: usize) -> StorageResult<Self> {
        fs::create_dir_all(dir)?;

        // SAFETY: The environment is opened once per process and the files are not modified
        // by anything but this process.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(Namespace::ALL.len() as u32)
                .open(dir)?
        };

        let mut wtxn = env.write_txn()?;
        let entries = env.create_database(&mut wtxn, Some(Namespace::Entries.name()))?;
        let expiry = env.create_database(&mut wtxn, Some(Namespace::Expiry.name()))?;
        wtxn.commit()?;

        Ok(Self {
            env,
            entries,
            expiry,
        })
    }

    fn db(&self, namespace: Namespace) -> Database<Bytes, Bytes> {
        match namespace {
            Namespace::Entries => self.entries,
            Namespace::Expiry => self.expiry,
        }
    }
}

impl KvEngine for LmdbEngine {
    fn name(&self) -> &'static str {
        "lmdb"
    }

    fn get(&self, namespace: Namespace, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        let rtxn = self.env.read_txn()?;
        Ok(self.db(namespace).get(&rtxn, key)?.map(<[u8]>::to_vec))
    }

    fn write(&self, batch: WriteBatch) -> StorageResult<usize> {
        let mut wtxn = self.env.write_txn()?;
        let mut skipped = 0;
        for op in batch {
            match op {
                WriteOp::Put {
                    namespace,
                    key,
                    value,
                } => self.db(namespace).put(&mut wtxn, key.as_slice(), value.as_slice())?,
                WriteOp::Delete { namespace, key } => {
                    self.db(namespace).delete(&mut wtxn, key.as_slice())?;
                }
                WriteOp::DeleteIfUnchanged { guard, keys } => {
                    let holds = {
                        let current = self.db(guard.namespace).get(&wtxn, guard.key.as_slice())?;
                        guard.holds(current)
                    };
                    if !holds {
                        skipped += 1;
                        continue;
                    }
                    for (namespace, key) in keys {
                        self.db(namespace).delete(&mut wtxn, key.as_slice())?;
                    }
                }
            }
        }
        wtxn.commit()?;
        Ok(skipped)
    }

    fn scan_from(
        &self,
        namespace: Namespace,
        lower_bound: &[u8],
        limit: usize,
    ) -> StorageResult<Vec<KvPair>> {
        let rtxn = self.env.read_txn()?;
        let range = (Bound::Included(lower_bound), Bound::Unbounded);
        let mut pairs = Vec::new();
        for item in self.db(namespace).range(&rtxn, &range)?.take(limit) {
            let (key, value) = item?;
            pairs.push((key.to_vec(), value.to_vec()));
        }
        Ok(pairs)
    }
}
