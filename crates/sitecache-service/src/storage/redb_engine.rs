use std::fs;
use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};

use super::{KvEngine, KvPair, Namespace, StorageError, StorageResult, WriteBatch, WriteOp};

const ENTRIES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("entries");
const EXPIRY: TableDefinition<&[u8], &[u8]> = TableDefinition::new("expiry");

fn table(namespace: Namespace) -> TableDefinition<'static, &'static [u8], &'static [u8]> {
    match namespace {
        Namespace::Entries => ENTRIES,
        Namespace::Expiry => EXPIRY,
    }
}

/// An engine storing both namespaces as tables of a single redb database file.
pub struct RedbEngine {
    db: Database,
}

impl std::fmt::Debug for RedbEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbEngine").finish_non_exhaustive()
    }
}

impl RedbEngine {
    /// Opens (or creates) the database at the given path.
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create all tables eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        for namespace in Namespace::ALL {
            write_txn.open_table(table(namespace))?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }
}

impl KvEngine for RedbEngine {
    fn name(&self) -> &'static str {
        "redb"
    }

    fn get(&self, namespace: Namespace, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table(namespace))?;
        Ok(table.get(key)?.map(|value| value.value().to_vec()))
    }

    fn write(&self, batch: WriteBatch) -> StorageResult<usize> {
        let write_txn = self.db.begin_write()?;
        let mut skipped = 0;
        {
            let mut tables = [write_txn.open_table(ENTRIES)?, write_txn.open_table(EXPIRY)?];
            for op in batch {
                match op {
                    WriteOp::Put {
                        namespace,
                        key,
                        value,
                    } => {
                        tables[namespace.index()].insert(key.as_slice(), value.as_slice())?;
                    }
                    WriteOp::Delete { namespace, key } => {
                        tables[namespace.index()].remove(key.as_slice())?;
                    }
                    WriteOp::DeleteIfUnchanged { guard, keys } => {
                        let holds = {
                            let table = &tables[guard.namespace.index()];
                            let current = table.get(guard.key.as_slice())?;
                            guard.holds(current.as_ref().map(|value| value.value()))
                        };
                        if !holds {
                            skipped += 1;
                            continue;
                        }
                        for (namespace, key) in keys {
                            tables[namespace.index()].remove(key.as_slice())?;
                        }
                    }
                }
            }
        }
        write_txn.commit()?;
        Ok(skipped)
    }

    fn scan_from(
        &self,
        namespace: Namespace,
        lower_bound: &[u8],
        limit: usize,
    ) -> StorageResult<Vec<KvPair>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table(namespace))?;
        let mut pairs = Vec::new();
        for item in table.range(lower_bound..)?.take(limit) {
            let (key, value) = item?;
            pairs.push((key.value().to_vec(), value.value().to_vec()));
        }
        Ok(pairs)
    }
}

impl From<redb::DatabaseError> for StorageError {
    fn from(e: redb::DatabaseError) -> Self {
        Self::Redb(e.into())
    }
}

impl From<redb::TransactionError> for StorageError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Redb(e.into())
    }
}

impl From<redb::TableError> for StorageError {
    fn from(e: redb::TableError) -> Self {
        Self::Redb(e.into())
    }
}

impl From<redb::StorageError> for StorageError {
    fn from(e: redb::StorageError) -> Self {
        Self::Redb(e.into())
    }
}

impl From<redb::CommitError> for StorageError {
    fn from(e: redb::CommitError) -> Self {
        Self::Redb(e.into())
    }
}
