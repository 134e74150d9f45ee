use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use super::{KvEngine, KvPair, Namespace, StorageResult, WriteBatch, WriteOp};

/// An engine storing each namespace as a table of a single SQLite database file.
///
/// Keys are `BLOB` primary keys, which SQLite orders bytewise.
pub struct SqliteEngine {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteEngine").finish_non_exhaustive()
    }
}

impl SqliteEngine {
    /// Opens (or creates) the database at the given path.
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        for namespace in Namespace::ALL {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    key BLOB PRIMARY KEY NOT NULL,
                    value BLOB NOT NULL
                ) WITHOUT ROWID",
                namespace.name()
            ))?;
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn select_value(
    conn: &Connection,
    namespace: Namespace,
    key: &[u8],
) -> StorageResult<Option<Vec<u8>>> {
    let sql = format!("SELECT value FROM {} WHERE key = ?1", namespace.name());
    let value = conn
        .prepare_cached(&sql)?
        .query_row(params![key], |row| row.get(0))
        .optional()?;
    Ok(value)
}

fn delete_key(conn: &Connection, namespace: Namespace, key: &[u8]) -> StorageResult<()> {
    let sql = format!("DELETE FROM {} WHERE key = ?1", namespace.name());
    conn.prepare_cached(&sql)?.execute(params![key])?;
    Ok(())
}

impl KvEngine for SqliteEngine {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn get(&self, namespace: Namespace, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        select_value(&self.conn(), namespace, key)
    }

    fn write(&self, batch: WriteBatch) -> StorageResult<usize> {
        let mut conn = self.conn();
        // takes the write lock up front, so guards are checked against the committed state
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut skipped = 0;
        for op in batch {
            match op {
                WriteOp::Put {
                    namespace,
                    key,
                    value,
                } => {
                    let sql = format!(
                        "INSERT OR REPLACE INTO {} (key, value) VALUES (?1, ?2)",
                        namespace.name()
                    );
                    tx.prepare_cached(&sql)?.execute(params![key, value])?;
                }
                WriteOp::Delete { namespace, key } => delete_key(&tx, namespace, &key)?,
                WriteOp::DeleteIfUnchanged { guard, keys } => {
                    let current = select_value(&tx, guard.namespace, &guard.key)?;
                    if !guard.holds(current.as_deref()) {
                        skipped += 1;
                        continue;
                    }
                    for (namespace, key) in keys {
                        delete_key(&tx, namespace, &key)?;
                    }
                }
            }
        }
        tx.commit()?;
        Ok(skipped)
    }

    fn scan_from(
        &self,
        namespace: Namespace,
        lower_bound: &[u8],
        limit: usize,
    ) -> StorageResult<Vec<KvPair>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT key, value FROM {} WHERE key >= ?1 ORDER BY key LIMIT ?2",
            namespace.name()
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![lower_bound, limit], |row| {
            Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        let mut pairs = Vec::new();
        for pair in rows {
            pairs.push(pair?);
        }
        Ok(pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::exercise_engine;

    #[test]
    fn test_sqlite_engine() {
        sitecache_test::setup();
        let cache_dir = sitecache_test::tempdir();
        let engine = SqliteEngine::open(&cache_dir.path().join("nested/cache.sqlite")).unwrap();
        exercise_engine(&engine);
    }

    #[test]
    fn test_sqlite_reopen() {
        let cache_dir = sitecache_test::tempdir();
        let path = cache_dir.path().join("cache.sqlite");
        {
            let engine = SqliteEngine::open(&path).unwrap();
            engine.set(Namespace::Expiry, b"c:kept", b"value").unwrap();
        }
        let engine = SqliteEngine::open(&path).unwrap();
        assert_eq!(
            engine.get(Namespace::Expiry, b"c:kept").unwrap().as_deref(),
            Some(&b"value"[..])
        );
    }
}
