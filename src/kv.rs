use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, RwLock};

use anyhow::Context;
use rusqlite::{Connection, OptionalExtension, params};

/// Pure merge function backing `append`. Given the key, the newly appended
/// value and the currently stored value, it returns the bytes to write, or
/// `None` when the store should be left untouched. Supplied by the layer that
/// owns the key encoding; backends only route bytes through it.
pub type MergeFn =
    fn(key: &[u8], value: &[u8], old: Option<&[u8]>) -> anyhow::Result<Option<Vec<u8>>>;

enum BatchOp {
    Set(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// A collected set of writes applied atomically by `write_batch`. `append`
/// resolves its merge against the live store at call time, so two appends to
/// the same key within one batch are not cumulative.
#[derive(Default)]
pub struct Batch {
    ops: Vec<BatchOp>,
}

impl Batch {
    pub fn set(&mut self, key: &[u8], value: &[u8]) {
        self.ops.push(BatchOp::Set(key.to_vec(), value.to_vec()));
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.ops.push(BatchOp::Delete(key.to_vec()));
    }

    pub fn append(&mut self, store: &dyn KvStore, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        let old = store.get(key)?;
        if let Some(merged) = store.merge(key, value, old.as_deref())? {
            self.ops.push(BatchOp::Set(key.to_vec(), merged));
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.ops.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Byte-key to byte-value persistent map. Absent keys are a normal `None`
/// result, never an error; backend "not found" sentinels stop here.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>>;
    fn set(&self, key: &[u8], value: &[u8]) -> anyhow::Result<()>;
    fn delete(&self, key: &[u8]) -> anyhow::Result<()>;

    fn exists(&self, key: &[u8]) -> anyhow::Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Run the store's merge function over (value, current value) without
    /// touching storage.
    fn merge(&self, key: &[u8], value: &[u8], old: Option<&[u8]>)
    -> anyhow::Result<Option<Vec<u8>>>;

    /// Semantic merge write: read the old value, merge, write when the merge
    /// says so.
    fn append(&self, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        let old = self.get(key)?;
        if let Some(merged) = self.merge(key, value, old.as_deref())? {
            self.set(key, &merged)?;
        }
        Ok(())
    }

    fn start_batch(&self) -> Batch {
        Batch::default()
    }

    fn write_batch(&self, batch: Batch) -> anyhow::Result<()>;

    /// Lifecycle hooks bracketing a bulk rebuild. Backends with no
    /// maintenance tasks to suspend just return success.
    fn begin_refresh(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn end_refresh(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Release underlying resources. Subsequent operations fail.
    fn close(&self) -> anyhow::Result<()>;
}

/// SQLite-backed store: one `kv` table of blob key/value pairs.
pub struct SqliteStore {
    conn: Mutex<Option<Connection>>,
    merge: MergeFn,
}

impl SqliteStore {
    pub fn open(path: &Path, merge: MergeFn) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening kv store {}", path.to_string_lossy()))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key BLOB PRIMARY KEY,
                value BLOB NOT NULL
            )",
        )
        .context("initializing kv schema")?;
        Ok(SqliteStore {
            conn: Mutex::new(Some(conn)),
            merge,
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> anyhow::Result<T>) -> anyhow::Result<T> {
        let guard = self.conn.lock().unwrap();
        let conn = guard
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("kv store is closed"))?;
        f(conn)
    }
}

impl KvStore for SqliteStore {
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM kv WHERE key = ?1",
                params![key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()
            .context("kv get")
        })
    }

    fn set(&self, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .context("kv set")?;
            Ok(())
        })
    }

    fn delete(&self, key: &[u8]) -> anyhow::Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM kv WHERE key = ?1", params![key])
                .context("kv delete")?;
            Ok(())
        })
    }

    fn merge(
        &self,
        key: &[u8],
        value: &[u8],
        old: Option<&[u8]>,
    ) -> anyhow::Result<Option<Vec<u8>>> {
        (self.merge)(key, value, old)
    }

    fn write_batch(&self, batch: Batch) -> anyhow::Result<()> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction().context("kv batch begin")?;
            for op in &batch.ops {
                match op {
                    BatchOp::Set(key, value) => {
                        tx.execute(
                            "INSERT INTO kv (key, value) VALUES (?1, ?2)
                             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                            params![key, value],
                        )?;
                    }
                    BatchOp::Delete(key) => {
                        tx.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
                    }
                }
            }
            tx.commit().context("kv batch commit")
        })
    }

    fn close(&self) -> anyhow::Result<()> {
        let mut guard = self.conn.lock().unwrap();
        if let Some(conn) = guard.take() {
            conn.close()
                .map_err(|(_, err)| err)
                .context("closing kv store")?;
        }
        Ok(())
    }
}

/// In-memory store used by tests and small tools; same contract as the
/// SQLite backend.
pub struct MemoryStore {
    map: RwLock<Option<HashMap<Vec<u8>, Vec<u8>>>>,
    merge: MergeFn,
}

impl MemoryStore {
    pub fn new(merge: MergeFn) -> Self {
        MemoryStore {
            map: RwLock::new(Some(HashMap::new())),
            merge,
        }
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        let guard = self.map.read().unwrap();
        let map = guard
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("kv store is closed"))?;
        Ok(map.get(key).cloned())
    }

    fn set(&self, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        let mut guard = self.map.write().unwrap();
        let map = guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("kv store is closed"))?;
        map.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> anyhow::Result<()> {
        let mut guard = self.map.write().unwrap();
        let map = guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("kv store is closed"))?;
        map.remove(key);
        Ok(())
    }

    fn merge(
        &self,
        key: &[u8],
        value: &[u8],
        old: Option<&[u8]>,
    ) -> anyhow::Result<Option<Vec<u8>>> {
        (self.merge)(key, value, old)
    }

    fn write_batch(&self, batch: Batch) -> anyhow::Result<()> {
        let mut guard = self.map.write().unwrap();
        let map = guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("kv store is closed"))?;
        for op in &batch.ops {
            match op {
                BatchOp::Set(key, value) => {
                    map.insert(key.clone(), value.clone());
                }
                BatchOp::Delete(key) => {
                    map.remove(key);
                }
            }
        }
        Ok(())
    }

    fn close(&self) -> anyhow::Result<()> {
        let mut guard = self.map.write().unwrap();
        guard.take();
        Ok(())
    }
}
