use super::{KeyValue, Storage, StorageError, StorageResult};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

/// SQLite backed key-value adapter.
///
/// Keys are stored as BLOBs, which SQLite compares with `memcmp`, so range
/// scans come back in the same order as the in-memory adapter.
pub struct SqliteStorage {
    conn: Mutex<Option<Connection>>,
}

impl SqliteStorage {
    pub fn open(path: &str) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        let storage = Self {
            conn: Mutex::new(Some(conn)),
        };
        storage.init()?;
        info!(path, "Storage: SQLite opened");
        Ok(storage)
    }

    pub fn open_in_memory() -> StorageResult<Self> {
        let storage = Self {
            conn: Mutex::new(Some(Connection::open_in_memory()?)),
        };
        storage.init()?;
        Ok(storage)
    }

    fn init(&self) -> StorageResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS kv (
                    key    BLOB PRIMARY KEY,
                    value  BLOB NOT NULL
                ) WITHOUT ROWID",
                [],
            )?;
            Ok(())
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> StorageResult<T>) -> StorageResult<T> {
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or(StorageError::Closed)?;
        f(conn)
    }

    /// Number of stored keys.
    pub fn count(&self) -> StorageResult<u64> {
        self.with_conn(|conn| {
            let count: u64 = conn.query_row("SELECT COUNT(*) FROM kv", [], |row| row.get(0))?;
            Ok(count)
        })
    }
}

impl Storage for SqliteStorage {
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        self.with_conn(|conn| {
            let value = conn
                .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| row.get(0))
                .optional()?;
            Ok(value)
        })
    }

    fn put(&self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
    }

    fn del(&self, key: &[u8]) -> StorageResult<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM kv WHERE key = ?1", [key])?;
            Ok(())
        })
    }

    fn scan_range(
        &self,
        gt: Option<&[u8]>,
        lt: Option<&[u8]>,
        limit: Option<usize>,
    ) -> StorageResult<Vec<KeyValue>> {
        // SQLite treats a negative LIMIT as unbounded
        let limit_i64 = limit.map_or(-1, |l| l.min(i64::MAX as usize) as i64);

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT key, value FROM kv
                 WHERE (?1 IS NULL OR key > ?1) AND (?2 IS NULL OR key < ?2)
                 ORDER BY key ASC LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![gt, lt, limit_i64], |row| {
                Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?;

            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    fn close(&self) -> StorageResult<()> {
        let conn = self.conn.lock().take().ok_or(StorageError::Closed)?;
        conn.close().map_err(|(_, e)| StorageError::Sqlite(e))?;
        debug!("Storage: SQLite closed");
        Ok(())
    }
}
