//! Shared key-value / append-log / dict store over SQLite.
//!
//! Layout:
//! - `objects`: blobs keyed by `namespace/name` with content metadata
//!   (row type, row count, schema version, modified time)
//! - `logs` + `log_meta`: append logs, optionally bounded (oldest evicted)
//! - `dicts`: JSON values keyed by `(dict, key)`
//!
//! The database runs in WAL mode with a busy timeout, so several processes can
//! open the same file; [`Store::transaction`] takes the write lock up front
//! (`BEGIN IMMEDIATE`) and is the unit of cross-process atomicity.

pub mod table;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

pub use table::TableRow;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);
const WAIT_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("'{key}' holds {found}, expected {expected}")]
    SchemaMismatch {
        key: String,
        expected: String,
        found: String,
    },

    #[error("timed out waiting for log '{log}' to reach length {len}")]
    WaitTimeout { log: String, len: u64 },
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Encoding(format!("json: {e}"))
    }
}

/// Content metadata of one stored object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub namespace: String,
    pub name: String,
    pub content_type: String,
    pub rows: u64,
    pub schema_version: u32,
    pub modified: DateTime<Utc>,
    pub size: u64,
}

impl ObjectMeta {
    pub fn key(&self) -> String {
        join_key(&self.namespace, &self.name)
    }
}

/// Split `a/b/c` into (`a/b`, `c`). A key without `/` lives in the root namespace.
pub fn split_key(key: &str) -> (&str, &str) {
    key.rsplit_once('/').unwrap_or(("", key))
}

pub fn join_key(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}/{name}")
    }
}

/// Handle to the store file. Cheap to share behind an `Arc`.
pub struct Store {
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (creating if needed) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        init_schema(&conn)?;
        info!(path = %path.display(), "store opened");
        Ok(Self {
            path: Some(path.to_path_buf()),
            conn: Mutex::new(conn),
        })
    }

    /// Private in-memory store; not shared across processes.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            path: None,
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` inside one write transaction. Commits on `Ok`, rolls back on `Err`.
    pub fn transaction<T, E>(&self, f: impl FnOnce(&Tx<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;
        let out = f(&Tx { conn: &tx })?;
        tx.commit().map_err(StoreError::from)?;
        Ok(out)
    }

    /// Run `f` outside an explicit transaction (each statement autocommits).
    fn with<T>(&self, f: impl FnOnce(&Tx<'_>) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let conn = self.conn.lock();
        f(&Tx { conn: &conn })
    }

    // ── objects ──────────────────────────────────────────────────────

    pub fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.with(|tx| tx.exists(key))
    }

    pub fn meta(&self, key: &str) -> Result<Option<ObjectMeta>, StoreError> {
        self.with(|tx| tx.meta(key))
    }

    pub fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.with(|tx| tx.delete(key))
    }

    pub fn list(&self, namespace: &str) -> Result<Vec<String>, StoreError> {
        self.with(|tx| tx.list(namespace))
    }

    pub fn list_meta(&self, namespace: &str) -> Result<Vec<ObjectMeta>, StoreError> {
        self.with(|tx| tx.list_meta(namespace))
    }

    pub fn put_table<T: TableRow>(&self, key: &str, rows: &[T]) -> Result<(), StoreError> {
        self.transaction(|tx| tx.put_table(key, rows))
    }

    pub fn get_table<T: TableRow>(&self, key: &str) -> Result<Option<Vec<T>>, StoreError> {
        self.with(|tx| tx.get_table(key))
    }

    pub fn put_json<T: Serialize>(
        &self,
        key: &str,
        content_type: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        self.transaction(|tx| tx.put_json(key, content_type, value))
    }

    pub fn get_json<T: DeserializeOwned>(
        &self,
        key: &str,
        content_type: &str,
    ) -> Result<Option<T>, StoreError> {
        self.with(|tx| tx.get_json(key, content_type))
    }

    pub fn put_bytes(&self, key: &str, content_type: &str, rows: u64, data: &[u8]) -> Result<(), StoreError> {
        self.with(|tx| tx.put_object(key, content_type, rows, 0, data))
    }

    pub fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.with(|tx| tx.get_bytes(key))
    }

    // ── logs ─────────────────────────────────────────────────────────

    /// Clear `log` and set its bound (`None` for unbounded).
    pub fn log_reset(&self, log: &str, maxsize: Option<u64>) -> Result<(), StoreError> {
        self.transaction(|tx| tx.log_reset(log, maxsize))
    }

    pub fn log_append<T: Serialize>(&self, log: &str, value: &T) -> Result<(), StoreError> {
        self.transaction(|tx| tx.log_append(log, value))
    }

    pub fn log_len(&self, log: &str) -> Result<u64, StoreError> {
        self.with(|tx| tx.log_len(log))
    }

    pub fn log_get<T: DeserializeOwned>(&self, log: &str, index: u64) -> Result<Option<T>, StoreError> {
        self.with(|tx| tx.log_get(log, index))
    }

    pub fn log_slice<T: DeserializeOwned>(
        &self,
        log: &str,
        start: u64,
        end: u64,
    ) -> Result<Vec<T>, StoreError> {
        self.with(|tx| tx.log_slice(log, start, end))
    }

    pub fn log_clear(&self, log: &str) -> Result<(), StoreError> {
        self.with(|tx| tx.log_clear(log))
    }

    /// Block until `log` holds at least `len` entries, polling.
    ///
    /// Returns the observed length, or [`StoreError::WaitTimeout`].
    pub fn wait_len(&self, log: &str, len: u64, timeout: Option<Duration>) -> Result<u64, StoreError> {
        let started = Instant::now();
        loop {
            let current = self.log_len(log)?;
            if current >= len {
                return Ok(current);
            }
            if timeout.is_some_and(|t| started.elapsed() >= t) {
                return Err(StoreError::WaitTimeout {
                    log: log.to_string(),
                    len,
                });
            }
            std::thread::sleep(WAIT_POLL);
        }
    }

    // ── dicts ────────────────────────────────────────────────────────

    pub fn dict_get<T: DeserializeOwned>(&self, dict: &str, key: &str) -> Result<Option<T>, StoreError> {
        self.with(|tx| tx.dict_get(dict, key))
    }

    pub fn dict_set<T: Serialize>(&self, dict: &str, key: &str, value: &T) -> Result<(), StoreError> {
        self.with(|tx| tx.dict_set(dict, key, value))
    }

    pub fn dict_items<T: DeserializeOwned>(&self, dict: &str) -> Result<Vec<(String, T)>, StoreError> {
        self.with(|tx| tx.dict_items(dict))
    }

    pub fn dict_clear(&self, dict: &str) -> Result<(), StoreError> {
        self.with(|tx| tx.dict_clear(dict))
    }

    // ── maintenance ──────────────────────────────────────────────────

    /// Checkpoint the WAL and rebuild the database file.
    pub fn compact(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        if self.path.is_some() {
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        }
        conn.execute_batch("VACUUM")?;
        debug!("store compacted");
        Ok(())
    }

    /// Bytes on disk, including the WAL. Zero for in-memory stores.
    pub fn size_on_disk(&self) -> u64 {
        let Some(path) = &self.path else {
            return 0;
        };
        let wal = PathBuf::from(format!("{}-wal", path.display()));
        [path.as_path(), wal.as_path()]
            .iter()
            .filter_map(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .sum()
    }
}

fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS objects (
            namespace TEXT NOT NULL,
            name TEXT NOT NULL,
            content_type TEXT NOT NULL,
            rows INTEGER NOT NULL,
            schema_version INTEGER NOT NULL,
            modified_ns INTEGER NOT NULL,
            data BLOB NOT NULL,
            PRIMARY KEY (namespace, name)
        );
        CREATE TABLE IF NOT EXISTS log_meta (
            log TEXT PRIMARY KEY,
            maxsize INTEGER,
            next_seq INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE IF NOT EXISTS logs (
            log TEXT NOT NULL,
            seq INTEGER NOT NULL,
            data TEXT NOT NULL,
            PRIMARY KEY (log, seq)
        );
        CREATE TABLE IF NOT EXISTS dicts (
            dict TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY (dict, key)
        );",
    )?;
    Ok(())
}

fn now_ns() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Store operations bound to one connection or open transaction.
pub struct Tx<'a> {
    conn: &'a Connection,
}

impl Tx<'_> {
    pub fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let (ns, name) = split_key(key);
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM objects WHERE namespace = ?1 AND name = ?2",
                params![ns, name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn put_object(
        &self,
        key: &str,
        content_type: &str,
        rows: u64,
        schema_version: u32,
        data: &[u8],
    ) -> Result<(), StoreError> {
        let (ns, name) = split_key(key);
        self.conn.execute(
            "INSERT OR REPLACE INTO objects
             (namespace, name, content_type, rows, schema_version, modified_ns, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![ns, name, content_type, rows as i64, schema_version, now_ns(), data],
        )?;
        Ok(())
    }

    pub fn meta(&self, key: &str) -> Result<Option<ObjectMeta>, StoreError> {
        let (ns, name) = split_key(key);
        let meta = self
            .conn
            .query_row(
                "SELECT namespace, name, content_type, rows, schema_version, modified_ns, length(data)
                 FROM objects WHERE namespace = ?1 AND name = ?2",
                params![ns, name],
                row_to_meta,
            )
            .optional()?;
        Ok(meta)
    }

    pub fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let (ns, name) = split_key(key);
        let data = self
            .conn
            .query_row(
                "SELECT data FROM objects WHERE namespace = ?1 AND name = ?2",
                params![ns, name],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(data)
    }

    pub fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let (ns, name) = split_key(key);
        let n = self.conn.execute(
            "DELETE FROM objects WHERE namespace = ?1 AND name = ?2",
            params![ns, name],
        )?;
        Ok(n > 0)
    }

    /// Names directly inside `namespace`, sorted.
    pub fn list(&self, namespace: &str) -> Result<Vec<String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM objects WHERE namespace = ?1 ORDER BY name")?;
        let names = stmt
            .query_map(params![namespace], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    pub fn list_meta(&self, namespace: &str) -> Result<Vec<ObjectMeta>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT namespace, name, content_type, rows, schema_version, modified_ns, length(data)
             FROM objects WHERE namespace = ?1 ORDER BY name",
        )?;
        let metas = stmt
            .query_map(params![namespace], row_to_meta)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(metas)
    }

    /// Encode `rows` as one table object. Replaces any previous value atomically.
    pub fn put_table<T: TableRow>(&self, key: &str, rows: &[T]) -> Result<(), StoreError> {
        let bytes = table::encode(rows)?;
        self.put_object(key, T::ROW_TYPE, rows.len() as u64, T::SCHEMA_VERSION, &bytes)
    }

    /// Load a table object, validating its row type and schema version.
    pub fn get_table<T: TableRow>(&self, key: &str) -> Result<Option<Vec<T>>, StoreError> {
        let Some(meta) = self.meta(key)? else {
            return Ok(None);
        };
        check_content(key, &meta, T::ROW_TYPE, T::SCHEMA_VERSION)?;
        match self.get_bytes(key)? {
            Some(bytes) => table::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn put_json<T: Serialize>(&self, key: &str, content_type: &str, value: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value)?;
        self.put_object(key, content_type, 1, 0, &bytes)
    }

    pub fn get_json<T: DeserializeOwned>(
        &self,
        key: &str,
        content_type: &str,
    ) -> Result<Option<T>, StoreError> {
        let Some(meta) = self.meta(key)? else {
            return Ok(None);
        };
        check_content(key, &meta, content_type, 0)?;
        match self.get_bytes(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    // ── logs ─────────────────────────────────────────────────────────

    pub fn log_reset(&self, log: &str, maxsize: Option<u64>) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM logs WHERE log = ?1", params![log])?;
        self.log_configure(log, maxsize)
    }

    /// Set the bound of `log` without touching its entries.
    pub fn log_configure(&self, log: &str, maxsize: Option<u64>) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO log_meta (log, maxsize, next_seq) VALUES (?1, ?2, 0)
             ON CONFLICT(log) DO UPDATE SET maxsize = excluded.maxsize",
            params![log, maxsize.map(|m| m as i64)],
        )?;
        Ok(())
    }

    /// Append one value; a bounded log evicts its oldest entries first.
    pub fn log_append<T: Serialize>(&self, log: &str, value: &T) -> Result<(), StoreError> {
        let data = serde_json::to_string(value)?;
        self.conn.execute(
            "INSERT OR IGNORE INTO log_meta (log, maxsize, next_seq) VALUES (?1, NULL, 0)",
            params![log],
        )?;
        let (maxsize, seq): (Option<i64>, i64) = self.conn.query_row(
            "SELECT maxsize, next_seq FROM log_meta WHERE log = ?1",
            params![log],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        if let Some(maxsize) = maxsize {
            let len = self.log_len(log)? as i64;
            let excess = len - maxsize + 1;
            if excess > 0 {
                self.conn.execute(
                    "DELETE FROM logs WHERE log = ?1 AND seq IN
                     (SELECT seq FROM logs WHERE log = ?1 ORDER BY seq LIMIT ?2)",
                    params![log, excess],
                )?;
            }
        }
        self.conn.execute(
            "INSERT INTO logs (log, seq, data) VALUES (?1, ?2, ?3)",
            params![log, seq, data],
        )?;
        self.conn.execute(
            "UPDATE log_meta SET next_seq = ?2 WHERE log = ?1",
            params![log, seq + 1],
        )?;
        Ok(())
    }

    pub fn log_len(&self, log: &str) -> Result<u64, StoreError> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM logs WHERE log = ?1",
            params![log],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    /// Entry at position `index`, counted from the oldest retained entry.
    pub fn log_get<T: DeserializeOwned>(&self, log: &str, index: u64) -> Result<Option<T>, StoreError> {
        Ok(self.log_slice(log, index, index + 1)?.into_iter().next())
    }

    /// Entries in positions `start..end`.
    pub fn log_slice<T: DeserializeOwned>(
        &self,
        log: &str,
        start: u64,
        end: u64,
    ) -> Result<Vec<T>, StoreError> {
        if end <= start {
            return Ok(Vec::new());
        }
        let mut stmt = self
            .conn
            .prepare("SELECT data FROM logs WHERE log = ?1 ORDER BY seq LIMIT ?2 OFFSET ?3")?;
        let rows = stmt
            .query_map(params![log, (end - start) as i64, start as i64], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.iter()
            .map(|s| serde_json::from_str(s).map_err(StoreError::from))
            .collect()
    }

    pub fn log_clear(&self, log: &str) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM logs WHERE log = ?1", params![log])?;
        Ok(())
    }

    // ── dicts ────────────────────────────────────────────────────────

    pub fn dict_get<T: DeserializeOwned>(&self, dict: &str, key: &str) -> Result<Option<T>, StoreError> {
        let raw = self
            .conn
            .query_row(
                "SELECT value FROM dicts WHERE dict = ?1 AND key = ?2",
                params![dict, key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        raw.map(|s| serde_json::from_str(&s).map_err(StoreError::from))
            .transpose()
    }

    pub fn dict_set<T: Serialize>(&self, dict: &str, key: &str, value: &T) -> Result<(), StoreError> {
        let data = serde_json::to_string(value)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO dicts (dict, key, value) VALUES (?1, ?2, ?3)",
            params![dict, key, data],
        )?;
        Ok(())
    }

    pub fn dict_remove(&self, dict: &str, key: &str) -> Result<bool, StoreError> {
        let n = self.conn.execute(
            "DELETE FROM dicts WHERE dict = ?1 AND key = ?2",
            params![dict, key],
        )?;
        Ok(n > 0)
    }

    pub fn dict_items<T: DeserializeOwned>(&self, dict: &str) -> Result<Vec<(String, T)>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, value FROM dicts WHERE dict = ?1 ORDER BY key")?;
        let rows = stmt
            .query_map(params![dict], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(k, v)| Ok((k, serde_json::from_str(&v)?)))
            .collect()
    }

    pub fn dict_clear(&self, dict: &str) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM dicts WHERE dict = ?1", params![dict])?;
        Ok(())
    }
}

fn row_to_meta(row: &rusqlite::Row<'_>) -> rusqlite::Result<ObjectMeta> {
    let modified_ns: i64 = row.get(5)?;
    Ok(ObjectMeta {
        namespace: row.get(0)?,
        name: row.get(1)?,
        content_type: row.get(2)?,
        rows: row.get::<_, i64>(3)? as u64,
        schema_version: row.get(4)?,
        modified: DateTime::from_timestamp_nanos(modified_ns),
        size: row.get::<_, i64>(6)? as u64,
    })
}

fn check_content(key: &str, meta: &ObjectMeta, row_type: &str, version: u32) -> Result<(), StoreError> {
    if meta.content_type != row_type || meta.schema_version != version {
        return Err(StoreError::SchemaMismatch {
            key: key.to_string(),
            expected: format!("{row_type} v{version}"),
            found: format!("{} v{}", meta.content_type, meta.schema_version),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("store.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn split_and_join_keys() {
        assert_eq!(split_key("cache/daily/SPY"), ("cache/daily", "SPY"));
        assert_eq!(split_key("cache/market"), ("cache", "market"));
        assert_eq!(split_key("plain"), ("", "plain"));
        assert_eq!(join_key("cache/daily", "SPY"), "cache/daily/SPY");
    }

    #[test]
    fn objects_are_listed_per_namespace() {
        let (_dir, store) = temp_store();
        store.put_bytes("cache/daily/SPY", "raw", 1, b"a").unwrap();
        store.put_bytes("cache/daily/AAPL", "raw", 1, b"b").unwrap();
        store.put_bytes("cache/intraday/1/SPY", "raw", 1, b"c").unwrap();

        assert_eq!(store.list("cache/daily").unwrap(), vec!["AAPL", "SPY"]);
        assert!(store.exists("cache/intraday/1/SPY").unwrap());
        assert!(store.delete("cache/daily/SPY").unwrap());
        assert!(!store.exists("cache/daily/SPY").unwrap());
        assert!(!store.delete("cache/daily/SPY").unwrap());
    }

    #[test]
    fn meta_records_content() {
        let (_dir, store) = temp_store();
        store.put_bytes("blob/x", "raw", 3, b"abcd").unwrap();
        let meta = store.meta("blob/x").unwrap().unwrap();
        assert_eq!(meta.content_type, "raw");
        assert_eq!(meta.rows, 3);
        assert_eq!(meta.size, 4);
        assert_eq!(meta.key(), "blob/x");
    }

    #[test]
    fn json_content_type_is_checked() {
        let (_dir, store) = temp_store();
        store.put_json("t/a", "Thing", &json!({"x": 1})).unwrap();
        let back: Option<serde_json::Value> = store.get_json("t/a", "Thing").unwrap();
        assert_eq!(back.unwrap()["x"], 1);
        let wrong: Result<Option<serde_json::Value>, _> = store.get_json("t/a", "Other");
        assert!(matches!(wrong, Err(StoreError::SchemaMismatch { .. })));
    }

    #[test]
    fn bounded_log_evicts_oldest() {
        let (_dir, store) = temp_store();
        store.log_reset("l", Some(3)).unwrap();
        for i in 0..5 {
            store.log_append("l", &i).unwrap();
        }
        assert_eq!(store.log_len("l").unwrap(), 3);
        let all: Vec<i32> = store.log_slice("l", 0, 10).unwrap();
        assert_eq!(all, vec![2, 3, 4]);
        assert_eq!(store.log_get::<i32>("l", 0).unwrap(), Some(2));
    }

    #[test]
    fn unbounded_log_slices_and_clears() {
        let (_dir, store) = temp_store();
        for i in 0..4 {
            store.log_append("u", &i).unwrap();
        }
        let mid: Vec<i32> = store.log_slice("u", 1, 3).unwrap();
        assert_eq!(mid, vec![1, 2]);
        store.log_clear("u").unwrap();
        assert_eq!(store.log_len("u").unwrap(), 0);
    }

    #[test]
    fn wait_len_times_out() {
        let (_dir, store) = temp_store();
        store.log_append("w", &1).unwrap();
        assert_eq!(store.wait_len("w", 1, None).unwrap(), 1);
        let err = store.wait_len("w", 2, Some(Duration::from_millis(30)));
        assert!(matches!(err, Err(StoreError::WaitTimeout { .. })));
    }

    #[test]
    fn dict_roundtrip() {
        let (_dir, store) = temp_store();
        store.dict_set("d", "SPY", &json!({"bid": 1.0})).unwrap();
        store.dict_set("d", "AAPL", &json!({"bid": null})).unwrap();
        let items: Vec<(String, serde_json::Value)> = store.dict_items("d").unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].0, "AAPL");
        store.dict_clear("d").unwrap();
        assert!(store.dict_get::<serde_json::Value>("d", "SPY").unwrap().is_none());
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let (_dir, store) = temp_store();
        let result: Result<(), StoreError> = store.transaction(|tx| {
            tx.put_object("a/b", "raw", 1, 0, b"x")?;
            Err(StoreError::Encoding("boom".into()))
        });
        assert!(result.is_err());
        assert!(!store.exists("a/b").unwrap());
    }

    #[test]
    fn compact_keeps_data() {
        let (_dir, store) = temp_store();
        store.put_bytes("a/b", "raw", 1, b"x").unwrap();
        store.compact().unwrap();
        assert_eq!(store.get_bytes("a/b").unwrap().unwrap(), b"x");
        assert!(store.size_on_disk() > 0);
    }

    #[test]
    fn two_handles_share_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.db");
        let a = Store::open(&path).unwrap();
        let b = Store::open(&path).unwrap();
        a.log_append("shared", &"x").unwrap();
        assert_eq!(b.log_len("shared").unwrap(), 1);
    }
}
