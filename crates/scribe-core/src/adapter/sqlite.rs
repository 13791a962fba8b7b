//! SQLite-backed document store.
//!
//! Every collection lives in one `records` table keyed by
//! `(collection, record_key)`; the body is the JSON record. Upserts keep the
//! row's `seq`, so replaced records stay in their original position and
//! `select` order is insertion order.
//!
//! The message-store schema version lives in `PRAGMA user_version`, outside
//! the migrated collections. The `records` table itself is bootstrapped with
//! `IF NOT EXISTS` DDL and never versioned.
//!
//! Runtime pragmas match the rest of the workspace:
//! - `journal_mode = WAL` so readers are not blocked by the migration writer
//! - `busy_timeout = 5s` to ride out transient lock contention
//! - `synchronous = NORMAL`

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Context;
use rusqlite::{Connection, ErrorCode as SqliteCode, OptionalExtension, params};

use super::{
    Insert, QueryAdapter, Remove, Select, StorageError, Update, VersionStore, apply_set,
    record_key,
};
use crate::record::{EVENT_ID, Record};

/// Busy timeout used for store connections.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const BOOTSTRAP_SQL: &str = "
CREATE TABLE IF NOT EXISTS records (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    collection TEXT NOT NULL,
    record_key TEXT NOT NULL,
    body TEXT NOT NULL,
    UNIQUE (collection, record_key)
);

CREATE INDEX IF NOT EXISTS idx_records_collection_seq
    ON records (collection, seq);
";

/// Document store over a single SQLite connection.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
    migrating: AtomicBool,
}

impl SqliteStore {
    /// Open (or create) the store database, apply runtime pragmas, and
    /// bootstrap the `records` table.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created or the
    /// database cannot be opened or configured.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create store directory {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("open store database {}", path.display()))?;
        configure_connection(&conn).context("configure sqlite pragmas")?;
        conn.execute_batch(BOOTSTRAP_SQL)
            .context("bootstrap records table")?;

        Ok(Self {
            conn: Mutex::new(conn),
            migrating: AtomicBool::new(false),
        })
    }

    /// Open a private in-memory store.
    ///
    /// # Errors
    ///
    /// Returns an error if SQLite fails to create the bootstrap table.
    pub fn open_in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(BOOTSTRAP_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
            migrating: AtomicBool::new(false),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    /// Row count per non-empty collection.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the count query fails.
    pub fn collection_counts(&self) -> Result<BTreeMap<String, u64>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT collection, COUNT(*) FROM records GROUP BY collection ORDER BY collection",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let (collection, count) = row?;
            counts.insert(collection, u64::try_from(count).unwrap_or(0));
        }
        Ok(counts)
    }

    /// Append records without key checks or upsert semantics.
    ///
    /// Legacy rows without a key are stored under a synthetic
    /// `#seq-<n>` key so they stay selectable and removable by filter.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if an insert fails.
    pub fn seed(&self, collection: &str, records: Vec<Record>) -> Result<(), StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for record in records {
            let body = serde_json::to_string(&record)?;
            match record_key(collection, &record) {
                Ok(key) => {
                    tx.execute(
                        "INSERT INTO records (collection, record_key, body) VALUES (?1, ?2, ?3)",
                        params![collection, key, body],
                    )?;
                }
                Err(_) => {
                    tx.execute(
                        "INSERT INTO records (collection, record_key, body) \
                         VALUES (?1, '#seq-' || (SELECT COALESCE(MAX(seq), 0) + 1 FROM records), ?2)",
                        params![collection, body],
                    )?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }
}

fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    let _journal_mode: String =
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
    Ok(())
}

/// Matching rows as `(seq, record)` pairs in insertion order.
fn matching_rows(
    conn: &Connection,
    collection: &str,
    query: &super::Filter,
    limit: Option<usize>,
) -> Result<Vec<(i64, Record)>, StorageError> {
    let limit = limit.unwrap_or(usize::MAX);
    let mut out = Vec::new();
    if limit == 0 {
        return Ok(out);
    }

    let mut push = |seq: i64, body: &str| -> Result<bool, StorageError> {
        let record: Record = serde_json::from_str(body)?;
        if query.matches(&record) {
            out.push((seq, record));
        }
        Ok(out.len() < limit)
    };

    if let Some(key) = query.key_term() {
        let row: Option<(i64, String)> = conn
            .query_row(
                "SELECT seq, body FROM records WHERE collection = ?1 AND record_key = ?2",
                params![collection, key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if let Some((seq, body)) = row {
            push(seq, &body)?;
        }
    } else {
        let mut stmt = conn
            .prepare_cached("SELECT seq, body FROM records WHERE collection = ?1 ORDER BY seq")?;
        let mut rows = stmt.query(params![collection])?;
        while let Some(row) = rows.next()? {
            let seq: i64 = row.get(0)?;
            let body: String = row.get(1)?;
            if !push(seq, &body)? {
                break;
            }
        }
    }

    Ok(out)
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(inner, _) if inner.code == SqliteCode::ConstraintViolation)
}

impl QueryAdapter for SqliteStore {
    fn select(&self, query: &Select<'_>) -> Result<Vec<Record>, StorageError> {
        let conn = self.lock()?;
        Ok(matching_rows(&conn, query.from, &query.filter, query.limit)?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }

    fn insert(&self, query: Insert<'_>) -> Result<(), StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let sql = if query.upsert {
            "INSERT INTO records (collection, record_key, body) VALUES (?1, ?2, ?3) \
             ON CONFLICT (collection, record_key) DO UPDATE SET body = excluded.body"
        } else {
            "INSERT INTO records (collection, record_key, body) VALUES (?1, ?2, ?3)"
        };

        for value in &query.values {
            let key = record_key(query.into, value)?;
            let body = serde_json::to_string(value)?;
            tx.execute(sql, params![query.into, key, body])
                .map_err(|err| {
                    if is_constraint_violation(&err) {
                        StorageError::DuplicateKey {
                            collection: query.into.to_owned(),
                            key: key.to_owned(),
                        }
                    } else {
                        StorageError::Sqlite(err)
                    }
                })?;
        }

        tx.commit()?;
        Ok(())
    }

    fn update(&self, query: &Update<'_>) -> Result<usize, StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let rekey = query.set.contains_key(EVENT_ID);
        let rows = matching_rows(&tx, query.collection, &query.filter, None)?;
        for (seq, mut record) in rows.iter().cloned() {
            apply_set(&mut record, &query.set);
            let body = serde_json::to_string(&record)?;
            if rekey {
                let key = record_key(query.collection, &record)?;
                tx.execute(
                    "UPDATE records SET record_key = ?1, body = ?2 WHERE seq = ?3",
                    params![key, body, seq],
                )?;
            } else {
                tx.execute(
                    "UPDATE records SET body = ?1 WHERE seq = ?2",
                    params![body, seq],
                )?;
            }
        }

        tx.commit()?;
        Ok(rows.len())
    }

    fn remove(&self, query: &Remove<'_>) -> Result<usize, StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let rows = matching_rows(&tx, query.from, &query.filter, None)?;
        for (seq, _) in &rows {
            tx.execute("DELETE FROM records WHERE seq = ?1", params![seq])?;
        }

        tx.commit()?;
        Ok(rows.len())
    }
}

impl VersionStore for SqliteStore {
    fn read_version(&self) -> Result<Option<u32>, StorageError> {
        let conn = self.lock()?;
        let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        if version == 0 {
            return Ok(None);
        }
        u32::try_from(version)
            .map(Some)
            .map_err(|_| StorageError::VersionOutOfRange(version))
    }

    /// `user_version` is a signed 32-bit integer; larger versions are
    /// rejected instead of wrapping.
    fn write_version(&self, version: u32) -> Result<(), StorageError> {
        let stored =
            i32::try_from(version).map_err(|_| StorageError::VersionOutOfRange(i64::from(version)))?;
        let conn = self.lock()?;
        conn.pragma_update(None, "user_version", stored)?;
        Ok(())
    }

    fn migration_flag(&self) -> &AtomicBool {
        &self.migrating
    }
}
