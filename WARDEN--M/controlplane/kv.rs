//! Atomic key-value capability shared by the idempotency store and the lease lock.
//!
//! Any backend offering compare-and-swap with expiry can implement [`KvStore`].
//! [`SqliteKvStore`] is shared by every process opening the same file;
//! [`MemoryKvStore`] is the single-process variant used by tests.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

/// Failures surfaced by a key-value backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Backend could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Stored value could not be decoded.
    #[error("stored value for `{key}` is corrupt: {reason}")]
    Corrupt {
        /// Key that failed to decode.
        key: String,
        /// Decoder message.
        reason: String,
    },
}

/// Key-value operations the control plane relies on. Each call is atomic.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Stores `value` only if `key` is absent or expired. Returns whether it was stored.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, StoreError>;
    /// Unconditionally stores `value`.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;
    /// Reads a live value.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    /// Deletes `key`. Returns whether a live value was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
    /// Deletes `key` only while it still holds `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError>;
    /// Resets the expiry of `key` only while it still holds `expected`.
    async fn expire_if_equals(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;
}

#[derive(Debug, Clone)]
struct Slot {
    value: String,
    expires_at: Option<Instant>,
}

impl Slot {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |deadline| deadline > now)
    }
}

/// In-process store. Expired keys are hidden on read and dropped on every write.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    slots: Mutex<HashMap<String, Slot>>,
}

impl MemoryKvStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.slots.lock().values().filter(|slot| slot.live(now)).count()
    }

    /// Whether no live keys remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn purge(slots: &mut HashMap<String, Slot>, now: Instant) {
        slots.retain(|_, slot| slot.live(now));
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut slots = self.slots.lock();
        Self::purge(&mut slots, now);
        if slots.contains_key(key) {
            return Ok(false);
        }
        slots.insert(
            key.to_string(),
            Slot {
                value: value.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let now = Instant::now();
        let expires_at = ttl.map(|ttl| now + ttl);
        let mut slots = self.slots.lock();
        Self::purge(&mut slots, now);
        slots.insert(
            key.to_string(),
            Slot {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        Ok(self
            .slots
            .lock()
            .get(key)
            .filter(|slot| slot.live(now))
            .map(|slot| slot.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        Ok(self
            .slots
            .lock()
            .remove(key)
            .is_some_and(|slot| slot.live(now)))
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut slots = self.slots.lock();
        let matches = slots
            .get(key)
            .is_some_and(|slot| slot.live(now) && slot.value == expected);
        if matches {
            slots.remove(key);
        }
        Ok(matches)
    }

    async fn expire_if_equals(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut slots = self.slots.lock();
        match slots.get_mut(key) {
            Some(slot) if slot.live(now) && slot.value == expected => {
                slot.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    expires_at INTEGER
);
CREATE INDEX IF NOT EXISTS kv_expires_at ON kv (expires_at);
";

/// Row is live when it has no deadline or the deadline is after `:now`.
const LIVE: &str = "(expires_at IS NULL OR expires_at > :now)";

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn deadline(now: i64, ttl: Duration) -> i64 {
    now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

fn unavailable(err: impl std::fmt::Display) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

/// SQLite-backed store. Claims and leases survive restarts and are visible to every
/// process that opens the same database file.
///
/// Expiry uses wall-clock milliseconds so deadlines stay meaningful across processes.
#[derive(Clone)]
pub struct SqliteKvStore {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteKvStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteKvStore {
    /// Opens or creates the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(unavailable)?;
        }
        let conn = Connection::open(&path).map_err(unavailable)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(unavailable)?;
        conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))
            .map_err(unavailable)?;
        conn.execute_batch(SCHEMA).map_err(unavailable)?;
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of rows, expired ones included until the next write removes them.
    pub async fn row_count(&self) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM kv", [], |row| row.get::<_, i64>(0))
                .map(|count| usize::try_from(count).unwrap_or(0))
        })
        .await
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || op(&conn.lock()))
            .await
            .map_err(unavailable)?
            .map_err(unavailable)
    }
}

fn purge_rows(conn: &Connection, now: i64) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
        params![now],
    )
}

#[async_trait]
impl KvStore for SqliteKvStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let (key, value) = (key.to_string(), value.to_string());
        self.with_conn(move |conn| {
            let now = now_millis();
            purge_rows(conn, now)?;
            let inserted = conn.execute(
                "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO NOTHING",
                params![key, value, deadline(now, ttl)],
            )?;
            Ok(inserted == 1)
        })
        .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let (key, value) = (key.to_string(), value.to_string());
        self.with_conn(move |conn| {
            let now = now_millis();
            purge_rows(conn, now)?;
            conn.execute(
                "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
                params![key, value, ttl.map(|ttl| deadline(now, ttl))],
            )?;
            Ok(())
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT value FROM kv WHERE key = :key AND {LIVE}"),
                rusqlite::named_params! { ":key": key, ":now": now_millis() },
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let removed = conn.execute(
                &format!("DELETE FROM kv WHERE key = :key AND {LIVE}"),
                rusqlite::named_params! { ":key": key, ":now": now_millis() },
            )?;
            Ok(removed > 0)
        })
        .await
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let (key, expected) = (key.to_string(), expected.to_string());
        self.with_conn(move |conn| {
            let removed = conn.execute(
                &format!("DELETE FROM kv WHERE key = :key AND value = :value AND {LIVE}"),
                rusqlite::named_params! { ":key": key, ":value": expected, ":now": now_millis() },
            )?;
            Ok(removed > 0)
        })
        .await
    }

    async fn expire_if_equals(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let (key, expected) = (key.to_string(), expected.to_string());
        self.with_conn(move |conn| {
            let now = now_millis();
            let updated = conn.execute(
                &format!(
                    "UPDATE kv SET expires_at = :deadline WHERE key = :key AND value = :value AND {LIVE}"
                ),
                rusqlite::named_params! {
                    ":deadline": deadline(now, ttl),
                    ":key": key,
                    ":value": expected,
                    ":now": now,
                },
            )?;
            Ok(updated > 0)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_if_absent_claims_once() {
        let store = MemoryKvStore::new();
        let ttl = Duration::from_secs(60);
        assert!(store.set_if_absent("k", "a", ttl).await.unwrap());
        assert!(!store.set_if_absent("k", "b", ttl).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn expired_keys_can_be_reclaimed() {
        let store = MemoryKvStore::new();
        assert!(store
            .set_if_absent("k", "a", Duration::from_millis(20))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store
            .set_if_absent("k", "b", Duration::from_secs(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn conditional_delete_and_expire_check_the_value() {
        let store = MemoryKvStore::new();
        store.set("k", "owner", None).await.unwrap();
        assert!(!store.delete_if_equals("k", "intruder").await.unwrap());
        assert!(!store
            .expire_if_equals("k", "intruder", Duration::from_secs(1))
            .await
            .unwrap());
        assert!(store
            .expire_if_equals("k", "owner", Duration::from_secs(1))
            .await
            .unwrap());
        assert!(store.delete_if_equals("k", "owner").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn writes_drop_expired_keys() {
        let store = MemoryKvStore::new();
        for n in 0..10 {
            store
                .set_if_absent(&format!("idempotent:{n}"), "1", Duration::from_millis(20))
                .await
                .unwrap();
        }
        store
            .set("result:0", "{}", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert_eq!(store.slots.lock().len(), 11);

        tokio::time::sleep(Duration::from_millis(40)).await;
        store
            .set_if_absent("idempotent:fresh", "1", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.slots.lock().len(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn sqlite_claims_are_shared_between_handles() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state").join("warden.db");
        let ttl = Duration::from_secs(60);

        let first = SqliteKvStore::open(&path).unwrap();
        assert!(first.set_if_absent("idempotent:abc", "1", ttl).await.unwrap());
        drop(first);

        let reopened = SqliteKvStore::open(&path).unwrap();
        let other = SqliteKvStore::open(&path).unwrap();
        assert!(!reopened.set_if_absent("idempotent:abc", "1", ttl).await.unwrap());
        assert!(!other.set_if_absent("idempotent:abc", "1", ttl).await.unwrap());
        assert_eq!(other.get("idempotent:abc").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn sqlite_expired_rows_are_reclaimed_and_purged() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SqliteKvStore::open(tmp.path().join("warden.db")).unwrap();
        assert!(store
            .set_if_absent("k", "a", Duration::from_millis(20))
            .await
            .unwrap());
        store
            .set("result:k", "{}", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        store.set("pinned", "x", None).await.unwrap();
        assert_eq!(store.row_count().await.unwrap(), 3);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store
            .set_if_absent("k", "b", Duration::from_secs(1))
            .await
            .unwrap());
        assert_eq!(store.row_count().await.unwrap(), 2);
        assert_eq!(store.get("pinned").await.unwrap().as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn sqlite_conditional_ops_check_the_value() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SqliteKvStore::open(tmp.path().join("warden.db")).unwrap();
        store.set("lease", "owner", Some(Duration::from_secs(5))).await.unwrap();
        assert!(!store.delete_if_equals("lease", "intruder").await.unwrap());
        assert!(!store
            .expire_if_equals("lease", "intruder", Duration::from_secs(1))
            .await
            .unwrap());
        assert!(store
            .expire_if_equals("lease", "owner", Duration::from_secs(30))
            .await
            .unwrap());
        assert!(store.delete_if_equals("lease", "owner").await.unwrap());
        assert!(!store.delete("lease").await.unwrap());
    }
}
