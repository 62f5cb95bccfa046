//! Persistent TTL store backed by a single SQLite file
//!
//! Each record is a JSON envelope holding the payload bytes and an absolute
//! expiry timestamp. Expired or unreadable records are treated as absent and
//! are purged lazily: every successful read sweeps the whole table.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Name of the single table used as the cache bucket
const CACHE_TABLE: &str = "image_cache";

/// How long a connection waits on a lock held by another process
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors that can occur while talking to the store
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store file could not be opened or initialized
    #[error("Failed to open store at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// The directory holding the store file could not be created
    #[error("Failed to create store directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TTL does not fit into a timestamp
    #[error("TTL out of range: {0:?}")]
    Ttl(Duration),

    /// Failed to encode a record
    #[error("Failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),

    /// A read or write against the database failed
    #[error("Store I/O failed: {0}")]
    Io(#[from] rusqlite::Error),

    /// The blocking task running a store call failed
    #[error("Store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Record envelope stored under each key
#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    /// The cached artifact
    payload: Vec<u8>,
    /// When the entry was written
    cached_at: DateTime<Utc>,
    /// When the entry stops being served
    expires_at: DateTime<Utc>,
}

impl CacheEntry {
    /// An entry is live only while its expiry is strictly in the future
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Handle to the persistent TTL store
///
/// Cloning the handle is cheap; all clones share one connection. SQLite's own
/// locking serializes writers across processes, and the connection mutex
/// serializes use of the connection inside this process.
#[derive(Debug, Clone)]
pub struct TtlStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl TtlStore {
    /// Opens the store at `path`, creating the file and the cache table if absent
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let open_err = |source| StoreError::Open {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(&path).map_err(open_err)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(open_err)?;
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {CACHE_TABLE} (
                    key TEXT PRIMARY KEY NOT NULL,
                    value BLOB NOT NULL
                )"
            ),
            [],
        )
        .map_err(open_err)?;

        debug!(path = %path.display(), "opened cache store");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// Returns the path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `payload` under `key`, replacing any previous value
    ///
    /// The entry expires `ttl` from now. A zero TTL produces an entry that is
    /// already expired.
    pub fn put(&self, key: &str, payload: &[u8], ttl: Duration) -> Result<(), StoreError> {
        let ttl_delta = chrono::Duration::from_std(ttl).map_err(|_| StoreError::Ttl(ttl))?;
        let now = Utc::now();
        let expires_at = now
            .checked_add_signed(ttl_delta)
            .ok_or(StoreError::Ttl(ttl))?;

        let entry = CacheEntry {
            payload: payload.to_vec(),
            cached_at: now,
            expires_at,
        };
        let encoded = serde_json::to_vec(&entry)?;

        self.put_raw(key, &encoded)
    }

    /// Writes an already encoded record
    fn put_raw(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT INTO {CACHE_TABLE} (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value"
            ),
            params![key, value],
        )?;
        Ok(())
    }

    /// Reads the payload stored under `key`
    ///
    /// Returns `None` when the key is missing, the record cannot be decoded,
    /// or the record has expired. A successful read sweeps expired records
    /// from the whole table before returning.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let raw = match self.get_raw(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(key, error = %e, "cache read failed");
                return None;
            }
        };

        let entry: CacheEntry = match serde_json::from_slice(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key, error = %e, "cache record is corrupt");
                return None;
            }
        };

        if !entry.is_live(Utc::now()) {
            debug!(key, expired_at = %entry.expires_at, "cache entry expired");
            return None;
        }

        if let Err(e) = self.sweep() {
            warn!(error = %e, "cache sweep failed");
        }

        Some(entry.payload)
    }

    /// Reads the raw record bytes for `key`
    fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                &format!("SELECT value FROM {CACHE_TABLE} WHERE key = ?1"),
                params![key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(raw)
    }

    /// Deletes the record under `key`, returning whether one existed
    pub fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            &format!("DELETE FROM {CACHE_TABLE} WHERE key = ?1"),
            params![key],
        )?;
        Ok(removed > 0)
    }

    /// Removes every record that is expired or cannot be decoded
    ///
    /// Walks the table in key order inside one write transaction and returns
    /// the number of purged records.
    pub fn sweep(&self) -> Result<usize, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now();

        let stale: Vec<String> = {
            let mut stmt =
                tx.prepare(&format!("SELECT key, value FROM {CACHE_TABLE} ORDER BY key"))?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?;

            let mut stale = Vec::new();
            for row in rows {
                let (key, value) = row?;
                let live = serde_json::from_slice::<CacheEntry>(&value)
                    .map(|entry| entry.is_live(now))
                    .unwrap_or(false);
                if !live {
                    stale.push(key);
                }
            }
            stale
        };

        {
            let mut delete = tx.prepare(&format!("DELETE FROM {CACHE_TABLE} WHERE key = ?1"))?;
            for key in &stale {
                delete.execute(params![key])?;
            }
        }
        tx.commit()?;

        if !stale.is_empty() {
            debug!(purged = stale.len(), "swept expired cache entries");
        }
        Ok(stale.len())
    }

    /// Runs [`get`](Self::get) on the blocking thread pool
    ///
    /// A failed task is logged and reads as absent, like any other read failure.
    pub async fn get_async(&self, key: &str) -> Option<Vec<u8>> {
        let store = self.clone();
        let owned_key = key.to_string();
        match tokio::task::spawn_blocking(move || store.get(&owned_key)).await {
            Ok(payload) => payload,
            Err(e) => {
                warn!(key, error = %e, "cache read task failed");
                None
            }
        }
    }

    /// Runs [`put`](Self::put) on the blocking thread pool
    pub async fn put_async(
        &self,
        key: &str,
        payload: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let store = self.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || store.put(&key, &payload, ttl)).await?
    }

    /// Lists every physically present key in key order, live or not
    pub fn keys(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT key FROM {CACHE_TABLE} ORDER BY key"))?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }
}
