//! Expiring key-value transients
//!
//! Two backings: an in-process map and a SQLite table. Both are
//! opportunistic: a failed read is a miss and a failed write is logged.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of the current unix time, in seconds
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

pub trait TransientCache<V> {
    fn get(&self, key: &str) -> Option<V>;
    fn set(&self, key: &str, value: V, ttl: Duration);
    fn delete(&self, key: &str);
}

struct Entry<V> {
    value: V,
    expires_at: u64,
}

/// In-memory transients
pub struct MemoryCache<V> {
    entries: Mutex<HashMap<String, Entry<V>>>,
    clock: Arc<dyn Clock>,
}

impl<V: Clone> MemoryCache<V> {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone> Default for MemoryCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone> TransientCache<V> for MemoryCache<V> {
    fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().ok()?;
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn set(&self, key: &str, value: V, ttl: Duration) {
        let expires_at = self.clock.now().saturating_add(ttl.as_secs());
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.to_string(), Entry { value, expires_at });
        }
    }

    fn delete(&self, key: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(key);
        }
    }
}

/// Transients persisted in a SQLite table as JSON
pub struct SqliteTransientStore<V> {
    conn: Connection,
    clock: Arc<dyn Clock>,
    _value: PhantomData<fn() -> V>,
}

impl<V> SqliteTransientStore<V> {
    /// Open (or create) the transients table in the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open transients DB at {:?}", path))?;
        Self::from_connection(conn, Arc::new(SystemClock))
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory DB")?;
        Self::from_connection(conn, Arc::new(SystemClock))
    }

    pub fn from_connection(conn: Connection, clock: Arc<dyn Clock>) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS transients (
                name       TEXT PRIMARY KEY,
                value      TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );",
        )
        .context("Failed to create transients table")?;
        Ok(Self {
            conn,
            clock,
            _value: PhantomData,
        })
    }

    /// Remove every expired transient, returning how many were dropped.
    pub fn purge_expired(&self) -> Result<usize> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM transients WHERE expires_at <= ?1",
                params![self.now_secs()],
            )
            .context("Failed to purge expired transients")?;
        Ok(removed)
    }

    fn now_secs(&self) -> i64 {
        i64::try_from(self.clock.now()).unwrap_or(i64::MAX)
    }

    fn read_raw(&self, key: &str) -> Result<Option<String>> {
        let raw = self
            .conn
            .query_row(
                "SELECT value FROM transients WHERE name = ?1 AND expires_at > ?2",
                params![key, self.now_secs()],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(raw)
    }
}

impl<V: Serialize + DeserializeOwned> TransientCache<V> for SqliteTransientStore<V> {
    fn get(&self, key: &str) -> Option<V> {
        let raw = match self.read_raw(key) {
            Ok(raw) => raw?,
            Err(e) => {
                tracing::warn!("Transient read failed for {}: {}", key, e);
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!("Discarding undecodable transient {}: {}", key, e);
                None
            }
        }
    }

    fn set(&self, key: &str, value: V, ttl: Duration) {
        let raw = match serde_json::to_string(&value) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("Failed to encode transient {}: {}", key, e);
                return;
            }
        };
        let expires_at = i64::try_from(self.clock.now().saturating_add(ttl.as_secs()))
            .unwrap_or(i64::MAX);
        if let Err(e) = self.conn.execute(
            "INSERT OR REPLACE INTO transients (name, value, expires_at) VALUES (?1, ?2, ?3)",
            params![key, raw, expires_at],
        ) {
            tracing::warn!("Failed to store transient {}: {}", key, e);
        }
    }

    fn delete(&self, key: &str) {
        if let Err(e) = self
            .conn
            .execute("DELETE FROM transients WHERE name = ?1", params![key])
        {
            tracing::warn!("Failed to delete transient {}: {}", key, e);
        }
    }
}

/// Clock that only moves when told to
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct ManualClock(std::sync::atomic::AtomicU64);

#[cfg(test)]
impl ManualClock {
    pub(crate) fn at(secs: u64) -> Self {
        Self(std::sync::atomic::AtomicU64::new(secs))
    }

    pub(crate) fn advance(&self, secs: u64) {
        self.0.fetch_add(secs, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}
