//! SQLite-backed raw response cache
//!
//! Entries are addressed by the SHA-256 of `(source_id, query_key)` and carry
//! their own ttl. Expired entries are never deleted on read: `get` hands them
//! back tagged [`Freshness::Stale`] so the caller can fall back to them when a
//! live refetch fails.
//!
//! Writes are single-statement upserts, so an entry is always replaced whole.

use crate::models::RawResponse;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS raw_responses (
    cache_key TEXT PRIMARY KEY,
    source_id TEXT NOT NULL,
    query_key TEXT NOT NULL,
    payload TEXT NOT NULL,
    payload_sha256 TEXT NOT NULL,
    fetched_at_ms INTEGER NOT NULL,
    ttl_secs INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_raw_responses_source
    ON raw_responses(source_id, fetched_at_ms DESC);
"#;

/// Errors surfaced by the cache. Callers decide whether a missing or stale
/// entry is acceptable.
#[derive(Debug)]
pub enum CacheError {
    Sqlite(rusqlite::Error),
    Corrupt {
        source_id: String,
        query_key: String,
        reason: String,
    },
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(e) => write!(f, "cache storage error: {}", e),
            Self::Corrupt {
                source_id,
                query_key,
                reason,
            } => write!(
                f,
                "corrupt cache entry {}/{}: {}",
                source_id, query_key, reason
            ),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Sqlite(e) => Some(e),
            Self::Corrupt { .. } => None,
        }
    }
}

impl From<rusqlite::Error> for CacheError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite(e)
    }
}

/// Whether a looked-up entry is still inside its ttl.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale,
}

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLookup {
    pub response: RawResponse,
    pub freshness: Freshness,
}

impl CacheLookup {
    pub fn is_fresh(&self) -> bool {
        self.freshness == Freshness::Fresh
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub stale_entries: usize,
}

/// Content-addressed, time-boxed response cache.
///
/// Cloning is cheap; clones share the same connection.
#[derive(Clone)]
pub struct CacheStore {
    conn: Arc<Mutex<Connection>>,
}

impl CacheStore {
    /// Open (or create) a cache database on disk.
    pub fn open(db_path: &str) -> Result<Self, CacheError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // We handle our own locking

        let conn = Connection::open_with_flags(db_path, flags)?;
        let store = Self::init(conn)?;
        info!(path = db_path, "response cache opened");
        Ok(store)
    }

    /// Open a private in-memory cache (tests, one-shot runs).
    pub fn open_in_memory() -> Result<Self, CacheError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, CacheError> {
        conn.execute_batch(SCHEMA_SQL)?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if !matches!(journal_mode.to_lowercase().as_str(), "wal" | "memory") {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Look up an entry, tagging it fresh or stale relative to now.
    pub fn get(&self, source_id: &str, query_key: &str) -> Result<Option<CacheLookup>, CacheError> {
        self.get_at(source_id, query_key, Utc::now())
    }

    /// Look up an entry, tagging it fresh or stale relative to `now`.
    pub fn get_at(
        &self,
        source_id: &str,
        query_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheLookup>, CacheError> {
        let key = cache_key(source_id, query_key);
        let row = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare_cached(
                "SELECT payload, payload_sha256, fetched_at_ms, ttl_secs \
                 FROM raw_responses WHERE cache_key = ?1",
            )?;
            let row = stmt
                .query_row([&key], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })
                .optional()?;
            row
        };

        let Some((payload, digest, fetched_at_ms, ttl_secs)) = row else {
            return Ok(None);
        };

        let corrupt = |reason: String| CacheError::Corrupt {
            source_id: source_id.to_string(),
            query_key: query_key.to_string(),
            reason,
        };

        if payload_digest(&payload) != digest {
            return Err(corrupt("payload digest mismatch".to_string()));
        }
        let fetched_at = Utc
            .timestamp_millis_opt(fetched_at_ms)
            .single()
            .ok_or_else(|| corrupt(format!("invalid timestamp {}", fetched_at_ms)))?;
        let ttl_secs =
            u64::try_from(ttl_secs).map_err(|_| corrupt(format!("negative ttl {}", ttl_secs)))?;

        let response = RawResponse {
            source_id: source_id.to_string(),
            query_key: query_key.to_string(),
            fetched_at,
            payload,
            ttl_secs,
        };
        let freshness = if is_fresh_at(&response, now) {
            Freshness::Fresh
        } else {
            Freshness::Stale
        };
        debug!(
            source = source_id,
            query = query_key,
            ?freshness,
            "cache hit"
        );

        Ok(Some(CacheLookup {
            response,
            freshness,
        }))
    }

    /// Store a response fetched now, replacing any previous entry for the key.
    pub fn put(
        &self,
        source_id: &str,
        query_key: &str,
        payload: &str,
        ttl: Duration,
    ) -> Result<RawResponse, CacheError> {
        self.put_at(source_id, query_key, payload, ttl, Utc::now())
    }

    /// Store a response with an explicit fetch time.
    pub fn put_at(
        &self,
        source_id: &str,
        query_key: &str,
        payload: &str,
        ttl: Duration,
        fetched_at: DateTime<Utc>,
    ) -> Result<RawResponse, CacheError> {
        let key = cache_key(source_id, query_key);
        let digest = payload_digest(payload);
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO raw_responses \
             (cache_key, source_id, query_key, payload, payload_sha256, fetched_at_ms, ttl_secs) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT(cache_key) DO UPDATE SET \
             payload=excluded.payload, payload_sha256=excluded.payload_sha256, \
             fetched_at_ms=excluded.fetched_at_ms, ttl_secs=excluded.ttl_secs",
            params![
                key,
                source_id,
                query_key,
                payload,
                digest,
                fetched_at.timestamp_millis(),
                ttl_secs
            ],
        )?;

        Ok(RawResponse {
            source_id: source_id.to_string(),
            query_key: query_key.to_string(),
            fetched_at,
            payload: payload.to_string(),
            ttl_secs: ttl.as_secs(),
        })
    }

    /// Whether an entry is still inside its ttl.
    pub fn is_fresh(entry: &RawResponse) -> bool {
        is_fresh_at(entry, Utc::now())
    }

    /// Delete entries fetched before `cutoff`, whatever their ttl.
    pub fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, CacheError> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM raw_responses WHERE fetched_at_ms < ?1",
            params![cutoff.timestamp_millis()],
        )?;
        if removed > 0 {
            info!(removed, "purged old cache entries");
        }
        Ok(removed)
    }

    pub fn stats(&self) -> Result<CacheStats, CacheError> {
        self.stats_at(Utc::now())
    }

    pub fn stats_at(&self, now: DateTime<Utc>) -> Result<CacheStats, CacheError> {
        let conn = self.conn.lock();
        let (entries, stale): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), \
             COALESCE(SUM(CASE WHEN ?1 - fetched_at_ms > ttl_secs * 1000 THEN 1 ELSE 0 END), 0) \
             FROM raw_responses",
            params![now.timestamp_millis()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(CacheStats {
            entries: entries.max(0) as usize,
            stale_entries: stale.max(0) as usize,
        })
    }
}

/// An entry is stale once `now - fetched_at > ttl`.
pub fn is_fresh_at(entry: &RawResponse, now: DateTime<Utc>) -> bool {
    entry.age_at(now) <= entry.ttl()
}

fn cache_key(source_id: &str, query_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(query_key.as_bytes());
    hex::encode(hasher.finalize())
}

fn payload_digest(payload: &str) -> String {
    hex::encode(Sha256::digest(payload.as_bytes()))
}
