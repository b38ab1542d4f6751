use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

use labnav_core::{Fingerprint, LabnavError, Result};

use crate::cache::CacheRecord;
use crate::retrieval::SourceRef;

/// Row store behind [`crate::ResponseCache`]. Every method is atomic per
/// record: a concurrent reader sees either the old or the new record, never a
/// mix of both.
pub trait CacheStore: Send + Sync {
    fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CacheRecord>>;

    /// Inserts or fully replaces the record for its fingerprint.
    fn put(&self, record: CacheRecord) -> Result<()>;

    /// Increments `hit_count`, stamps `last_accessed_at` and returns the
    /// updated record in one step.
    fn touch(&self, fingerprint: &Fingerprint, now: DateTime<Utc>) -> Result<Option<CacheRecord>>;

    fn delete(&self, fingerprint: &Fingerprint) -> Result<bool>;

    fn count(&self) -> Result<usize>;

    fn clear(&self) -> Result<usize>;

    /// Snapshot of every readable record.
    fn records(&self) -> Result<Vec<CacheRecord>>;
}

#[derive(Default)]
pub struct MemoryCacheStore {
    records: RwLock<HashMap<Fingerprint, Arc<Mutex<CacheRecord>>>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, fingerprint: &Fingerprint) -> Option<Arc<Mutex<CacheRecord>>> {
        self.records.read().get(fingerprint).cloned()
    }
}

impl CacheStore for MemoryCacheStore {
    fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CacheRecord>> {
        Ok(self.slot(fingerprint).map(|slot| slot.lock().clone()))
    }

    fn put(&self, record: CacheRecord) -> Result<()> {
        record.validate()?;
        let fingerprint = record.fingerprint;
        self.records
            .write()
            .insert(fingerprint, Arc::new(Mutex::new(record)));
        Ok(())
    }

    fn touch(&self, fingerprint: &Fingerprint, now: DateTime<Utc>) -> Result<Option<CacheRecord>> {
        // the map lock is released before the per-record lock is taken
        let Some(slot) = self.slot(fingerprint) else {
            return Ok(None);
        };
        let mut record = slot.lock();
        record.hit_count += 1;
        record.last_accessed_at = record.last_accessed_at.max(now);
        Ok(Some(record.clone()))
    }

    fn delete(&self, fingerprint: &Fingerprint) -> Result<bool> {
        Ok(self.records.write().remove(fingerprint).is_some())
    }

    fn count(&self) -> Result<usize> {
        Ok(self.records.read().len())
    }

    fn clear(&self) -> Result<usize> {
        let mut records = self.records.write();
        let removed = records.len();
        records.clear();
        Ok(removed)
    }

    fn records(&self) -> Result<Vec<CacheRecord>> {
        let slots: Vec<_> = self.records.read().values().cloned().collect();
        Ok(slots.iter().map(|slot| slot.lock().clone()).collect())
    }
}

const RECORD_COLUMNS: &str = "fingerprint, query_text, answer_text, sources, confidence_score, doc_type_filter, hit_count, created_at, last_accessed_at";

/// SQLite-backed store. Unreadable rows are deleted when encountered and
/// reported as [`LabnavError::CacheCorruption`].
#[derive(Clone)]
pub struct SqliteCacheStore {
    path: PathBuf,
}

impl SqliteCacheStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
        };
        store.init()?;
        Ok(store)
    }

    fn connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path).map_err(LabnavError::storage)?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(LabnavError::storage)?;
        Ok(conn)
    }

    fn init(&self) -> Result<()> {
        let conn = self.connection()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS cache_records (
                fingerprint TEXT PRIMARY KEY,
                query_text TEXT NOT NULL,
                answer_text TEXT NOT NULL,
                sources TEXT NOT NULL,
                confidence_score REAL NOT NULL,
                doc_type_filter TEXT,
                hit_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                last_accessed_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_cache_hits ON cache_records(hit_count);
            "#,
        )
        .map_err(LabnavError::storage)?;
        Ok(())
    }

    /// Decodes a raw row; a failure deletes the row and yields a corruption error.
    fn decode(&self, conn: &Connection, raw: RawRecord) -> Result<CacheRecord> {
        let key = raw.fingerprint.clone();
        match raw.into_record() {
            Ok(record) => Ok(record),
            Err(reason) => {
                error!(fingerprint = %key, %reason, "evicting corrupt cache record");
                conn.execute(
                    "DELETE FROM cache_records WHERE fingerprint = ?1",
                    params![key],
                )
                .map_err(LabnavError::storage)?;
                Err(LabnavError::CacheCorruption {
                    fingerprint: key,
                    reason,
                })
            }
        }
    }
}

impl CacheStore for SqliteCacheStore {
    fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CacheRecord>> {
        let conn = self.connection()?;
        let raw = conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM cache_records WHERE fingerprint = ?1"),
                params![fingerprint.to_hex()],
                RawRecord::from_row,
            )
            .optional()
            .map_err(LabnavError::storage)?;
        raw.map(|raw| self.decode(&conn, raw)).transpose()
    }

    fn put(&self, record: CacheRecord) -> Result<()> {
        record.validate()?;
        let sources = serde_json::to_string(&record.sources)?;
        let conn = self.connection()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO cache_records ({RECORD_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            ),
            params![
                record.fingerprint.to_hex(),
                record.query_text,
                record.answer_text,
                sources,
                record.confidence_score as f64,
                record.doc_type_filter,
                record.hit_count as i64,
                record.created_at.to_rfc3339(),
                record.last_accessed_at.to_rfc3339()
            ],
        )
        .map_err(LabnavError::storage)?;
        Ok(())
    }

    fn touch(&self, fingerprint: &Fingerprint, now: DateTime<Utc>) -> Result<Option<CacheRecord>> {
        let conn = self.connection()?;
        let raw = conn
            .query_row(
                &format!(
                    "UPDATE cache_records SET hit_count = hit_count + 1, last_accessed_at = ?2 WHERE fingerprint = ?1 RETURNING {RECORD_COLUMNS}"
                ),
                params![fingerprint.to_hex(), now.to_rfc3339()],
                RawRecord::from_row,
            )
            .optional()
            .map_err(LabnavError::storage)?;
        raw.map(|raw| self.decode(&conn, raw)).transpose()
    }

    fn delete(&self, fingerprint: &Fingerprint) -> Result<bool> {
        let conn = self.connection()?;
        let removed = conn
            .execute(
                "DELETE FROM cache_records WHERE fingerprint = ?1",
                params![fingerprint.to_hex()],
            )
            .map_err(LabnavError::storage)?;
        Ok(removed > 0)
    }

    fn count(&self) -> Result<usize> {
        let conn = self.connection()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM cache_records", [], |row| row.get(0))
            .map_err(LabnavError::storage)?;
        Ok(count as usize)
    }

    fn clear(&self) -> Result<usize> {
        let conn = self.connection()?;
        let removed = conn
            .execute("DELETE FROM cache_records", [])
            .map_err(LabnavError::storage)?;
        Ok(removed)
    }

    fn records(&self) -> Result<Vec<CacheRecord>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {RECORD_COLUMNS} FROM cache_records"))
            .map_err(LabnavError::storage)?;
        let raws = stmt
            .query_map([], RawRecord::from_row)
            .map_err(LabnavError::storage)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(LabnavError::storage)?;
        let mut out = Vec::with_capacity(raws.len());
        for raw in raws {
            match self.decode(&conn, raw) {
                Ok(record) => out.push(record),
                Err(LabnavError::CacheCorruption { .. }) => continue,
                Err(other) => return Err(other),
            }
        }
        Ok(out)
    }
}

/// Column values as stored, before validation.
struct RawRecord {
    fingerprint: String,
    query_text: String,
    answer_text: String,
    sources: String,
    confidence_score: f64,
    doc_type_filter: Option<String>,
    hit_count: i64,
    created_at: String,
    last_accessed_at: String,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            fingerprint: row.get(0)?,
            query_text: row.get(1)?,
            answer_text: row.get(2)?,
            sources: row.get(3)?,
            confidence_score: row.get(4)?,
            doc_type_filter: row.get(5)?,
            hit_count: row.get(6)?,
            created_at: row.get(7)?,
            last_accessed_at: row.get(8)?,
        })
    }

    fn into_record(self) -> std::result::Result<CacheRecord, String> {
        let fingerprint: Fingerprint = self.fingerprint.parse().map_err(|e| format!("{e}"))?;
        let sources: Vec<SourceRef> =
            serde_json::from_str(&self.sources).map_err(|e| format!("sources: {e}"))?;
        let hit_count =
            u64::try_from(self.hit_count).map_err(|_| format!("hit_count {}", self.hit_count))?;
        let record = CacheRecord {
            fingerprint,
            query_text: self.query_text,
            answer_text: self.answer_text,
            sources,
            confidence_score: self.confidence_score as f32,
            doc_type_filter: self.doc_type_filter,
            hit_count,
            created_at: parse_timestamp(&self.created_at)?,
            last_accessed_at: parse_timestamp(&self.last_accessed_at)?,
        };
        record.validate().map_err(|e| e.to_string())?;
        Ok(record)
    }
}

fn parse_timestamp(raw: &str) -> std::result::Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| format!("timestamp {raw}: {e}"))
}
