use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info};

use labnav_core::{Fingerprint, LabnavError, Result};

use crate::cache_store::{CacheStore, MemoryCacheStore, SqliteCacheStore};
use crate::retrieval::SourceRef;

pub const DEFAULT_ADMISSION_THRESHOLD: f32 = 0.45;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    #[default]
    Memory,
    Sqlite,
}

impl FromStr for CacheBackendKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "memory" => Ok(CacheBackendKind::Memory),
            "sqlite" => Ok(CacheBackendKind::Sqlite),
            other => Err(anyhow::anyhow!("unknown cache backend {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub backend: CacheBackendKind,
    pub admission_threshold: f32,
    /// SQLite file for the sqlite backend; falls back to the passage store.
    pub path: Option<String>,
    pub stats_top_n: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackendKind::Memory,
            admission_threshold: DEFAULT_ADMISSION_THRESHOLD,
            path: None,
            stats_top_n: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRecord {
    pub fingerprint: Fingerprint,
    pub query_text: String,
    pub answer_text: String,
    pub sources: Vec<SourceRef>,
    pub confidence_score: f32,
    pub doc_type_filter: Option<String>,
    pub hit_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

impl CacheRecord {
    pub fn validate(&self) -> Result<()> {
        let reason = if !self.confidence_score.is_finite()
            || !(0.0..=1.0).contains(&self.confidence_score)
        {
            Some(format!("confidence {} outside [0, 1]", self.confidence_score))
        } else if self.answer_text.trim().is_empty() {
            Some("empty answer".to_string())
        } else {
            None
        };
        match reason {
            Some(reason) => Err(LabnavError::CacheCorruption {
                fingerprint: self.fingerprint.to_hex(),
                reason,
            }),
            None => Ok(()),
        }
    }
}

/// Everything needed to admit one answer.
#[derive(Debug, Clone)]
pub struct CacheAdmission {
    pub fingerprint: Fingerprint,
    pub query_text: String,
    pub answer_text: String,
    pub sources: Vec<SourceRef>,
    pub confidence_score: f32,
    pub doc_type_filter: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Hit(CacheRecord),
    Miss,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    Admitted,
    Rejected { confidence: f32, threshold: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eviction {
    Deleted,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopRecord {
    pub fingerprint: Fingerprint,
    pub query_text: String,
    pub hit_count: u64,
    pub confidence_score: f32,
    pub doc_type_filter: Option<String>,
    pub last_accessed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocTypeCount {
    pub doc_type: Option<String>,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub size: usize,
    pub average_confidence: f64,
    pub total_hits: u64,
    pub average_hits: f64,
    pub top_records_by_hits: Vec<TopRecord>,
    pub distribution_by_doc_type: Vec<DocTypeCount>,
}

/// Confidence-gated answer cache. Records are never expired implicitly;
/// they leave only through [`ResponseCache::evict`] or [`ResponseCache::clear`].
#[derive(Clone)]
pub struct ResponseCache {
    store: Arc<dyn CacheStore>,
    admission_threshold: f32,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn CacheStore>, admission_threshold: f32) -> Self {
        Self {
            store,
            admission_threshold,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCacheStore::new()), DEFAULT_ADMISSION_THRESHOLD)
    }

    pub fn from_config(config: &CacheConfig, default_path: &str) -> anyhow::Result<Self> {
        let store: Arc<dyn CacheStore> = match config.backend {
            CacheBackendKind::Memory => Arc::new(MemoryCacheStore::new()),
            CacheBackendKind::Sqlite => Arc::new(SqliteCacheStore::open(
                config.path.as_deref().unwrap_or(default_path),
            )?),
        };
        info!(
            backend = ?config.backend,
            threshold = config.admission_threshold,
            "response cache ready"
        );
        Ok(Self::new(store, config.admission_threshold))
    }

    pub fn admission_threshold(&self) -> f32 {
        self.admission_threshold
    }

    /// A hit increments the record's hit count and access time before it is
    /// returned. Corrupt records are evicted and reported as a miss.
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Result<CacheLookup> {
        match self.store.touch(fingerprint, Utc::now()) {
            Ok(Some(record)) => {
                debug!(%fingerprint, hits = record.hit_count, "cache hit");
                Ok(CacheLookup::Hit(record))
            }
            Ok(None) => Ok(CacheLookup::Miss),
            Err(LabnavError::CacheCorruption { fingerprint, reason }) => {
                error!(%fingerprint, %reason, "corrupt cache record treated as miss");
                Ok(CacheLookup::Miss)
            }
            Err(other) => Err(other),
        }
    }

    /// Stores the answer when `confidence_score >= threshold`, replacing any
    /// previous record for the fingerprint with a fresh one (`hit_count = 0`).
    pub fn admit(&self, admission: CacheAdmission) -> Result<Admission> {
        let confidence = admission.confidence_score;
        if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
            return Err(LabnavError::validation(format!(
                "confidence score {confidence} outside [0, 1]"
            )));
        }
        if confidence < self.admission_threshold {
            debug!(
                fingerprint = %admission.fingerprint,
                confidence,
                threshold = self.admission_threshold,
                "cache admission rejected"
            );
            return Ok(Admission::Rejected {
                confidence,
                threshold: self.admission_threshold,
            });
        }
        let now = Utc::now();
        let record = CacheRecord {
            fingerprint: admission.fingerprint,
            query_text: admission.query_text,
            answer_text: admission.answer_text,
            sources: admission.sources,
            confidence_score: confidence,
            doc_type_filter: admission.doc_type_filter,
            hit_count: 0,
            created_at: now,
            last_accessed_at: now,
        };
        self.store.put(record)?;
        debug!(fingerprint = %admission.fingerprint, confidence, "cache admission accepted");
        Ok(Admission::Admitted)
    }

    pub fn evict(&self, fingerprint: &Fingerprint) -> Result<Eviction> {
        if self.store.delete(fingerprint)? {
            info!(%fingerprint, "cache record evicted");
            Ok(Eviction::Deleted)
        } else {
            Ok(Eviction::NotFound)
        }
    }

    pub fn clear(&self) -> Result<usize> {
        let removed = self.store.clear()?;
        info!(removed, "cache cleared");
        Ok(removed)
    }

    pub fn len(&self) -> Result<usize> {
        self.store.count()
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Aggregates over the current record set. An empty cache reports zeros.
    pub fn stats(&self, top_n: usize) -> Result<CacheStats> {
        let records = self.store.records()?;
        let size = records.len();
        let total_hits: u64 = records.iter().map(|r| r.hit_count).sum();
        let (average_confidence, average_hits) = if size == 0 {
            (0.0, 0.0)
        } else {
            let confidence_sum: f64 = records.iter().map(|r| r.confidence_score as f64).sum();
            (
                confidence_sum / size as f64,
                total_hits as f64 / size as f64,
            )
        };

        let mut by_doc_type: HashMap<Option<String>, usize> = HashMap::new();
        for record in &records {
            *by_doc_type
                .entry(record.doc_type_filter.clone())
                .or_default() += 1;
        }
        let mut distribution_by_doc_type: Vec<DocTypeCount> = by_doc_type
            .into_iter()
            .map(|(doc_type, count)| DocTypeCount { doc_type, count })
            .collect();
        distribution_by_doc_type
            .sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.doc_type.cmp(&b.doc_type)));

        let mut ranked = records;
        ranked.sort_by(|a, b| {
            b.hit_count
                .cmp(&a.hit_count)
                .then_with(|| b.last_accessed_at.cmp(&a.last_accessed_at))
                .then_with(|| a.fingerprint.cmp(&b.fingerprint))
        });
        let top_records_by_hits = ranked
            .into_iter()
            .take(top_n)
            .map(|r| TopRecord {
                fingerprint: r.fingerprint,
                query_text: r.query_text,
                hit_count: r.hit_count,
                confidence_score: r.confidence_score,
                doc_type_filter: r.doc_type_filter,
                last_accessed_at: r.last_accessed_at,
            })
            .collect();

        Ok(CacheStats {
            size,
            average_confidence,
            total_hits,
            average_hits,
            top_records_by_hits,
            distribution_by_doc_type,
        })
    }
}
