use anyhow::{bail, Result};
use bytemuck::cast_slice;
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retrieval::{PassageMetadata, RetrievalResult};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed passage table. Embeddings are stored already protected.
#[derive(Clone)]
pub struct PassageStore {
    path: PathBuf,
}

impl PassageStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
        };
        store.init()?;
        Ok(store)
    }

    fn connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    pub fn init(&self) -> Result<()> {
        let conn = self.connection()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS passages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                document_id TEXT NOT NULL,
                title TEXT NOT NULL,
                doc_type TEXT NOT NULL,
                year TEXT,
                author TEXT,
                page INTEGER,
                content TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                embedding BLOB NOT NULL,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            CREATE INDEX IF NOT EXISTS idx_passages_document ON passages(document_id);
            CREATE INDEX IF NOT EXISTS idx_passages_doc_type ON passages(doc_type);
            "#,
        )?;
        Ok(())
    }

    /// Replaces every passage of `document.document_id` in one transaction.
    pub fn replace_document(
        &self,
        document: &DocumentInsert,
        passages: &[PassageRow],
    ) -> Result<usize> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM passages WHERE document_id = ?1",
            params![document.document_id],
        )?;
        for passage in passages {
            let embedding_blob = cast_slice::<f32, u8>(&passage.embedding);
            tx.execute(
                "INSERT INTO passages (document_id, title, doc_type, year, author, page, content, content_hash, embedding) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    document.document_id,
                    document.title,
                    document.doc_type,
                    document.year,
                    document.author,
                    passage.page,
                    passage.content,
                    passage.content_hash,
                    embedding_blob
                ],
            )?;
        }
        tx.commit()?;
        Ok(passages.len())
    }

    pub fn delete_document(&self, document_id: &str) -> Result<usize> {
        let conn = self.connection()?;
        Ok(conn.execute(
            "DELETE FROM passages WHERE document_id = ?1",
            params![document_id],
        )?)
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.connection()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM passages", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Length of the stored embeddings, read from one passage. `None` when the
    /// store holds no passages yet.
    pub fn embedding_dimensions(&self) -> Result<Option<usize>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare("SELECT length(embedding) FROM passages LIMIT 1")?;
        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(row) => {
                let bytes: i64 = row.get(0)?;
                Ok(Some(bytes as usize / std::mem::size_of::<f32>()))
            }
            None => Ok(None),
        }
    }

    /// Stored embedding for each passage of a document, in insertion order.
    pub fn document_embeddings(&self, document_id: &str) -> Result<Vec<Vec<f32>>> {
        let conn = self.connection()?;
        let mut stmt =
            conn.prepare("SELECT embedding FROM passages WHERE document_id = ?1 ORDER BY id")?;
        let mut rows = stmt.query([document_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let blob: Vec<u8> = row.get(0)?;
            out.push(decode_embedding(&blob)?);
        }
        Ok(out)
    }

    /// Scores every passage (optionally restricted to one document type) with
    /// `1 - distance / 2` and returns the best `filters.limit`, highest first.
    pub fn search<D>(
        &self,
        query_embedding: &[f32],
        filters: &SearchFilters,
        distance: D,
    ) -> Result<Vec<RetrievalResult>>
    where
        D: Fn(&[f32], &[f32]) -> labnav_core::Result<f32>,
    {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT document_id, title, doc_type, year, author, page, content, embedding
            FROM passages
            WHERE (?1 IS NULL OR doc_type = ?1 COLLATE NOCASE)
            ORDER BY id
            "#,
        )?;
        let mut rows = stmt.query(params![filters.doc_type])?;
        let mut hits = Vec::new();
        while let Some(row) = rows.next()? {
            let embedding_blob: Vec<u8> = row.get(7)?;
            let embedding = decode_embedding(&embedding_blob)?;
            let d = distance(query_embedding, &embedding)?;
            hits.push(RetrievalResult {
                content: row.get(6)?,
                metadata: PassageMetadata {
                    document_id: row.get(0)?,
                    title: row.get(1)?,
                    doc_type: row.get(2)?,
                    year: row.get(3)?,
                    author: row.get(4)?,
                    page: row.get(5)?,
                },
                score: (1.0 - d / 2.0).clamp(0.0, 1.0),
            });
        }
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(filters.limit);
        Ok(hits)
    }
}

fn decode_embedding(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % std::mem::size_of::<f32>() != 0 {
        bail!("invalid embedding blob of {} bytes", blob.len());
    }
    Ok(bytemuck::pod_collect_to_vec(blob))
}

#[derive(Debug, Clone)]
pub struct DocumentInsert {
    pub document_id: String,
    pub title: String,
    pub doc_type: String,
    pub year: Option<String>,
    pub author: Option<String>,
}

/// A passage ready for persistence: embedding already protected.
#[derive(Debug, Clone)]
pub struct PassageRow {
    pub page: Option<u32>,
    pub content: String,
    pub content_hash: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct SearchFilters {
    pub limit: usize,
    pub doc_type: Option<String>,
}

impl Default for SearchFilters {
    fn default() -> Self {
        Self {
            limit: 10,
            doc_type: None,
        }
    }
}
