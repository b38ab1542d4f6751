use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use labnav_core::{EmbeddingProtector, Fingerprint, LabnavError, NoiseSeed};

use crate::embedding::EmbeddingClient;
use crate::store::{DocumentInsert, PassageRow, PassageStore, SearchFilters};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassageMetadata {
    pub document_id: String,
    pub title: String,
    pub doc_type: String,
    pub year: Option<String>,
    pub author: Option<String>,
    pub page: Option<u32>,
}

/// One candidate passage. Lives for a single pipeline invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalResult {
    pub content: String,
    pub metadata: PassageMetadata,
    pub score: f32,
}

/// Citation shown to the caller and stored alongside cached answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRef {
    pub id: usize,
    pub title: String,
    pub doc_type: String,
    pub year: Option<String>,
    pub author: Option<String>,
    pub page: Option<u32>,
}

impl SourceRef {
    /// `position` is zero-based; citation ids start at 1.
    pub fn from_result(position: usize, result: &RetrievalResult) -> Self {
        let meta = &result.metadata;
        Self {
            id: position + 1,
            title: meta.title.clone(),
            doc_type: meta.doc_type.clone(),
            year: meta.year.clone(),
            author: meta.author.clone(),
            page: meta.page,
        }
    }
}

/// External search collaborator. Implementations may block on I/O.
pub trait Retriever: Send + Sync {
    fn retrieve(
        &self,
        query: &str,
        doc_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RetrievalResult>>;
}

impl<R: Retriever + ?Sized> Retriever for Arc<R> {
    fn retrieve(
        &self,
        query: &str,
        doc_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RetrievalResult>> {
        (**self).retrieve(query, doc_type, limit)
    }
}

/// Pre-chunked passage text to be embedded, protected and stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassageText {
    pub content: String,
    #[serde(default)]
    pub page: Option<u32>,
}

/// Vector search over [`PassageStore`]. Every vector it writes or compares
/// goes through the configured protector first.
#[derive(Clone)]
pub struct StoreRetriever {
    store: PassageStore,
    embeddings: EmbeddingClient,
    protector: Arc<dyn EmbeddingProtector>,
}

impl StoreRetriever {
    pub fn new(
        store: PassageStore,
        embeddings: EmbeddingClient,
        protector: Arc<dyn EmbeddingProtector>,
    ) -> Self {
        Self {
            store,
            embeddings,
            protector,
        }
    }

    pub fn store(&self) -> &PassageStore {
        &self.store
    }

    /// Fails when the stored passages were embedded at a different length than
    /// the configured backend produces. Backends with no fixed length are
    /// checked at query time instead.
    pub fn verify_dimensions(&self) -> Result<()> {
        let (Some(stored), Some(configured)) =
            (self.store.embedding_dimensions()?, self.embeddings.dimensions())
        else {
            return Ok(());
        };
        if stored != configured {
            return Err(LabnavError::DimensionMismatch {
                left: configured,
                right: stored,
            })
            .context("passage store was built with a different embedding configuration");
        }
        Ok(())
    }

    /// Replaces the stored passages of one document. Noise is seeded from the
    /// document id and content hash, so reloading unchanged text is a no-op
    /// for the stored vectors.
    pub fn load_document(
        &self,
        document: &DocumentInsert,
        passages: &[PassageText],
    ) -> Result<usize> {
        let texts: Vec<String> = passages.iter().map(|p| p.content.clone()).collect();
        let raw = self
            .embeddings
            .embed_batch(&texts)
            .context("failed to embed passages")?;
        let mut rows = Vec::with_capacity(passages.len());
        for (passage, embedding) in passages.iter().zip(raw) {
            let content_hash = blake3::hash(passage.content.as_bytes()).to_hex().to_string();
            let protected = self.protector.protect_document(
                &embedding,
                &document.document_id,
                &content_hash,
            )?;
            rows.push(PassageRow {
                page: passage.page,
                content: passage.content.clone(),
                content_hash,
                embedding: protected.into_vector(),
            });
        }
        let stored = self.store.replace_document(document, &rows)?;
        debug!(document = %document.document_id, passages = stored, "document loaded");
        Ok(stored)
    }
}

impl Retriever for StoreRetriever {
    fn retrieve(
        &self,
        query: &str,
        doc_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RetrievalResult>> {
        let raw = self.embeddings.embed(query)?;
        let seed = NoiseSeed::for_fingerprint(&Fingerprint::scoped(query, doc_type));
        let protected = self.protector.protect(&raw, Some(&seed))?;
        let filters = SearchFilters {
            limit,
            doc_type: doc_type.map(str::to_string),
        };
        self.store.search(protected.vector(), &filters, |a, b| {
            self.protector.embedding_distance(a, b)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labnav_core::{build_protector, PrivacyConfig};
    use tempfile::tempdir;

    fn document(id: &str, doc_type: &str) -> DocumentInsert {
        DocumentInsert {
            document_id: id.to_string(),
            title: format!("{id} handbook"),
            doc_type: doc_type.to_string(),
            year: Some("2023".to_string()),
            author: Some("Lab Protocol".to_string()),
        }
    }

    fn passage(content: &str) -> PassageText {
        PassageText {
            content: content.to_string(),
            page: Some(1),
        }
    }

    fn retriever(dir: &std::path::Path, privacy: PrivacyConfig) -> StoreRetriever {
        StoreRetriever::new(
            PassageStore::open(dir.join("passages.sqlite")).unwrap(),
            EmbeddingClient::hash(256, 1337),
            build_protector(&privacy).unwrap(),
        )
    }

    #[test]
    fn reloading_unchanged_document_keeps_vectors_stable() {
        let dir = tempdir().unwrap();
        let retriever = retriever(dir.path(), PrivacyConfig::default());
        let doc = document("trizol", "protocol");
        let passages = [passage("lyse cells in trizol reagent")];
        retriever.load_document(&doc, &passages).unwrap();
        let first = retriever.store().document_embeddings("trizol").unwrap();
        retriever.load_document(&doc, &passages).unwrap();
        let second = retriever.store().document_embeddings("trizol").unwrap();
        assert_eq!(first, second);
        assert_eq!(retriever.store().count().unwrap(), 1);
    }

    #[test]
    fn finds_relevant_passage_without_protection() {
        let dir = tempdir().unwrap();
        let retriever = retriever(dir.path(), PrivacyConfig::disabled());
        retriever
            .load_document(
                &document("rna", "protocol"),
                &[passage("rna extraction with trizol and chloroform")],
            )
            .unwrap();
        retriever
            .load_document(
                &document("crispr", "paper"),
                &[passage("crispr guide design for gene editing")],
            )
            .unwrap();
        let hits = retriever
            .retrieve("how to extract rna with trizol", None, 5)
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].metadata.document_id, "rna");
        assert!(hits[0].score > hits[1].score);

        let papers = retriever.retrieve("gene editing", Some("paper"), 5).unwrap();
        assert_eq!(papers.len(), 1);
        assert_eq!(papers[0].metadata.document_id, "crispr");
    }

    #[test]
    fn reopening_with_other_dimensions_is_rejected() {
        let dir = tempdir().unwrap();
        let wide = retriever(dir.path(), PrivacyConfig::default());
        assert!(wide.verify_dimensions().is_ok());
        wide.load_document(&document("rna", "protocol"), &[passage("rna extraction")])
            .unwrap();
        assert!(wide.verify_dimensions().is_ok());

        let narrow = StoreRetriever::new(
            PassageStore::open(dir.path().join("passages.sqlite")).unwrap(),
            EmbeddingClient::hash(64, 1337),
            build_protector(&PrivacyConfig::default()).unwrap(),
        );
        let err = narrow.verify_dimensions().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LabnavError>(),
            Some(LabnavError::DimensionMismatch { left: 64, right: 256 })
        ));
    }

    #[test]
    fn protected_retrieval_is_deterministic_per_query() {
        let dir = tempdir().unwrap();
        let retriever = retriever(dir.path(), PrivacyConfig::default());
        retriever
            .load_document(
                &document("a", "protocol"),
                &[passage("rna extraction"), passage("pcr setup")],
            )
            .unwrap();
        let first = retriever.retrieve("rna extraction", None, 5).unwrap();
        let second = retriever.retrieve("RNA  extraction", None, 5).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn source_ref_numbers_from_one() {
        let result = RetrievalResult {
            content: "x".to_string(),
            metadata: PassageMetadata {
                document_id: "d".to_string(),
                title: "Title".to_string(),
                doc_type: "protocol".to_string(),
                year: None,
                author: None,
                page: Some(3),
            },
            score: 0.5,
        };
        let source = SourceRef::from_result(0, &result);
        assert_eq!(source.id, 1);
        assert_eq!(source.page, Some(3));
    }
}
