use anyhow::bail;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use labnav_core::{Fingerprint, LabnavError, NoiseSeed, Result};

use crate::answer::{AnswerGenerator, FALLBACK_ANSWER};
use crate::cache::{Admission, CacheAdmission, CacheLookup, ResponseCache};
use crate::rerank::{score_confidence, ConfidenceConfig, RerankConfig, Reranker};
use crate::retrieval::{RetrievalResult, Retriever, SourceRef};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Candidates requested from the retriever.
    pub candidate_limit: usize,
    /// Sources returned to the caller and handed to the generator.
    pub max_sources: usize,
    pub rerank: RerankConfig,
    pub confidence: ConfidenceConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            candidate_limit: 10,
            max_sources: 5,
            rerank: RerankConfig::default(),
            confidence: ConfidenceConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.candidate_limit == 0 {
            bail!("pipeline candidate_limit must be > 0");
        }
        if !(1..=5).contains(&self.max_sources) {
            bail!("pipeline max_sources must be within [1, 5]");
        }
        let confidence = &self.confidence;
        if confidence.top_k == 0 {
            bail!("confidence top_k must be > 0");
        }
        if !(confidence.floor > 0.0 && confidence.floor <= 1.0) {
            bail!("confidence floor must be within (0, 1]");
        }
        if !(confidence.damping > 0.0 && confidence.damping <= 1.0) {
            bail!("confidence damping must be within (0, 1]");
        }
        Reranker::new(self.rerank.clone())?;
        Ok(())
    }
}

fn default_use_cache() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub query: String,
    #[serde(default)]
    pub doc_type: Option<String>,
    #[serde(default = "default_use_cache")]
    pub use_cache: bool,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            doc_type: None,
            use_cache: true,
        }
    }

    pub fn with_doc_type(mut self, doc_type: impl Into<String>) -> Self {
        self.doc_type = Some(doc_type.into());
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub answer: String,
    pub sources: Vec<SourceRef>,
    pub confidence_score: f32,
    pub served_from_cache: bool,
    pub processing_time_seconds: f64,
    pub fingerprint: Fingerprint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_hits: Option<u64>,
}

/// Per-request flow: validate, check the cache, retrieve, rerank, score,
/// generate and decide admission. Retrieval and generation failures turn into
/// the fallback answer at the confidence floor; cache store failures surface.
#[derive(Clone)]
pub struct RetrievalPipeline {
    config: PipelineConfig,
    retriever: Arc<dyn Retriever>,
    generator: Arc<dyn AnswerGenerator>,
    reranker: Reranker,
    cache: ResponseCache,
}

struct Computed {
    answer: String,
    sources: Vec<SourceRef>,
    confidence: f32,
    cacheable: bool,
}

impl RetrievalPipeline {
    pub fn new(
        config: PipelineConfig,
        retriever: Arc<dyn Retriever>,
        generator: Arc<dyn AnswerGenerator>,
        cache: ResponseCache,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let reranker = Reranker::new(config.rerank.clone())?;
        Ok(Self {
            config,
            retriever,
            generator,
            reranker,
            cache,
        })
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn answer(&self, request: &QueryRequest) -> Result<QueryResponse> {
        let started = Instant::now();
        let query = request.query.trim();
        if query.is_empty() {
            return Err(LabnavError::validation(
                "query must not be empty; ask a question such as \"how do I extract RNA?\"",
            ));
        }
        let doc_type = request
            .doc_type
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty());
        let fingerprint = Fingerprint::scoped(query, doc_type);

        if request.use_cache {
            if let CacheLookup::Hit(record) = self.cache.lookup(&fingerprint)? {
                info!(%fingerprint, hits = record.hit_count, "served from cache");
                return Ok(QueryResponse {
                    answer: record.answer_text,
                    sources: record.sources,
                    confidence_score: record.confidence_score,
                    served_from_cache: true,
                    processing_time_seconds: started.elapsed().as_secs_f64(),
                    fingerprint,
                    cache_hits: Some(record.hit_count),
                });
            }
        }

        let computed = self.compute(query, doc_type, &fingerprint);

        if request.use_cache && computed.cacheable {
            let admitted = self.cache.admit(CacheAdmission {
                fingerprint,
                query_text: query.to_string(),
                answer_text: computed.answer.clone(),
                sources: computed.sources.clone(),
                confidence_score: computed.confidence,
                doc_type_filter: doc_type.map(str::to_string),
            });
            match admitted {
                Ok(Admission::Admitted) => {}
                Ok(Admission::Rejected { threshold, .. }) => debug!(
                    %fingerprint,
                    confidence = computed.confidence,
                    threshold,
                    "answer not cached"
                ),
                // the computed answer is still returned, just not cached
                Err(err) => error!(%fingerprint, error = %err, "cache admission failed"),
            }
        }

        let elapsed = started.elapsed().as_secs_f64();
        info!(
            %fingerprint,
            confidence = computed.confidence,
            sources = computed.sources.len(),
            elapsed,
            "query answered"
        );
        Ok(QueryResponse {
            answer: computed.answer,
            sources: computed.sources,
            confidence_score: computed.confidence,
            served_from_cache: false,
            processing_time_seconds: elapsed,
            fingerprint,
            cache_hits: None,
        })
    }

    fn compute(&self, query: &str, doc_type: Option<&str>, fingerprint: &Fingerprint) -> Computed {
        let candidates = match self.retrieve(query, doc_type) {
            Ok(candidates) if !candidates.is_empty() => candidates,
            Ok(_) => {
                warn!(
                    %fingerprint,
                    doc_type = doc_type.unwrap_or("any"),
                    "retrieval returned no candidates"
                );
                return self.fallback();
            }
            Err(LabnavError::DimensionMismatch { left, right }) => {
                error!(
                    %fingerprint,
                    query_dims = left,
                    stored_dims = right,
                    "query and stored embeddings differ in length"
                );
                return self.fallback();
            }
            Err(err) => {
                warn!(%fingerprint, error = %err, "retrieval failed, answering with fallback");
                return self.fallback();
            }
        };
        let candidate_count = candidates.len();
        let seed = NoiseSeed::for_fingerprint(fingerprint);
        let ranked = self.reranker.rerank(query, candidates, &seed);
        let confidence = score_confidence(&ranked, &self.config.confidence);
        let top: Vec<RetrievalResult> = ranked.into_iter().take(self.config.max_sources).collect();
        debug!(%fingerprint, candidates = candidate_count, confidence, "candidates reranked");

        let answer = match self.generator.generate(query, &top) {
            Ok(answer) if !answer.trim().is_empty() => answer,
            Ok(_) => {
                warn!(%fingerprint, "answer generator returned empty text");
                return self.fallback();
            }
            Err(err) => {
                warn!(%fingerprint, error = %err, "answer generation failed");
                return self.fallback();
            }
        };
        let sources = top
            .iter()
            .enumerate()
            .map(|(position, result)| SourceRef::from_result(position, result))
            .collect();
        Computed {
            answer,
            sources,
            confidence,
            cacheable: true,
        }
    }

    fn retrieve(&self, query: &str, doc_type: Option<&str>) -> Result<Vec<RetrievalResult>> {
        self.retriever
            .retrieve(query, doc_type, self.config.candidate_limit)
            .map_err(|err| match err.downcast_ref::<LabnavError>() {
                Some(LabnavError::DimensionMismatch { left, right }) => {
                    LabnavError::DimensionMismatch {
                        left: *left,
                        right: *right,
                    }
                }
                _ => LabnavError::RetrievalUnavailable(format!("{err:#}")),
            })
    }

    fn fallback(&self) -> Computed {
        Computed {
            answer: FALLBACK_ANSWER.to_string(),
            sources: Vec::new(),
            confidence: self.config.confidence.floor,
            cacheable: false,
        }
    }
}
