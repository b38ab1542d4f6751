use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use labnav_core::{query_terms, NoiseCalibrator, NoiseMechanism, NoiseSeed};

use crate::retrieval::RetrievalResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankConfig {
    /// Weight of the retrieval score; the rest goes to lexical overlap.
    pub retrieval_weight: f32,
    pub min_score: f32,
    pub max_score: f32,
    /// Standard deviation of seeded Gaussian jitter. Zero disables it.
    pub jitter: f32,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            retrieval_weight: 0.7,
            min_score: 0.1,
            max_score: 0.99,
            jitter: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceConfig {
    pub top_k: usize,
    pub floor: f32,
    pub damping: f32,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            top_k: 3,
            floor: 0.1,
            damping: 0.95,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Reranker {
    config: RerankConfig,
    jitter: Option<NoiseCalibrator>,
}

impl Reranker {
    pub fn new(config: RerankConfig) -> Result<Self> {
        if !(0.0..=1.0).contains(&config.retrieval_weight) {
            bail!("rerank retrieval_weight must be within [0, 1]");
        }
        let bounds_ok = 0.0 <= config.min_score
            && config.min_score <= config.max_score
            && config.max_score <= 1.0;
        if !bounds_ok {
            bail!("rerank score bounds must satisfy 0 <= min <= max <= 1");
        }
        let jitter = if config.jitter > 0.0 {
            Some(NoiseCalibrator::with_scale(
                NoiseMechanism::Gaussian,
                config.jitter,
            )?)
        } else {
            None
        };
        Ok(Self { config, jitter })
    }

    /// Rescores candidates as
    /// `clamp(w * retrieval + (1 - w) * overlap [+ jitter], min, max)` and
    /// sorts descending. The sort is stable: equal scores keep retrieval order.
    pub fn rerank(
        &self,
        query: &str,
        mut candidates: Vec<RetrievalResult>,
        seed: &NoiseSeed,
    ) -> Vec<RetrievalResult> {
        let terms: HashSet<String> = query_terms(query).into_iter().collect();
        let noise = self
            .jitter
            .map(|calibrator| calibrator.sample(candidates.len(), Some(&seed.derive("rerank"))))
            .unwrap_or_else(|| vec![0.0; candidates.len()]);
        let w = self.config.retrieval_weight;
        for (candidate, jitter) in candidates.iter_mut().zip(noise) {
            let overlap = lexical_overlap(&terms, &candidate.content);
            let score = w * candidate.score + (1.0 - w) * overlap + jitter;
            candidate.score = score.clamp(self.config.min_score, self.config.max_score);
        }
        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
        candidates
    }
}

/// Share of distinct query terms that occur in `content`.
pub fn lexical_overlap(query_terms_set: &HashSet<String>, content: &str) -> f32 {
    if query_terms_set.is_empty() {
        return 0.0;
    }
    let content_terms: HashSet<String> = query_terms(content).into_iter().collect();
    let shared = query_terms_set
        .iter()
        .filter(|term| content_terms.contains(*term))
        .count();
    shared as f32 / query_terms_set.len() as f32
}

/// Mean of the top-k reranked scores times `damping`, clamped to
/// `[floor, 1]`. No candidates yields the floor.
pub fn score_confidence(ranked: &[RetrievalResult], config: &ConfidenceConfig) -> f32 {
    let top: Vec<f32> = ranked
        .iter()
        .take(config.top_k.max(1))
        .map(|r| r.score)
        .collect();
    if top.is_empty() {
        return config.floor;
    }
    let mean = top.iter().sum::<f32>() / top.len() as f32;
    let confidence = mean * config.damping;
    if !confidence.is_finite() {
        return config.floor;
    }
    confidence.clamp(config.floor, 1.0)
}
