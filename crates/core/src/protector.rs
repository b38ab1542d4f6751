use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::embedding::{cosine_distance, l2_norm, Embedding};
use crate::error::{LabnavError, Result};
use crate::noise::{NoiseCalibrator, NoiseMechanism, NoiseSeed, PrivacyBudget};

/// Where a protected vector came from. Present when it was seeded from a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub document_id: String,
    pub content_hash: String,
}

/// Clipped-and-noised embedding. Never mutated; re-protection builds a new value.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtectedEmbedding {
    vector: Embedding,
    mechanism: Option<NoiseMechanism>,
    provenance: Option<Provenance>,
}

impl ProtectedEmbedding {
    pub fn vector(&self) -> &[f32] {
        &self.vector
    }

    pub fn into_vector(self) -> Embedding {
        self.vector
    }

    /// `None` when produced by the no-op protector.
    pub fn mechanism(&self) -> Option<NoiseMechanism> {
        self.mechanism
    }

    pub fn provenance(&self) -> Option<&Provenance> {
        self.provenance.as_ref()
    }

    pub fn dimensions(&self) -> usize {
        self.vector.len()
    }

    fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = Some(provenance);
        self
    }
}

/// Capability shared by both protection variants. Call sites hold an
/// `Arc<dyn EmbeddingProtector>` chosen once from [`PrivacyConfig`].
pub trait EmbeddingProtector: Send + Sync {
    fn protect(&self, raw: &[f32], seed: Option<&NoiseSeed>) -> Result<ProtectedEmbedding>;

    fn embedding_distance(&self, a: &[f32], b: &[f32]) -> Result<f32>;

    fn is_enabled(&self) -> bool;

    /// Reproducible protection keyed by document id and content hash.
    fn protect_document(
        &self,
        raw: &[f32],
        document_id: &str,
        content_hash: &str,
    ) -> Result<ProtectedEmbedding> {
        let seed = NoiseSeed::for_document(document_id, content_hash);
        Ok(self.protect(raw, Some(&seed))?.with_provenance(Provenance {
            document_id: document_id.to_string(),
            content_hash: content_hash.to_string(),
        }))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpProtector;

impl EmbeddingProtector for NoOpProtector {
    fn protect(&self, raw: &[f32], _seed: Option<&NoiseSeed>) -> Result<ProtectedEmbedding> {
        Ok(ProtectedEmbedding {
            vector: raw.to_vec(),
            mechanism: None,
            provenance: None,
        })
    }

    fn embedding_distance(&self, a: &[f32], b: &[f32]) -> Result<f32> {
        cosine_distance(a, b)
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
pub struct DifferentiallyPrivateProtector {
    budget: PrivacyBudget,
    calibrator: NoiseCalibrator,
}

impl DifferentiallyPrivateProtector {
    pub fn new(budget: PrivacyBudget) -> Self {
        Self {
            budget,
            calibrator: NoiseCalibrator::from_budget(&budget),
        }
    }

    pub fn budget(&self) -> &PrivacyBudget {
        &self.budget
    }
}

impl EmbeddingProtector for DifferentiallyPrivateProtector {
    fn protect(&self, raw: &[f32], seed: Option<&NoiseSeed>) -> Result<ProtectedEmbedding> {
        Ok(add_noise(raw, &self.budget, &self.calibrator, seed))
    }

    fn embedding_distance(&self, a: &[f32], b: &[f32]) -> Result<f32> {
        cosine_distance(a, b)
    }

    fn is_enabled(&self) -> bool {
        true
    }
}

/// Scales `raw` down so its L2 norm is at most `clip_norm`; shorter vectors
/// are returned unchanged.
pub fn clip_to_norm(raw: &[f32], clip_norm: f32) -> Embedding {
    let norm = l2_norm(raw);
    if norm <= clip_norm || norm == 0.0 {
        return raw.to_vec();
    }
    let factor = clip_norm / norm;
    raw.iter().map(|v| v * factor).collect()
}

/// Clip to `budget.clip_norm()` then add per-coordinate noise scaled by
/// `sensitivity / epsilon`.
pub fn protect(
    raw: &[f32],
    budget: &PrivacyBudget,
    seed: Option<&NoiseSeed>,
) -> ProtectedEmbedding {
    add_noise(raw, budget, &NoiseCalibrator::from_budget(budget), seed)
}

fn add_noise(
    raw: &[f32],
    budget: &PrivacyBudget,
    calibrator: &NoiseCalibrator,
    seed: Option<&NoiseSeed>,
) -> ProtectedEmbedding {
    let mut vector = clip_to_norm(raw, budget.clip_norm());
    let noise = calibrator.sample(vector.len(), seed);
    for (value, delta) in vector.iter_mut().zip(noise) {
        *value += delta;
    }
    ProtectedEmbedding {
        vector,
        mechanism: Some(budget.mechanism()),
        provenance: None,
    }
}

/// Startup-time privacy settings. Read once; changing them needs a restart
/// because stored vectors are not re-noised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacyConfig {
    pub enable_dp_protection: bool,
    pub epsilon: f32,
    pub sensitivity: f32,
    pub clip_norm: f32,
    pub mechanism: NoiseMechanism,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            enable_dp_protection: true,
            epsilon: 0.1,
            sensitivity: 0.1,
            clip_norm: 1.0,
            mechanism: NoiseMechanism::Gaussian,
        }
    }
}

impl PrivacyConfig {
    pub fn disabled() -> Self {
        Self {
            enable_dp_protection: false,
            ..Self::default()
        }
    }

    /// Validated budget. Checked even when protection is disabled so a bad
    /// value never goes unnoticed until someone flips the flag.
    pub fn budget(&self) -> Result<PrivacyBudget> {
        PrivacyBudget::new(self.epsilon, self.sensitivity, self.clip_norm, self.mechanism).map_err(
            |err| match err {
                LabnavError::InvalidBudget(msg) => LabnavError::InvalidPrivacyConfig(msg),
                other => other,
            },
        )
    }
}

pub fn build_protector(config: &PrivacyConfig) -> Result<Arc<dyn EmbeddingProtector>> {
    let budget = config.budget()?;
    if config.enable_dp_protection {
        info!(
            epsilon = budget.epsilon(),
            sensitivity = budget.sensitivity(),
            clip_norm = budget.clip_norm(),
            mechanism = %budget.mechanism(),
            "embedding protection enabled"
        );
        Ok(Arc::new(DifferentiallyPrivateProtector::new(budget)))
    } else {
        info!("embedding protection disabled");
        Ok(Arc::new(NoOpProtector))
    }
}
