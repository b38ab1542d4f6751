mod embedding;
mod error;
mod fingerprint;
mod noise;
mod normalization;
mod protector;

pub use embedding::{
    cosine_distance, cosine_similarity, ensure_same_dims, l2_norm, Embedding, HashEmbedder,
    HashEmbedderConfig,
};
pub use error::{LabnavError, Result};
pub use fingerprint::Fingerprint;
pub use noise::{NoiseCalibrator, NoiseMechanism, NoiseSeed, PrivacyBudget};
pub use normalization::{normalize_query, query_terms};
pub use protector::{
    build_protector, clip_to_norm, protect, DifferentiallyPrivateProtector, EmbeddingProtector,
    NoOpProtector, PrivacyConfig, ProtectedEmbedding, Provenance,
};
