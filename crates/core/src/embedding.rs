use crate::error::{LabnavError, Result};
use crate::normalization::query_terms;

/// Dense vector; every embedding compared or cached together shares one length.
pub type Embedding = Vec<f32>;

#[derive(Debug, Clone, Copy)]
pub struct HashEmbedderConfig {
    pub dimensions: usize,
    pub seed: u64,
}

impl Default for HashEmbedderConfig {
    fn default() -> Self {
        Self {
            dimensions: 64,
            seed: 1337,
        }
    }
}

/// Bag-of-terms embedder hashing each normalized term into a bucket.
/// Stable across processes and releases so stored vectors stay comparable.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    config: HashEmbedderConfig,
}

impl HashEmbedder {
    pub fn new(config: HashEmbedderConfig) -> Self {
        Self { config }
    }

    pub fn dimensions(&self) -> usize {
        self.config.dimensions.max(1)
    }

    pub fn embed_text(&self, text: &str) -> Embedding {
        let dims = self.dimensions();
        let mut vector = vec![0f32; dims];
        for term in query_terms(text) {
            let bucket = self.bucket_for(&term);
            vector[bucket] += 1.0;
        }
        normalize(&mut vector);
        vector
    }

    fn bucket_for(&self, term: &str) -> usize {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.config.seed.to_le_bytes());
        hasher.update(term.as_bytes());
        let hash = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&hash.as_bytes()[..8]);
        (u64::from_le_bytes(head) % self.dimensions() as u64) as usize
    }
}

pub fn l2_norm(vector: &[f32]) -> f32 {
    vector.iter().map(|v| v * v).sum::<f32>().sqrt()
}

pub fn ensure_same_dims(a: &[f32], b: &[f32]) -> Result<()> {
    if a.len() != b.len() {
        return Err(LabnavError::DimensionMismatch {
            left: a.len(),
            right: b.len(),
        });
    }
    Ok(())
}

/// Cosine similarity in [-1, 1]. A zero vector only matches itself.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    ensure_same_dims(a, b)?;
    let mut dot = 0.0f32;
    let mut a_norm = 0.0f32;
    let mut b_norm = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        a_norm += x * x;
        b_norm += y * y;
    }
    if a_norm == 0.0 || b_norm == 0.0 {
        return Ok(if a == b { 1.0 } else { 0.0 });
    }
    Ok((dot / (a_norm.sqrt() * b_norm.sqrt())).clamp(-1.0, 1.0))
}

/// `1 - cos(a, b)`, in [0, 2].
pub fn cosine_distance(a: &[f32], b: &[f32]) -> Result<f32> {
    let similarity = cosine_similarity(a, b)?;
    if a == b {
        return Ok(0.0);
    }
    Ok((1.0 - similarity).clamp(0.0, 2.0))
}

fn normalize(vector: &mut [f32]) {
    let norm = l2_norm(vector);
    if norm == 0.0 {
        return;
    }
    for value in vector.iter_mut() {
        *value /= norm;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_embedding_is_unit_length_and_stable() {
        let embedder = HashEmbedder::new(HashEmbedderConfig::default());
        let a = embedder.embed_text("RNA extraction with TRIzol");
        let b = embedder.embed_text("rna   extraction with trizol");
        assert_eq!(a.len(), 64);
        assert_eq!(a, b);
        assert!((l2_norm(&a) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn empty_text_embeds_to_zero_vector() {
        let embedder = HashEmbedder::new(HashEmbedderConfig {
            dimensions: 8,
            seed: 7,
        });
        assert_eq!(embedder.embed_text("   "), vec![0.0; 8]);
    }

    #[test]
    fn distance_is_zero_on_identical_and_symmetric() {
        let a = vec![0.3, -0.2, 0.9];
        let b = vec![-0.1, 0.4, 0.2];
        assert_eq!(cosine_distance(&a, &a).unwrap(), 0.0);
        let ab = cosine_distance(&a, &b).unwrap();
        let ba = cosine_distance(&b, &a).unwrap();
        assert!((ab - ba).abs() < 1e-6);
        assert!(ab > 0.0);
    }

    #[test]
    fn distance_rejects_mismatched_dimensions() {
        let err = cosine_distance(&[1.0, 0.0], &[1.0, 0.0, 0.0]).unwrap_err();
        assert!(matches!(
            err,
            LabnavError::DimensionMismatch { left: 2, right: 3 }
        ));
    }

    #[test]
    fn zero_vectors_sit_at_unit_distance() {
        let zero = vec![0.0; 3];
        assert_eq!(cosine_distance(&zero, &[1.0, 0.0, 0.0]).unwrap(), 1.0);
        assert_eq!(cosine_distance(&zero, &zero).unwrap(), 0.0);
    }
}
