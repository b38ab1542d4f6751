use std::fmt;
use std::str::FromStr;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Exp1, StandardNormal};
use serde::{Deserialize, Serialize};

use crate::error::{LabnavError, Result};
use crate::fingerprint::Fingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NoiseMechanism {
    #[default]
    Gaussian,
    Laplace,
}

impl NoiseMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoiseMechanism::Gaussian => "gaussian",
            NoiseMechanism::Laplace => "laplace",
        }
    }
}

impl fmt::Display for NoiseMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NoiseMechanism {
    type Err = LabnavError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "gaussian" | "normal" => Ok(NoiseMechanism::Gaussian),
            "laplace" | "laplacian" => Ok(NoiseMechanism::Laplace),
            other => Err(LabnavError::InvalidPrivacyConfig(format!(
                "unknown noise mechanism {other}"
            ))),
        }
    }
}

/// Immutable privacy parameters. Construction enforces the domain, so every
/// live value has strictly positive epsilon, sensitivity and clip norm.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrivacyBudget {
    epsilon: f32,
    sensitivity: f32,
    clip_norm: f32,
    mechanism: NoiseMechanism,
}

impl PrivacyBudget {
    pub fn new(
        epsilon: f32,
        sensitivity: f32,
        clip_norm: f32,
        mechanism: NoiseMechanism,
    ) -> Result<Self> {
        for (name, value) in [
            ("epsilon", epsilon),
            ("sensitivity", sensitivity),
            ("clip_norm", clip_norm),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(LabnavError::InvalidBudget(format!(
                    "{name} must be a finite value > 0, got {value}"
                )));
            }
        }
        Ok(Self {
            epsilon,
            sensitivity,
            clip_norm,
            mechanism,
        })
    }

    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }

    pub fn sensitivity(&self) -> f32 {
        self.sensitivity
    }

    pub fn clip_norm(&self) -> f32 {
        self.clip_norm
    }

    pub fn mechanism(&self) -> NoiseMechanism {
        self.mechanism
    }

    /// `sensitivity / epsilon`: the Gaussian standard deviation or the
    /// Laplace scale, depending on the mechanism.
    pub fn noise_scale(&self) -> f32 {
        self.sensitivity / self.epsilon
    }
}

/// 32-byte key for reproducible noise draws.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NoiseSeed([u8; 32]);

impl NoiseSeed {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    /// Seed for a stored passage. Unchanged content re-protects to the same vector.
    pub fn for_document(document_id: &str, content_hash: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"document\x1f");
        hasher.update(document_id.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(content_hash.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    pub fn for_fingerprint(fingerprint: &Fingerprint) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"query\x1f");
        hasher.update(fingerprint.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    /// Independent seed for a secondary use of the same key.
    pub fn derive(&self, label: &str) -> Self {
        let mut hasher = blake3::Hasher::new_keyed(&self.0);
        hasher.update(label.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    fn rng(&self) -> ChaCha8Rng {
        ChaCha8Rng::from_seed(self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoiseCalibrator {
    mechanism: NoiseMechanism,
    scale: f32,
}

impl NoiseCalibrator {
    pub fn from_budget(budget: &PrivacyBudget) -> Self {
        Self {
            mechanism: budget.mechanism(),
            scale: budget.noise_scale(),
        }
    }

    /// Calibrator with an explicit scale; zero yields an all-zero draw.
    pub fn with_scale(mechanism: NoiseMechanism, scale: f32) -> Result<Self> {
        if !scale.is_finite() || scale < 0.0 {
            return Err(LabnavError::InvalidBudget(format!(
                "noise scale must be finite and >= 0, got {scale}"
            )));
        }
        Ok(Self { mechanism, scale })
    }

    pub fn mechanism(&self) -> NoiseMechanism {
        self.mechanism
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// `len` independent draws. The same seed always yields the same vector.
    pub fn sample(&self, len: usize, seed: Option<&NoiseSeed>) -> Vec<f32> {
        match seed {
            Some(seed) => self.draw(len, &mut seed.rng()),
            None => self.draw(len, &mut ChaCha8Rng::from_entropy()),
        }
    }

    fn draw<R: Rng>(&self, len: usize, rng: &mut R) -> Vec<f32> {
        (0..len).map(|_| self.draw_one(rng)).collect()
    }

    fn draw_one<R: Rng>(&self, rng: &mut R) -> f32 {
        match self.mechanism {
            NoiseMechanism::Gaussian => {
                let z: f32 = StandardNormal.sample(rng);
                z * self.scale
            }
            NoiseMechanism::Laplace => {
                // difference of two Exp(1) draws is Laplace(0, 1)
                let a: f32 = Exp1.sample(rng);
                let b: f32 = Exp1.sample(rng);
                (a - b) * self.scale
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget(epsilon: f32, sensitivity: f32, mechanism: NoiseMechanism) -> PrivacyBudget {
        PrivacyBudget::new(epsilon, sensitivity, 1.0, mechanism).unwrap()
    }

    #[test]
    fn rejects_non_positive_parameters() {
        for (eps, sens, clip) in [
            (0.0, 0.1, 1.0),
            (-1.0, 0.1, 1.0),
            (0.1, 0.0, 1.0),
            (0.1, 0.1, 0.0),
            (f32::NAN, 0.1, 1.0),
        ] {
            let err = PrivacyBudget::new(eps, sens, clip, NoiseMechanism::Gaussian).unwrap_err();
            assert!(matches!(err, LabnavError::InvalidBudget(_)));
        }
    }

    #[test]
    fn scale_is_sensitivity_over_epsilon() {
        let b = budget(0.5, 0.25, NoiseMechanism::Laplace);
        assert!((b.noise_scale() - 0.5).abs() < 1e-6);
        let calibrator = NoiseCalibrator::from_budget(&b);
        assert_eq!(calibrator.mechanism(), NoiseMechanism::Laplace);
        assert!((calibrator.scale() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn seeded_draws_repeat() {
        let calibrator = NoiseCalibrator::from_budget(&budget(1.0, 0.1, NoiseMechanism::Gaussian));
        let seed = NoiseSeed::for_document("doc-7", "abc123");
        assert_eq!(
            calibrator.sample(32, Some(&seed)),
            calibrator.sample(32, Some(&seed))
        );
        let other = NoiseSeed::for_document("doc-7", "abc124");
        assert_ne!(
            calibrator.sample(32, Some(&seed)),
            calibrator.sample(32, Some(&other))
        );
    }

    #[test]
    fn derived_seeds_differ_from_parent() {
        let seed = NoiseSeed::from_bytes(b"parent");
        assert_ne!(seed.derive("rerank"), seed);
        assert_eq!(seed.derive("rerank"), seed.derive("rerank"));
    }

    #[test]
    fn zero_scale_draws_zeros() {
        let calibrator = NoiseCalibrator::with_scale(NoiseMechanism::Laplace, 0.0).unwrap();
        assert!(calibrator.sample(8, None).iter().all(|v| *v == 0.0));
        assert!(NoiseCalibrator::with_scale(NoiseMechanism::Gaussian, -0.1).is_err());
    }

    #[test]
    fn empirical_spread_tracks_scale() {
        let seed = NoiseSeed::from_bytes(b"spread");
        let n = 20_000;
        let gaussian = NoiseCalibrator::with_scale(NoiseMechanism::Gaussian, 2.0).unwrap();
        let draws = gaussian.sample(n, Some(&seed));
        let var = draws.iter().map(|v| (*v as f64).powi(2)).sum::<f64>() / n as f64;
        assert!((var.sqrt() - 2.0).abs() < 0.1, "gaussian std {}", var.sqrt());

        let laplace = NoiseCalibrator::with_scale(NoiseMechanism::Laplace, 2.0).unwrap();
        let draws = laplace.sample(n, Some(&seed));
        let mean_abs = draws.iter().map(|v| v.abs() as f64).sum::<f64>() / n as f64;
        assert!((mean_abs - 2.0).abs() < 0.1, "laplace mean |x| {mean_abs}");
    }

    #[test]
    fn mechanism_parses_case_insensitively() {
        assert_eq!(
            "Gaussian".parse::<NoiseMechanism>().unwrap(),
            NoiseMechanism::Gaussian
        );
        assert_eq!(
            " laplace ".parse::<NoiseMechanism>().unwrap(),
            NoiseMechanism::Laplace
        );
        assert!(matches!(
            "uniform".parse::<NoiseMechanism>().unwrap_err(),
            LabnavError::InvalidPrivacyConfig(_)
        ));
    }
}
