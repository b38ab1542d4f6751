use labnav_core::{
    clip_to_norm, l2_norm, protect, DifferentiallyPrivateProtector, EmbeddingProtector,
    NoiseMechanism, NoiseSeed, PrivacyBudget,
};
use proptest::prelude::*;

proptest! {
    #[test]
    fn clipped_norm_never_exceeds_bound(raw in embedding(), clip in 0.1f32..5.0) {
        let clipped = clip_to_norm(&raw, clip);
        let norm = l2_norm(&clipped);
        prop_assert!(norm <= clip * (1.0 + 1e-4));
        if l2_norm(&raw) > clip {
            prop_assert!((norm - clip).abs() <= clip * 1e-4);
        } else {
            prop_assert_eq!(&clipped, &raw);
        }
    }

    #[test]
    fn seeded_protection_is_bit_identical(
        raw in embedding(),
        epsilon in 0.05f32..10.0,
        seed in prop::collection::vec(any::<u8>(), 1..32),
        laplace in any::<bool>(),
    ) {
        let mechanism = if laplace { NoiseMechanism::Laplace } else { NoiseMechanism::Gaussian };
        let budget = PrivacyBudget::new(epsilon, 0.1, 1.0, mechanism).unwrap();
        let seed = NoiseSeed::from_bytes(&seed);
        let a = protect(&raw, &budget, Some(&seed));
        let b = protect(&raw, &budget, Some(&seed));
        let a_bits: Vec<u32> = a.vector().iter().map(|v| v.to_bits()).collect();
        let b_bits: Vec<u32> = b.vector().iter().map(|v| v.to_bits()).collect();
        prop_assert_eq!(a_bits, b_bits);
    }

    #[test]
    fn distance_is_symmetric_with_zero_self_distance(a in embedding_of(12), b in embedding_of(12)) {
        let protector = DifferentiallyPrivateProtector::new(
            PrivacyBudget::new(1.0, 0.1, 1.0, NoiseMechanism::Gaussian).unwrap(),
        );
        let ab = protector.embedding_distance(&a, &b).unwrap();
        let ba = protector.embedding_distance(&b, &a).unwrap();
        prop_assert!((ab - ba).abs() < 1e-5);
        prop_assert!((0.0..=2.0).contains(&ab));
        prop_assert_eq!(protector.embedding_distance(&a, &a).unwrap(), 0.0);
    }
}

#[test]
fn equal_ratio_budgets_have_equal_noise_magnitude() {
    let raw = vec![0.0f32; 4096];
    let mean_abs = |epsilon: f32, sensitivity: f32, label: &[u8]| {
        let budget =
            PrivacyBudget::new(epsilon, sensitivity, 1.0, NoiseMechanism::Gaussian).unwrap();
        let protected = protect(&raw, &budget, Some(&NoiseSeed::from_bytes(label)));
        protected.vector().iter().map(|v| v.abs() as f64).sum::<f64>() / raw.len() as f64
    };
    let a = mean_abs(0.1, 0.1, b"first");
    let b = mean_abs(2.0, 2.0, b"second");
    let c = mean_abs(0.5, 0.5, b"third");
    // E|N(0, 1)| = sqrt(2 / pi)
    let expected = (2.0 / std::f64::consts::PI).sqrt();
    for observed in [a, b, c] {
        assert!((observed - expected).abs() < 0.05, "{observed} vs {expected}");
    }
}

#[test]
fn smaller_epsilon_means_more_noise() {
    let raw = vec![0.0f32; 2048];
    let seed = NoiseSeed::from_bytes(b"epsilon");
    let spread = |epsilon: f32| {
        let budget = PrivacyBudget::new(epsilon, 0.1, 1.0, NoiseMechanism::Laplace).unwrap();
        l2_norm(protect(&raw, &budget, Some(&seed)).vector())
    };
    assert!(spread(0.1) > spread(1.0));
    assert!(spread(1.0) > spread(10.0));
}

fn embedding() -> impl Strategy<Value = Vec<f32>> {
    (1usize..64).prop_flat_map(embedding_of)
}

fn embedding_of(dims: usize) -> impl Strategy<Value = Vec<f32>> {
    prop::collection::vec(-10.0f32..10.0, dims)
}
