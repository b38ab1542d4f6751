use labnav_core::NoiseSeed;
use labnav_rag::{
    score_confidence, ConfidenceConfig, PassageMetadata, RerankConfig, Reranker, RetrievalResult,
};
use proptest::prelude::*;

fn candidates(scores: &[f32]) -> Vec<RetrievalResult> {
    scores
        .iter()
        .enumerate()
        .map(|(idx, score)| RetrievalResult {
            content: format!("passage {idx} about rna extraction"),
            metadata: PassageMetadata {
                document_id: format!("doc-{idx}"),
                title: format!("Doc {idx}"),
                doc_type: "protocol".to_string(),
                year: None,
                author: None,
                page: None,
            },
            score: *score,
        })
        .collect()
}

proptest! {
    #[test]
    fn reranked_scores_are_bounded_and_sorted(
        scores in prop::collection::vec(0.0f32..=1.0, 0..20),
        jitter in prop_oneof![Just(0.0f32), 0.01f32..0.2],
    ) {
        let reranker = Reranker::new(RerankConfig { jitter, ..RerankConfig::default() }).unwrap();
        let ranked = reranker.rerank("rna extraction", candidates(&scores), &NoiseSeed::from_bytes(b"q"));
        prop_assert_eq!(ranked.len(), scores.len());
        for window in ranked.windows(2) {
            prop_assert!(window[0].score >= window[1].score);
        }
        for result in &ranked {
            prop_assert!((0.1..=0.99).contains(&result.score));
        }
    }

    #[test]
    fn confidence_stays_within_floor_and_one(scores in prop::collection::vec(0.0f32..=1.0, 0..10)) {
        let config = ConfidenceConfig::default();
        let confidence = score_confidence(&candidates(&scores), &config);
        prop_assert!(confidence >= config.floor);
        prop_assert!(confidence <= 1.0);
    }

    #[test]
    fn rerank_is_deterministic_for_a_seed(scores in prop::collection::vec(0.0f32..=1.0, 1..10)) {
        let reranker = Reranker::new(RerankConfig { jitter: 0.05, ..RerankConfig::default() }).unwrap();
        let seed = NoiseSeed::from_bytes(b"same query");
        let first = reranker.rerank("rna", candidates(&scores), &seed);
        let second = reranker.rerank("rna", candidates(&scores), &seed);
        prop_assert_eq!(first, second);
    }
}
