pub mod answer;
pub mod cache;
pub mod cache_store;
pub mod config;
pub mod embedding;
pub mod pipeline;
pub mod rerank;
pub mod retrieval;
pub mod store;

pub use answer::{build_prompt, AnswerGenerator, ExtractiveAnswerer, FALLBACK_ANSWER};
pub use cache::{
    Admission, CacheAdmission, CacheBackendKind, CacheConfig, CacheLookup, CacheRecord,
    CacheStats, DocTypeCount, Eviction, ResponseCache, TopRecord,
};
pub use cache_store::{CacheStore, MemoryCacheStore, SqliteCacheStore};
pub use config::AppConfig;
pub use embedding::{EmbeddingBackend, EmbeddingClient, EmbeddingConfig};
pub use pipeline::{PipelineConfig, QueryRequest, QueryResponse, RetrievalPipeline};
pub use rerank::{lexical_overlap, score_confidence, ConfidenceConfig, RerankConfig, Reranker};
pub use retrieval::{
    PassageMetadata, PassageText, RetrievalResult, Retriever, SourceRef, StoreRetriever,
};
pub use store::{DocumentInsert, PassageRow, PassageStore, SearchFilters};
