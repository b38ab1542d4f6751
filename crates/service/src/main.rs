use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{routing::get, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use labnav_core::{build_protector, Fingerprint, LabnavError};
use labnav_rag::{
    AppConfig, CacheStats, DocumentInsert, EmbeddingClient, Eviction, ExtractiveAnswerer,
    PassageStore, PassageText, QueryRequest, QueryResponse, ResponseCache, RetrievalPipeline,
    StoreRetriever,
};

#[derive(Clone)]
struct AppState {
    pipeline: RetrievalPipeline,
    retriever: StoreRetriever,
    stats_top_n: usize,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %format!("{err:#}"), "refusing to start with invalid configuration");
            return Err(err);
        }
    };
    let addr: SocketAddr = config.bind_addr.parse()?;
    // the blocking HTTP embedding client must not be built on a runtime thread
    let state = task::spawn_blocking(move || build_state(&config)).await??;
    let app = router(Arc::new(state));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening" = %addr);
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_state(config: &AppConfig) -> anyhow::Result<AppState> {
    let protector = build_protector(&config.privacy)?;
    let store = PassageStore::open(&config.store_path)?;
    let embeddings = EmbeddingClient::from_config(&config.embedding)?;
    let retriever = StoreRetriever::new(store, embeddings, protector);
    retriever.verify_dimensions()?;
    let cache = ResponseCache::from_config(&config.cache, &config.store_path)?;
    let pipeline = RetrievalPipeline::new(
        config.pipeline.clone(),
        Arc::new(retriever.clone()),
        Arc::new(ExtractiveAnswerer::default()),
        cache,
    )?;
    Ok(AppState {
        pipeline,
        retriever,
        stats_top_n: config.cache.stats_top_n,
    })
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/query", post(handle_query))
        .route(
            "/api/cache",
            get(handle_cache_stats).delete(handle_cache_delete),
        )
        .route("/api/documents", post(handle_documents))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct StatsParams {
    top: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EvictParams {
    fingerprint: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EvictResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    fingerprint: Option<Fingerprint>,
    removed: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentRequest {
    document_id: String,
    title: String,
    doc_type: String,
    #[serde(default)]
    year: Option<String>,
    #[serde(default)]
    author: Option<String>,
    passages: Vec<PassageText>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DocumentResponse {
    document_id: String,
    passages_indexed: usize,
}

// Pipeline work runs to completion on the blocking pool even if the caller
// disconnects, so an admit is never cut short.
async fn handle_query(
    State(state): State<Arc<AppState>>,
    Json(body): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, AppError> {
    let response = task::spawn_blocking(move || state.pipeline.answer(&body))
        .await
        .map_err(AppError::internal)??;
    Ok(Json(response))
}

async fn handle_cache_stats(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatsParams>,
) -> Result<Json<CacheStats>, AppError> {
    let top = params.top.unwrap_or(state.stats_top_n);
    let stats = task::spawn_blocking(move || state.pipeline.cache().stats(top))
        .await
        .map_err(AppError::internal)??;
    Ok(Json(stats))
}

async fn handle_cache_delete(
    State(state): State<Arc<AppState>>,
    Query(params): Query<EvictParams>,
) -> Result<Json<EvictResponse>, AppError> {
    let fingerprint = params
        .fingerprint
        .map(|raw| raw.parse::<Fingerprint>())
        .transpose()?;
    task::spawn_blocking(move || evict_or_clear(state.pipeline.cache(), fingerprint))
        .await
        .map_err(AppError::internal)?
        .map(Json)
}

fn evict_or_clear(
    cache: &ResponseCache,
    fingerprint: Option<Fingerprint>,
) -> Result<EvictResponse, AppError> {
    match fingerprint {
        Some(fingerprint) => match cache.evict(&fingerprint)? {
            Eviction::Deleted => Ok(EvictResponse {
                fingerprint: Some(fingerprint),
                removed: 1,
            }),
            Eviction::NotFound => Err(AppError::NotFound(format!(
                "no cached answer for fingerprint {fingerprint}"
            ))),
        },
        None => Ok(EvictResponse {
            fingerprint: None,
            removed: cache.clear()?,
        }),
    }
}

async fn handle_documents(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DocumentRequest>,
) -> Result<Json<DocumentResponse>, AppError> {
    let response = task::spawn_blocking(move || load_document(&state.retriever, body))
        .await
        .map_err(AppError::internal)??;
    Ok(Json(response))
}

fn load_document(
    retriever: &StoreRetriever,
    body: DocumentRequest,
) -> Result<DocumentResponse, AppError> {
    if body.document_id.trim().is_empty() || body.title.trim().is_empty() {
        return Err(AppError::bad_request("documentId and title are required"));
    }
    if body.doc_type.trim().is_empty() {
        return Err(AppError::bad_request("docType is required"));
    }
    if body.passages.iter().all(|p| p.content.trim().is_empty()) {
        return Err(AppError::bad_request("at least one non-empty passage is required"));
    }
    let passages: Vec<PassageText> = body
        .passages
        .into_iter()
        .filter(|p| !p.content.trim().is_empty())
        .collect();
    let document = DocumentInsert {
        document_id: body.document_id.trim().to_string(),
        title: body.title.trim().to_string(),
        doc_type: body.doc_type.trim().to_string(),
        year: body.year,
        author: body.author,
    };
    let passages_indexed = retriever
        .load_document(&document, &passages)
        .map_err(AppError::internal)?;
    info!(document = %document.document_id, passages = passages_indexed, "document indexed");
    Ok(DocumentResponse {
        document_id: document.document_id,
        passages_indexed,
    })
}

#[derive(Debug, Error)]
enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    fn bad_request<E: ToString>(msg: E) -> Self {
        Self::BadRequest(msg.to_string())
    }

    fn internal<E: Into<anyhow::Error>>(err: E) -> Self {
        Self::Internal(err.into())
    }
}

impl From<LabnavError> for AppError {
    fn from(err: LabnavError) -> Self {
        match err {
            LabnavError::Validation(msg) => AppError::BadRequest(msg),
            other => AppError::Internal(other.into()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            AppError::Internal(err) => {
                error!("internal_error" = %format!("{err:#}"));
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labnav_core::PrivacyConfig;
    use tempfile::TempDir;

    fn test_state() -> (TempDir, Arc<AppState>) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.privacy = PrivacyConfig::disabled();
        config.store_path = dir.path().join("labnav.sqlite").to_string_lossy().into_owned();
        let state = Arc::new(build_state(&config).unwrap());
        (dir, state)
    }

    fn rna_document() -> DocumentRequest {
        DocumentRequest {
            document_id: "rna-extraction".to_string(),
            title: "RNA Extraction Protocol".to_string(),
            doc_type: "protocol".to_string(),
            year: Some("2024".to_string()),
            author: None,
            passages: vec![
                PassageText {
                    content: "To extract RNA, homogenize tissue in TRIzol reagent.".to_string(),
                    page: Some(1),
                },
                PassageText {
                    content: "   ".to_string(),
                    page: Some(2),
                },
            ],
        }
    }

    #[tokio::test]
    async fn query_then_stats_then_evict() {
        let (_dir, state) = test_state();
        let indexed = handle_documents(State(state.clone()), Json(rna_document()))
            .await
            .unwrap();
        assert_eq!(indexed.0.passages_indexed, 1);

        let first = handle_query(
            State(state.clone()),
            Json(QueryRequest::new("how to extract RNA")),
        )
        .await
        .unwrap();
        assert!(!first.0.served_from_cache);
        let second = handle_query(
            State(state.clone()),
            Json(QueryRequest::new("how to extract RNA")),
        )
        .await
        .unwrap();
        assert!(second.0.served_from_cache);

        let stats = handle_cache_stats(State(state.clone()), Query(StatsParams { top: None }))
            .await
            .unwrap();
        assert_eq!(stats.0.size, 1);
        assert_eq!(stats.0.total_hits, 1);

        let evicted = handle_cache_delete(
            State(state.clone()),
            Query(EvictParams {
                fingerprint: Some(first.0.fingerprint.to_hex()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(evicted.0.removed, 1);

        let missing = handle_cache_delete(
            State(state),
            Query(EvictParams {
                fingerprint: Some(first.0.fingerprint.to_hex()),
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(missing, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn empty_query_is_bad_request() {
        let (_dir, state) = test_state();
        let err = handle_query(State(state), Json(QueryRequest::new("")))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unanswerable_query_returns_fallback() {
        let (_dir, state) = test_state();
        let response = handle_query(State(state), Json(QueryRequest::new("anything at all")))
            .await
            .unwrap();
        assert!(response.0.sources.is_empty());
        assert_eq!(response.0.confidence_score, 0.1);
    }

    #[tokio::test]
    async fn clear_without_fingerprint_reports_count() {
        let (_dir, state) = test_state();
        let cleared = handle_cache_delete(State(state), Query(EvictParams { fingerprint: None }))
            .await
            .unwrap();
        assert_eq!(cleared.0.removed, 0);
        assert!(cleared.0.fingerprint.is_none());
    }

    #[tokio::test]
    async fn malformed_fingerprint_is_bad_request() {
        let (_dir, state) = test_state();
        let err = handle_cache_delete(
            State(state),
            Query(EvictParams {
                fingerprint: Some("not-hex".to_string()),
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn changed_embedding_dimensions_prevent_startup() {
        let (dir, state) = test_state();
        handle_documents(State(state), Json(rna_document()))
            .await
            .unwrap();

        let mut config = AppConfig::default();
        config.privacy = PrivacyConfig::disabled();
        config.store_path = dir.path().join("labnav.sqlite").to_string_lossy().into_owned();
        assert!(build_state(&config).is_ok());
        config.embedding.dimensions = 128;
        let err = build_state(&config).err().unwrap();
        assert!(format!("{err:#}").contains("different embedding configuration"));
    }

    #[test]
    fn invalid_privacy_budget_prevents_startup() {
        let mut config = AppConfig::default();
        config.privacy.epsilon = 0.0;
        assert!(build_state(&config).is_err());
    }
}
