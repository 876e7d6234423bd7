//! HTTP query interface.
//!
//! Exposes the engine's query operations and the rebuild trigger as a JSON
//! API for the agent and command layers.
//!
//! # Endpoints
//!
//! | Method | Path | Body | Response |
//! |--------|------|------|----------|
//! | `GET`  | `/health` | | status, version, generation, chunk count |
//! | `POST` | `/search` | `{"query", "limit"?}` | `{"results": [{snippet, citation, score}]}` |
//! | `POST` | `/ask` | `{"question"}` | `{text, citations, provider}` |
//! | `POST` | `/explain` | `{"ticker", "setup", "timeframe"?}` | `{text, citations, provider}` |
//! | `POST` | `/rebuild` | | build report |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "rebuild_required", "message": "index was built with ..." } }
//! ```
//!
//! Error codes: `bad_request` (400), `rebuild_required` (409),
//! `build_in_progress` (409), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so browser-based
//! dashboards can call the API directly.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::builder::BuildReport;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::models::{Answer, SearchHit};
use crate::progress::NoProgress;

/// Build the router over a shared engine.
pub fn router(engine: Arc<Engine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/search", post(handle_search))
        .route("/ask", post(handle_ask))
        .route("/explain", post(handle_explain))
        .route("/rebuild", post(handle_rebuild))
        .layer(cors)
        .with_state(engine)
}

/// Serve on `[server].bind` until the process is terminated.
pub async fn run_server(engine: Arc<Engine>) -> anyhow::Result<()> {
    let bind_addr = engine.config().server.bind.clone();
    let app = router(engine);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(bind = %bind_addr, "listening");
    println!("Playbook server listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

impl From<&EngineError> for AppError {
    fn from(err: &EngineError) -> Self {
        let (status, code) = match err {
            EngineError::IndexVersionMismatch { .. } => (StatusCode::CONFLICT, "rebuild_required"),
            EngineError::BuildInProgress => (StatusCode::CONFLICT, "build_in_progress"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        AppError {
            status,
            code,
            message: err.to_string(),
        }
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        AppError::from(&err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<EngineError>() {
            Some(engine_err) => AppError::from(engine_err),
            None => {
                error!(error = %format!("{:#}", err), "request failed");
                AppError {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    code: "internal",
                    message: format!("{:#}", err),
                }
            }
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    generation: Option<String>,
    chunks: usize,
}

async fn handle_health(State(engine): State<Arc<Engine>>) -> Json<HealthResponse> {
    let snapshot = engine.snapshot();
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        generation: snapshot.generation.clone(),
        chunks: snapshot.meta.chunks.len(),
    })
}

// ============ POST /search ============

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<SearchHit>,
}

async fn handle_search(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    if req.limit == Some(0) {
        return Err(bad_request("limit must be at least 1"));
    }
    let results = engine.search(&req.query, req.limit).await?;
    Ok(Json(SearchResponse { results }))
}

// ============ POST /ask ============

#[derive(Deserialize)]
struct AskRequest {
    question: String,
}

async fn handle_ask(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<AskRequest>,
) -> Result<Json<Answer>, AppError> {
    if req.question.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }
    Ok(Json(engine.ask(&req.question).await?))
}

// ============ POST /explain ============

#[derive(Deserialize)]
struct ExplainRequest {
    ticker: String,
    setup: String,
    #[serde(default)]
    timeframe: Option<String>,
}

async fn handle_explain(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<ExplainRequest>,
) -> Result<Json<Answer>, AppError> {
    if req.ticker.trim().is_empty() || req.setup.trim().is_empty() {
        return Err(bad_request("ticker and setup must not be empty"));
    }
    let answer = engine
        .explain(&req.ticker, &req.setup, req.timeframe.as_deref())
        .await?;
    Ok(Json(answer))
}

// ============ POST /rebuild ============

async fn handle_rebuild(State(engine): State<Arc<Engine>>) -> Result<Json<BuildReport>, AppError> {
    Ok(Json(engine.rebuild(&NoProgress).await?))
}
