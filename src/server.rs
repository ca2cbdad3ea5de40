//! HTTP boundary.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/rag/upload` | Multipart PDF upload, returns session + document ids |
//! | `POST` | `/api/rag/query` | Streamed plain-text answer, chunked as generated |
//! | `DELETE` | `/api/rag/cleanup/{session_id}` | Idempotent session teardown |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! Upload errors are JSON: `{ "error": { "code": "...", "message": "..." } }`.
//! Query errors are a single `"Error: <message>"` line inside the text
//! stream — the client always reads a plain-text body, never a transport
//! error. This module is the only place pipeline errors become responses.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser
//! clients.

use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::embedder::{Embedder, HttpEmbedder};
use crate::error::RagError;
use crate::generate::{Generator, HttpGenerator};
use crate::history::Message;
use crate::ingest::ingest_document;
use crate::query::{stream_answer, QueryRequest};
use crate::session::SessionRegistry;

/// Maximum accepted upload size.
const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

/// Interval between background sweep passes.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);
/// Retry delay after a failed sweep pass.
const SWEEP_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
    pub embedder: Arc<dyn Embedder>,
    pub generator: Arc<dyn Generator>,
    pub config: Arc<Config>,
}

/// Starts the server: builds real HTTP-backed model adapters, spawns the
/// hourly session sweep, and serves until the process is terminated.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let registry = SessionRegistry::new(&config.storage.root)?;
    let embedder: Arc<dyn Embedder> = Arc::new(HttpEmbedder::new(config.embedding.clone())?);
    let generator: Arc<dyn Generator> = Arc::new(HttpGenerator::new(config.generation.clone())?);

    spawn_sweeper(registry.clone());

    let bind_addr = config.server.bind.clone();
    let state = AppState {
        registry,
        embedder,
        generator,
        config: Arc::new(config),
    };

    let app = router(state);
    tracing::info!(bind = %bind_addr, "pdfchat listening");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Background sweep duty: deletes sessions past the idle threshold on a
/// fixed interval. A failed pass logs and retries after a short backoff;
/// it is never fatal to the process.
fn spawn_sweeper(registry: SessionRegistry) {
    tokio::spawn(async move {
        loop {
            match registry.sweep() {
                Ok(_) => tokio::time::sleep(SWEEP_INTERVAL).await,
                Err(e) => {
                    tracing::warn!(error = %e, "session sweep failed, retrying soon");
                    tokio::time::sleep(SWEEP_RETRY_DELAY).await;
                }
            }
        }
    });
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/rag/upload", post(handle_upload))
        .route("/api/rag/query", post(handle_query))
        .route("/api/rag/cleanup/{session_id}", delete(handle_cleanup))
        .route("/health", get(handle_health))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(cors)
        .with_state(state)
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

fn upload_error(err: RagError) -> AppError {
    match err {
        RagError::Validation(msg) => bad_request(msg),
        RagError::UpstreamModel(msg) => AppError {
            status: StatusCode::BAD_GATEWAY,
            code: "upstream_model",
            message: msg,
        },
        other => AppError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "ingestion_failed",
            message: other.to_string(),
        },
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /api/rag/upload ============

#[derive(Serialize)]
struct UploadResponse {
    status: String,
    session_id: String,
    document_id: String,
    message: String,
}

/// Multipart upload: a `file` part (PDF) and an optional `session_id` part.
/// Non-PDF content is rejected before any session is created.
async fn handle_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let mut file_bytes: Option<Bytes> = None;
    let mut file_name = String::new();
    let mut session_id: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("malformed multipart body: {}", e)))?
    {
        match field.name() {
            Some("file") => {
                file_name = field.file_name().unwrap_or_default().to_string();
                file_bytes = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| bad_request(format!("failed to read file: {}", e)))?,
                );
            }
            Some("session_id") => {
                session_id = field.text().await.ok().filter(|s| !s.is_empty());
            }
            _ => {}
        }
    }

    let bytes = file_bytes.ok_or_else(|| bad_request("missing file field"))?;
    if !file_name.to_lowercase().ends_with(".pdf") {
        return Err(bad_request("Only PDF files are allowed"));
    }
    if !bytes.starts_with(b"%PDF") {
        return Err(bad_request("file content is not a PDF"));
    }

    let outcome = ingest_document(
        &state.registry,
        state.embedder.as_ref(),
        &state.config.chunking,
        session_id.as_deref(),
        bytes.to_vec(),
    )
    .await
    .map_err(upload_error)?;

    Ok(Json(UploadResponse {
        status: "success".to_string(),
        session_id: outcome.session_id,
        document_id: outcome.document_id,
        message: "File processed successfully".to_string(),
    }))
}

// ============ POST /api/rag/query ============

#[derive(Deserialize)]
struct QueryBody {
    message: String,
    session_id: String,
    document_id: String,
    #[serde(default)]
    history: Vec<Message>,
}

/// Streamed plain-text answer. Every failure — invalid session, missing
/// document, model errors — becomes a single `"Error: ..."` line in the
/// stream, preserving the uniform client contract.
async fn handle_query(State(state): State<AppState>, Json(body): Json<QueryBody>) -> Response {
    let request = QueryRequest {
        message: body.message,
        session_id: body.session_id,
        document_id: body.document_id,
        history: body.history,
    };

    let stream = match stream_answer(
        &state.registry,
        state.embedder.clone(),
        state.generator.clone(),
        &state.config.retrieval,
        request,
    )
    .await
    {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(error = %e, "query rejected");
            return text_stream_response(Body::from(format!("Error: {}", e)));
        }
    };

    let body_stream = stream.map(|item| {
        let text = match item {
            Ok(text) => text,
            Err(e) => format!("\nError during response generation: {}", e),
        };
        Ok::<_, Infallible>(Bytes::from(text))
    });

    text_stream_response(Body::from_stream(body_stream))
}

fn text_stream_response(body: Body) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

// ============ DELETE /api/rag/cleanup/{session_id} ============

#[derive(Serialize)]
struct CleanupResponse {
    status: String,
}

/// Idempotent: deleting a missing or already-deleted session succeeds.
async fn handle_cleanup(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Json<CleanupResponse> {
    state.registry.delete(&session_id);
    Json(CleanupResponse {
        status: "success".to_string(),
    })
}
