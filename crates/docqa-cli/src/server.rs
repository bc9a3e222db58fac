//! HTTP transport over the retrieval pipeline.
//!
//! Pipeline calls block (embedding, PDF parsing, the model call), so handlers hand them to
//! tokio's blocking pool and the event loop keeps serving other requests.

use std::sync::Arc;

use anyhow::Context;
use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use docqa_core::{PipelineError, RetrievalPipeline};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

type AppState = Arc<RetrievalPipeline>;

pub fn router(pipeline: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/upload-pdf", post(upload_pdf))
        .route("/ask", post(ask))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(CorsLayer::very_permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(pipeline)
}

/// Serve until Ctrl+C.
pub async fn serve(pipeline: AppState, bind: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(addr = %listener.local_addr()?, "docqa server listening");
    axum::serve(listener, router(pipeline))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for Ctrl+C; running until killed");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

#[derive(Debug, Serialize, Deserialize)]
struct HealthResponse {
    status: String,
    ready: bool,
    chunks: usize,
}

async fn health(State(pipeline): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        ready: pipeline.is_ready(),
        chunks: pipeline.chunk_count(),
    })
}

#[derive(Debug, Serialize, Deserialize)]
struct UploadResponse {
    message: String,
    chunks: usize,
}

/// Multipart form with the document in a `file` field whose filename ends in `.pdf`.
/// Other fields are ignored.
async fn upload_pdf(
    State(pipeline): State<AppState>,
    mut form: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut document = None;
    while let Some(field) = form.next_field().await.map_err(bad_form)? {
        if field.name() != Some("file") {
            continue;
        }
        if !is_pdf_name(field.file_name()) {
            return Err(not_a_pdf());
        }
        document = Some(field.bytes().await.map_err(bad_form)?);
        break;
    }
    let document = document.ok_or_else(not_a_pdf)?;
    let chunks = run_blocking(move || pipeline.ingest(&document)).await?;
    Ok(Json(UploadResponse {
        message: "PDF processed successfully.".into(),
        chunks,
    }))
}

fn is_pdf_name(name: Option<&str>) -> bool {
    name.map_or(false, |n| n.to_ascii_lowercase().ends_with(".pdf"))
}

fn not_a_pdf() -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, "Please upload a PDF file.")
}

fn bad_form(e: MultipartError) -> ApiError {
    warn!(error = %e, "malformed upload");
    ApiError::new(e.status(), "Malformed upload; send the PDF as a `file` form field.")
}

#[derive(Debug, Deserialize)]
struct QuestionRequest {
    question: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct AnswerResponse {
    answer: String,
}

async fn ask(
    State(pipeline): State<AppState>,
    Json(req): Json<QuestionRequest>,
) -> Result<Json<AnswerResponse>, ApiError> {
    let answer = run_blocking(move || pipeline.answer(&req.question)).await?;
    Ok(Json(AnswerResponse { answer }))
}

async fn run_blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, PipelineError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| {
            error!(error = %e, "pipeline task failed");
            ApiError::internal()
        })?
        .map_err(ApiError::from)
}

/// Error body shaped as `{"detail": "..."}`.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    fn internal() -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to process the request.",
        )
    }
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::NotReady => Self::new(
                StatusCode::BAD_REQUEST,
                "Please upload a PDF before asking questions.",
            ),
            PipelineError::EmptyQuestion => {
                Self::new(StatusCode::BAD_REQUEST, "Question cannot be empty.")
            }
            PipelineError::EmptyDocument | PipelineError::Extraction(_) => {
                warn!(error = %e, "rejected uploaded document");
                Self::new(
                    StatusCode::BAD_REQUEST,
                    "No text could be extracted. Please ensure the file is a readable PDF.",
                )
            }
            PipelineError::GenerationUnavailable(_) => {
                error!(error = %e, "failed to generate answer");
                Self::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "The language model is unavailable. Please try again later.",
                )
            }
            PipelineError::Index(_) => {
                error!(error = %e, "pipeline failure");
                Self::internal()
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "detail": self.detail })),
        )
            .into_response()
    }
}
