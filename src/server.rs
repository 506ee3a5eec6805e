//! HTTP surface for the knowledge base engine.
//!
//! # Endpoints
//!
//! | Method   | Path              | Description |
//! |----------|-------------------|-------------|
//! | `POST`   | `/upload`         | Batch upload, per-file results |
//! | `POST`   | `/upload-large`   | Single oversized file, extended budget |
//! | `GET`    | `/upload-status`  | ProcessingJob snapshots |
//! | `POST`   | `/search`         | Hybrid retrieval, optional answer + verification |
//! | `GET`    | `/statistics`     | Aggregate corpus and queue counts |
//! | `GET`    | `/health`         | Health check (returns version) |
//! | `DELETE` | `/documents/{id}` | Cascade delete one document |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `payload_too_large`
//! (413), `internal` (500). Per-file failures inside a batch (including a
//! full ingestion queue) are reported in that file's result entry, not as a
//! request-level error.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted; the engine sits behind
//! the application backend, not on a public edge.

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::engine::{Engine, SearchRequest, UploadMeta};
use crate::models::{Citation, JobSnapshot, SearchFilters, SearchResult, UploadOutcome};
use crate::search::SearchMode;
use crate::stats::StatsSnapshot;
use crate::verify::VerificationReport;

pub async fn run_server(engine: Arc<Engine>) -> anyhow::Result<()> {
    let bind_addr = engine.config.server.bind.clone();
    let body_limit = engine.config.upload.max_large_file_bytes + 64 * 1024;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/upload", post(handle_upload))
        .route("/upload-large", post(handle_upload_large))
        .route("/upload-status", get(handle_upload_status))
        .route("/search", post(handle_search))
        .route("/statistics", get(handle_statistics))
        .route("/health", get(handle_health))
        .route("/documents/{id}", delete(handle_delete_document))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .with_state(engine);

    tracing::info!(bind = %bind_addr, "knowledge base server listening");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
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

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn payload_too_large(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::PAYLOAD_TOO_LARGE,
        code: "payload_too_large".to_string(),
        message: message.into(),
    }
}

fn internal(err: anyhow::Error) -> AppError {
    tracing::error!(error = %err, "request failed");
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: err.to_string(),
    }
}

// ============ POST /upload, POST /upload-large ============

#[derive(Serialize)]
struct UploadResponse {
    results: Vec<UploadOutcome>,
    summary: UploadSummary,
}

#[derive(Serialize)]
struct UploadSummary {
    successful: usize,
    failed: usize,
    skipped: usize,
}

impl UploadSummary {
    fn of(results: &[UploadOutcome]) -> Self {
        let mut summary = UploadSummary {
            successful: 0,
            failed: 0,
            skipped: 0,
        };
        for outcome in results {
            match outcome.status.as_str() {
                "success" => summary.successful += 1,
                "skipped" => summary.skipped += 1,
                _ => summary.failed += 1,
            }
        }
        summary
    }
}

/// One file pulled out of a multipart body.
struct UploadedFile {
    filename: String,
    bytes: Vec<u8>,
}

/// Collects `file` parts and batch-level metadata fields (`category`,
/// `section`, `year`) from a multipart body.
async fn read_multipart(
    mut multipart: Multipart,
) -> Result<(Vec<UploadedFile>, UploadMeta), AppError> {
    let mut files = Vec::new();
    let mut meta = UploadMeta::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("malformed multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "category" | "section" | "year" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| bad_request(format!("unreadable field '{}': {}", name, e)))?;
                let value = value.trim().to_string();
                if value.is_empty() {
                    continue;
                }
                match name.as_str() {
                    "category" => meta.category = Some(value),
                    "section" => meta.section = Some(value),
                    "year" => {
                        meta.year = Some(value.parse::<i64>().map_err(|_| {
                            bad_request(format!("year must be an integer, got '{}'", value))
                        })?)
                    }
                    _ => unreachable!(),
                }
            }
            _ => {
                let filename = field
                    .file_name()
                    .map(|f| f.to_string())
                    .filter(|f| !f.is_empty())
                    .ok_or_else(|| bad_request("file part is missing a filename"))?;
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| bad_request(format!("unreadable file '{}': {}", filename, e)))?
                    .to_vec();
                files.push(UploadedFile { filename, bytes });
            }
        }
    }
    Ok((files, meta))
}

async fn handle_upload(
    State(engine): State<Arc<Engine>>,
    multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let (files, meta) = read_multipart(multipart).await?;
    let upload = &engine.config.upload;

    if files.is_empty() {
        return Err(bad_request("no files in request"));
    }
    if files.len() > upload.max_files_per_batch {
        return Err(bad_request(format!(
            "too many files: {} exceeds the batch limit of {}",
            files.len(),
            upload.max_files_per_batch
        )));
    }

    let mut results = Vec::with_capacity(files.len());
    for file in files {
        if file.bytes.len() > upload.max_file_bytes {
            results.push(UploadOutcome::error(
                &file.filename,
                format!(
                    "file exceeds {} bytes; use /upload-large",
                    upload.max_file_bytes
                ),
            ));
            continue;
        }
        results.push(engine.ingest_file(&file.filename, file.bytes, &meta).await);
    }
    let summary = UploadSummary::of(&results);
    Ok(Json(UploadResponse { results, summary }))
}

async fn handle_upload_large(
    State(engine): State<Arc<Engine>>,
    multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let (files, meta) = read_multipart(multipart).await?;
    let upload = &engine.config.upload;

    if files.len() != 1 {
        return Err(bad_request(format!(
            "upload-large accepts exactly one file, got {}",
            files.len()
        )));
    }
    let Some(file) = files.into_iter().next() else {
        return Err(bad_request("no file in request".to_string()));
    };
    if file.bytes.len() > upload.max_large_file_bytes {
        return Err(payload_too_large(format!(
            "file exceeds the large-upload limit of {} bytes",
            upload.max_large_file_bytes
        )));
    }

    let outcome = engine.ingest_file(&file.filename, file.bytes, &meta).await;
    let results = vec![outcome];
    let summary = UploadSummary::of(&results);
    Ok(Json(UploadResponse { results, summary }))
}

// ============ GET /upload-status ============

#[derive(Serialize)]
struct UploadStatusResponse {
    jobs: Vec<JobSnapshot>,
}

async fn handle_upload_status(State(engine): State<Arc<Engine>>) -> Json<UploadStatusResponse> {
    Json(UploadStatusResponse {
        jobs: engine.job_snapshots(),
    })
}

// ============ POST /search ============

#[derive(Deserialize)]
struct SearchRequestBody {
    query: String,
    top_k: Option<usize>,
    min_score: Option<f64>,
    search_mode: Option<String>,
    alpha: Option<f64>,
    #[serde(default)]
    filters: SearchFilters,
    #[serde(default)]
    allow_fallback: bool,
    #[serde(default)]
    synthesize_answer: bool,
    #[serde(default)]
    verify_answer: bool,
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<SearchResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    answer: Option<String>,
    /// `[n]` markers in `answer` map to `citations[n-1]`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    citations: Vec<Citation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    verification: Option<VerificationReport>,
    fallback_used: bool,
}

async fn handle_search(
    State(engine): State<Arc<Engine>>,
    Json(body): Json<SearchRequestBody>,
) -> Result<Json<SearchResponse>, AppError> {
    if body.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    if let Some(alpha) = body.alpha {
        if !(0.0..=1.0).contains(&alpha) {
            return Err(bad_request("alpha must be in [0.0, 1.0]"));
        }
    }
    if body.top_k == Some(0) {
        return Err(bad_request("top_k must be >= 1"));
    }

    let mut options = engine.default_options();
    if let Some(top_k) = body.top_k {
        options.top_k = top_k;
    }
    if let Some(min_score) = body.min_score {
        options.min_score = min_score;
    }
    if let Some(alpha) = body.alpha {
        options.alpha = alpha;
    }
    if let Some(ref mode) = body.search_mode {
        options.mode = SearchMode::parse(mode)
            .ok_or_else(|| bad_request(format!("unknown search_mode: '{}'", mode)))?;
    }
    options.filters = body.filters;
    options.allow_fallback = body.allow_fallback;

    let request = SearchRequest {
        query: body.query,
        options,
        synthesize_answer: body.synthesize_answer,
        verify_answer: body.verify_answer,
    };

    let outcome = engine.search(&request).await.map_err(internal)?;
    let (answer, citations) = match outcome.answer {
        Some(a) => (Some(a.text), a.citations),
        None => (None, Vec::new()),
    };
    Ok(Json(SearchResponse {
        results: outcome.results,
        answer,
        citations,
        verification: outcome.verification,
        fallback_used: outcome.fallback_used,
    }))
}

// ============ GET /statistics ============

async fn handle_statistics(State(engine): State<Arc<Engine>>) -> Json<StatsSnapshot> {
    Json(engine.statistics())
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

// ============ DELETE /documents/{id} ============

#[derive(Serialize)]
struct DeleteResponse {
    deleted: bool,
    document_id: String,
}

async fn handle_delete_document(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> Result<Json<DeleteResponse>, AppError> {
    let deleted = engine.delete_document(&id).await.map_err(internal)?;
    if !deleted {
        return Err(not_found(format!("document not found: {}", id)));
    }
    Ok(Json(DeleteResponse {
        deleted: true,
        document_id: id,
    }))
}
