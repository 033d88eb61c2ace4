//! JSON HTTP surface over the batch coordinator.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use fleet_core::Listing;
use fleet_sync::{BatchCoordinator, BatchReport, OutcomeCounts, SyncConfig, SyncError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fleet-web";

const MAX_UPLOAD_BYTES: usize = 32 << 20;

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("FLEET_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<BatchCoordinator>,
}

impl AppState {
    pub fn new(coordinator: BatchCoordinator) -> Self {
        Self {
            coordinator: Arc::new(coordinator),
        }
    }
}

#[derive(Debug, Deserialize)]
struct UploadQuery {
    file_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RecordsQuery {
    #[serde(default)]
    changed_only: bool,
}

#[derive(Debug, Deserialize)]
struct ConfirmRequest {
    confirm: String,
}

#[derive(Debug, Serialize)]
struct UploadSummary {
    run_id: Uuid,
    rows_processed: usize,
    #[serde(flatten)]
    counts: OutcomeCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    archived_path: Option<String>,
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    records: Vec<Listing>,
    file_name: String,
    files: Vec<String>,
    summary: UploadSummary,
}

impl From<BatchReport> for UploadResponse {
    fn from(report: BatchReport) -> Self {
        Self {
            records: report.listings,
            file_name: report.source_name,
            files: report.files,
            summary: UploadSummary {
                run_id: report.run_id,
                rows_processed: report.rows_processed,
                counts: report.counts,
                archived_path: report.archived_path,
            },
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/variants", get(variants_handler))
        .route("/api/{variant}/upload", post(upload_handler))
        .route("/api/{variant}/records", get(records_handler))
        .route("/api/{variant}/files", get(files_handler))
        .route("/api/{variant}/clear-changed-columns", post(clear_changed_handler))
        .route("/api/{variant}/delete-all-records", post(delete_all_handler))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(SyncConfig::from_env(), WebConfig::from_env()).await
}

/// Opens the store (running migrations), then serves until the listener fails.
pub async fn serve(sync: SyncConfig, web: WebConfig) -> anyhow::Result<()> {
    let coordinator = BatchCoordinator::from_config(&sync, true).await?;
    info!(variants = ?coordinator.variants().names(), "variants loaded");

    let listener = TcpListener::bind(("0.0.0.0", web.port))
        .await
        .with_context(|| format!("binding port {}", web.port))?;
    info!(port = web.port, "listening");
    axum::serve(listener, app(AppState::new(coordinator))).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn variants_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.coordinator.variants().names()).into_response()
}

async fn upload_handler(
    State(state): State<Arc<AppState>>,
    Path(variant): Path<String>,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> Response {
    let Some(file_name) = query.file_name.filter(|n| !n.trim().is_empty()) else {
        return bad_request("file_name query parameter is required");
    };
    if body.is_empty() {
        return bad_request("request body must contain the snapshot file");
    }
    match state.coordinator.run_bytes(&variant, &file_name, &body).await {
        Ok(report) => Json(UploadResponse::from(report)).into_response(),
        Err(err) => sync_error(err),
    }
}

async fn records_handler(
    State(state): State<Arc<AppState>>,
    Path(variant): Path<String>,
    Query(query): Query<RecordsQuery>,
) -> Response {
    match state.coordinator.list(&variant, query.changed_only).await {
        Ok(listings) => Json(listings).into_response(),
        Err(err) => sync_error(err),
    }
}

async fn files_handler(State(state): State<Arc<AppState>>, Path(variant): Path<String>) -> Response {
    match state.coordinator.files(&variant) {
        Ok(files) => Json(files).into_response(),
        Err(err) => sync_error(err),
    }
}

async fn clear_changed_handler(
    State(state): State<Arc<AppState>>,
    Path(variant): Path<String>,
) -> Response {
    match state.coordinator.clear_change_sets(&variant).await {
        Ok(rows) => Json(json!({
            "message": "changed columns cleared",
            "rows_affected": rows,
        }))
        .into_response(),
        Err(err) => sync_error(err),
    }
}

async fn delete_all_handler(
    State(state): State<Arc<AppState>>,
    Path(variant): Path<String>,
    payload: Result<Json<ConfirmRequest>, JsonRejection>,
) -> Response {
    let confirmed = matches!(&payload, Ok(Json(req)) if req.confirm == "delete");
    if !confirmed {
        return bad_request(r#"to delete all records, send JSON: {"confirm": "delete"}"#);
    }
    match state.coordinator.delete_all(&variant).await {
        Ok(rows) => Json(json!({
            "message": "all records deleted",
            "rows_deleted": rows,
        }))
        .into_response(),
        Err(err) => sync_error(err),
    }
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

fn sync_error(err: SyncError) -> Response {
    let status = match &err {
        SyncError::UnknownVariant(_) => StatusCode::NOT_FOUND,
        SyncError::Snapshot(_) => StatusCode::BAD_REQUEST,
        SyncError::Store(_) => {
            error!(error = %err, "request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}
