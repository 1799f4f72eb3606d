// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! HTTP API — thin handlers over the catalogue and supervisor.
//!
//! Endpoints:
//!   GET    /api/status                  → engine status (JSON)
//!   GET    /api/streams                 → per-stream status + recording stats
//!   GET    /api/recordings              → filtered/sorted/paged recordings
//!   GET    /api/recordings/{id}         → one recording
//!   DELETE /api/recordings/{id}         → delete row + files
//!   GET    /api/alerts                  → alert view with per-class counts
//!   GET    /api/stats/objects           → per-class recording counts
//!   GET    /api/stats/times             → hour/weekday histograms
//!   GET    /api/video/{stream_id}       → MJPEG of annotated frames
//!   GET    /recordings/{path}           → clip/thumbnail files (validated)

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::catalogue::{Page, RecordingFilter, SortKey, SortOrder};
use crate::frame::Frame;
use crate::supervisor::Supervisor;

/// Shared state passed to all handlers.
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
}

const ALLOWED_FILE_EXTENSIONS: [&str; 5] = ["mp4", "jpg", "jpeg", "png", "webm"];
const MJPEG_BOUNDARY: &str = "frame";

// ──────────────── request types ───────────────────────────────────────────

#[derive(Deserialize)]
pub struct RecordingsParams {
    stream_id: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
    object_type: Option<String>,
    min_confidence: Option<f64>,
    #[serde(default = "default_sort_by")]
    sort_by: String,
    #[serde(default = "default_sort_order")]
    sort_order: String,
    #[serde(default = "default_limit")]
    limit: u32,
    #[serde(default)]
    offset: u32,
}

#[derive(Deserialize)]
pub struct AlertsParams {
    start_date: Option<String>,
    end_date: Option<String>,
    object_type: Option<String>,
    #[serde(default = "default_alert_confidence")]
    min_confidence: f64,
    #[serde(default = "default_limit")]
    limit: u32,
    #[serde(default)]
    offset: u32,
}

#[derive(Deserialize)]
pub struct ObjectStatsParams {
    start_date: Option<String>,
    end_date: Option<String>,
    stream_id: Option<String>,
}

#[derive(Deserialize)]
pub struct TimeStatsParams {
    object_type: Option<String>,
    #[serde(default = "default_days")]
    days: u32,
    stream_id: Option<String>,
}

fn default_sort_by() -> String { "timestamp".into() }
fn default_sort_order() -> String { "desc".into() }
fn default_limit() -> u32 { 100 }
fn default_alert_confidence() -> f64 { 0.5 }
fn default_days() -> u32 { 7 }

// ──────────────── router ──────────────────────────────────────────────────

/// Build the axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/status", get(handle_status))
        .route("/api/streams", get(handle_streams))
        .route(
            "/api/recordings",
            get(handle_list_recordings),
        )
        .route(
            "/api/recordings/{id}",
            get(handle_get_recording).delete(handle_delete_recording),
        )
        .route("/api/alerts", get(handle_alerts))
        .route("/api/stats/objects", get(handle_object_stats))
        .route("/api/stats/times", get(handle_time_stats))
        .route("/api/video/{stream_id}", get(handle_video))
        .route("/recordings/{*path}", get(handle_recording_file))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn start_server(state: Arc<AppState>, port: u16) {
    let app = build_router(state);
    let addr = format!("0.0.0.0:{}", port);
    info!(port, "HTTP API listening on http://{}", addr);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "Failed to bind HTTP server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "HTTP server error");
    }
}

// ──────────────── status handlers ─────────────────────────────────────────

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let streams: Vec<serde_json::Value> = state
        .supervisor
        .stream_statuses()
        .into_iter()
        .map(|(id, name, status)| {
            serde_json::json!({
                "stream_id": id.to_string(),
                "name": name,
                "status": status,
            })
        })
        .collect();

    let total_recordings = state
        .supervisor
        .catalogue()
        .count(&RecordingFilter::default())
        .unwrap_or(0);

    axum::Json(serde_json::json!({
        "streams": streams,
        "total_recordings": total_recordings,
    }))
}

async fn handle_streams(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let catalogue = state.supervisor.catalogue();
    let streams: Vec<serde_json::Value> = state
        .supervisor
        .stream_statuses()
        .into_iter()
        .map(|(id, name, status)| {
            let stats = catalogue.stream_stats(&id.to_string()).ok();
            serde_json::json!({
                "stream_id": id.to_string(),
                "name": name,
                "status": status,
                "recording_stats": stats,
            })
        })
        .collect();

    axum::Json(serde_json::json!({ "streams": streams }))
}

// ──────────────── catalogue handlers ──────────────────────────────────────

async fn handle_list_recordings(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RecordingsParams>,
) -> Response {
    let filter = RecordingFilter {
        stream_id: params.stream_id,
        start_date: params.start_date,
        end_date: params.end_date,
        object_class: params.object_type,
        min_confidence: params.min_confidence,
    };
    let page = Page { limit: params.limit, offset: params.offset };
    let sort = SortKey::parse(&params.sort_by);
    let order = SortOrder::parse(&params.sort_order);

    let catalogue = state.supervisor.catalogue();
    let result = catalogue
        .count(&filter)
        .and_then(|total| catalogue.list(&filter, sort, order, page).map(|rows| (total, rows)));
    match result {
        Ok((total, rows)) => axum::Json(serde_json::json!({
            "total": total,
            "offset": params.offset,
            "limit": params.limit.min(1000),
            "recordings": rows,
        }))
        .into_response(),
        Err(e) => internal_error(e),
    }
}

async fn handle_get_recording(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Response {
    match state.supervisor.catalogue().get(id) {
        Ok(Some(row)) => axum::Json(row).into_response(),
        Ok(None) => not_found(format!("Recording {id} not found")),
        Err(e) => internal_error(e),
    }
}

async fn handle_delete_recording(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Response {
    match state.supervisor.catalogue().delete(id) {
        Ok(true) => axum::Json(serde_json::json!({ "status": "deleted", "id": id }))
            .into_response(),
        Ok(false) => not_found(format!("Recording {id} not found")),
        Err(e) => internal_error(e),
    }
}

async fn handle_alerts(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AlertsParams>,
) -> Response {
    let filter = RecordingFilter {
        stream_id: None,
        start_date: params.start_date,
        end_date: params.end_date,
        object_class: params.object_type,
        min_confidence: Some(params.min_confidence),
    };
    let page = Page { limit: params.limit, offset: params.offset };

    match state.supervisor.catalogue().alerts(&filter, page) {
        Ok((total, alerts)) => axum::Json(serde_json::json!({
            "total": total,
            "offset": params.offset,
            "limit": params.limit.min(1000),
            "alerts": alerts,
        }))
        .into_response(),
        Err(e) => internal_error(e),
    }
}

async fn handle_object_stats(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ObjectStatsParams>,
) -> Response {
    let filter = RecordingFilter {
        stream_id: params.stream_id,
        start_date: params.start_date,
        end_date: params.end_date,
        object_class: None,
        min_confidence: None,
    };
    match state.supervisor.catalogue().object_stats(&filter) {
        Ok(stats) => axum::Json(serde_json::json!({ "stats": stats })).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn handle_time_stats(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TimeStatsParams>,
) -> Response {
    if params.days == 0 || params.days > 90 {
        return (
            StatusCode::BAD_REQUEST,
            axum::Json(serde_json::json!({ "error": "days must be in (0, 90]" })),
        )
            .into_response();
    }
    match state.supervisor.catalogue().time_stats(
        params.object_type.as_deref(),
        params.days,
        params.stream_id.as_deref(),
    ) {
        Ok(stats) => axum::Json(serde_json::json!({ "stats": stats })).into_response(),
        Err(e) => internal_error(e),
    }
}

// ──────────────── video delivery ──────────────────────────────────────────

/// MJPEG stream of the latest annotated frame for one stream.
async fn handle_video(
    State(state): State<Arc<AppState>>,
    Path(stream_id): Path<String>,
) -> Response {
    let Ok(stream_id) = stream_id.parse::<Uuid>() else {
        return not_found("Invalid stream id".into());
    };
    let Some(mut rx) = state.supervisor.annotated_frames(stream_id) else {
        return not_found(format!("Stream {stream_id} not found"));
    };

    let stream = async_stream::stream! {
        loop {
            if rx.changed().await.is_err() {
                break;
            }
            let frame = rx.borrow_and_update().clone();
            let Some(frame) = frame else { continue };
            if let Some(part) = mjpeg_part(&frame) {
                yield Ok::<Bytes, std::convert::Infallible>(part);
            }
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(
            "content-type",
            format!("multipart/x-mixed-replace; boundary={MJPEG_BOUNDARY}"),
        )
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Encode one frame as a multipart MJPEG chunk.
fn mjpeg_part(frame: &Frame) -> Option<Bytes> {
    use image::ImageEncoder;

    let img = image::RgbImage::from_raw(frame.width, frame.height, frame.pixels.to_vec())?;
    let mut jpeg = Vec::new();
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, 80);
    encoder
        .write_image(
            img.as_raw(),
            frame.width,
            frame.height,
            image::ExtendedColorType::Rgb8,
        )
        .ok()?;

    let mut part = Vec::with_capacity(jpeg.len() + 128);
    part.extend_from_slice(
        format!(
            "--{MJPEG_BOUNDARY}\r\ncontent-type: image/jpeg\r\ncontent-length: {}\r\n\r\n",
            jpeg.len()
        )
        .as_bytes(),
    );
    part.extend_from_slice(&jpeg);
    part.extend_from_slice(b"\r\n");
    Some(Bytes::from(part))
}

// ──────────────── file serving ────────────────────────────────────────────

/// Serve a clip or thumbnail. The requested path must canonicalize to a
/// descendant of the recordings directory and carry an allowed extension;
/// anything else is a 403.
async fn handle_recording_file(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
) -> Response {
    let root = match state.supervisor.recordings_dir().canonicalize() {
        Ok(r) => r,
        Err(_) => return not_found("Recording directory not available".into()),
    };
    let requested = match root.join(&path).canonicalize() {
        Ok(p) => p,
        Err(_) => return not_found(format!("File not found: {path}")),
    };

    if !requested.starts_with(&root) {
        return forbidden("Access denied");
    }
    if !requested.is_file() {
        return forbidden("Not a file");
    }
    let extension_ok = requested
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| ALLOWED_FILE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false);
    if !extension_ok {
        return forbidden("File type not allowed");
    }

    match tokio::fs::read(&requested).await {
        Ok(data) => {
            let content_type = content_type_for(&requested);
            ([("content-type", content_type)], data).into_response()
        }
        Err(e) => internal_error(crate::error::EngineError::Io(e)),
    }
}

fn content_type_for(path: &PathBuf) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        _ => "application/octet-stream",
    }
}

// ──────────────── error helpers ───────────────────────────────────────────

fn not_found(message: String) -> Response {
    (
        StatusCode::NOT_FOUND,
        axum::Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

fn forbidden(message: &str) -> Response {
    (
        StatusCode::FORBIDDEN,
        axum::Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

fn internal_error(e: crate::error::EngineError) -> Response {
    error!(error = %e, "API handler error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        axum::Json(serde_json::json!({ "error": e.to_string() })),
    )
        .into_response()
}
