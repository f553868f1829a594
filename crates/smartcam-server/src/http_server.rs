/// Live-view HTTP server.
///
/// Endpoints:
///   GET  /video_feed/:id  `multipart/x-mixed-replace` MJPEG of one camera
///   GET  /sensor_status   `{"motion_detected": bool}`
///   POST /sensor_data     push a reading, `{"value": ...}`
///   GET  /cameras         configured cameras with their feed paths
///   GET  /mode            `{"mode": ...}` operation mode
///
/// Video feeds drain the camera's frame buffer, so concurrent viewers of
/// one camera share its frames. Every feed ends when the server shuts down.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use smartcam_core::frames::FrameBuffers;
use smartcam_core::publisher::video_feed_path;
use smartcam_core::registry::DeviceRegistry;
use smartcam_core::sensor::{parse_motion, SensorState};

const FEED_BOUNDARY: &str = "frame";
const EMPTY_BUFFER_SLEEP: Duration = Duration::from_millis(10);

#[derive(Clone)]
pub struct LiveState {
    pub frames: Arc<FrameBuffers>,
    pub sensor: Arc<SensorState>,
    pub registry: Arc<DeviceRegistry>,
    pub cancel: CancellationToken,
    pub mode: Arc<str>,
}

#[derive(Debug, Serialize)]
struct CameraSummary {
    id: u32,
    name: String,
    path: String,
    live: bool,
}

pub fn router(state: LiveState) -> Router {
    Router::new()
        .route("/video_feed/:id", get(video_feed))
        .route("/sensor_status", get(sensor_status))
        .route("/sensor_data", post(sensor_data))
        .route("/cameras", get(cameras))
        .route("/mode", get(mode))
        .with_state(state)
}

/// Serve until the state's cancellation token fires.
pub async fn run(listener: tokio::net::TcpListener, state: LiveState) {
    let cancel = state.cancel.clone();
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "Live view server listening");
    }

    let shutdown = async move { cancel.cancelled().await };
    if let Err(e) = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!("Live view server error: {}", e);
    }
}

// ── Video feed ──────────────────────────────────────────────────────────

async fn video_feed(State(state): State<LiveState>, Path(camera_id): Path<u32>) -> Response {
    if !state.frames.contains(camera_id) {
        return (StatusCode::NOT_FOUND, "Camera not found").into_response();
    }
    debug!(camera_id, "Video feed client connected");

    let stream = futures::stream::unfold(state, move |state| async move {
        loop {
            if state.cancel.is_cancelled() {
                return None;
            }
            if let Some(frame) = state.frames.consume_frame(camera_id) {
                let part = multipart_part(&frame.jpeg);
                return Some((Ok::<Bytes, Infallible>(part), state));
            }
            tokio::time::sleep(EMPTY_BUFFER_SLEEP).await;
        }
    });

    Response::builder()
        .header(
            header::CONTENT_TYPE,
            format!("multipart/x-mixed-replace; boundary={}", FEED_BOUNDARY),
        )
        .body(Body::from_stream(stream))
        .unwrap_or_else(|e| {
            error!(camera_id, error = %e, "Failed to build video feed response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
}

fn multipart_part(jpeg: &[u8]) -> Bytes {
    let mut part = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        FEED_BOUNDARY,
        jpeg.len()
    )
    .into_bytes();
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    Bytes::from(part)
}

// ── Mode ────────────────────────────────────────────────────────────────

async fn mode(State(state): State<LiveState>) -> Json<Value> {
    Json(json!({ "mode": &*state.mode }))
}

// ── Sensor endpoints ────────────────────────────────────────────────────

async fn sensor_status(State(state): State<LiveState>) -> Json<Value> {
    Json(json!({ "motion_detected": state.sensor.get_motion() }))
}

async fn sensor_data(State(state): State<LiveState>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    let Some(value) = body.get("value") else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "status": "error", "message": "No value provided" })),
        );
    };

    let raw = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    match parse_motion(&raw) {
        Some(motion) => {
            let changed = state.sensor.store(motion);
            (
                StatusCode::OK,
                Json(json!({ "status": "success", "motion_detected": motion, "changed": changed })),
            )
        }
        None => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "status": "error", "message": "Invalid value" })),
        ),
    }
}

// ── Camera list ─────────────────────────────────────────────────────────

async fn cameras(State(state): State<LiveState>) -> Json<Vec<CameraSummary>> {
    let list = state
        .registry
        .cameras()
        .iter()
        .map(|entry| CameraSummary {
            id: entry.id,
            name: entry.config.name.clone(),
            path: video_feed_path(entry.id),
            live: state.frames.contains(entry.id),
        })
        .collect();
    Json(list)
}
