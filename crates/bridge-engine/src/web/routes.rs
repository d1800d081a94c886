//! `/api/devices...` handlers (§6). Grounded directly on `control_api/routes.rs`'s
//! `AppState`+`Router`+handler-fn+`Json(...).into_response()` pattern, adapted from its
//! single-manager-multiplexing model to per-device-id routing via axum's `Path`
//! extractor.

use crate::dlna::SnapshotCache;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use bridge_core::{Command, DspConfig, EventBus};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Clone)]
pub struct AppState {
    pub bus: EventBus,
    pub snapshots: SnapshotCache,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/devices", get(list_devices))
        .route("/api/devices/:id/dsp", get(get_dsp).post(set_dsp))
        .route("/api/devices/:id/dsp/reset", post(reset_dsp))
        .route("/api/devices/:id/volume", post(set_volume))
        .with_state(state)
}

#[derive(Serialize)]
struct DeviceSummary {
    device_id: String,
    name: String,
    kind: Option<bridge_core::DeviceKind>,
    transport_state: bridge_core::TransportState,
    volume: u8,
    muted: bool,
    metadata: bridge_core::TrackMetadata,
    dsp_enabled: bool,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

async fn list_devices(State(state): State<AppState>) -> Response {
    debug!("GET /api/devices");
    let summaries: Vec<DeviceSummary> = state
        .snapshots
        .all()
        .await
        .into_iter()
        .map(|s| DeviceSummary {
            device_id: s.device_id,
            name: s.display_name,
            kind: s.kind,
            transport_state: s.transport_state,
            volume: s.volume,
            muted: s.muted,
            metadata: s.metadata,
            dsp_enabled: s.dsp_enabled,
        })
        .collect();
    Json(summaries).into_response()
}

async fn get_dsp(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.snapshots.get(&id).await {
        Some(snapshot) => Json(snapshot.dsp_config).into_response(),
        None => not_found(&id),
    }
}

#[derive(Deserialize)]
struct SetDspRequest {
    enabled: bool,
    config: DspConfig,
}

async fn set_dsp(State(state): State<AppState>, Path(id): Path<String>, Json(req): Json<SetDspRequest>) -> Response {
    if let Err(message) = req.config.validate() {
        return (StatusCode::BAD_REQUEST, Json(ErrorBody { error: message })).into_response();
    }
    info!(device_id = %id, "POST /api/devices/{id}/dsp");
    state.bus.publish_command(Command::SetDsp { device_id: id, enabled: req.enabled, config: req.config });
    StatusCode::ACCEPTED.into_response()
}

async fn reset_dsp(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    info!(device_id = %id, "POST /api/devices/{id}/dsp/reset");
    state.bus.publish_command(Command::ResetDsp { device_id: id });
    StatusCode::ACCEPTED.into_response()
}

#[derive(Deserialize)]
struct SetVolumeRequest {
    volume: Option<u8>,
    muted: Option<bool>,
}

async fn set_volume(State(state): State<AppState>, Path(id): Path<String>, Json(req): Json<SetVolumeRequest>) -> Response {
    if let Some(volume) = req.volume {
        state.bus.publish_command(Command::SetVolume { device_id: id.clone(), volume: volume.min(100) });
    }
    if let Some(muted) = req.muted {
        state.bus.publish_command(Command::SetMute { device_id: id, muted });
    }
    StatusCode::ACCEPTED.into_response()
}

fn not_found(device_id: &str) -> Response {
    (StatusCode::NOT_FOUND, Json(ErrorBody { error: format!("unknown device: {device_id}") })).into_response()
}
