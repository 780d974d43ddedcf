use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::live::worker::LIVE_PLAYLIST_NAME;
use crate::live::{TunerSnapshot, WatchGrant};

use super::error::{ApiError, ApiResult};
use super::BridgeState;

#[derive(Debug, Deserialize)]
pub struct WatchBody {
    pub channel: String,
    #[serde(rename = "clientId")]
    pub client_id: String,
}

pub async fn watch(
    State(state): State<BridgeState>,
    Json(body): Json<WatchBody>,
) -> ApiResult<Json<WatchGrant>> {
    if body.channel.trim().is_empty() || body.client_id.trim().is_empty() {
        return Err(ApiError::bad_request("channel and clientId are required"));
    }
    let grant = state.pool.watch(&body.channel, &body.client_id).await?;
    Ok(Json(grant))
}

#[derive(Debug, Deserialize)]
pub struct ClientBody {
    #[serde(rename = "clientId")]
    pub client_id: String,
}

pub async fn heartbeat(
    State(state): State<BridgeState>,
    Json(body): Json<ClientBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let known = state.pool.heartbeat(&body.client_id).await;
    Ok(Json(json!({ "known": known })))
}

pub async fn stop(
    State(state): State<BridgeState>,
    Json(body): Json<ClientBody>,
) -> ApiResult<Json<serde_json::Value>> {
    state.pool.release(&body.client_id).await?;
    Ok(Json(json!({ "released": body.client_id })))
}

pub async fn tuners(State(state): State<BridgeState>) -> ApiResult<Json<Vec<TunerSnapshot>>> {
    Ok(Json(state.pool.tuners().await))
}

fn artifact_response(bytes: Vec<u8>, content_type: &'static str) -> Response {
    ([(header::CONTENT_TYPE, content_type)], bytes).into_response()
}

pub async fn playlist(
    State(state): State<BridgeState>,
    Path(tuner_id): Path<String>,
) -> ApiResult<Response> {
    let (bytes, content_type) = state
        .pool
        .worker()
        .read_file(&tuner_id, LIVE_PLAYLIST_NAME)
        .await?;
    Ok(artifact_response(bytes, content_type))
}

pub async fn segment(
    State(state): State<BridgeState>,
    Path((tuner_id, segment)): Path<(String, String)>,
) -> ApiResult<Response> {
    let (bytes, content_type) = state.pool.worker().read_file(&tuner_id, &segment).await?;
    Ok(artifact_response(bytes, content_type))
}
