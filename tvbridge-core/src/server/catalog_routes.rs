use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::store::models::{Episode, Series};

use super::error::{ApiError, ApiResult};
use super::BridgeState;

/// Episode as served to clients: playback goes through the local HLS proxy,
/// the appliance URL survives as `source_url`.
#[derive(Debug, Serialize)]
pub struct EpisodeResponse {
    pub id: i64,
    pub series_id: i64,
    pub program_id: String,
    pub title: Option<String>,
    pub episode_title: Option<String>,
    pub episode_number: Option<String>,
    pub season: Option<i64>,
    pub episode: Option<i64>,
    pub synopsis: Option<String>,
    pub channel_name: Option<String>,
    pub channel_number: Option<String>,
    pub start_time: i64,
    pub end_time: i64,
    pub duration: i64,
    pub original_airdate: Option<i64>,
    pub record_success: bool,
    pub play_url: String,
    pub source_url: Option<String>,
    pub image_url: Option<String>,
    pub resume_position: i64,
    pub resume_minutes: i64,
    pub watched: bool,
}

impl From<Episode> for EpisodeResponse {
    fn from(episode: Episode) -> Self {
        let resume = episode.canonical_resume();
        Self {
            play_url: format!("/stream/{}/playlist.m3u8", episode.id),
            source_url: episode.play_url.clone(),
            duration: episode.duration(),
            resume_position: resume,
            resume_minutes: resume / 60,
            id: episode.id,
            series_id: episode.series_id,
            program_id: episode.program_id,
            title: episode.title,
            episode_title: episode.episode_title,
            episode_number: episode.episode_number,
            season: episode.season,
            episode: episode.episode,
            synopsis: episode.synopsis,
            channel_name: episode.channel_name,
            channel_number: episode.channel_number,
            start_time: episode.start_time,
            end_time: episode.end_time,
            original_airdate: episode.original_airdate,
            record_success: episode.record_success,
            image_url: episode.image_url,
            watched: episode.watched,
        }
    }
}

pub async fn list_devices(State(state): State<BridgeState>) -> ApiResult<Json<serde_json::Value>> {
    let devices = state.store.list_devices(false)?;
    Ok(Json(json!({ "devices": devices })))
}

pub async fn trigger_discovery(
    State(state): State<BridgeState>,
) -> ApiResult<Json<serde_json::Value>> {
    let appliances = state.discovery.discover().await?;
    state.pool.register_appliances(&appliances).await;
    Ok(Json(json!({
        "discovered": appliances.len(),
        "device_ids": appliances.iter().map(|a| a.device_id.clone()).collect::<Vec<_>>(),
    })))
}

pub async fn trigger_sync(State(state): State<BridgeState>) -> ApiResult<Json<serde_json::Value>> {
    let report = state.sync.sync_all().await?;
    Ok(Json(json!({
        "devices": report.devices,
        "series": report.series,
        "episodes": report.episodes,
    })))
}

pub async fn list_series(State(state): State<BridgeState>) -> ApiResult<Json<Vec<Series>>> {
    Ok(Json(state.store.list_series()?))
}

pub async fn list_episodes(
    State(state): State<BridgeState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<EpisodeResponse>>> {
    // 404 for an unknown series rather than an empty list.
    state.store.series_by_id(id)?;
    let episodes = state
        .store
        .episodes_for_series(id)?
        .into_iter()
        .map(EpisodeResponse::from)
        .collect();
    Ok(Json(episodes))
}

pub async fn get_episode(
    State(state): State<BridgeState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<EpisodeResponse>> {
    let episode = state.store.episode_by_id(id)?;
    Ok(Json(episode.into()))
}

#[derive(Debug, Deserialize)]
pub struct ProgressBody {
    pub position: i64,
    #[serde(default)]
    pub watched: bool,
}

pub async fn put_progress(
    State(state): State<BridgeState>,
    Path(id): Path<i64>,
    Json(body): Json<ProgressBody>,
) -> ApiResult<Json<EpisodeResponse>> {
    if body.position < 0 {
        return Err(ApiError::bad_request("position must be non-negative"));
    }
    let episode = state
        .sync
        .update_progress(id, body.position, body.watched)
        .await?;
    Ok(Json(episode.into()))
}

#[derive(Debug, Deserialize)]
pub struct DeleteParams {
    #[serde(default)]
    pub rerecord: Option<u8>,
}

pub async fn delete_episode(
    State(state): State<BridgeState>,
    Path(id): Path<i64>,
    Query(params): Query<DeleteParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let allow_rerecord = params.rerecord.unwrap_or(0) != 0;
    state.sync.delete_episode(id, allow_rerecord).await?;
    Ok(Json(json!({ "deleted": id })))
}
