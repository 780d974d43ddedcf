use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::info;

use crate::transcode::backfill::{BackfillItem, BulkBackfill};
use crate::transcode::sidecar::PLAYLIST_NAME;
use crate::transcode::{TranscodeMetadata, TranscodeMode, TranscodeStatus};

use super::error::{ApiError, ApiResult};
use super::BridgeState;

fn artifact_response(bytes: Vec<u8>, content_type: &'static str) -> Response {
    ([(header::CONTENT_TYPE, content_type)], bytes).into_response()
}

async fn ensure_started(state: &BridgeState, episode_id: i64) -> ApiResult<()> {
    let episode = state.store.episode_by_id(episode_id)?;
    let Some(upstream) = episode.play_url.clone() else {
        return Err(ApiError::not_found(format!(
            "episode {episode_id} has no upstream play url"
        )));
    };
    let show_name = state
        .store
        .series_by_id(episode.series_id)
        .ok()
        .map(|series| series.title);
    let metadata = TranscodeMetadata {
        show_name,
        episode_name: episode.episode_title.clone().or(episode.title.clone()),
        air_date: episode.original_airdate.map(|ts| ts.to_string()),
    };
    state
        .engine
        .start(episode_id, &upstream, TranscodeMode::Interactive, metadata)
        .await?;
    Ok(())
}

/// Playlist request doubles as the on-demand start: a cold cache begins
/// transcoding and the response waits for the playlist to exist.
pub async fn playlist(
    State(state): State<BridgeState>,
    Path(episode_id): Path<i64>,
) -> ApiResult<Response> {
    ensure_started(&state, episode_id).await?;
    let (bytes, content_type) = state.engine.serve_file(episode_id, PLAYLIST_NAME).await?;
    Ok(artifact_response(bytes, content_type))
}

pub async fn segment(
    State(state): State<BridgeState>,
    Path((episode_id, filename)): Path<(i64, String)>,
) -> ApiResult<Response> {
    let (bytes, content_type) = state.engine.serve_file(episode_id, &filename).await?;
    Ok(artifact_response(bytes, content_type))
}

pub async fn status(
    State(state): State<BridgeState>,
    Path(episode_id): Path<i64>,
) -> ApiResult<Json<TranscodeStatus>> {
    Ok(Json(state.engine.status(episode_id).await?))
}

pub async fn overview(State(state): State<BridgeState>) -> ApiResult<Json<Vec<TranscodeStatus>>> {
    Ok(Json(state.engine.overview().await))
}

/// Queue the whole catalog for transcoding; runs in the background and never
/// evicts interactive work.
pub async fn backfill(State(state): State<BridgeState>) -> ApiResult<Json<serde_json::Value>> {
    let mut items = Vec::new();
    for series in state.store.list_series()? {
        let show_name = series.title.clone();
        for episode in state.store.episodes_for_series(series.id)? {
            let Some(upstream) = episode.play_url.clone() else {
                continue;
            };
            items.push(BackfillItem {
                episode_id: episode.id,
                upstream_url: upstream,
                metadata: TranscodeMetadata {
                    show_name: Some(show_name.clone()),
                    episode_name: episode.episode_title.clone().or(episode.title.clone()),
                    air_date: episode.original_airdate.map(|ts| ts.to_string()),
                },
            });
        }
    }
    let queued = items.len();
    let engine = std::sync::Arc::clone(&state.engine);
    tokio::spawn(async move {
        let report = BulkBackfill::new(engine).run(items).await;
        info!(
            completed = report.completed,
            failed = report.failed,
            skipped = report.skipped,
            "background backfill finished"
        );
    });
    Ok(Json(json!({ "queued": queued })))
}
