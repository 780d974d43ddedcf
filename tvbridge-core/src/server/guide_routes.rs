use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::guide::RuleRequest;
use crate::store::models::{GuideChannel, GuideProgram, RecordingRule};

use super::error::{ApiError, ApiResult};
use super::BridgeState;

#[derive(Debug, Serialize)]
pub struct ChannelPrograms {
    pub channel: GuideChannel,
    pub programs: Vec<GuideProgram>,
}

pub async fn guide(State(state): State<BridgeState>) -> ApiResult<Json<Vec<ChannelPrograms>>> {
    let window = state.guide.guide_window().await?;
    Ok(Json(
        window
            .into_iter()
            .map(|(channel, programs)| ChannelPrograms { channel, programs })
            .collect(),
    ))
}

#[derive(Debug, Serialize)]
pub struct NowEntry {
    pub channel: GuideChannel,
    pub program: GuideProgram,
}

pub async fn now_playing(State(state): State<BridgeState>) -> ApiResult<Json<Vec<NowEntry>>> {
    let current = state.guide.now_playing().await?;
    Ok(Json(
        current
            .into_iter()
            .map(|(channel, program)| NowEntry { channel, program })
            .collect(),
    ))
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub q: Option<String>,
    pub channel: Option<String>,
    pub limit: Option<usize>,
}

pub async fn search(
    State(state): State<BridgeState>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<Vec<NowEntry>>> {
    let query = params
        .q
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .ok_or_else(|| ApiError::bad_request("query parameter q is required"))?;
    let matches = state
        .guide
        .search(query, params.channel.as_deref(), params.limit.unwrap_or(50))
        .await?;
    Ok(Json(
        matches
            .into_iter()
            .map(|(channel, program)| NowEntry { channel, program })
            .collect(),
    ))
}

pub async fn list_rules(State(state): State<BridgeState>) -> ApiResult<Json<Vec<RecordingRule>>> {
    Ok(Json(state.guide.rules_list().await?))
}

pub async fn add_rule(
    State(state): State<BridgeState>,
    Json(request): Json<RuleRequest>,
) -> ApiResult<Json<Vec<RecordingRule>>> {
    if request.series_id.is_none() && request.datetime_only.is_none() {
        return Err(ApiError::bad_request(
            "a rule needs a SeriesID or a DateTimeOnly",
        ));
    }
    Ok(Json(state.guide.rule_add(&request).await?))
}

pub async fn change_rule(
    State(state): State<BridgeState>,
    Path(rule_id): Path<String>,
    Json(mut request): Json<RuleRequest>,
) -> ApiResult<Json<Vec<RecordingRule>>> {
    request.recording_rule_id = Some(rule_id);
    Ok(Json(state.guide.rule_change(&request).await?))
}

pub async fn delete_rule(
    State(state): State<BridgeState>,
    Path(rule_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.guide.rule_delete(&rule_id).await?;
    Ok(Json(json!({ "deleted": rule_id })))
}
