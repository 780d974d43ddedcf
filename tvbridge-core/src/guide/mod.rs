//! Electronic program guide and recording rules. The vendor cloud is the
//! system of record; this plane keeps a freshness-gated local cache and
//! brokers rule mutations, fanning a resync signal out to the appliances.

use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::appliance::ApplianceClient;
use crate::config::GuideSection;
use crate::store::guide::GuideProgramUpsert;
use crate::store::models::{Device, GuideChannel, GuideProgram, RecordingRule};
use crate::store::{MediaStore, StoreError};

const CLOUD_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum GuideError {
    #[error("cloud authorization expired")]
    AuthExpired,
    #[error("no appliance credential available for the cloud")]
    MissingCredential,
    #[error("cloud request failed: {0}")]
    Http(reqwest::Error),
    #[error("cloud returned status {status}")]
    Upstream { status: u16 },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub type GuideResult<T> = Result<T, GuideError>;

/// Loosely typed identifiers arrive as numbers or strings depending on the
/// cloud endpoint; normalize at the edge.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum IdValue {
    Num(i64),
    Str(String),
}

impl IdValue {
    fn into_string(self) -> String {
        match self {
            IdValue::Num(value) => value.to_string(),
            IdValue::Str(value) => value,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct CloudGuideProgram {
    #[serde(rename = "SeriesID")]
    series_id: IdValue,
    #[serde(rename = "Title", default)]
    title: Option<String>,
    #[serde(rename = "EpisodeTitle", default)]
    episode_title: Option<String>,
    #[serde(rename = "Synopsis", default)]
    synopsis: Option<String>,
    #[serde(rename = "StartTime")]
    start_time: i64,
    #[serde(rename = "EndTime")]
    end_time: i64,
    #[serde(rename = "OriginalAirdate", default)]
    original_airdate: Option<i64>,
    #[serde(rename = "ImageURL", default)]
    image_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct CloudGuideChannel {
    #[serde(rename = "GuideNumber")]
    guide_number: IdValue,
    #[serde(rename = "GuideName", default)]
    guide_name: Option<String>,
    #[serde(rename = "ImageURL", default)]
    image_url: Option<String>,
    #[serde(rename = "Guide", default)]
    programs: Vec<CloudGuideProgram>,
}

#[derive(Debug, Clone, Deserialize)]
struct CloudRule {
    #[serde(rename = "RecordingRuleID")]
    rule_id: IdValue,
    #[serde(rename = "SeriesID", default)]
    series_id: Option<IdValue>,
    #[serde(rename = "Title", default)]
    title: Option<String>,
    #[serde(rename = "Synopsis", default)]
    synopsis: Option<String>,
    #[serde(rename = "ImageURL", default)]
    image_url: Option<String>,
    #[serde(rename = "ChannelOnly", default)]
    channel_only: Option<String>,
    #[serde(rename = "TeamOnly", default)]
    team_only: Option<String>,
    #[serde(rename = "RecentOnly", default)]
    recent_only: Option<u8>,
    #[serde(rename = "AfterOriginalAirdateOnly", default)]
    after_original_airdate_only: Option<i64>,
    #[serde(rename = "DateTimeOnly", default)]
    datetime_only: Option<i64>,
    #[serde(rename = "Priority", default)]
    priority: Option<i64>,
    #[serde(rename = "StartPadding", default)]
    start_padding: Option<i64>,
    #[serde(rename = "EndPadding", default)]
    end_padding: Option<i64>,
}

impl CloudRule {
    fn into_model(self) -> RecordingRule {
        RecordingRule {
            rule_id: self.rule_id.into_string(),
            series_id: self.series_id.map(IdValue::into_string),
            title: self.title,
            synopsis: self.synopsis,
            image_url: self.image_url,
            channel_only: self.channel_only,
            team_only: self.team_only,
            recent_only: self.recent_only.unwrap_or(0) != 0,
            after_original_airdate_only: self.after_original_airdate_only,
            datetime_only: self.datetime_only,
            priority: self.priority,
            start_padding: self.start_padding.unwrap_or(0),
            end_padding: self.end_padding.unwrap_or(0),
        }
    }
}

/// Fields accepted for `add` and `change` rule mutations.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleRequest {
    #[serde(rename = "SeriesID", default)]
    pub series_id: Option<String>,
    #[serde(rename = "RecordingRuleID", default)]
    pub recording_rule_id: Option<String>,
    #[serde(rename = "ChannelOnly", default)]
    pub channel_only: Option<String>,
    #[serde(rename = "TeamOnly", default)]
    pub team_only: Option<String>,
    #[serde(rename = "RecentOnly", default)]
    pub recent_only: Option<bool>,
    #[serde(rename = "AfterOriginalAirdateOnly", default)]
    pub after_original_airdate_only: Option<i64>,
    #[serde(rename = "DateTimeOnly", default)]
    pub datetime_only: Option<i64>,
    #[serde(rename = "Priority", default)]
    pub priority: Option<i64>,
    #[serde(rename = "StartPadding", default)]
    pub start_padding: Option<i64>,
    #[serde(rename = "EndPadding", default)]
    pub end_padding: Option<i64>,
    #[serde(rename = "AfterRecordingRuleID", default)]
    pub after_recording_rule_id: Option<String>,
}

pub struct GuidePlane {
    config: GuideSection,
    http: reqwest::Client,
    appliances: ApplianceClient,
    store: MediaStore,
}

impl GuidePlane {
    pub fn new(config: GuideSection, appliances: ApplianceClient, store: MediaStore) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            appliances,
            store,
        }
    }

    fn cloud_url(&self, path: &str) -> String {
        format!("{}/{path}", self.config.cloud_base_url.trim_end_matches('/'))
    }

    fn credential_device(&self) -> GuideResult<Device> {
        self.store
            .primary_device_auth()?
            .ok_or(GuideError::MissingCredential)
    }

    /// Pull a fresh DeviceAuth from the credential appliance after a 403.
    async fn refresh_auth(&self, device: &Device) -> GuideResult<String> {
        let ip = device.ip_address.as_deref().ok_or(GuideError::AuthExpired)?;
        let description = self
            .appliances
            .discover(ip)
            .await
            .map_err(|err| {
                warn!(device_id = %device.device_id, error = %err, "credential refresh failed");
                GuideError::AuthExpired
            })?;
        let auth = description.device_auth.ok_or(GuideError::AuthExpired)?;
        self.store.update_device_auth(&device.device_id, &auth)?;
        info!(device_id = %device.device_id, "refreshed cloud credential");
        Ok(auth)
    }

    /// Execute a cloud call with the DeviceAuth credential. A 403 triggers
    /// exactly one token refresh and retry; a second 403 surfaces.
    async fn send_with_auth<F>(&self, build: F) -> GuideResult<reqwest::Response>
    where
        F: Fn(&str) -> reqwest::RequestBuilder,
    {
        let device = self.credential_device()?;
        let auth = device
            .device_auth
            .clone()
            .ok_or(GuideError::MissingCredential)?;
        let response = build(&auth)
            .timeout(CLOUD_TIMEOUT)
            .send()
            .await
            .map_err(GuideError::Http)?;
        if response.status().as_u16() != 403 {
            return check_status(response);
        }
        debug!("cloud rejected credential, refreshing once");
        let auth = self.refresh_auth(&device).await?;
        let response = build(&auth)
            .timeout(CLOUD_TIMEOUT)
            .send()
            .await
            .map_err(GuideError::Http)?;
        if response.status().as_u16() == 403 {
            return Err(GuideError::AuthExpired);
        }
        check_status(response)
    }

    /// Fetch a guide window from the cloud and append it to the local cache.
    /// Returns the number of newly stored programs.
    pub async fn fetch_guide(
        &self,
        start: Option<i64>,
        duration_hours: Option<u64>,
    ) -> GuideResult<usize> {
        let start = start.unwrap_or_else(|| Utc::now().timestamp());
        let hours = duration_hours.unwrap_or(24).clamp(1, 24);
        let url = self.cloud_url("api/guide");
        let response = self
            .send_with_auth(|auth| {
                self.http.get(&url).query(&[
                    ("DeviceAuth", auth.to_string()),
                    ("Start", start.to_string()),
                    ("Duration", (hours * 3600).to_string()),
                ])
            })
            .await?;
        let channels: Vec<CloudGuideChannel> =
            response.json().await.map_err(GuideError::Http)?;

        let fetched_at = Utc::now().timestamp();
        let mut inserted = 0;
        for channel in channels {
            let guide_number = channel.guide_number.into_string();
            let channel_row = self.store.upsert_guide_channel(
                &guide_number,
                channel.guide_name.as_deref(),
                channel.image_url.as_deref(),
                fetched_at,
            )?;
            let programs: Vec<GuideProgramUpsert> = channel
                .programs
                .into_iter()
                .map(|program| GuideProgramUpsert {
                    series_id: program.series_id.into_string(),
                    title: program.title,
                    episode_title: program.episode_title,
                    synopsis: program.synopsis,
                    start_time: program.start_time,
                    end_time: program.end_time,
                    original_airdate: program.original_airdate,
                    image_url: program.image_url,
                })
                .collect();
            inserted += self.store.insert_guide_programs(channel_row, &programs)?;
        }
        info!(programs = inserted, "guide window cached");
        Ok(inserted)
    }

    /// Refresh when the cache watermark has gone stale.
    pub async fn refresh_if_stale(&self) -> GuideResult<bool> {
        let stale_cutoff =
            Utc::now().timestamp() - self.config.guide_stale_minutes * 60;
        let fresh = self
            .store
            .guide_last_updated()?
            .map(|watermark| watermark >= stale_cutoff)
            .unwrap_or(false);
        if fresh {
            return Ok(false);
        }
        self.fetch_guide(None, None).await?;
        Ok(true)
    }

    pub async fn run_periodic_refresh(self: std::sync::Arc<Self>) {
        let period = Duration::from_secs(self.config.guide_refresh_hours * 3600);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(err) = self.fetch_guide(None, None).await {
                warn!(error = %err, "periodic guide refresh failed");
            }
        }
    }

    /// Programs for the next 24 hours, grouped by channel, refreshing first
    /// when stale.
    pub async fn guide_window(&self) -> GuideResult<Vec<(GuideChannel, Vec<GuideProgram>)>> {
        if let Err(err) = self.refresh_if_stale().await {
            warn!(error = %err, "guide refresh failed, serving cached data");
        }
        let now = Utc::now().timestamp();
        Ok(self.store.guide_window(now, now + 24 * 3600)?)
    }

    pub async fn now_playing(&self) -> GuideResult<Vec<(GuideChannel, GuideProgram)>> {
        if let Err(err) = self.refresh_if_stale().await {
            warn!(error = %err, "guide refresh failed, serving cached data");
        }
        Ok(self.store.guide_now(Utc::now().timestamp())?)
    }

    /// Substring search over the 7-day forward window.
    pub async fn search(
        &self,
        query: &str,
        channel: Option<&str>,
        limit: usize,
    ) -> GuideResult<Vec<(GuideChannel, GuideProgram)>> {
        let now = Utc::now().timestamp();
        Ok(self
            .store
            .guide_search(query, channel, limit, now, now + 7 * 24 * 3600)?)
    }

    /// Full-list refresh from the cloud, reconciling the local cache.
    pub async fn rules_list(&self) -> GuideResult<Vec<RecordingRule>> {
        let url = self.cloud_url("api/recording_rules");
        let response = self
            .send_with_auth(|auth| {
                self.http
                    .get(&url)
                    .query(&[("DeviceAuth", auth.to_string())])
            })
            .await?;
        let rules: Vec<CloudRule> = response.json().await.map_err(GuideError::Http)?;
        let rules: Vec<RecordingRule> = rules.into_iter().map(CloudRule::into_model).collect();
        self.store.replace_rules(&rules)?;
        Ok(self.store.list_rules()?)
    }

    pub async fn rule_add(&self, request: &RuleRequest) -> GuideResult<Vec<RecordingRule>> {
        self.post_rule_command("add", request).await?;
        let rules = self.rules_list().await?;
        self.fan_out_resync().await;
        Ok(rules)
    }

    pub async fn rule_change(&self, request: &RuleRequest) -> GuideResult<Vec<RecordingRule>> {
        self.post_rule_command("change", request).await?;
        let rules = self.rules_list().await?;
        self.fan_out_resync().await;
        Ok(rules)
    }

    pub async fn rule_delete(&self, rule_id: &str) -> GuideResult<()> {
        let request = RuleRequest {
            recording_rule_id: Some(rule_id.to_string()),
            ..RuleRequest::default()
        };
        self.post_rule_command("delete", &request).await?;
        match self.store.delete_rule(rule_id) {
            Ok(()) => {}
            Err(StoreError::RuleNotFound { .. }) => {}
            Err(err) => return Err(err.into()),
        }
        self.fan_out_resync().await;
        Ok(())
    }

    async fn post_rule_command(&self, cmd: &str, request: &RuleRequest) -> GuideResult<()> {
        let url = self.cloud_url("api/recording_rules");
        self.send_with_auth(|auth| {
            self.http
                .post(&url)
                .form(&rule_form(auth, cmd, request))
        })
        .await?;
        info!(cmd, rule_id = ?request.recording_rule_id, series_id = ?request.series_id, "rule mutation accepted by cloud");
        Ok(())
    }

    /// Tell every known appliance to resync its rules, in parallel and
    /// best-effort; a deaf appliance catches up on its own schedule.
    async fn fan_out_resync(&self) {
        let devices = match self.store.list_devices(true) {
            Ok(devices) => devices,
            Err(err) => {
                warn!(error = %err, "cannot enumerate appliances for resync");
                return;
            }
        };
        let posts = devices.iter().filter_map(|device| {
            let base_url = device.base_url.clone()?;
            let client = self.appliances.clone();
            let device_id = device.device_id.clone();
            Some(async move {
                if let Err(err) = client.post_resync(&base_url).await {
                    warn!(device_id = %device_id, error = %err, "resync signal failed");
                }
            })
        });
        join_all(posts).await;
    }
}

fn check_status(response: reqwest::Response) -> GuideResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(GuideError::Upstream {
            status: status.as_u16(),
        })
    }
}

/// Form body for a rule mutation; absent optional fields are omitted.
fn rule_form(auth: &str, cmd: &str, request: &RuleRequest) -> Vec<(String, String)> {
    let mut form = vec![
        ("DeviceAuth".to_string(), auth.to_string()),
        ("Cmd".to_string(), cmd.to_string()),
    ];
    let mut push = |key: &str, value: Option<String>| {
        if let Some(value) = value {
            form.push((key.to_string(), value));
        }
    };
    push("SeriesID", request.series_id.clone());
    push("RecordingRuleID", request.recording_rule_id.clone());
    push("ChannelOnly", request.channel_only.clone());
    push("TeamOnly", request.team_only.clone());
    push(
        "RecentOnly",
        request.recent_only.map(|value| u8::from(value).to_string()),
    );
    push(
        "AfterOriginalAirdateOnly",
        request.after_original_airdate_only.map(|v| v.to_string()),
    );
    push("DateTimeOnly", request.datetime_only.map(|v| v.to_string()));
    push("Priority", request.priority.map(|v| v.to_string()));
    push("StartPadding", request.start_padding.map(|v| v.to_string()));
    push("EndPadding", request.end_padding.map(|v| v.to_string()));
    push(
        "AfterRecordingRuleID",
        request.after_recording_rule_id.clone(),
    );
    form
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_form_omits_absent_fields() {
        let request = RuleRequest {
            series_id: Some("S123".into()),
            recent_only: Some(true),
            channel_only: Some("2.1".into()),
            ..RuleRequest::default()
        };
        let form = rule_form("token", "add", &request);
        assert!(form.contains(&("DeviceAuth".into(), "token".into())));
        assert!(form.contains(&("Cmd".into(), "add".into())));
        assert!(form.contains(&("SeriesID".into(), "S123".into())));
        assert!(form.contains(&("RecentOnly".into(), "1".into())));
        assert!(form.contains(&("ChannelOnly".into(), "2.1".into())));
        assert!(!form.iter().any(|(key, _)| key == "Priority"));
        assert!(!form.iter().any(|(key, _)| key == "TeamOnly"));
    }

    #[test]
    fn loose_ids_normalize_to_strings() {
        let num: IdValue = serde_json::from_str("12345").unwrap();
        assert_eq!(num.into_string(), "12345");
        let text: IdValue = serde_json::from_str("\"S9001\"").unwrap();
        assert_eq!(text.into_string(), "S9001");
    }
}
