//! Typed client for the HTTP surface the tuner appliances expose. All JSON
//! arrives loosely typed; the serde structs here are the normalization edge
//! so interior components only ever see typed values.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

const USER_AGENT: &str = concat!("tvbridge/", env!("CARGO_PKG_VERSION"));

/// Header the appliance uses to communicate tuner errors on the live feed.
pub const TUNER_ERROR_HEADER: &str = "X-HDHomeRun-Error";

pub const LIVE_TUNER_PORT: u16 = 5004;

#[derive(Debug, Error)]
pub enum ApplianceError {
    #[error("appliance request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("appliance returned status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("failed to build appliance client: {0}")]
    Client(reqwest::Error),
}

pub type ApplianceResult<T> = Result<T, ApplianceError>;

/// Outcome of probing a live-tuner URL before any transcoder is spawned.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LiveProbeError {
    #[error("all tuners on the appliance are busy")]
    AllTunersBusy,
    #[error("the requested tuner is busy")]
    TunerBusy,
    #[error("channel is DRM protected")]
    DrmProtected,
    #[error("appliance live feed unavailable (status {status})")]
    Unavailable { status: u16 },
    #[error("appliance unreachable: {0}")]
    Unreachable(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceDescription {
    #[serde(rename = "DeviceID", default)]
    pub device_id: Option<String>,
    #[serde(rename = "FriendlyName", default)]
    pub friendly_name: Option<String>,
    #[serde(rename = "ModelNumber", default)]
    pub model_number: Option<String>,
    #[serde(rename = "FirmwareName", default)]
    pub firmware_name: Option<String>,
    #[serde(rename = "FirmwareVersion", default)]
    pub firmware_version: Option<String>,
    #[serde(rename = "DeviceAuth", default)]
    pub device_auth: Option<String>,
    #[serde(rename = "BaseURL", default)]
    pub base_url: Option<String>,
    #[serde(rename = "LineupURL", default)]
    pub lineup_url: Option<String>,
    #[serde(rename = "TunerCount", default)]
    pub tuner_count: Option<u32>,
    #[serde(rename = "StorageID", default)]
    pub storage_id: Option<String>,
    #[serde(rename = "StorageURL", default)]
    pub storage_url: Option<String>,
    #[serde(rename = "TotalSpace", default)]
    pub total_space: Option<i64>,
    #[serde(rename = "FreeSpace", default)]
    pub free_space: Option<i64>,
}

impl DeviceDescription {
    pub fn dvr_capable(&self) -> bool {
        self.storage_url.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LineupEntry {
    #[serde(rename = "GuideNumber")]
    pub guide_number: String,
    #[serde(rename = "GuideName", default)]
    pub guide_name: Option<String>,
    #[serde(rename = "URL", default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TunerStatusEntry {
    #[serde(rename = "Resource")]
    pub resource: String,
    #[serde(rename = "InUse", default)]
    pub in_use: Option<u8>,
    #[serde(rename = "VctNumber", default)]
    pub vct_number: Option<String>,
    #[serde(rename = "VctName", default)]
    pub vct_name: Option<String>,
    #[serde(rename = "TargetIP", default)]
    pub target_ip: Option<String>,
    #[serde(rename = "SignalStrengthPercent", default)]
    pub signal_strength: Option<i64>,
}

impl TunerStatusEntry {
    /// A tuner counts as claimed when the appliance flags it in use or it is
    /// locked onto a virtual channel.
    pub fn busy(&self) -> bool {
        self.in_use == Some(1)
            || self
                .vct_number
                .as_deref()
                .map(|number| !number.is_empty())
                .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordedSeriesEntry {
    #[serde(rename = "SeriesID")]
    pub series_id: String,
    #[serde(rename = "Title", default)]
    pub title: Option<String>,
    #[serde(rename = "Category", default)]
    pub category: Option<String>,
    #[serde(rename = "ImageURL", default)]
    pub image_url: Option<String>,
    #[serde(rename = "EpisodesURL", default)]
    pub episodes_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordedEpisodeEntry {
    #[serde(rename = "ProgramID")]
    pub program_id: String,
    #[serde(rename = "Title", default)]
    pub title: Option<String>,
    #[serde(rename = "EpisodeTitle", default)]
    pub episode_title: Option<String>,
    #[serde(rename = "EpisodeNumber", default)]
    pub episode_number: Option<String>,
    #[serde(rename = "Synopsis", default)]
    pub synopsis: Option<String>,
    #[serde(rename = "ChannelName", default)]
    pub channel_name: Option<String>,
    #[serde(rename = "ChannelNumber", default)]
    pub channel_number: Option<String>,
    #[serde(rename = "StartTime", default)]
    pub start_time: Option<i64>,
    #[serde(rename = "EndTime", default)]
    pub end_time: Option<i64>,
    #[serde(rename = "OriginalAirdate", default)]
    pub original_airdate: Option<i64>,
    #[serde(rename = "RecordStartTime", default)]
    pub record_start: Option<i64>,
    #[serde(rename = "RecordEndTime", default)]
    pub record_end: Option<i64>,
    #[serde(rename = "RecordSuccess", default)]
    pub record_success: Option<u8>,
    #[serde(rename = "Filename", default)]
    pub filename: Option<String>,
    #[serde(rename = "PlayURL", default)]
    pub play_url: Option<String>,
    #[serde(rename = "CmdURL", default)]
    pub cmd_url: Option<String>,
    #[serde(rename = "ImageURL", default)]
    pub image_url: Option<String>,
    #[serde(rename = "Resume", default)]
    pub resume: Option<u32>,
}

#[derive(Clone)]
pub struct ApplianceClient {
    http: reqwest::Client,
}

impl std::fmt::Debug for ApplianceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplianceClient").finish()
    }
}

impl ApplianceClient {
    pub fn new() -> ApplianceResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(ApplianceError::Client)?;
        Ok(Self { http })
    }

    pub fn with_http(http: reqwest::Client) -> Self {
        Self { http }
    }

    pub async fn discover(&self, ip: &str) -> ApplianceResult<DeviceDescription> {
        let url = format!("http://{ip}/discover.json");
        self.get_json(&url, Duration::from_secs(5)).await
    }

    pub async fn discover_url(&self, url: &str) -> ApplianceResult<DeviceDescription> {
        self.get_json(url, Duration::from_secs(5)).await
    }

    pub async fn lineup(&self, lineup_url: &str) -> ApplianceResult<Vec<LineupEntry>> {
        self.get_json(lineup_url, Duration::from_secs(5)).await
    }

    pub async fn tuner_status(&self, base_url: &str) -> ApplianceResult<Vec<TunerStatusEntry>> {
        let url = format!("{}/status.json", base_url.trim_end_matches('/'));
        self.get_json(&url, Duration::from_secs(3)).await
    }

    /// Does the appliance report at least one unclaimed tuner right now?
    pub async fn has_free_tuner(&self, base_url: &str) -> ApplianceResult<bool> {
        let status = self.tuner_status(base_url).await?;
        Ok(status.iter().any(|entry| !entry.busy()))
    }

    pub async fn recorded_series(
        &self,
        storage_url: &str,
    ) -> ApplianceResult<Vec<RecordedSeriesEntry>> {
        self.get_json(storage_url, Duration::from_secs(10)).await
    }

    pub async fn recorded_episodes(
        &self,
        episodes_url: &str,
    ) -> ApplianceResult<Vec<RecordedEpisodeEntry>> {
        self.get_json(episodes_url, Duration::from_secs(10)).await
    }

    /// Mirror a resume position to the appliance. Empty body; the appliance
    /// answers 200 on success.
    pub async fn set_resume(&self, cmd_url: &str, value: u32) -> ApplianceResult<()> {
        let url = format!("{cmd_url}&cmd=set&Resume={value}");
        self.post_empty(&url, Duration::from_secs(5)).await
    }

    pub async fn delete_recording(&self, cmd_url: &str, rerecord: bool) -> ApplianceResult<()> {
        let url = format!("{cmd_url}&cmd=delete&rerecord={}", u8::from(rerecord));
        self.post_empty(&url, Duration::from_secs(5)).await
    }

    /// Nudge the appliance to resync its recording rules with the cloud.
    pub async fn post_resync(&self, base_url: &str) -> ApplianceResult<()> {
        let url = format!(
            "{}/recording_events.post?sync",
            base_url.trim_end_matches('/')
        );
        self.post_empty(&url, Duration::from_secs(5)).await
    }

    pub fn live_stream_url(ip: &str, channel: &str) -> String {
        format!("http://{ip}:{LIVE_TUNER_PORT}/auto/v{channel}")
    }

    /// Probe the live feed before spawning a transcoder: short read, short
    /// timeout, tuner errors decoded from the appliance header.
    pub async fn probe_live(&self, ip: &str, channel: &str) -> Result<(), LiveProbeError> {
        let url = Self::live_stream_url(ip, channel);
        let response = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(3))
            .send()
            .await
            .map_err(|err| LiveProbeError::Unreachable(err.to_string()))?;

        if let Some(code) = response
            .headers()
            .get(TUNER_ERROR_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            debug!(url = %url, code, "appliance reported tuner error");
            return Err(match code.trim() {
                "805" => LiveProbeError::AllTunersBusy,
                "804" => LiveProbeError::TunerBusy,
                "811" => LiveProbeError::DrmProtected,
                _ => LiveProbeError::Unavailable {
                    status: response.status().as_u16(),
                },
            });
        }

        let status = response.status();
        if status.is_server_error() {
            return Err(LiveProbeError::Unavailable {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(LiveProbeError::Unavailable {
                status: status.as_u16(),
            });
        }

        // Pull the first chunk to confirm bytes actually flow.
        let mut body = response;
        match body.chunk().await {
            Ok(Some(chunk)) => {
                debug!(url = %url, bytes = chunk.len(), "live feed probe succeeded");
                Ok(())
            }
            Ok(None) => Err(LiveProbeError::Unavailable {
                status: status.as_u16(),
            }),
            Err(err) => Err(LiveProbeError::Unreachable(err.to_string())),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        timeout: Duration,
    ) -> ApplianceResult<T> {
        let response = self.http.get(url).timeout(timeout).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApplianceError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response.json().await?)
    }

    async fn post_empty(&self, url: &str, timeout: Duration) -> ApplianceResult<()> {
        let response = self.http.post(url).timeout(timeout).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApplianceError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(())
    }
}
