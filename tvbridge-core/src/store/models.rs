use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use rusqlite::Row;
use serde::{Deserialize, Serialize};

/// Appliance progress value meaning "fully watched".
pub const RESUME_SENTINEL: u32 = 0xFFFF_FFFF;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Device {
    pub id: i64,
    pub device_id: String,
    pub friendly_name: Option<String>,
    pub model_number: Option<String>,
    pub firmware_name: Option<String>,
    pub firmware_version: Option<String>,
    pub ip_address: Option<String>,
    pub base_url: Option<String>,
    pub lineup_url: Option<String>,
    pub storage_url: Option<String>,
    pub device_auth: Option<String>,
    pub tuner_count: u32,
    pub total_space: Option<i64>,
    pub free_space: Option<i64>,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Device {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let last_seen: Option<NaiveDateTime> = row.get("last_seen")?;
        Ok(Self {
            id: row.get("id")?,
            device_id: row.get("device_id")?,
            friendly_name: row.get("friendly_name")?,
            model_number: row.get("model_number")?,
            firmware_name: row.get("firmware_name")?,
            firmware_version: row.get("firmware_version")?,
            ip_address: row.get("ip_address")?,
            base_url: row.get("base_url")?,
            lineup_url: row.get("lineup_url")?,
            storage_url: row.get("storage_url")?,
            device_auth: row.get("device_auth")?,
            tuner_count: row.get::<_, Option<i64>>("tuner_count")?.unwrap_or(0) as u32,
            total_space: row.get("total_space")?,
            free_space: row.get("free_space")?,
            online: row.get::<_, Option<i64>>("online")?.unwrap_or(0) != 0,
            last_seen: last_seen.map(|dt| Utc.from_utc_datetime(&dt)),
        })
    }

    pub fn dvr_capable(&self) -> bool {
        self.storage_url.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Series {
    pub id: i64,
    pub device_id: i64,
    pub series_id: String,
    pub title: String,
    pub category: Option<String>,
    pub image_url: Option<String>,
    pub episodes_url: Option<String>,
    pub episode_count: i64,
    pub total_duration: i64,
    pub first_recorded: Option<i64>,
    pub last_recorded: Option<i64>,
}

impl Series {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            device_id: row.get("device_id")?,
            series_id: row.get("series_id")?,
            title: row.get("title")?,
            category: row.get("category")?,
            image_url: row.get("image_url")?,
            episodes_url: row.get("episodes_url")?,
            episode_count: row.get::<_, Option<i64>>("episode_count")?.unwrap_or(0),
            total_duration: row.get::<_, Option<i64>>("total_duration")?.unwrap_or(0),
            first_recorded: row.get("first_recorded")?,
            last_recorded: row.get("last_recorded")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Episode {
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
    pub original_airdate: Option<i64>,
    pub record_start: Option<i64>,
    pub record_end: Option<i64>,
    pub record_success: bool,
    pub filename: Option<String>,
    pub play_url: Option<String>,
    pub cmd_url: Option<String>,
    pub image_url: Option<String>,
    pub resume_position: i64,
    pub watched: bool,
}

impl Episode {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            series_id: row.get("series_id")?,
            program_id: row.get("program_id")?,
            title: row.get("title")?,
            episode_title: row.get("episode_title")?,
            episode_number: row.get("episode_number")?,
            season: row.get("season")?,
            episode: row.get("episode")?,
            synopsis: row.get("synopsis")?,
            channel_name: row.get("channel_name")?,
            channel_number: row.get("channel_number")?,
            start_time: row.get("start_time")?,
            end_time: row.get("end_time")?,
            original_airdate: row.get("original_airdate")?,
            record_start: row.get("record_start")?,
            record_end: row.get("record_end")?,
            record_success: row.get::<_, Option<i64>>("record_success")?.unwrap_or(1) != 0,
            filename: row.get("filename")?,
            play_url: row.get("play_url")?,
            cmd_url: row.get("cmd_url")?,
            image_url: row.get("image_url")?,
            resume_position: row.get::<_, Option<i64>>("resume_position")?.unwrap_or(0),
            watched: row.get::<_, Option<i64>>("watched")?.unwrap_or(0) != 0,
        })
    }

    pub fn duration(&self) -> i64 {
        self.end_time - self.start_time
    }

    /// Resume position as presented to clients: a watched episode reports its
    /// full duration regardless of the stored offset.
    pub fn canonical_resume(&self) -> i64 {
        if self.watched {
            self.duration()
        } else {
            self.resume_position
        }
    }
}

/// Parse an `SxxEyy` label into season/episode numbers.
pub fn parse_episode_number(label: &str) -> (Option<i64>, Option<i64>) {
    let pattern = Regex::new(r"(?i)S(\d+)E(\d+)").expect("static pattern");
    match pattern.captures(label) {
        Some(caps) => {
            let season = caps.get(1).and_then(|m| m.as_str().parse().ok());
            let episode = caps.get(2).and_then(|m| m.as_str().parse().ok());
            (season, episode)
        }
        None => (None, None),
    }
}

/// Canonicalize an appliance resume value: the sentinel means fully watched
/// and never reaches the database raw.
pub fn canonicalize_resume(raw: u32) -> (i64, bool) {
    if raw == RESUME_SENTINEL {
        (0, true)
    } else {
        (i64::from(raw), false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GuideChannel {
    pub id: i64,
    pub guide_number: String,
    pub guide_name: Option<String>,
    pub image_url: Option<String>,
    pub last_updated: i64,
}

impl GuideChannel {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            guide_number: row.get("guide_number")?,
            guide_name: row.get("guide_name")?,
            image_url: row.get("image_url")?,
            last_updated: row.get::<_, Option<i64>>("last_updated")?.unwrap_or(0),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GuideProgram {
    pub id: i64,
    pub channel_id: i64,
    pub series_id: String,
    pub title: Option<String>,
    pub episode_title: Option<String>,
    pub synopsis: Option<String>,
    pub start_time: i64,
    pub end_time: i64,
    pub original_airdate: Option<i64>,
    pub image_url: Option<String>,
}

impl GuideProgram {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            channel_id: row.get("channel_id")?,
            series_id: row.get("series_id")?,
            title: row.get("title")?,
            episode_title: row.get("episode_title")?,
            synopsis: row.get("synopsis")?,
            start_time: row.get("start_time")?,
            end_time: row.get("end_time")?,
            original_airdate: row.get("original_airdate")?,
            image_url: row.get("image_url")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordingRule {
    pub rule_id: String,
    pub series_id: Option<String>,
    pub title: Option<String>,
    pub synopsis: Option<String>,
    pub image_url: Option<String>,
    pub channel_only: Option<String>,
    pub team_only: Option<String>,
    pub recent_only: bool,
    pub after_original_airdate_only: Option<i64>,
    pub datetime_only: Option<i64>,
    pub priority: Option<i64>,
    pub start_padding: i64,
    pub end_padding: i64,
}

impl RecordingRule {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            rule_id: row.get("rule_id")?,
            series_id: row.get("series_id")?,
            title: row.get("title")?,
            synopsis: row.get("synopsis")?,
            image_url: row.get("image_url")?,
            channel_only: row.get("channel_only")?,
            team_only: row.get("team_only")?,
            recent_only: row.get::<_, Option<i64>>("recent_only")?.unwrap_or(0) != 0,
            after_original_airdate_only: row.get("after_original_airdate_only")?,
            datetime_only: row.get("datetime_only")?,
            priority: row.get("priority")?,
            start_padding: row.get::<_, Option<i64>>("start_padding")?.unwrap_or(0),
            end_padding: row.get::<_, Option<i64>>("end_padding")?.unwrap_or(0),
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TunerState {
    Idle,
    Active,
    Cooldown,
    Offline,
}

impl TunerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunerState::Idle => "idle",
            TunerState::Active => "active",
            TunerState::Cooldown => "cooldown",
            TunerState::Offline => "offline",
        }
    }
}

impl fmt::Display for TunerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TunerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(TunerState::Idle),
            "active" => Ok(TunerState::Active),
            "cooldown" => Ok(TunerState::Cooldown),
            "offline" => Ok(TunerState::Offline),
            other => Err(format!("unknown tuner state: {other}")),
        }
    }
}

/// Durable mirror row for a tuner; the live pool owns the in-memory truth.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunerRow {
    pub tuner_id: String,
    pub device_id: String,
    pub tuner_index: u32,
    pub state: TunerState,
    pub channel: Option<String>,
    pub viewer_count: u32,
    pub last_accessed: i64,
}

impl TunerRow {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            tuner_id: row.get("tuner_id")?,
            device_id: row.get("device_id")?,
            tuner_index: row.get::<_, i64>("tuner_index")? as u32,
            state: row
                .get::<_, String>("state")?
                .parse()
                .unwrap_or(TunerState::Idle),
            channel: row.get("channel")?,
            viewer_count: row.get::<_, Option<i64>>("viewer_count")?.unwrap_or(0) as u32,
            last_accessed: row.get::<_, Option<i64>>("last_accessed")?.unwrap_or(0),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ViewerRow {
    pub client_id: String,
    pub tuner_id: String,
    pub channel: String,
    pub last_heartbeat: i64,
}

impl ViewerRow {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            client_id: row.get("client_id")?,
            tuner_id: row.get("tuner_id")?,
            channel: row.get("channel")?,
            last_heartbeat: row.get::<_, Option<i64>>("last_heartbeat")?.unwrap_or(0),
        })
    }
}
