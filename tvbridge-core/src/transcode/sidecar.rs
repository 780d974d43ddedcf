//! Durable per-episode transcode state, stored as `transcode.json` next to
//! the HLS output. The sidecar is what survives restarts.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{TranscodeError, TranscodeMetadata, TranscodeResult, TranscodeState};

pub const SIDECAR_NAME: &str = "transcode.json";
pub const PLAYLIST_NAME: &str = "stream.m3u8";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodeSidecar {
    pub state: TranscodeState,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub source_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub air_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_tail: Option<Vec<String>>,
}

impl TranscodeSidecar {
    pub fn started(source_url: &str, metadata: &TranscodeMetadata, at: DateTime<Utc>) -> Self {
        Self {
            state: TranscodeState::Transcoding,
            start_time: at,
            end_time: None,
            source_url: source_url.to_string(),
            show_name: metadata.show_name.clone(),
            episode_name: metadata.episode_name.clone(),
            air_date: metadata.air_date.clone(),
            error: None,
            stderr_tail: None,
        }
    }

    pub fn path_for(dir: &Path) -> PathBuf {
        dir.join(SIDECAR_NAME)
    }

    pub async fn load(dir: &Path) -> TranscodeResult<Option<Self>> {
        let path = Self::path_for(dir);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(TranscodeError::Io { path, source }),
        };
        let sidecar =
            serde_json::from_slice(&bytes).map_err(|source| TranscodeError::Sidecar {
                path,
                source,
            })?;
        Ok(Some(sidecar))
    }

    /// Write-then-rename so a crash mid-write never leaves a torn sidecar.
    pub async fn persist(&self, dir: &Path) -> TranscodeResult<()> {
        let path = Self::path_for(dir);
        let tmp = dir.join(format!("{SIDECAR_NAME}.tmp"));
        let bytes = serde_json::to_vec_pretty(self).map_err(|source| TranscodeError::Sidecar {
            path: path.clone(),
            source,
        })?;
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|source| TranscodeError::Io {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|source| TranscodeError::Io { path, source })?;
        Ok(())
    }
}
