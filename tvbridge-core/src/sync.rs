//! Metadata sync: mirror every DVR-capable appliance's series and episode
//! catalog into the relational store, and own the progress/delete paths
//! where the local row is the source of truth and the appliance a
//! best-effort mirror.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::appliance::{ApplianceClient, ApplianceError, RecordedEpisodeEntry};
use crate::store::catalog::{EpisodeUpsert, SeriesUpsert};
use crate::store::models::{Episode, RESUME_SENTINEL};
use crate::store::{MediaStore, StoreError};
use crate::transcode::TranscodeEngine;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("appliance error: {0}")]
    Appliance(#[from] ApplianceError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct SyncReport {
    pub devices: usize,
    pub series: usize,
    pub episodes: usize,
}

pub struct CatalogSync {
    client: ApplianceClient,
    store: MediaStore,
    engine: Arc<TranscodeEngine>,
}

impl CatalogSync {
    pub fn new(client: ApplianceClient, store: MediaStore, engine: Arc<TranscodeEngine>) -> Self {
        Self {
            client,
            store,
            engine,
        }
    }

    /// Sync every online, DVR-capable appliance.
    pub async fn sync_all(&self) -> SyncResult<SyncReport> {
        let mut report = SyncReport::default();
        for device in self.store.list_devices(true)? {
            if !device.dvr_capable() {
                debug!(device_id = %device.device_id, "no storage endpoint, skipping");
                continue;
            }
            match self.sync_one(&device.device_id).await {
                Ok(partial) => {
                    report.devices += 1;
                    report.series += partial.series;
                    report.episodes += partial.episodes;
                }
                Err(err) => {
                    warn!(device_id = %device.device_id, error = %err, "catalog sync failed");
                }
            }
        }
        info!(
            devices = report.devices,
            series = report.series,
            episodes = report.episodes,
            "catalog sync complete"
        );
        Ok(report)
    }

    pub async fn sync_device(&self, device_id: &str) -> SyncResult<SyncReport> {
        let report = self.sync_one(device_id).await?;
        Ok(SyncReport {
            devices: 1,
            ..report
        })
    }

    async fn sync_one(&self, device_id: &str) -> SyncResult<SyncReport> {
        let device = self.store.device_by_id(device_id)?;
        let Some(storage_url) = device.storage_url.as_deref() else {
            return Ok(SyncReport::default());
        };
        let mut report = SyncReport::default();
        for entry in self.client.recorded_series(storage_url).await? {
            let series_row = self.store.upsert_series(
                device.id,
                &SeriesUpsert {
                    series_id: entry.series_id.clone(),
                    title: entry.title.clone().unwrap_or_default(),
                    category: entry.category.clone(),
                    image_url: entry.image_url.clone(),
                    episodes_url: entry.episodes_url.clone(),
                },
            )?;
            report.series += 1;

            let Some(episodes_url) = entry.episodes_url.as_deref() else {
                continue;
            };
            for episode in self.client.recorded_episodes(episodes_url).await? {
                self.store
                    .upsert_episode(series_row, &episode_upsert(&episode))?;
                report.episodes += 1;
            }
        }
        self.store.touch_device_last_seen(device_id)?;
        Ok(report)
    }

    /// Write the local progress row, then mirror to the appliance. The
    /// appliance write failing is logged, never surfaced.
    pub async fn update_progress(
        &self,
        episode_id: i64,
        position_seconds: i64,
        watched: bool,
    ) -> SyncResult<Episode> {
        let episode = self
            .store
            .update_progress(episode_id, position_seconds, watched)?;

        if let Some(cmd_url) = episode.cmd_url.clone() {
            let value = if watched {
                RESUME_SENTINEL
            } else {
                position_seconds as u32
            };
            if let Err(err) = self.client.set_resume(&cmd_url, value).await {
                warn!(episode_id, error = %err, "progress mirror to appliance failed");
            }
        }
        Ok(episode)
    }

    /// Delete an episode: appliance first (fail-fast), then the HLS cache,
    /// then the local row. Series statistics follow via triggers.
    pub async fn delete_episode(&self, episode_id: i64, allow_rerecord: bool) -> SyncResult<()> {
        let episode = self.store.episode_by_id(episode_id)?;
        if let Some(cmd_url) = episode.cmd_url.as_deref() {
            self.client.delete_recording(cmd_url, allow_rerecord).await?;
        }
        if let Err(err) = self.engine.delete(episode_id).await {
            warn!(episode_id, error = %err, "failed to drop transcode cache");
        }
        self.store.delete_episode_row(episode_id)?;
        info!(episode_id, allow_rerecord, "episode deleted");
        Ok(())
    }
}

fn episode_upsert(entry: &RecordedEpisodeEntry) -> EpisodeUpsert {
    EpisodeUpsert {
        program_id: entry.program_id.clone(),
        title: entry.title.clone(),
        episode_title: entry.episode_title.clone(),
        episode_number: entry.episode_number.clone(),
        synopsis: entry.synopsis.clone(),
        channel_name: entry.channel_name.clone(),
        channel_number: entry.channel_number.clone(),
        start_time: entry.start_time.unwrap_or(0),
        end_time: entry.end_time.or(entry.start_time).unwrap_or(0),
        original_airdate: entry.original_airdate,
        record_start: entry.record_start,
        record_end: entry.record_end,
        record_success: entry.record_success.unwrap_or(1) != 0,
        filename: entry.filename.clone(),
        play_url: entry.play_url.clone(),
        cmd_url: entry.cmd_url.clone(),
        image_url: entry.image_url.clone(),
        resume: entry.resume.unwrap_or(0),
    }
}
