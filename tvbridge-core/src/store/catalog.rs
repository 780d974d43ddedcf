use rusqlite::{params, Connection, OptionalExtension};

use super::models::{canonicalize_resume, parse_episode_number, Device, Episode, Series};
use super::{MediaStore, StoreError, StoreResult};

/// Device fields as assembled by a discovery pass.
#[derive(Debug, Clone, Default)]
pub struct DeviceUpsert {
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
}

#[derive(Debug, Clone, Default)]
pub struct SeriesUpsert {
    pub series_id: String,
    pub title: String,
    pub category: Option<String>,
    pub image_url: Option<String>,
    pub episodes_url: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct EpisodeUpsert {
    pub program_id: String,
    pub title: Option<String>,
    pub episode_title: Option<String>,
    pub episode_number: Option<String>,
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
    /// Raw appliance resume value; the sentinel is canonicalized on write.
    pub resume: u32,
}

fn upsert_device_on(conn: &Connection, device: &DeviceUpsert) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO devices (
            device_id, friendly_name, model_number, firmware_name, firmware_version,
            ip_address, base_url, lineup_url, storage_url, device_auth,
            tuner_count, total_space, free_space, online, last_seen
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 1, CURRENT_TIMESTAMP)
        ON CONFLICT(device_id) DO UPDATE SET
            friendly_name = excluded.friendly_name,
            model_number = excluded.model_number,
            firmware_name = excluded.firmware_name,
            firmware_version = excluded.firmware_version,
            ip_address = excluded.ip_address,
            base_url = excluded.base_url,
            lineup_url = excluded.lineup_url,
            storage_url = excluded.storage_url,
            device_auth = excluded.device_auth,
            tuner_count = excluded.tuner_count,
            total_space = excluded.total_space,
            free_space = excluded.free_space,
            online = 1,
            last_seen = CURRENT_TIMESTAMP",
        params![
            &device.device_id,
            &device.friendly_name,
            &device.model_number,
            &device.firmware_name,
            &device.firmware_version,
            &device.ip_address,
            &device.base_url,
            &device.lineup_url,
            &device.storage_url,
            &device.device_auth,
            device.tuner_count,
            &device.total_space,
            &device.free_space,
        ],
    )?;
    conn.query_row(
        "SELECT id FROM devices WHERE device_id = ?1",
        [&device.device_id],
        |row| row.get(0),
    )
}

impl MediaStore {
    pub fn upsert_device(&self, device: &DeviceUpsert) -> StoreResult<i64> {
        let conn = self.open()?;
        let id = upsert_device_on(&conn, device)?;
        Ok(id)
    }

    /// Apply one discovery pass as a single transaction so readers see the
    /// previous device set or the new one, never a half-merged state.
    pub fn apply_discovery(&self, devices: &[DeviceUpsert]) -> StoreResult<usize> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        for device in devices {
            upsert_device_on(&tx, device)?;
        }
        let seen: Vec<&str> = devices.iter().map(|d| d.device_id.as_str()).collect();
        let placeholders = std::iter::repeat("?")
            .take(seen.len())
            .collect::<Vec<_>>()
            .join(", ");
        let sql = if seen.is_empty() {
            "UPDATE devices SET online = 0 WHERE online = 1".to_string()
        } else {
            format!("UPDATE devices SET online = 0 WHERE online = 1 AND device_id NOT IN ({placeholders})")
        };
        let offlined = tx.execute(&sql, rusqlite::params_from_iter(seen))?;
        tx.commit()?;
        Ok(offlined)
    }

    /// Soft-delete every device not observed by the latest discovery pass.
    pub fn mark_devices_offline(&self, seen_device_ids: &[String]) -> StoreResult<usize> {
        let conn = self.open()?;
        let placeholders = std::iter::repeat("?")
            .take(seen_device_ids.len())
            .collect::<Vec<_>>()
            .join(", ");
        let sql = if seen_device_ids.is_empty() {
            "UPDATE devices SET online = 0 WHERE online = 1".to_string()
        } else {
            format!("UPDATE devices SET online = 0 WHERE online = 1 AND device_id NOT IN ({placeholders})")
        };
        let affected = conn.execute(
            &sql,
            rusqlite::params_from_iter(seen_device_ids.iter().map(|s| s.as_str())),
        )?;
        Ok(affected)
    }

    pub fn list_devices(&self, online_only: bool) -> StoreResult<Vec<Device>> {
        let conn = self.open()?;
        let sql = if online_only {
            "SELECT * FROM devices WHERE online = 1 ORDER BY device_id"
        } else {
            "SELECT * FROM devices ORDER BY device_id"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map([], |row| Device::from_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn device_by_id(&self, device_id: &str) -> StoreResult<Device> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM devices WHERE device_id = ?1")?;
        stmt.query_row([device_id], |row| Device::from_row(row))
            .optional()?
            .ok_or_else(|| StoreError::DeviceNotFound {
                device_id: device_id.to_string(),
            })
    }

    /// Credential used against the vendor cloud: any online device's auth
    /// token, preferring DVR-capable appliances.
    pub fn primary_device_auth(&self) -> StoreResult<Option<Device>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM devices
             WHERE online = 1 AND device_auth IS NOT NULL
             ORDER BY (storage_url IS NULL) ASC, device_id ASC
             LIMIT 1",
        )?;
        let device = stmt
            .query_row([], |row| Device::from_row(row))
            .optional()?;
        Ok(device)
    }

    pub fn update_device_auth(&self, device_id: &str, device_auth: &str) -> StoreResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE devices SET device_auth = ?2 WHERE device_id = ?1",
            params![device_id, device_auth],
        )?;
        if affected == 0 {
            return Err(StoreError::DeviceNotFound {
                device_id: device_id.to_string(),
            });
        }
        Ok(())
    }

    pub fn touch_device_last_seen(&self, device_id: &str) -> StoreResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE devices SET last_seen = CURRENT_TIMESTAMP WHERE device_id = ?1",
            [device_id],
        )?;
        if affected == 0 {
            return Err(StoreError::DeviceNotFound {
                device_id: device_id.to_string(),
            });
        }
        Ok(())
    }

    pub fn upsert_series(&self, device_row_id: i64, series: &SeriesUpsert) -> StoreResult<i64> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO series (device_id, series_id, title, category, image_url, episodes_url)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(device_id, series_id) DO UPDATE SET
                title = excluded.title,
                category = excluded.category,
                image_url = excluded.image_url,
                episodes_url = excluded.episodes_url,
                updated_at = CURRENT_TIMESTAMP",
            params![
                device_row_id,
                &series.series_id,
                &series.title,
                &series.category,
                &series.image_url,
                &series.episodes_url,
            ],
        )?;
        let id = conn.query_row(
            "SELECT id FROM series WHERE device_id = ?1 AND series_id = ?2",
            params![device_row_id, &series.series_id],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn upsert_episode(&self, series_row_id: i64, episode: &EpisodeUpsert) -> StoreResult<i64> {
        let (resume_position, watched) = canonicalize_resume(episode.resume);
        let (season, number) = episode
            .episode_number
            .as_deref()
            .map(parse_episode_number)
            .unwrap_or((None, None));
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO episodes (
                series_id, program_id, title, episode_title, episode_number, season, episode,
                synopsis, channel_name, channel_number, start_time, end_time, original_airdate,
                record_start, record_end, record_success, filename, play_url, cmd_url, image_url,
                resume_position, watched
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                      ?17, ?18, ?19, ?20, ?21, ?22)
            ON CONFLICT(series_id, program_id) DO UPDATE SET
                title = excluded.title,
                episode_title = excluded.episode_title,
                episode_number = excluded.episode_number,
                season = excluded.season,
                episode = excluded.episode,
                synopsis = excluded.synopsis,
                channel_name = excluded.channel_name,
                channel_number = excluded.channel_number,
                start_time = excluded.start_time,
                end_time = excluded.end_time,
                original_airdate = excluded.original_airdate,
                record_start = excluded.record_start,
                record_end = excluded.record_end,
                record_success = excluded.record_success,
                filename = excluded.filename,
                play_url = excluded.play_url,
                cmd_url = excluded.cmd_url,
                image_url = excluded.image_url,
                updated_at = CURRENT_TIMESTAMP",
            params![
                series_row_id,
                &episode.program_id,
                &episode.title,
                &episode.episode_title,
                &episode.episode_number,
                season,
                number,
                &episode.synopsis,
                &episode.channel_name,
                &episode.channel_number,
                episode.start_time,
                episode.end_time,
                &episode.original_airdate,
                &episode.record_start,
                &episode.record_end,
                episode.record_success,
                &episode.filename,
                &episode.play_url,
                &episode.cmd_url,
                &episode.image_url,
                resume_position,
                watched,
            ],
        )?;
        let id = conn.query_row(
            "SELECT id FROM episodes WHERE series_id = ?1 AND program_id = ?2",
            params![series_row_id, &episode.program_id],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn list_series(&self) -> StoreResult<Vec<Series>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM series ORDER BY title COLLATE NOCASE")?;
        let rows = stmt
            .query_map([], |row| Series::from_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn series_by_id(&self, id: i64) -> StoreResult<Series> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM series WHERE id = ?1")?;
        stmt.query_row([id], |row| Series::from_row(row))
            .optional()?
            .ok_or(StoreError::SeriesNotFound { id })
    }

    pub fn episodes_for_series(&self, series_row_id: i64) -> StoreResult<Vec<Episode>> {
        let conn = self.open()?;
        let mut stmt =
            conn.prepare("SELECT * FROM episodes WHERE series_id = ?1 ORDER BY start_time ASC")?;
        let rows = stmt
            .query_map([series_row_id], |row| Episode::from_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn episode_by_id(&self, id: i64) -> StoreResult<Episode> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM episodes WHERE id = ?1")?;
        stmt.query_row([id], |row| Episode::from_row(row))
            .optional()?
            .ok_or(StoreError::EpisodeNotFound { id })
    }

    /// Write the local progress row. The local database is the source of
    /// truth; mirroring to the appliance happens elsewhere and best-effort.
    pub fn update_progress(
        &self,
        episode_id: i64,
        position_seconds: i64,
        watched: bool,
    ) -> StoreResult<Episode> {
        let episode = self.episode_by_id(episode_id)?;
        let duration = episode.duration();
        if position_seconds > duration {
            return Err(StoreError::ProgressOutOfRange {
                position: position_seconds,
                duration,
            });
        }
        let conn = self.open()?;
        conn.execute(
            "UPDATE episodes
             SET resume_position = ?2, watched = ?3, updated_at = CURRENT_TIMESTAMP
             WHERE id = ?1",
            params![episode_id, position_seconds, watched],
        )?;
        self.episode_by_id(episode_id)
    }

    pub fn delete_episode_row(&self, episode_id: i64) -> StoreResult<()> {
        let conn = self.open()?;
        let affected = conn.execute("DELETE FROM episodes WHERE id = ?1", [episode_id])?;
        if affected == 0 {
            return Err(StoreError::EpisodeNotFound { id: episode_id });
        }
        Ok(())
    }

    pub fn episode_count(&self) -> StoreResult<usize> {
        let conn = self.open()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM episodes", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}
