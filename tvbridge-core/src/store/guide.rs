use rusqlite::{params, OptionalExtension};

use super::models::{GuideChannel, GuideProgram, RecordingRule};
use super::{MediaStore, StoreError, StoreResult};

#[derive(Debug, Clone, Default)]
pub struct GuideProgramUpsert {
    pub series_id: String,
    pub title: Option<String>,
    pub episode_title: Option<String>,
    pub synopsis: Option<String>,
    pub start_time: i64,
    pub end_time: i64,
    pub original_airdate: Option<i64>,
    pub image_url: Option<String>,
}

impl MediaStore {
    pub fn upsert_guide_channel(
        &self,
        guide_number: &str,
        guide_name: Option<&str>,
        image_url: Option<&str>,
        fetched_at: i64,
    ) -> StoreResult<i64> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO guide_channels (guide_number, guide_name, image_url, last_updated)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(guide_number) DO UPDATE SET
                guide_name = excluded.guide_name,
                image_url = excluded.image_url,
                last_updated = excluded.last_updated",
            params![guide_number, guide_name, image_url, fetched_at],
        )?;
        let id = conn.query_row(
            "SELECT id FROM guide_channels WHERE guide_number = ?1",
            [guide_number],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Programs append by `(channel, series, start)`; an entry already stored
    /// is left untouched.
    pub fn insert_guide_programs(
        &self,
        channel_row_id: i64,
        programs: &[GuideProgramUpsert],
    ) -> StoreResult<usize> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let mut inserted = 0;
        for program in programs {
            let affected = tx.execute(
                "INSERT OR IGNORE INTO guide_programs (
                    channel_id, series_id, title, episode_title, synopsis,
                    start_time, end_time, original_airdate, image_url
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    channel_row_id,
                    &program.series_id,
                    &program.title,
                    &program.episode_title,
                    &program.synopsis,
                    program.start_time,
                    program.end_time,
                    &program.original_airdate,
                    &program.image_url,
                ],
            )?;
            inserted += affected;
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn guide_channels(&self) -> StoreResult<Vec<GuideChannel>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM guide_channels ORDER BY guide_number")?;
        let rows = stmt
            .query_map([], |row| GuideChannel::from_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Newest `last_updated` across channels, the freshness watermark.
    pub fn guide_last_updated(&self) -> StoreResult<Option<i64>> {
        let conn = self.open()?;
        let watermark: Option<i64> = conn.query_row(
            "SELECT MAX(last_updated) FROM guide_channels",
            [],
            |row| row.get(0),
        )?;
        Ok(watermark)
    }

    /// Programs overlapping `[from, to)` grouped under their channel.
    pub fn guide_window(
        &self,
        from: i64,
        to: i64,
    ) -> StoreResult<Vec<(GuideChannel, Vec<GuideProgram>)>> {
        let conn = self.open()?;
        let channels = self.guide_channels()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM guide_programs
             WHERE channel_id = ?1 AND end_time > ?2 AND start_time < ?3
             ORDER BY start_time ASC",
        )?;
        let mut grouped = Vec::with_capacity(channels.len());
        for channel in channels {
            let programs = stmt
                .query_map(params![channel.id, from, to], |row| {
                    GuideProgram::from_row(row)
                })?
                .collect::<Result<Vec<_>, _>>()?;
            grouped.push((channel, programs));
        }
        Ok(grouped)
    }

    pub fn guide_now(&self, now: i64) -> StoreResult<Vec<(GuideChannel, GuideProgram)>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT c.guide_number, p.*
             FROM guide_programs p JOIN guide_channels c ON c.id = p.channel_id
             WHERE p.start_time <= ?1 AND p.end_time > ?1
             ORDER BY c.guide_number",
        )?;
        let mut rows = stmt.query([now])?;
        let mut current = Vec::new();
        while let Some(row) = rows.next()? {
            let program = GuideProgram::from_row(row)?;
            let channel = self.guide_channel_by_id(program.channel_id)?;
            current.push((channel, program));
        }
        Ok(current)
    }

    fn guide_channel_by_id(&self, id: i64) -> StoreResult<GuideChannel> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM guide_channels WHERE id = ?1")?;
        let channel = stmt.query_row([id], |row| GuideChannel::from_row(row))?;
        Ok(channel)
    }

    /// Substring search over title, episode title and synopsis, bounded to a
    /// forward window.
    pub fn guide_search(
        &self,
        query: &str,
        channel: Option<&str>,
        limit: usize,
        from: i64,
        to: i64,
    ) -> StoreResult<Vec<(GuideChannel, GuideProgram)>> {
        let conn = self.open()?;
        let needle = format!("%{}%", query);
        let mut stmt = conn.prepare(
            "SELECT c.id AS channel_row, p.*
             FROM guide_programs p JOIN guide_channels c ON c.id = p.channel_id
             WHERE p.end_time > ?2 AND p.start_time < ?3
               AND (?4 IS NULL OR c.guide_number = ?4)
               AND (p.title LIKE ?1 OR p.episode_title LIKE ?1 OR p.synopsis LIKE ?1)
             ORDER BY p.start_time ASC
             LIMIT ?5",
        )?;
        let mut rows = stmt.query(params![needle, from, to, channel, limit as i64])?;
        let mut matches = Vec::new();
        while let Some(row) = rows.next()? {
            let program = GuideProgram::from_row(row)?;
            let channel = self.guide_channel_by_id(program.channel_id)?;
            matches.push((channel, program));
        }
        Ok(matches)
    }

    /// Full-list reconcile against the cloud: upsert everything returned and
    /// drop local rules the cloud no longer knows.
    pub fn replace_rules(&self, rules: &[RecordingRule]) -> StoreResult<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        for rule in rules {
            tx.execute(
                "INSERT INTO recording_rules (
                    rule_id, series_id, title, synopsis, image_url, channel_only, team_only,
                    recent_only, after_original_airdate_only, datetime_only, priority,
                    start_padding, end_padding
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                ON CONFLICT(rule_id) DO UPDATE SET
                    series_id = excluded.series_id,
                    title = excluded.title,
                    synopsis = excluded.synopsis,
                    image_url = excluded.image_url,
                    channel_only = excluded.channel_only,
                    team_only = excluded.team_only,
                    recent_only = excluded.recent_only,
                    after_original_airdate_only = excluded.after_original_airdate_only,
                    datetime_only = excluded.datetime_only,
                    priority = excluded.priority,
                    start_padding = excluded.start_padding,
                    end_padding = excluded.end_padding,
                    updated_at = CURRENT_TIMESTAMP",
                params![
                    &rule.rule_id,
                    &rule.series_id,
                    &rule.title,
                    &rule.synopsis,
                    &rule.image_url,
                    &rule.channel_only,
                    &rule.team_only,
                    rule.recent_only,
                    &rule.after_original_airdate_only,
                    &rule.datetime_only,
                    &rule.priority,
                    rule.start_padding,
                    rule.end_padding,
                ],
            )?;
        }
        let placeholders = std::iter::repeat("?")
            .take(rules.len())
            .collect::<Vec<_>>()
            .join(", ");
        let sql = if rules.is_empty() {
            "DELETE FROM recording_rules".to_string()
        } else {
            format!("DELETE FROM recording_rules WHERE rule_id NOT IN ({placeholders})")
        };
        tx.execute(
            &sql,
            rusqlite::params_from_iter(rules.iter().map(|rule| rule.rule_id.as_str())),
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn list_rules(&self) -> StoreResult<Vec<RecordingRule>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM recording_rules ORDER BY priority IS NULL, priority, rule_id",
        )?;
        let rows = stmt
            .query_map([], |row| RecordingRule::from_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn rule_by_id(&self, rule_id: &str) -> StoreResult<RecordingRule> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM recording_rules WHERE rule_id = ?1")?;
        stmt.query_row([rule_id], |row| RecordingRule::from_row(row))
            .optional()?
            .ok_or_else(|| StoreError::RuleNotFound {
                rule_id: rule_id.to_string(),
            })
    }

    pub fn delete_rule(&self, rule_id: &str) -> StoreResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "DELETE FROM recording_rules WHERE rule_id = ?1",
            [rule_id],
        )?;
        if affected == 0 {
            return Err(StoreError::RuleNotFound {
                rule_id: rule_id.to_string(),
            });
        }
        Ok(())
    }
}
