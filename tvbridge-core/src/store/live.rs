use rusqlite::params;

use super::models::{TunerRow, ViewerRow};
use super::{MediaStore, StoreResult};

impl MediaStore {
    /// Mirror rows for cross-restart visibility. The pool resets anything
    /// that claimed a live worker before persisting again.
    pub fn load_tuners(&self) -> StoreResult<Vec<TunerRow>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM live_tuners ORDER BY tuner_id")?;
        let rows = stmt
            .query_map([], |row| TunerRow::from_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn save_tuner(&self, tuner: &TunerRow) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO live_tuners (
                tuner_id, device_id, tuner_index, state, channel, viewer_count, last_accessed
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(tuner_id) DO UPDATE SET
                device_id = excluded.device_id,
                tuner_index = excluded.tuner_index,
                state = excluded.state,
                channel = excluded.channel,
                viewer_count = excluded.viewer_count,
                last_accessed = excluded.last_accessed",
            params![
                &tuner.tuner_id,
                &tuner.device_id,
                tuner.tuner_index,
                tuner.state.as_str(),
                &tuner.channel,
                tuner.viewer_count,
                tuner.last_accessed,
            ],
        )?;
        Ok(())
    }

    pub fn remove_tuner(&self, tuner_id: &str) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute("DELETE FROM live_tuners WHERE tuner_id = ?1", [tuner_id])?;
        Ok(())
    }

    pub fn save_viewer(&self, viewer: &ViewerRow) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO live_viewers (client_id, tuner_id, channel, last_heartbeat)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(client_id) DO UPDATE SET
                tuner_id = excluded.tuner_id,
                channel = excluded.channel,
                last_heartbeat = excluded.last_heartbeat",
            params![
                &viewer.client_id,
                &viewer.tuner_id,
                &viewer.channel,
                viewer.last_heartbeat,
            ],
        )?;
        Ok(())
    }

    pub fn remove_viewer(&self, client_id: &str) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute("DELETE FROM live_viewers WHERE client_id = ?1", [client_id])?;
        Ok(())
    }

    /// No viewer survives a restart; their workers are gone with the process.
    pub fn clear_viewers(&self) -> StoreResult<usize> {
        let conn = self.open()?;
        let affected = conn.execute("DELETE FROM live_viewers", [])?;
        Ok(affected)
    }
}
