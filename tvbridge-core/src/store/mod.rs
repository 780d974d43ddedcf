pub mod catalog;
pub mod guide;
pub mod live;
pub mod models;

use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags};
use thiserror::Error;

use crate::sqlite::configure_connection;

const MEDIA_SCHEMA: &str = include_str!("../../sql/schema.sql");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open media database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on media database: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("media database path not configured")]
    MissingStore,
    #[error("episode {id} not found")]
    EpisodeNotFound { id: i64 },
    #[error("series {id} not found")]
    SeriesNotFound { id: i64 },
    #[error("device {device_id} not found")]
    DeviceNotFound { device_id: String },
    #[error("recording rule {rule_id} not found")]
    RuleNotFound { rule_id: String },
    #[error("resume position {position}s exceeds episode duration {duration}s")]
    ProgressOutOfRange { position: i64, duration: i64 },
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone)]
pub struct MediaStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for MediaStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl MediaStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> StoreResult<MediaStore> {
        let path = self.path.ok_or(StoreError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(MediaStore { path, flags })
    }
}

/// Handle to the single relational store backing catalog, guide and live
/// state. Cheap to clone; every call opens a configured connection.
#[derive(Debug, Clone)]
pub struct MediaStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl MediaStore {
    pub fn builder() -> MediaStoreBuilder {
        MediaStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        MediaStoreBuilder::new().path(path).build()
    }

    pub(crate) fn open(&self) -> StoreResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            StoreError::Open {
                source,
                path: self.path.clone(),
            }
        })?;
        configure_connection(&conn).map_err(|source| StoreError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute_batch(MEDIA_SCHEMA)?;
        Ok(())
    }

    /// One-shot reconciliation of the derived series columns. Run at startup
    /// so rows that pre-date the triggers end up consistent.
    pub fn recalculate_series_aggregates(&self) -> StoreResult<usize> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE series SET
                episode_count = (SELECT COUNT(*) FROM episodes WHERE series_id = series.id),
                total_duration = (SELECT COALESCE(SUM(end_time - start_time), 0)
                                  FROM episodes WHERE series_id = series.id),
                first_recorded = (SELECT MIN(start_time) FROM episodes WHERE series_id = series.id),
                last_recorded = (SELECT MAX(start_time) FROM episodes WHERE series_id = series.id)",
            [],
        )?;
        Ok(affected)
    }
}
