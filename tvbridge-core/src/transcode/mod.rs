//! On-demand HLS transcode cache: at most one child transcoder per episode,
//! a bounded set of concurrent builds, durable sidecar state and a retention
//! sweep. Recorded playback is served straight from the cache directory.

pub mod backfill;
pub mod sidecar;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::process::{terminate, FfmpegLauncher, TranscodeLauncher};

use self::sidecar::{TranscodeSidecar, PLAYLIST_NAME, SIDECAR_NAME};

pub const MPEGTS_CONTENT_TYPE: &str = "video/mp2t";
pub const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const STOP_GRACE: Duration = Duration::from_secs(5);
const STOP_WAIT: Duration = Duration::from_secs(8);
const STDERR_RING_CAPACITY: usize = 20;

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("transcode cache io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to spawn transcoder: {source}")]
    Spawn { source: std::io::Error },
    #[error("transcoder for episode {episode_id} produced no playlist in time")]
    StartupTimeout { episode_id: i64 },
    #[error("invalid artifact name {name:?}")]
    InvalidArtifactName { name: String },
    #[error("artifact {name} for episode {episode_id} not found (state {state:?})")]
    ArtifactNotFound {
        episode_id: i64,
        name: String,
        state: Option<TranscodeState>,
    },
    #[error("no transcode job for episode {episode_id}")]
    JobNotFound { episode_id: i64 },
    #[error("invalid sidecar at {path}: {source}")]
    Sidecar {
        path: PathBuf,
        source: serde_json::Error,
    },
}

pub type TranscodeResult<T> = Result<T, TranscodeError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscodeState {
    Pending,
    Transcoding,
    Complete,
    Error,
}

impl TranscodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TranscodeState::Pending => "pending",
            TranscodeState::Transcoding => "transcoding",
            TranscodeState::Complete => "complete",
            TranscodeState::Error => "error",
        }
    }
}

impl fmt::Display for TranscodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscodeMode {
    /// A viewer is waiting; overflow evicts the oldest running build.
    Interactive,
    /// Backfill driver; overflow defers and the driver retries.
    Bulk,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranscodeMetadata {
    pub show_name: Option<String>,
    pub episode_name: Option<String>,
    pub air_date: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Completed,
    Failed,
    Evicted,
}

#[derive(Debug, Clone, Copy)]
pub struct TranscodeExit {
    pub episode_id: i64,
    pub kind: ExitKind,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscodeStatus {
    pub episode_id: i64,
    pub state: TranscodeState,
    /// Seconds of output materialized so far.
    pub progress: u64,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TranscodeSettings {
    pub cache_dir: PathBuf,
    pub ffmpeg: PathBuf,
    pub segment_duration: u32,
    pub max_concurrent: usize,
    pub playlist_wait: Duration,
    pub segment_wait: Duration,
    pub cleanup_interval: Duration,
    pub max_cache_age: Duration,
}

impl TranscodeSettings {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            cache_dir: config.cache_dir(),
            ffmpeg: PathBuf::from(&config.paths.ffmpeg),
            segment_duration: config.transcode.segment_duration,
            max_concurrent: config.transcode.max_concurrent_transcodes.max(1),
            playlist_wait: Duration::from_secs(config.transcode.playlist_wait_secs),
            segment_wait: Duration::from_secs(config.transcode.segment_wait_secs),
            cleanup_interval: Duration::from_secs(config.transcode.cleanup_interval_secs),
            max_cache_age: Duration::from_secs(config.transcode.max_cache_age_secs),
        }
    }
}

struct JobEntry {
    state: TranscodeState,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    output_dir: PathBuf,
    source_url: String,
    metadata: TranscodeMetadata,
    error: Option<String>,
    pid: Option<u32>,
    stop_tx: Option<watch::Sender<bool>>,
    done_rx: Option<watch::Receiver<bool>>,
    stderr_ring: Arc<Mutex<VecDeque<String>>>,
}

#[derive(Default)]
struct JobsTable {
    entries: HashMap<i64, JobEntry>,
    /// Episode ids currently transcoding, oldest first; eviction order.
    active: Vec<i64>,
}

enum StartAction {
    Defer(PathBuf),
    Evict(i64),
    Reserved,
}

pub struct TranscodeEngine {
    settings: TranscodeSettings,
    launcher: Arc<dyn TranscodeLauncher>,
    jobs: Arc<Mutex<JobsTable>>,
    exits: Arc<Mutex<Option<mpsc::UnboundedSender<TranscodeExit>>>>,
}

impl fmt::Debug for TranscodeEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranscodeEngine")
            .field("settings", &self.settings)
            .finish()
    }
}

impl TranscodeEngine {
    pub fn new(settings: TranscodeSettings, launcher: Option<Arc<dyn TranscodeLauncher>>) -> Self {
        let launcher = launcher.unwrap_or_else(|| Arc::new(FfmpegLauncher));
        Self {
            settings,
            launcher,
            jobs: Arc::new(Mutex::new(JobsTable::default())),
            exits: Arc::new(Mutex::new(None)),
        }
    }

    pub fn settings(&self) -> &TranscodeSettings {
        &self.settings
    }

    pub fn episode_dir(&self, episode_id: i64) -> PathBuf {
        self.settings.cache_dir.join(episode_id.to_string())
    }

    pub fn active_count(&self) -> usize {
        self.jobs.lock().unwrap().active.len()
    }

    pub fn state_of(&self, episode_id: i64) -> Option<TranscodeState> {
        self.jobs
            .lock()
            .unwrap()
            .entries
            .get(&episode_id)
            .map(|entry| entry.state)
    }

    /// Child-exit notifications, consumed by the backfill driver. A new
    /// subscription replaces the previous one.
    pub fn subscribe_exits(&self) -> mpsc::UnboundedReceiver<TranscodeExit> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.exits.lock().unwrap() = Some(tx);
        rx
    }

    fn notify_exit(exits: &Mutex<Option<mpsc::UnboundedSender<TranscodeExit>>>, exit: TranscodeExit) {
        let mut guard = exits.lock().unwrap();
        if let Some(tx) = guard.as_ref() {
            if tx.send(exit).is_err() {
                *guard = None;
            }
        }
    }

    /// Idempotent start. A completed or running build returns its directory
    /// immediately; capacity overflow evicts (interactive) or defers (bulk).
    pub async fn start(
        &self,
        episode_id: i64,
        upstream_url: &str,
        mode: TranscodeMode,
        metadata: TranscodeMetadata,
    ) -> TranscodeResult<PathBuf> {
        let output_dir = self.episode_dir(episode_id);
        loop {
            let action = {
                let mut jobs = self.jobs.lock().unwrap();
                if let Some(entry) = jobs.entries.get(&episode_id) {
                    match entry.state {
                        TranscodeState::Complete | TranscodeState::Transcoding => {
                            return Ok(entry.output_dir.clone());
                        }
                        TranscodeState::Pending | TranscodeState::Error => {}
                    }
                }
                if jobs.active.len() >= self.settings.max_concurrent {
                    match mode {
                        TranscodeMode::Bulk => StartAction::Defer(output_dir.clone()),
                        TranscodeMode::Interactive => StartAction::Evict(jobs.active[0]),
                    }
                } else {
                    jobs.entries.insert(
                        episode_id,
                        JobEntry {
                            state: TranscodeState::Transcoding,
                            start_time: Utc::now(),
                            end_time: None,
                            output_dir: output_dir.clone(),
                            source_url: upstream_url.to_string(),
                            metadata: metadata.clone(),
                            error: None,
                            pid: None,
                            stop_tx: None,
                            done_rx: None,
                            stderr_ring: Arc::new(Mutex::new(VecDeque::new())),
                        },
                    );
                    jobs.active.push(episode_id);
                    StartAction::Reserved
                }
            };

            match action {
                StartAction::Defer(dir) => return Ok(dir),
                StartAction::Evict(victim) => {
                    warn!(
                        victim,
                        for_episode = episode_id,
                        "transcode capacity reached, evicting oldest build"
                    );
                    self.delete(victim).await?;
                    Self::notify_exit(
                        &self.exits,
                        TranscodeExit {
                            episode_id: victim,
                            kind: ExitKind::Evicted,
                        },
                    );
                }
                StartAction::Reserved => break,
            }
        }

        if let Err(err) = self
            .launch(episode_id, upstream_url, &output_dir, &metadata)
            .await
        {
            self.fail_reservation(episode_id, &err.to_string()).await;
            return Err(err);
        }

        if self
            .wait_for_file(&output_dir.join(PLAYLIST_NAME), self.settings.playlist_wait)
            .await
        {
            Ok(output_dir)
        } else {
            // The job stays flagged Transcoding; the retention sweep or an
            // eventual child exit settles it.
            Err(TranscodeError::StartupTimeout { episode_id })
        }
    }

    async fn launch(
        &self,
        episode_id: i64,
        upstream_url: &str,
        output_dir: &Path,
        metadata: &TranscodeMetadata,
    ) -> TranscodeResult<()> {
        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|source| TranscodeError::Io {
                path: output_dir.to_path_buf(),
                source,
            })?;

        let started_at = Utc::now();
        TranscodeSidecar::started(upstream_url, metadata, started_at)
            .persist(output_dir)
            .await?;

        let mut command = Command::new(&self.settings.ffmpeg);
        for arg in recorded_transcode_args(
            upstream_url,
            output_dir,
            self.settings.segment_duration,
        ) {
            command.arg(arg);
        }
        let mut child = self
            .launcher
            .spawn(&mut command)
            .map_err(|source| TranscodeError::Spawn { source })?;
        let pid = child.id();
        info!(episode_id, pid = ?pid, "transcoder started");

        let ring = {
            let jobs = self.jobs.lock().unwrap();
            jobs.entries
                .get(&episode_id)
                .map(|entry| Arc::clone(&entry.stderr_ring))
                .unwrap_or_default()
        };
        let stderr_reader = child.stderr.take().map(|stderr| {
            let ring = Arc::clone(&ring);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "transcoder", "{line}");
                    if line.to_ascii_lowercase().contains("error") {
                        let mut ring = ring.lock().unwrap();
                        if ring.len() == STDERR_RING_CAPACITY {
                            ring.pop_front();
                        }
                        ring.push_back(line);
                    }
                }
            })
        });

        let (stop_tx, stop_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        {
            let mut jobs = self.jobs.lock().unwrap();
            if let Some(entry) = jobs.entries.get_mut(&episode_id) {
                entry.pid = pid;
                entry.stop_tx = Some(stop_tx);
                entry.done_rx = Some(done_rx);
            }
        }

        let jobs = Arc::clone(&self.jobs);
        let exits = Arc::clone(&self.exits);
        let dir = output_dir.to_path_buf();
        tokio::spawn(async move {
            monitor_child(
                child,
                stop_rx,
                done_tx,
                jobs,
                exits,
                dir,
                episode_id,
                ring,
                stderr_reader,
            )
            .await;
        });
        Ok(())
    }

    async fn fail_reservation(&self, episode_id: i64, message: &str) {
        let (dir, sidecar) = {
            let mut jobs = self.jobs.lock().unwrap();
            jobs.active.retain(|id| *id != episode_id);
            match jobs.entries.get_mut(&episode_id) {
                Some(entry) => {
                    entry.state = TranscodeState::Error;
                    entry.end_time = Some(Utc::now());
                    entry.error = Some(message.to_string());
                    (
                        entry.output_dir.clone(),
                        TranscodeSidecar {
                            state: TranscodeState::Error,
                            start_time: entry.start_time,
                            end_time: entry.end_time,
                            source_url: entry.source_url.clone(),
                            show_name: entry.metadata.show_name.clone(),
                            episode_name: entry.metadata.episode_name.clone(),
                            air_date: entry.metadata.air_date.clone(),
                            error: entry.error.clone(),
                            stderr_tail: None,
                        },
                    )
                }
                None => return,
            }
        };
        if let Err(err) = sidecar.persist(&dir).await {
            warn!(episode_id, error = %err, "failed to persist error sidecar");
        }
        Self::notify_exit(
            &self.exits,
            TranscodeExit {
                episode_id,
                kind: ExitKind::Failed,
            },
        );
    }

    /// Serve a playlist or segment from the cache, waiting briefly for files
    /// the running transcoder has not produced yet.
    pub async fn serve_file(
        &self,
        episode_id: i64,
        name: &str,
    ) -> TranscodeResult<(Vec<u8>, &'static str)> {
        if !valid_artifact_name(name) {
            return Err(TranscodeError::InvalidArtifactName {
                name: name.to_string(),
            });
        }
        let path = self.episode_dir(episode_id).join(name);
        let content_type = if name.ends_with(".m3u8") {
            PLAYLIST_CONTENT_TYPE
        } else {
            MPEGTS_CONTENT_TYPE
        };

        let deadline = Instant::now() + self.settings.segment_wait;
        loop {
            match tokio::fs::read(&path).await {
                Ok(bytes) => return Ok((bytes, content_type)),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    let transcoding = self.state_of(episode_id) == Some(TranscodeState::Transcoding);
                    if !transcoding || Instant::now() >= deadline {
                        return Err(TranscodeError::ArtifactNotFound {
                            episode_id,
                            name: name.to_string(),
                            state: self.state_of(episode_id),
                        });
                    }
                    sleep(POLL_INTERVAL).await;
                }
                Err(source) => return Err(TranscodeError::Io { path, source }),
            }
        }
    }

    pub async fn status(&self, episode_id: i64) -> TranscodeResult<TranscodeStatus> {
        let summary = {
            let jobs = self.jobs.lock().unwrap();
            let entry = jobs
                .entries
                .get(&episode_id)
                .ok_or(TranscodeError::JobNotFound { episode_id })?;
            TranscodeStatus {
                episode_id,
                state: entry.state,
                progress: 0,
                start_time: entry.start_time,
                end_time: entry.end_time,
                error: entry.error.clone(),
            }
        };
        let segments = count_segments(&self.episode_dir(episode_id)).await;
        Ok(TranscodeStatus {
            progress: segments as u64 * u64::from(self.settings.segment_duration),
            ..summary
        })
    }

    pub async fn overview(&self) -> Vec<TranscodeStatus> {
        let ids: Vec<i64> = {
            let jobs = self.jobs.lock().unwrap();
            let mut ids: Vec<i64> = jobs.entries.keys().copied().collect();
            ids.sort_unstable();
            ids
        };
        let mut statuses = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(status) = self.status(id).await {
                statuses.push(status);
            }
        }
        statuses
    }

    /// Stop a running build if present and drop the cache directory.
    pub async fn delete(&self, episode_id: i64) -> TranscodeResult<()> {
        let (stop_tx, done_rx) = {
            let mut jobs = self.jobs.lock().unwrap();
            jobs.active.retain(|id| *id != episode_id);
            match jobs.entries.remove(&episode_id) {
                Some(entry) => (entry.stop_tx, entry.done_rx),
                None => (None, None),
            }
        };
        if let Some(stop) = stop_tx {
            let _ = stop.send(true);
            if let Some(mut done) = done_rx {
                let _ = timeout(STOP_WAIT, done.wait_for(|finished| *finished)).await;
            }
        }
        let dir = self.episode_dir(episode_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(episode_id, "transcode cache directory removed");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(TranscodeError::Io { path: dir, source }),
        }
    }

    /// Startup pass over the cache root: abandoned builds are discarded,
    /// finished ones are readopted into the jobs table.
    pub async fn recover_cache(&self) -> TranscodeResult<usize> {
        tokio::fs::create_dir_all(&self.settings.cache_dir)
            .await
            .map_err(|source| TranscodeError::Io {
                path: self.settings.cache_dir.clone(),
                source,
            })?;
        let mut read_dir = tokio::fs::read_dir(&self.settings.cache_dir)
            .await
            .map_err(|source| TranscodeError::Io {
                path: self.settings.cache_dir.clone(),
                source,
            })?;
        let mut restored = 0;
        while let Some(entry) = read_dir.next_entry().await.ok().flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(episode_id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<i64>().ok())
            else {
                continue;
            };
            let sidecar = match TranscodeSidecar::load(&path).await {
                Ok(Some(sidecar)) => sidecar,
                Ok(None) => continue,
                Err(err) => {
                    warn!(episode_id, error = %err, "unreadable sidecar, ignoring directory");
                    continue;
                }
            };
            match sidecar.state {
                TranscodeState::Transcoding => {
                    info!(episode_id, "removing abandoned transcode directory");
                    let _ = tokio::fs::remove_dir_all(&path).await;
                }
                TranscodeState::Complete if path.join(PLAYLIST_NAME).exists() => {
                    let mut jobs = self.jobs.lock().unwrap();
                    jobs.entries.insert(
                        episode_id,
                        JobEntry {
                            state: TranscodeState::Complete,
                            start_time: sidecar.start_time,
                            end_time: sidecar.end_time,
                            output_dir: path.clone(),
                            source_url: sidecar.source_url.clone(),
                            metadata: TranscodeMetadata {
                                show_name: sidecar.show_name.clone(),
                                episode_name: sidecar.episode_name.clone(),
                                air_date: sidecar.air_date.clone(),
                            },
                            error: None,
                            pid: None,
                            stop_tx: None,
                            done_rx: None,
                            stderr_ring: Arc::new(Mutex::new(VecDeque::new())),
                        },
                    );
                    restored += 1;
                }
                _ => {}
            }
        }
        info!(restored, "transcode cache recovered");
        Ok(restored)
    }

    /// Retention sweep: directories untouched for longer than the cache age
    /// bound are deleted through the same path as explicit deletes.
    pub async fn cleanup_sweep(&self) -> TranscodeResult<usize> {
        let mut read_dir = match tokio::fs::read_dir(&self.settings.cache_dir).await {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(source) => {
                return Err(TranscodeError::Io {
                    path: self.settings.cache_dir.clone(),
                    source,
                })
            }
        };
        let mut removed = 0;
        while let Some(entry) = read_dir.next_entry().await.ok().flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(episode_id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<i64>().ok())
            else {
                continue;
            };
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| modified.elapsed().ok())
                .unwrap_or_default();
            if age > self.settings.max_cache_age {
                info!(episode_id, age_secs = age.as_secs(), "expiring cached transcode");
                self.delete(episode_id).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub async fn run_cleanup(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.settings.cleanup_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match self.cleanup_sweep().await {
                Ok(0) => {}
                Ok(removed) => info!(removed, "retention sweep removed cached transcodes"),
                Err(err) => warn!(error = %err, "retention sweep failed"),
            }
        }
    }

    /// Terminate every running child. Sidecars stay as they are; startup
    /// recovery treats the interrupted builds as abandoned.
    pub async fn shutdown(&self) {
        let waiting: Vec<(watch::Sender<bool>, Option<watch::Receiver<bool>>)> = {
            let mut jobs = self.jobs.lock().unwrap();
            let ids: Vec<i64> = jobs.active.clone();
            ids.iter()
                .filter_map(|id| {
                    jobs.entries.get_mut(id).and_then(|entry| {
                        entry.stop_tx.take().map(|tx| (tx, entry.done_rx.clone()))
                    })
                })
                .collect()
        };
        for (stop, done) in waiting {
            let _ = stop.send(true);
            if let Some(mut done) = done {
                let _ = timeout(STOP_WAIT, done.wait_for(|finished| *finished)).await;
            }
        }
    }

    async fn wait_for_file(&self, path: &Path, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        loop {
            if let Ok(metadata) = tokio::fs::metadata(path).await {
                if metadata.len() > 0 {
                    return true;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(POLL_INTERVAL).await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn monitor_child(
    mut child: tokio::process::Child,
    mut stop_rx: watch::Receiver<bool>,
    done_tx: watch::Sender<bool>,
    jobs: Arc<Mutex<JobsTable>>,
    exits: Arc<Mutex<Option<mpsc::UnboundedSender<TranscodeExit>>>>,
    output_dir: PathBuf,
    episode_id: i64,
    stderr_ring: Arc<Mutex<VecDeque<String>>>,
    stderr_reader: Option<tokio::task::JoinHandle<()>>,
) {
    let exit_status = tokio::select! {
        status = child.wait() => Some(status),
        _ = stop_rx.changed() => {
            terminate(&mut child, STOP_GRACE).await;
            None
        }
    };

    // The pipe hits EOF once the child is gone; drain it fully before the
    // tail is captured.
    if let Some(reader) = stderr_reader {
        let _ = reader.await;
    }

    match exit_status {
        Some(wait_result) => {
            let (state, error) = match wait_result {
                Ok(status) if status.success() => (TranscodeState::Complete, None),
                Ok(status) => (
                    TranscodeState::Error,
                    Some(format!("transcoder exited with status {status}")),
                ),
                Err(err) => (
                    TranscodeState::Error,
                    Some(format!("failed to reap transcoder: {err}")),
                ),
            };
            let tail: Vec<String> = stderr_ring.lock().unwrap().iter().cloned().collect();
            let ended_at = Utc::now();

            let sidecar = {
                let mut table = jobs.lock().unwrap();
                table.active.retain(|id| *id != episode_id);
                table.entries.get_mut(&episode_id).map(|entry| {
                    entry.state = state;
                    entry.end_time = Some(ended_at);
                    entry.error = error.clone();
                    entry.pid = None;
                    entry.stop_tx = None;
                    TranscodeSidecar {
                        state,
                        start_time: entry.start_time,
                        end_time: Some(ended_at),
                        source_url: entry.source_url.clone(),
                        show_name: entry.metadata.show_name.clone(),
                        episode_name: entry.metadata.episode_name.clone(),
                        air_date: entry.metadata.air_date.clone(),
                        error: error.clone(),
                        stderr_tail: if tail.is_empty() { None } else { Some(tail) },
                    }
                })
            };
            if let Some(sidecar) = sidecar {
                if let Err(err) = sidecar.persist(&output_dir).await {
                    warn!(episode_id, error = %err, "failed to persist sidecar");
                }
            }
            match state {
                TranscodeState::Complete => info!(episode_id, "transcode complete"),
                _ => warn!(episode_id, error = ?error, "transcode failed"),
            }
            TranscodeEngine::notify_exit(
                &exits,
                TranscodeExit {
                    episode_id,
                    kind: if state == TranscodeState::Complete {
                        ExitKind::Completed
                    } else {
                        ExitKind::Failed
                    },
                },
            );
        }
        None => {
            // Stopped by eviction, delete or shutdown; the caller owns the
            // entry and the directory.
            let mut table = jobs.lock().unwrap();
            table.active.retain(|id| *id != episode_id);
        }
    }
    let _ = done_tx.send(true);
}

/// Argument vector for a recorded-content transcode.
pub fn recorded_transcode_args(
    upstream_url: &str,
    output_dir: &Path,
    segment_duration: u32,
) -> Vec<String> {
    vec![
        "-i".into(),
        upstream_url.into(),
        "-c:v".into(),
        "h264".into(),
        "-preset".into(),
        "veryfast".into(),
        "-crf".into(),
        "23".into(),
        "-maxrate".into(),
        "5000k".into(),
        "-bufsize".into(),
        "10000k".into(),
        "-g".into(),
        "48".into(),
        "-sc_threshold".into(),
        "0".into(),
        "-c:a".into(),
        "aac".into(),
        "-b:a".into(),
        "192k".into(),
        "-ac".into(),
        "2".into(),
        "-ar".into(),
        "48000".into(),
        "-f".into(),
        "hls".into(),
        "-hls_time".into(),
        segment_duration.to_string(),
        "-hls_list_size".into(),
        "0".into(),
        "-hls_flags".into(),
        "append_list".into(),
        "-hls_segment_filename".into(),
        output_dir.join("segment%04d.ts").to_string_lossy().into_owned(),
        output_dir.join(PLAYLIST_NAME).to_string_lossy().into_owned(),
    ]
}

/// Only the playlist and four-digit segment names are ever served.
pub fn valid_artifact_name(name: &str) -> bool {
    if name.contains('/') || name.contains('\\') || name.contains("..") {
        return false;
    }
    if name == PLAYLIST_NAME {
        return true;
    }
    if name == SIDECAR_NAME {
        return false;
    }
    let Some(digits) = name
        .strip_prefix("segment")
        .and_then(|rest| rest.strip_suffix(".ts"))
    else {
        return false;
    };
    digits.len() == 4 && digits.bytes().all(|b| b.is_ascii_digit())
}

async fn count_segments(dir: &Path) -> usize {
    let Ok(mut read_dir) = tokio::fs::read_dir(dir).await else {
        return 0;
    };
    let mut count = 0;
    while let Some(entry) = read_dir.next_entry().await.ok().flatten() {
        if let Some(name) = entry.file_name().to_str() {
            if name.starts_with("segment") && name.ends_with(".ts") {
                count += 1;
            }
        }
    }
    count
}
