//! Per-tuner live transcode worker: one child per tuner-to-channel binding,
//! writing a sliding HLS window into the tuner's output directory.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::process::{terminate, FfmpegLauncher, TranscodeLauncher};

use super::LiveError;

pub const LIVE_PLAYLIST_NAME: &str = "playlist.m3u8";

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const PLAYLIST_WAIT: Duration = Duration::from_secs(15);
const STOP_GRACE: Duration = Duration::from_secs(5);
const STOP_WAIT: Duration = Duration::from_secs(8);
const ERROR_RING_CAPACITY: usize = 20;

/// First-segment sanity bound; anything smaller is still container preamble.
const FIRST_SEGMENT_MIN_BYTES: u64 = 10 * 1024;

#[derive(Debug, Clone)]
pub struct LiveWorkerSettings {
    pub live_cache_dir: PathBuf,
    pub ffmpeg: PathBuf,
    pub segment_duration: u32,
}

impl LiveWorkerSettings {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            live_cache_dir: config.live_cache_dir(),
            ffmpeg: PathBuf::from(&config.paths.ffmpeg),
            segment_duration: config.live.live_segment_duration,
        }
    }
}

struct LiveStream {
    pid: Option<u32>,
    stop_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
    dir: PathBuf,
    errors: Arc<Mutex<VecDeque<String>>>,
}

pub struct LiveStreamWorker {
    settings: LiveWorkerSettings,
    launcher: Arc<dyn TranscodeLauncher>,
    streams: Mutex<HashMap<String, LiveStream>>,
}

impl fmt::Debug for LiveStreamWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveStreamWorker")
            .field("settings", &self.settings)
            .finish()
    }
}

impl LiveStreamWorker {
    pub fn new(settings: LiveWorkerSettings, launcher: Option<Arc<dyn TranscodeLauncher>>) -> Self {
        let launcher = launcher.unwrap_or_else(|| Arc::new(FfmpegLauncher));
        Self {
            settings,
            launcher,
            streams: Mutex::new(HashMap::new()),
        }
    }

    pub fn tuner_dir(&self, tuner_id: &str) -> PathBuf {
        self.settings.live_cache_dir.join(tuner_id)
    }

    pub fn is_running(&self, tuner_id: &str) -> bool {
        let streams = self.streams.lock().unwrap();
        streams
            .get(tuner_id)
            .map(|stream| !*stream.done_rx.borrow())
            .unwrap_or(false)
    }

    /// Error-tagged stderr lines captured for this stream, oldest first.
    pub fn errors(&self, tuner_id: &str) -> Vec<String> {
        let streams = self.streams.lock().unwrap();
        streams
            .get(tuner_id)
            .map(|stream| stream.errors.lock().unwrap().iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Spawn the live transcoder for a tuner and wait for its playlist.
    pub async fn start(&self, tuner_id: &str, source_url: &str) -> Result<u32, LiveError> {
        // A stale binding for this tuner is stopped before anything else.
        self.stop(tuner_id).await;

        let dir = self.tuner_dir(tuner_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| LiveError::Io {
                path: dir.clone(),
                source,
            })?;

        let mut command = Command::new(&self.settings.ffmpeg);
        for arg in live_transcode_args(source_url, &dir, self.settings.segment_duration) {
            command.arg(arg);
        }
        let mut child = self
            .launcher
            .spawn(&mut command)
            .map_err(|source| LiveError::Spawn { source })?;
        let pid = child.id().unwrap_or(0);
        info!(tuner_id, pid, source_url, "live transcoder started");

        let errors = Arc::new(Mutex::new(VecDeque::new()));
        if let Some(stderr) = child.stderr.take() {
            let errors = Arc::clone(&errors);
            let tuner = tuner_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "live_transcoder", tuner_id = %tuner, "{line}");
                    if line.to_ascii_lowercase().contains("error") {
                        let mut ring = errors.lock().unwrap();
                        if ring.len() == ERROR_RING_CAPACITY {
                            ring.pop_front();
                        }
                        ring.push_back(line);
                    }
                }
            });
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        {
            let mut streams = self.streams.lock().unwrap();
            streams.insert(
                tuner_id.to_string(),
                LiveStream {
                    pid: Some(pid),
                    stop_tx,
                    done_rx,
                    dir: dir.clone(),
                    errors: Arc::clone(&errors),
                },
            );
        }

        let tuner = tuner_id.to_string();
        let stream_dir = dir.clone();
        tokio::spawn(async move {
            let stopped = tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(status) if status.success() => {
                            info!(tuner_id = %tuner, "live transcoder ended")
                        }
                        Ok(status) => {
                            warn!(tuner_id = %tuner, %status, "live transcoder died")
                        }
                        Err(err) => warn!(tuner_id = %tuner, error = %err, "wait failed"),
                    }
                    false
                }
                _ = stop_rx.changed() => {
                    terminate(&mut child, STOP_GRACE).await;
                    true
                }
            };
            if stopped {
                if let Err(err) = tokio::fs::remove_dir_all(&stream_dir).await {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        warn!(tuner_id = %tuner, error = %err, "failed to remove live directory");
                    }
                }
            }
            let _ = done_tx.send(true);
        });

        if !wait_for_nonempty(&dir.join(LIVE_PLAYLIST_NAME), PLAYLIST_WAIT).await {
            self.stop(tuner_id).await;
            return Err(LiveError::WorkerStartupTimeout {
                tuner_id: tuner_id.to_string(),
            });
        }
        Ok(pid)
    }

    /// Graceful stop; the monitor removes the output directory afterwards.
    pub async fn stop(&self, tuner_id: &str) {
        let removed = {
            let mut streams = self.streams.lock().unwrap();
            streams.remove(tuner_id)
        };
        let Some(stream) = removed else {
            return;
        };
        debug!(tuner_id, pid = ?stream.pid, "stopping live transcoder");
        let _ = stream.stop_tx.send(true);
        let mut done = stream.done_rx;
        let _ = timeout(STOP_WAIT, done.wait_for(|finished| *finished)).await;
    }

    pub async fn stop_all(&self) {
        let ids: Vec<String> = {
            let streams = self.streams.lock().unwrap();
            streams.keys().cloned().collect()
        };
        for id in ids {
            self.stop(&id).await;
        }
    }

    /// Poll until the first segment exists and has a plausible size.
    pub async fn wait_for_first_segment(&self, tuner_id: &str, wait: Duration) -> bool {
        let path = self.tuner_dir(tuner_id).join("segment-0.ts");
        let deadline = Instant::now() + wait;
        loop {
            if let Ok(metadata) = tokio::fs::metadata(&path).await {
                if metadata.len() >= FIRST_SEGMENT_MIN_BYTES {
                    return true;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Serve the live playlist or a segment for a tuner.
    pub async fn read_file(
        &self,
        tuner_id: &str,
        name: &str,
    ) -> Result<(Vec<u8>, &'static str), LiveError> {
        if !valid_live_artifact_name(name) {
            return Err(LiveError::InvalidArtifactName {
                name: name.to_string(),
            });
        }
        let path = self.tuner_dir(tuner_id).join(name);
        let content_type = if name.ends_with(".m3u8") {
            crate::transcode::PLAYLIST_CONTENT_TYPE
        } else {
            crate::transcode::MPEGTS_CONTENT_TYPE
        };
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok((bytes, content_type)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(LiveError::ArtifactNotFound {
                    tuner_id: tuner_id.to_string(),
                    name: name.to_string(),
                })
            }
            Err(source) => Err(LiveError::Io { path, source }),
        }
    }
}

async fn wait_for_nonempty(path: &Path, wait: Duration) -> bool {
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

pub fn valid_live_artifact_name(name: &str) -> bool {
    if name.contains('/') || name.contains('\\') || name.contains("..") {
        return false;
    }
    if name == LIVE_PLAYLIST_NAME {
        return true;
    }
    let Some(digits) = name
        .strip_prefix("segment-")
        .and_then(|rest| rest.strip_suffix(".ts"))
    else {
        return false;
    };
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Argument vector for the live pipeline: tolerant demuxing up front, an
/// endless event playlist out the back.
pub fn live_transcode_args(
    source_url: &str,
    output_dir: &Path,
    segment_duration: u32,
) -> Vec<String> {
    vec![
        "-fflags".into(),
        "discardcorrupt+genpts".into(),
        "-err_detect".into(),
        "ignore_err".into(),
        "-analyzeduration".into(),
        "3000000".into(),
        "-probesize".into(),
        "10000000".into(),
        "-avoid_negative_ts".into(),
        "make_zero".into(),
        "-i".into(),
        source_url.into(),
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
        "append_list+omit_endlist+independent_segments".into(),
        "-hls_segment_type".into(),
        "mpegts".into(),
        "-start_number".into(),
        "0".into(),
        "-muxdelay".into(),
        "0".into(),
        "-muxpreload".into(),
        "0".into(),
        "-hls_segment_filename".into(),
        output_dir.join("segment-%d.ts").to_string_lossy().into_owned(),
        output_dir.join(LIVE_PLAYLIST_NAME).to_string_lossy().into_owned(),
    ]
}
