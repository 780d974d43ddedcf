use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BridgeConfig {
    pub server: ServerSection,
    pub paths: PathsSection,
    pub transcode: TranscodeSection,
    pub live: LiveSection,
    pub discovery: DiscoverySection,
    pub guide: GuideSection,
}

impl BridgeConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.resolve_path(&self.paths.database)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.cache_dir)
    }

    pub fn live_cache_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.live_cache_dir)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Base URL clients use to reach this service; baked into rewritten play URLs.
    #[serde(default)]
    pub external_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    #[serde(default = "default_base_dir")]
    pub base_dir: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,
    #[serde(default = "default_live_cache_dir")]
    pub live_cache_dir: String,
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscodeSection {
    #[serde(default = "default_segment_duration")]
    pub segment_duration: u32,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_transcodes: usize,
    #[serde(default = "default_playlist_wait_secs")]
    pub playlist_wait_secs: u64,
    #[serde(default = "default_segment_wait_secs")]
    pub segment_wait_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_max_cache_age_secs")]
    pub max_cache_age_secs: u64,
}

impl Default for TranscodeSection {
    fn default() -> Self {
        Self {
            segment_duration: default_segment_duration(),
            max_concurrent_transcodes: default_max_concurrent(),
            playlist_wait_secs: default_playlist_wait_secs(),
            segment_wait_secs: default_segment_wait_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            max_cache_age_secs: default_max_cache_age_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LiveSection {
    #[serde(default = "default_live_segment_duration")]
    pub live_segment_duration: u32,
    #[serde(default = "default_live_buffer_minutes")]
    pub live_buffer_minutes: u32,
    #[serde(default = "default_client_heartbeat_secs")]
    pub client_heartbeat_secs: u64,
    #[serde(default = "default_missed_heartbeats")]
    pub missed_heartbeats: u32,
    #[serde(default = "default_tuner_cooldown_secs")]
    pub tuner_cooldown_secs: u64,
    #[serde(default = "default_max_viewers_per_tuner")]
    pub max_viewers_per_tuner: u32,
    #[serde(default = "default_viewer_sweep_secs")]
    pub viewer_sweep_secs: u64,
    #[serde(default = "default_tuner_sweep_secs")]
    pub tuner_sweep_secs: u64,
}

impl Default for LiveSection {
    fn default() -> Self {
        Self {
            live_segment_duration: default_live_segment_duration(),
            live_buffer_minutes: default_live_buffer_minutes(),
            client_heartbeat_secs: default_client_heartbeat_secs(),
            missed_heartbeats: default_missed_heartbeats(),
            tuner_cooldown_secs: default_tuner_cooldown_secs(),
            max_viewers_per_tuner: default_max_viewers_per_tuner(),
            viewer_sweep_secs: default_viewer_sweep_secs(),
            tuner_sweep_secs: default_tuner_sweep_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoverySection {
    #[serde(default = "default_reply_window_secs")]
    pub reply_window_secs: u64,
    #[serde(default = "default_scan_parallelism")]
    pub scan_parallelism: usize,
    #[serde(default = "default_cloud_discover_url")]
    pub cloud_discover_url: String,
    /// Extra addresses probed directly, for appliances on routed segments.
    #[serde(default)]
    pub static_addresses: Vec<String>,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            reply_window_secs: default_reply_window_secs(),
            scan_parallelism: default_scan_parallelism(),
            cloud_discover_url: default_cloud_discover_url(),
            static_addresses: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuideSection {
    #[serde(default = "default_cloud_base_url")]
    pub cloud_base_url: String,
    #[serde(default = "default_guide_refresh_hours")]
    pub guide_refresh_hours: u64,
    #[serde(default = "default_guide_stale_minutes")]
    pub guide_stale_minutes: i64,
}

impl Default for GuideSection {
    fn default() -> Self {
        Self {
            cloud_base_url: default_cloud_base_url(),
            guide_refresh_hours: default_guide_refresh_hours(),
            guide_stale_minutes: default_guide_stale_minutes(),
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8975".to_string()
}

fn default_base_dir() -> String {
    ".".to_string()
}

fn default_database() -> String {
    "tvbridge.sqlite".to_string()
}

fn default_cache_dir() -> String {
    "cache/recorded".to_string()
}

fn default_live_cache_dir() -> String {
    "cache/live".to_string()
}

fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}

fn default_segment_duration() -> u32 {
    4
}

fn default_max_concurrent() -> usize {
    2
}

fn default_playlist_wait_secs() -> u64 {
    15
}

fn default_segment_wait_secs() -> u64 {
    5
}

fn default_cleanup_interval_secs() -> u64 {
    3600
}

fn default_max_cache_age_secs() -> u64 {
    60 * 60 * 24 * 30
}

fn default_live_segment_duration() -> u32 {
    6
}

fn default_live_buffer_minutes() -> u32 {
    60
}

fn default_client_heartbeat_secs() -> u64 {
    30
}

fn default_missed_heartbeats() -> u32 {
    2
}

fn default_tuner_cooldown_secs() -> u64 {
    300
}

fn default_max_viewers_per_tuner() -> u32 {
    10
}

fn default_viewer_sweep_secs() -> u64 {
    30
}

fn default_tuner_sweep_secs() -> u64 {
    60
}

fn default_reply_window_secs() -> u64 {
    3
}

fn default_scan_parallelism() -> usize {
    32
}

fn default_cloud_discover_url() -> String {
    "https://ipv4-api.hdhomerun.com/discover".to_string()
}

fn default_cloud_base_url() -> String {
    "https://api.hdhomerun.com".to_string()
}

fn default_guide_refresh_hours() -> u64 {
    12
}

fn default_guide_stale_minutes() -> i64 {
    15
}

pub fn load_bridge_config<P: AsRef<Path>>(path: P) -> Result<BridgeConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_fixture_config() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs");
        let config = load_bridge_config(dir.join("tvbridge.toml")).expect("config should parse");
        assert_eq!(config.transcode.segment_duration, 4);
        assert_eq!(config.transcode.max_concurrent_transcodes, 2);
        assert_eq!(config.live.tuner_cooldown_secs, 300);
        assert_eq!(config.live.max_viewers_per_tuner, 10);
        assert_eq!(config.guide.guide_refresh_hours, 12);
    }

    #[test]
    fn relative_paths_resolve_against_base_dir() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs");
        let config = load_bridge_config(dir.join("tvbridge.toml")).unwrap();
        let resolved = config.resolve_path("cache/recorded");
        assert!(resolved.starts_with(&config.paths.base_dir));
        assert_eq!(config.resolve_path("/abs/path"), PathBuf::from("/abs/path"));
    }
}
