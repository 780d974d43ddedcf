use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tvbridge_core::discovery::{Appliance, DiscoverySource};
use tvbridge_core::live::worker::{LiveStreamWorker, LiveWorkerSettings};
use tvbridge_core::live::{AvailabilityProbe, LiveError, LiveSettings, TunerPool};
use tvbridge_core::store::models::TunerState;
use tvbridge_core::{MediaStore, TranscodeLauncher};

struct ScriptLauncher {
    spawned: AtomicUsize,
}

impl ScriptLauncher {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            spawned: AtomicUsize::new(0),
        })
    }

    fn spawn_count(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }
}

impl TranscodeLauncher for ScriptLauncher {
    fn spawn(&self, command: &mut tokio::process::Command) -> std::io::Result<tokio::process::Child> {
        let args: Vec<String> = command
            .as_std()
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        let playlist = PathBuf::from(args.last().expect("argv ends with playlist path"));
        let dir = playlist.parent().expect("playlist has a parent").to_path_buf();
        self.spawned.fetch_add(1, Ordering::SeqCst);
        let script = format!(
            "printf '#EXTM3U\\n' > {d}/playlist.m3u8; \
             head -c 12000 /dev/zero > {d}/segment-0.ts; exec sleep 600",
            d = dir.display()
        );
        tokio::process::Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }
}

/// Appliance stand-in: availability and pre-check outcomes are scripted.
struct StubProbe {
    free: AtomicBool,
    probe_error: std::sync::Mutex<Option<LiveError>>,
}

impl StubProbe {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            free: AtomicBool::new(true),
            probe_error: std::sync::Mutex::new(None),
        })
    }

    fn set_free(&self, free: bool) {
        self.free.store(free, Ordering::SeqCst);
    }

    fn fail_probe_with(&self, error: LiveError) {
        *self.probe_error.lock().unwrap() = Some(error);
    }
}

#[async_trait]
impl AvailabilityProbe for StubProbe {
    async fn has_free_tuner(&self, _base_url: &str) -> Result<bool, LiveError> {
        Ok(self.free.load(Ordering::SeqCst))
    }

    async fn probe_live(&self, _ip: &str, channel: &str) -> Result<(), LiveError> {
        match self.probe_error.lock().unwrap().take() {
            Some(err) => Err(err),
            None => {
                let _ = channel;
                Ok(())
            }
        }
    }
}

fn appliance(device_id: &str, tuners: u32) -> Appliance {
    Appliance {
        device_id: device_id.into(),
        ip_address: "127.0.0.1".into(),
        friendly_name: None,
        model_number: Some("HDHomeRun FLEX 4K".into()),
        firmware_name: None,
        firmware_version: None,
        base_url: Some("http://127.0.0.1".into()),
        lineup_url: None,
        storage_url: None,
        device_auth: None,
        tuner_count: tuners,
        total_space: None,
        free_space: None,
        source: DiscoverySource::Udp,
    }
}

fn settings() -> LiveSettings {
    LiveSettings {
        heartbeat: Duration::from_secs(30),
        missed_heartbeats: 2,
        cooldown: Duration::from_secs(300),
        max_viewers_per_tuner: 10,
        viewer_sweep: Duration::from_secs(30),
        tuner_sweep: Duration::from_secs(60),
    }
}

struct Fixture {
    pool: Arc<TunerPool>,
    probe: Arc<StubProbe>,
    launcher: Arc<ScriptLauncher>,
    _dir: TempDir,
}

async fn fixture_with(settings: LiveSettings, tuners: u32) -> Fixture {
    let dir = TempDir::new().unwrap();
    let store = MediaStore::builder()
        .path(dir.path().join("media.sqlite"))
        .create_if_missing(true)
        .build()
        .unwrap();
    store.initialize().unwrap();

    let launcher = ScriptLauncher::new();
    let worker = Arc::new(LiveStreamWorker::new(
        LiveWorkerSettings {
            live_cache_dir: dir.path().join("live"),
            ffmpeg: Path::new("ffmpeg").to_path_buf(),
            segment_duration: 6,
        },
        Some(launcher.clone()),
    ));
    let probe = StubProbe::new();
    let pool = Arc::new(
        TunerPool::new(settings, store, probe.clone(), worker).unwrap(),
    );
    pool.register_appliances(&[appliance("T0", 2)]).await;
    if tuners > 2 {
        pool.register_appliances(&[appliance("T0", 2), appliance("T1", tuners - 2)])
            .await;
    }
    Fixture {
        pool,
        probe,
        launcher,
        _dir: dir,
    }
}

async fn fixture() -> Fixture {
    fixture_with(settings(), 2).await
}

#[tokio::test]
async fn viewers_share_a_channel_tuner() {
    let f = fixture().await;

    let grant_a = f.pool.watch("2.1", "client-a").await.unwrap();
    assert_eq!(grant_a.tuner_id, "T0-tuner-0");
    assert_eq!(grant_a.playlist_url, "/live/T0-tuner-0/playlist.m3u8");

    let grant_b = f.pool.watch("2.1", "client-b").await.unwrap();
    assert_eq!(grant_b.tuner_id, "T0-tuner-0");
    // Shared channel means shared worker.
    assert_eq!(f.launcher.spawn_count(), 1);

    let tuners = f.pool.tuners().await;
    let tuner = tuners.iter().find(|t| t.tuner_id == "T0-tuner-0").unwrap();
    assert_eq!(tuner.state, TunerState::Active);
    assert_eq!(tuner.viewer_count, 2);

    f.pool.shutdown().await;
}

#[tokio::test]
async fn different_channels_take_different_tuners() {
    let f = fixture().await;

    let grant_a = f.pool.watch("2.1", "client-a").await.unwrap();
    let grant_b = f.pool.watch("7.1", "client-b").await.unwrap();
    assert_ne!(grant_a.tuner_id, grant_b.tuner_id);
    assert_eq!(f.launcher.spawn_count(), 2);

    f.pool.shutdown().await;
}

#[tokio::test]
async fn release_cools_down_and_reattach_reuses_worker() {
    let f = fixture().await;

    f.pool.watch("2.1", "client-a").await.unwrap();
    f.pool.release("client-a").await.unwrap();

    let tuners = f.pool.tuners().await;
    assert_eq!(tuners[0].state, TunerState::Cooldown);
    assert_eq!(tuners[0].viewer_count, 0);

    // Same channel within the cooldown window: no restart.
    let grant = f.pool.watch("2.1", "client-b").await.unwrap();
    assert_eq!(grant.tuner_id, "T0-tuner-0");
    assert_eq!(f.launcher.spawn_count(), 1);
    let tuners = f.pool.tuners().await;
    assert_eq!(tuners[0].state, TunerState::Active);

    f.pool.shutdown().await;
}

#[tokio::test]
async fn cooldown_retune_stops_the_old_worker() {
    let f = fixture().await;

    // Occupy both tuners, then walk away from both.
    f.pool.watch("2.1", "client-a").await.unwrap();
    f.pool.watch("7.1", "client-b").await.unwrap();
    f.pool.release("client-a").await.unwrap();
    f.pool.release("client-b").await.unwrap();

    // No idle tuner remains, so a third channel retunes a cooldown tuner.
    let grant = f.pool.watch("9.1", "client-c").await.unwrap();
    assert_eq!(grant.tuner_id, "T0-tuner-0");
    assert_eq!(f.launcher.spawn_count(), 3);

    let tuners = f.pool.tuners().await;
    let retuned = tuners.iter().find(|t| t.tuner_id == "T0-tuner-0").unwrap();
    assert_eq!(retuned.state, TunerState::Active);
    assert_eq!(retuned.channel.as_deref(), Some("9.1"));

    f.pool.shutdown().await;
}

#[tokio::test]
async fn cooldown_expiry_idles_the_tuner() {
    let mut cfg = settings();
    cfg.cooldown = Duration::ZERO;
    let f = fixture_with(cfg, 2).await;

    f.pool.watch("2.1", "client-a").await.unwrap();
    let dir = f.pool.worker().tuner_dir("T0-tuner-0");
    assert!(dir.join("playlist.m3u8").exists());

    f.pool.release("client-a").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let idled = f.pool.sweep_idle().await;
    assert_eq!(idled, 1);

    let tuners = f.pool.tuners().await;
    assert_eq!(tuners[0].state, TunerState::Idle);
    assert!(tuners[0].channel.is_none());
    // The worker monitor removes the output directory on stop.
    for _ in 0..20 {
        if !dir.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(!dir.exists());
}

#[tokio::test]
async fn stale_viewers_are_reaped_fresh_ones_survive() {
    let mut cfg = settings();
    cfg.heartbeat = Duration::from_millis(300);
    cfg.missed_heartbeats = 2;
    let f = fixture_with(cfg, 2).await;

    f.pool.watch("2.1", "client-a").await.unwrap();

    // Fresh viewer: a sweep right away releases nothing.
    assert_eq!(f.pool.sweep_viewers().await, 0);
    assert!(f.pool.heartbeat("client-a").await);

    // Stop heartbeating past the threshold.
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(f.pool.sweep_viewers().await, 1);
    assert_eq!(f.pool.viewer_count().await, 0);

    let tuners = f.pool.tuners().await;
    assert_eq!(tuners[0].state, TunerState::Cooldown);

    f.pool.shutdown().await;
}

#[tokio::test]
async fn unknown_clients_are_handled() {
    let f = fixture().await;
    assert!(!f.pool.heartbeat("nobody").await);
    let err = f.pool.release("nobody").await.unwrap_err();
    assert!(matches!(err, LiveError::UnknownViewer { .. }));
}

#[tokio::test]
async fn busy_appliance_means_no_tuners() {
    let f = fixture().await;
    f.probe.set_free(false);
    let err = f.pool.watch("2.1", "client-a").await.unwrap_err();
    assert!(matches!(err, LiveError::NoTunersAvailable { .. }));
    assert_eq!(f.launcher.spawn_count(), 0);
}

#[tokio::test]
async fn drm_precheck_fails_without_spawning() {
    let f = fixture().await;
    f.probe.fail_probe_with(LiveError::DrmProtected {
        channel: "5.1".into(),
    });
    let err = f.pool.watch("5.1", "client-a").await.unwrap_err();
    assert!(matches!(err, LiveError::DrmProtected { .. }));
    assert_eq!(f.launcher.spawn_count(), 0);
}

#[tokio::test]
async fn all_tuners_busy_precheck_maps_to_no_tuners() {
    let f = fixture().await;
    f.probe.fail_probe_with(LiveError::NoTunersAvailable {
        channel: "2.1".into(),
    });
    let err = f.pool.watch("2.1", "client-a").await.unwrap_err();
    assert!(matches!(err, LiveError::NoTunersAvailable { .. }));
    assert_eq!(f.launcher.spawn_count(), 0);
}

#[tokio::test]
async fn deregistered_appliances_take_tuners_offline() {
    let f = fixture().await;
    f.pool.watch("2.1", "client-a").await.unwrap();

    f.pool.register_appliances(&[]).await;
    let tuners = f.pool.tuners().await;
    assert!(tuners.iter().all(|t| t.state == TunerState::Offline));
    assert_eq!(f.pool.viewer_count().await, 0);

    let err = f.pool.watch("2.1", "client-b").await.unwrap_err();
    assert!(matches!(err, LiveError::NoTunersAvailable { .. }));
}

#[tokio::test]
async fn viewer_cap_forces_a_second_tuner() {
    let mut cfg = settings();
    cfg.max_viewers_per_tuner = 1;
    let f = fixture_with(cfg, 2).await;

    let grant_a = f.pool.watch("2.1", "client-a").await.unwrap();
    let grant_b = f.pool.watch("2.1", "client-b").await.unwrap();
    assert_ne!(grant_a.tuner_id, grant_b.tuner_id);
    assert_eq!(f.launcher.spawn_count(), 2);

    f.pool.shutdown().await;
}

#[tokio::test]
async fn rewatching_rebinds_the_viewer() {
    let f = fixture().await;

    f.pool.watch("2.1", "client-a").await.unwrap();
    let grant = f.pool.watch("7.1", "client-a").await.unwrap();
    assert_eq!(f.pool.viewer_count().await, 1);

    let tuners = f.pool.tuners().await;
    let new_tuner = tuners.iter().find(|t| t.tuner_id == grant.tuner_id).unwrap();
    assert_eq!(new_tuner.viewer_count, 1);
    let old_tuner = tuners.iter().find(|t| t.tuner_id != grant.tuner_id).unwrap();
    assert_eq!(old_tuner.viewer_count, 0);
    assert_eq!(old_tuner.state, TunerState::Cooldown);

    f.pool.shutdown().await;
}

#[tokio::test]
async fn idle_scan_follows_numeric_tuner_order() {
    // Eleven tuners on one device: lexicographic tuner ids would scan
    // "tuner-10" before "tuner-2".
    let dir = TempDir::new().unwrap();
    let store = MediaStore::builder()
        .path(dir.path().join("media.sqlite"))
        .create_if_missing(true)
        .build()
        .unwrap();
    store.initialize().unwrap();
    let worker = Arc::new(LiveStreamWorker::new(
        LiveWorkerSettings {
            live_cache_dir: dir.path().join("live"),
            ffmpeg: Path::new("ffmpeg").to_path_buf(),
            segment_duration: 6,
        },
        Some(ScriptLauncher::new()),
    ));
    let pool = Arc::new(TunerPool::new(settings(), store, StubProbe::new(), worker).unwrap());
    pool.register_appliances(&[appliance("T0", 11)]).await;

    for (index, channel) in ["2.1", "3.1", "4.1"].iter().enumerate() {
        let grant = pool.watch(channel, &format!("client-{index}")).await.unwrap();
        assert_eq!(grant.tuner_id, format!("T0-tuner-{index}"));
    }

    pool.shutdown().await;
}

#[tokio::test]
async fn mirror_rows_come_back_idle_after_restart() {
    let dir = TempDir::new().unwrap();
    let store = MediaStore::builder()
        .path(dir.path().join("media.sqlite"))
        .create_if_missing(true)
        .build()
        .unwrap();
    store.initialize().unwrap();
    store
        .save_tuner(&tvbridge_core::store::models::TunerRow {
            tuner_id: "T0-tuner-0".into(),
            device_id: "T0".into(),
            tuner_index: 0,
            state: TunerState::Active,
            channel: Some("2.1".into()),
            viewer_count: 4,
            last_accessed: 1_700_000_000,
        })
        .unwrap();
    store
        .save_viewer(&tvbridge_core::store::models::ViewerRow {
            client_id: "client-a".into(),
            tuner_id: "T0-tuner-0".into(),
            channel: "2.1".into(),
            last_heartbeat: 1_700_000_000,
        })
        .unwrap();

    let worker = Arc::new(LiveStreamWorker::new(
        LiveWorkerSettings {
            live_cache_dir: dir.path().join("live"),
            ffmpeg: Path::new("ffmpeg").to_path_buf(),
            segment_duration: 6,
        },
        Some(ScriptLauncher::new()),
    ));
    let pool = TunerPool::new(settings(), store.clone(), StubProbe::new(), worker).unwrap();

    let tuners = pool.tuners().await;
    assert_eq!(tuners.len(), 1);
    assert_eq!(tuners[0].state, TunerState::Idle);
    assert_eq!(tuners[0].viewer_count, 0);
    // No worker survived the restart, so the viewer table is empty too.
    assert_eq!(pool.viewer_count().await, 0);
    assert!(store.load_tuners().unwrap()[0].state == TunerState::Idle);
}

#[tokio::test]
async fn first_segment_wait_sees_the_sanity_size() {
    let f = fixture().await;
    f.pool.watch("2.1", "client-a").await.unwrap();
    assert!(
        f.pool
            .worker()
            .wait_for_first_segment("T0-tuner-0", Duration::from_secs(5))
            .await
    );
    f.pool.shutdown().await;
}
