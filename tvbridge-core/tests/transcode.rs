use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tvbridge_core::transcode::backfill::{BackfillItem, BulkBackfill};
use tvbridge_core::transcode::sidecar::{TranscodeSidecar, PLAYLIST_NAME, SIDECAR_NAME};
use tvbridge_core::transcode::{
    TranscodeEngine, TranscodeError, TranscodeMetadata, TranscodeMode, TranscodeSettings,
    TranscodeState,
};
use tvbridge_core::TranscodeLauncher;

/// Stands in for the transcoder: reads the playlist path off the argument
/// vector and runs a small shell script in that directory.
struct ScriptLauncher {
    script: fn(&Path) -> String,
    spawned: AtomicUsize,
}

impl ScriptLauncher {
    fn new(script: fn(&Path) -> String) -> Arc<Self> {
        Arc::new(Self {
            script,
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
        tokio::process::Command::new("sh")
            .arg("-c")
            .arg((self.script)(&dir))
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }
}

fn long_running(dir: &Path) -> String {
    format!(
        "printf '#EXTM3U\\n' > {d}/stream.m3u8; printf 'ts' > {d}/segment0000.ts; exec sleep 600",
        d = dir.display()
    )
}

fn complete_quickly(dir: &Path) -> String {
    format!(
        "printf '#EXTM3U\\n#EXT-X-ENDLIST\\n' > {d}/stream.m3u8; printf 'ts' > {d}/segment0000.ts",
        d = dir.display()
    )
}

fn delayed_segment(dir: &Path) -> String {
    format!(
        "printf '#EXTM3U\\n' > {d}/stream.m3u8; sleep 1; printf 'tsdata' > {d}/segment0000.ts; exec sleep 600",
        d = dir.display()
    )
}

fn fail_fast(_dir: &Path) -> String {
    "echo 'error: source unreadable' >&2; exit 1".to_string()
}

fn settings(dir: &TempDir, max_concurrent: usize) -> TranscodeSettings {
    TranscodeSettings {
        cache_dir: dir.path().join("cache"),
        ffmpeg: PathBuf::from("ffmpeg"),
        segment_duration: 4,
        max_concurrent,
        playlist_wait: Duration::from_secs(5),
        segment_wait: Duration::from_secs(5),
        cleanup_interval: Duration::from_secs(3600),
        max_cache_age: Duration::from_secs(3600),
    }
}

async fn wait_for_state(engine: &TranscodeEngine, episode_id: i64, state: TranscodeState) {
    for _ in 0..40 {
        if engine.state_of(episode_id) == Some(state) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!(
        "episode {episode_id} never reached {state}, currently {:?}",
        engine.state_of(episode_id)
    );
}

#[tokio::test]
async fn concurrent_starts_spawn_one_child() {
    let dir = TempDir::new().unwrap();
    let launcher = ScriptLauncher::new(long_running);
    let engine = TranscodeEngine::new(settings(&dir, 2), Some(launcher.clone()));

    let (a, b, c) = tokio::join!(
        engine.start(42, "http://dvr/play/42", TranscodeMode::Interactive, TranscodeMetadata::default()),
        engine.start(42, "http://dvr/play/42", TranscodeMode::Interactive, TranscodeMetadata::default()),
        engine.start(42, "http://dvr/play/42", TranscodeMode::Interactive, TranscodeMetadata::default()),
    );
    let dir_a = a.unwrap();
    assert_eq!(dir_a, b.unwrap());
    assert_eq!(dir_a, c.unwrap());
    assert_eq!(launcher.spawn_count(), 1);
    assert_eq!(engine.active_count(), 1);

    engine.delete(42).await.unwrap();
    assert_eq!(engine.active_count(), 0);
    assert!(!dir_a.exists());
}

#[tokio::test]
async fn completion_persists_sidecar_and_serves() {
    let dir = TempDir::new().unwrap();
    let launcher = ScriptLauncher::new(complete_quickly);
    let engine = TranscodeEngine::new(settings(&dir, 2), Some(launcher));

    let metadata = TranscodeMetadata {
        show_name: Some("Nature Hour".into()),
        episode_name: Some("Tides".into()),
        air_date: None,
    };
    let output = engine
        .start(7, "http://dvr/play/7", TranscodeMode::Interactive, metadata)
        .await
        .unwrap();
    wait_for_state(&engine, 7, TranscodeState::Complete).await;

    let sidecar = TranscodeSidecar::load(&output).await.unwrap().unwrap();
    assert_eq!(sidecar.state, TranscodeState::Complete);
    assert!(sidecar.end_time.is_some());
    assert_eq!(sidecar.show_name.as_deref(), Some("Nature Hour"));

    let (bytes, content_type) = engine.serve_file(7, PLAYLIST_NAME).await.unwrap();
    assert!(String::from_utf8_lossy(&bytes).contains("#EXT-X-ENDLIST"));
    assert_eq!(content_type, "application/vnd.apple.mpegurl");

    let (_, content_type) = engine.serve_file(7, "segment0000.ts").await.unwrap();
    assert_eq!(content_type, "video/mp2t");

    // Completed builds return instantly on a second start.
    let again = engine
        .start(7, "http://dvr/play/7", TranscodeMode::Interactive, TranscodeMetadata::default())
        .await
        .unwrap();
    assert_eq!(again, output);

    let status = engine.status(7).await.unwrap();
    assert_eq!(status.state, TranscodeState::Complete);
    assert_eq!(status.progress, 4);
}

#[tokio::test]
async fn failed_child_is_recorded_in_sidecar() {
    let dir = TempDir::new().unwrap();
    let launcher = ScriptLauncher::new(fail_fast);
    let mut cfg = settings(&dir, 2);
    cfg.playlist_wait = Duration::from_secs(1);
    let engine = TranscodeEngine::new(cfg, Some(launcher));

    let result = engine
        .start(9, "http://dvr/play/9", TranscodeMode::Interactive, TranscodeMetadata::default())
        .await;
    assert!(result.is_err());
    wait_for_state(&engine, 9, TranscodeState::Error).await;
    assert_eq!(engine.active_count(), 0);

    let sidecar = TranscodeSidecar::load(&engine.episode_dir(9))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sidecar.state, TranscodeState::Error);
    assert!(sidecar.error.is_some());
    let tail = sidecar.stderr_tail.unwrap_or_default();
    assert!(tail.iter().any(|line| line.contains("source unreadable")));
}

#[tokio::test]
async fn interactive_overflow_evicts_oldest() {
    let dir = TempDir::new().unwrap();
    let launcher = ScriptLauncher::new(long_running);
    let engine = TranscodeEngine::new(settings(&dir, 1), Some(launcher.clone()));

    let first = engine
        .start(1, "http://dvr/play/1", TranscodeMode::Interactive, TranscodeMetadata::default())
        .await
        .unwrap();
    let second = engine
        .start(2, "http://dvr/play/2", TranscodeMode::Interactive, TranscodeMetadata::default())
        .await
        .unwrap();

    assert_eq!(engine.active_count(), 1);
    assert_eq!(engine.state_of(1), None);
    assert_eq!(engine.state_of(2), Some(TranscodeState::Transcoding));
    assert!(!first.exists());
    assert!(second.exists());
    assert_eq!(launcher.spawn_count(), 2);

    engine.delete(2).await.unwrap();
}

#[tokio::test]
async fn bulk_overflow_defers_instead_of_evicting() {
    let dir = TempDir::new().unwrap();
    let launcher = ScriptLauncher::new(long_running);
    let engine = TranscodeEngine::new(settings(&dir, 1), Some(launcher.clone()));

    engine
        .start(1, "http://dvr/play/1", TranscodeMode::Interactive, TranscodeMetadata::default())
        .await
        .unwrap();
    let deferred = engine
        .start(2, "http://dvr/play/2", TranscodeMode::Bulk, TranscodeMetadata::default())
        .await
        .unwrap();

    // The running build survives; the bulk caller got the intended
    // directory without anything starting.
    assert_eq!(engine.state_of(1), Some(TranscodeState::Transcoding));
    assert_eq!(engine.state_of(2), None);
    assert!(!deferred.exists());
    assert_eq!(launcher.spawn_count(), 1);

    engine.delete(1).await.unwrap();
}

#[tokio::test]
async fn segment_request_waits_for_the_file() {
    let dir = TempDir::new().unwrap();
    let launcher = ScriptLauncher::new(delayed_segment);
    let engine = TranscodeEngine::new(settings(&dir, 1), Some(launcher));

    engine
        .start(5, "http://dvr/play/5", TranscodeMode::Interactive, TranscodeMetadata::default())
        .await
        .unwrap();

    let started = std::time::Instant::now();
    let (bytes, _) = engine.serve_file(5, "segment0000.ts").await.unwrap();
    assert_eq!(bytes, b"tsdata");
    assert!(started.elapsed() < Duration::from_secs(5));

    engine.delete(5).await.unwrap();
}

#[tokio::test]
async fn invalid_artifact_names_are_rejected() {
    let dir = TempDir::new().unwrap();
    let engine = TranscodeEngine::new(settings(&dir, 1), Some(ScriptLauncher::new(long_running)));

    for name in ["../secret", "a/b.ts", "segment0000.ts/..", SIDECAR_NAME] {
        let err = engine.serve_file(1, name).await.unwrap_err();
        assert!(
            matches!(err, TranscodeError::InvalidArtifactName { .. }),
            "{name} should be invalid"
        );
    }

    // Valid name, no job, no file: not found with the state attached.
    let err = engine.serve_file(1, "segment0000.ts").await.unwrap_err();
    assert!(matches!(err, TranscodeError::ArtifactNotFound { state: None, .. }));
}

#[tokio::test]
async fn recovery_adopts_complete_and_discards_abandoned() {
    let dir = TempDir::new().unwrap();
    let cfg = settings(&dir, 2);

    // A finished build with its playlist in place.
    let complete_dir = cfg.cache_dir.join("11");
    std::fs::create_dir_all(&complete_dir).unwrap();
    std::fs::write(complete_dir.join(PLAYLIST_NAME), "#EXTM3U\n#EXT-X-ENDLIST\n").unwrap();
    let sidecar = TranscodeSidecar {
        state: TranscodeState::Complete,
        start_time: chrono::Utc::now(),
        end_time: Some(chrono::Utc::now()),
        source_url: "http://dvr/play/11".into(),
        show_name: None,
        episode_name: None,
        air_date: None,
        error: None,
        stderr_tail: None,
    };
    sidecar.persist(&complete_dir).await.unwrap();

    // A build that died mid-flight.
    let abandoned_dir = cfg.cache_dir.join("12");
    std::fs::create_dir_all(&abandoned_dir).unwrap();
    let abandoned = TranscodeSidecar {
        state: TranscodeState::Transcoding,
        ..sidecar.clone()
    };
    abandoned.persist(&abandoned_dir).await.unwrap();

    // Noise the recovery pass must ignore.
    std::fs::create_dir_all(cfg.cache_dir.join("not-an-id")).unwrap();

    let engine = TranscodeEngine::new(cfg, Some(ScriptLauncher::new(long_running)));
    let restored = engine.recover_cache().await.unwrap();
    assert_eq!(restored, 1);
    assert_eq!(engine.state_of(11), Some(TranscodeState::Complete));
    assert_eq!(engine.state_of(12), None);
    assert!(!abandoned_dir.exists());
    assert!(complete_dir.exists());
}

#[tokio::test]
async fn retention_sweep_expires_old_directories() {
    let dir = TempDir::new().unwrap();
    let mut cfg = settings(&dir, 2);
    cfg.max_cache_age = Duration::ZERO;
    let engine = TranscodeEngine::new(cfg, Some(ScriptLauncher::new(complete_quickly)));

    engine
        .start(21, "http://dvr/play/21", TranscodeMode::Interactive, TranscodeMetadata::default())
        .await
        .unwrap();
    wait_for_state(&engine, 21, TranscodeState::Complete).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    let removed = engine.cleanup_sweep().await.unwrap();
    assert_eq!(removed, 1);
    assert!(!engine.episode_dir(21).exists());
}

#[tokio::test]
async fn bulk_backfill_reports_counters() {
    let dir = TempDir::new().unwrap();
    let launcher = ScriptLauncher::new(complete_quickly);
    let engine = Arc::new(TranscodeEngine::new(settings(&dir, 2), Some(launcher)));

    // One episode is already cached before the run.
    engine
        .start(1, "http://dvr/play/1", TranscodeMode::Interactive, TranscodeMetadata::default())
        .await
        .unwrap();
    wait_for_state(&engine, 1, TranscodeState::Complete).await;

    let items: Vec<BackfillItem> = (1..=4)
        .map(|id| BackfillItem {
            episode_id: id,
            upstream_url: format!("http://dvr/play/{id}"),
            metadata: TranscodeMetadata::default(),
        })
        .collect();
    let report = BulkBackfill::new(Arc::clone(&engine)).run(items).await;

    assert_eq!(report.total, 4);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.completed, 3);
    assert_eq!(report.failed, 0);
    for id in 1..=4 {
        assert_eq!(engine.state_of(id), Some(TranscodeState::Complete));
    }
}
