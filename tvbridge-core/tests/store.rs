use tempfile::TempDir;
use tvbridge_core::store::catalog::{DeviceUpsert, EpisodeUpsert, SeriesUpsert};
use tvbridge_core::store::guide::GuideProgramUpsert;
use tvbridge_core::store::models::{TunerRow, ViewerRow, RESUME_SENTINEL};
use tvbridge_core::{MediaStore, RecordingRule, StoreError, TunerState};

fn setup_store(dir: &TempDir) -> MediaStore {
    let store = MediaStore::builder()
        .path(dir.path().join("media.sqlite"))
        .create_if_missing(true)
        .build()
        .expect("create store");
    store.initialize().expect("initialize store");
    store
}

fn seed_device(store: &MediaStore) -> i64 {
    store
        .upsert_device(&DeviceUpsert {
            device_id: "1052AE6F".into(),
            friendly_name: Some("Living Room".into()),
            model_number: Some("HDHomeRun SCRIBE 4K".into()),
            ip_address: Some("10.0.0.5".into()),
            base_url: Some("http://10.0.0.5".into()),
            storage_url: Some("http://10.0.0.5/recorded_files.json".into()),
            device_auth: Some("secret-token".into()),
            tuner_count: 4,
            ..DeviceUpsert::default()
        })
        .unwrap()
}

fn seed_series(store: &MediaStore, device_row: i64) -> i64 {
    store
        .upsert_series(
            device_row,
            &SeriesUpsert {
                series_id: "S1".into(),
                title: "Nature Hour".into(),
                category: Some("documentary".into()),
                ..SeriesUpsert::default()
            },
        )
        .unwrap()
}

fn episode(program_id: &str, start: i64, end: i64) -> EpisodeUpsert {
    EpisodeUpsert {
        program_id: program_id.into(),
        title: Some("Nature Hour".into()),
        episode_title: Some(format!("Episode {program_id}")),
        episode_number: Some("S01E02".into()),
        start_time: start,
        end_time: end,
        record_success: true,
        play_url: Some(format!("http://10.0.0.5/play/{program_id}")),
        cmd_url: Some(format!("http://10.0.0.5/recorded/cmd?id={program_id}")),
        resume: 0,
        ..EpisodeUpsert::default()
    }
}

#[test]
fn series_aggregates_follow_episodes() {
    let dir = TempDir::new().unwrap();
    let store = setup_store(&dir);
    let device_row = seed_device(&store);
    let series_row = seed_series(&store, device_row);

    store
        .upsert_episode(series_row, &episode("P1", 1000, 2800))
        .unwrap();
    let second = store
        .upsert_episode(series_row, &episode("P2", 5000, 6500))
        .unwrap();

    let series = store.series_by_id(series_row).unwrap();
    assert_eq!(series.episode_count, 2);
    assert_eq!(series.total_duration, 1800 + 1500);
    assert_eq!(series.first_recorded, Some(1000));
    assert_eq!(series.last_recorded, Some(5000));

    store.delete_episode_row(second).unwrap();
    let series = store.series_by_id(series_row).unwrap();
    assert_eq!(series.episode_count, 1);
    assert_eq!(series.total_duration, 1800);
    assert_eq!(series.last_recorded, Some(1000));

    // The one-shot reconciliation agrees with the triggers.
    store.recalculate_series_aggregates().unwrap();
    let series = store.series_by_id(series_row).unwrap();
    assert_eq!(series.episode_count, 1);
    assert_eq!(series.total_duration, 1800);
}

#[test]
fn episode_upsert_is_keyed_by_program_id() {
    let dir = TempDir::new().unwrap();
    let store = setup_store(&dir);
    let series_row = seed_series(&store, seed_device(&store));

    let first = store
        .upsert_episode(series_row, &episode("P1", 1000, 2800))
        .unwrap();
    let mut updated = episode("P1", 1000, 2800);
    updated.episode_title = Some("Renamed".into());
    let second = store.upsert_episode(series_row, &updated).unwrap();
    assert_eq!(first, second);

    let fetched = store.episode_by_id(first).unwrap();
    assert_eq!(fetched.episode_title.as_deref(), Some("Renamed"));
    assert_eq!(fetched.season, Some(1));
    assert_eq!(fetched.episode, Some(2));
    assert_eq!(store.episode_count().unwrap(), 1);
}

#[test]
fn sentinel_resume_is_canonicalized_on_ingest() {
    let dir = TempDir::new().unwrap();
    let store = setup_store(&dir);
    let series_row = seed_series(&store, seed_device(&store));

    let mut entry = episode("P1", 1000, 2800);
    entry.resume = RESUME_SENTINEL;
    let id = store.upsert_episode(series_row, &entry).unwrap();

    let fetched = store.episode_by_id(id).unwrap();
    assert!(fetched.watched);
    assert_eq!(fetched.resume_position, 0);
    // Watched episodes present their full duration as the resume point.
    assert_eq!(fetched.canonical_resume(), fetched.duration());
}

#[test]
fn progress_roundtrip_and_bounds() {
    let dir = TempDir::new().unwrap();
    let store = setup_store(&dir);
    let series_row = seed_series(&store, seed_device(&store));
    let id = store
        .upsert_episode(series_row, &episode("P1", 1000, 2800))
        .unwrap();

    let updated = store.update_progress(id, 600, false).unwrap();
    assert_eq!(updated.resume_position, 600);
    assert!(!updated.watched);

    // Exactly the duration is a legal position.
    let updated = store.update_progress(id, 1800, true).unwrap();
    assert_eq!(updated.resume_position, 1800);
    assert!(updated.watched);

    let err = store.update_progress(id, 1801, false).unwrap_err();
    assert!(matches!(err, StoreError::ProgressOutOfRange { .. }));
}

#[test]
fn episode_delete_is_idempotent_via_not_found() {
    let dir = TempDir::new().unwrap();
    let store = setup_store(&dir);
    let series_row = seed_series(&store, seed_device(&store));
    let id = store
        .upsert_episode(series_row, &episode("P1", 1000, 2800))
        .unwrap();

    store.delete_episode_row(id).unwrap();
    let err = store.delete_episode_row(id).unwrap_err();
    assert!(matches!(err, StoreError::EpisodeNotFound { .. }));
}

#[test]
fn devices_offline_when_not_observed() {
    let dir = TempDir::new().unwrap();
    let store = setup_store(&dir);
    seed_device(&store);
    store
        .upsert_device(&DeviceUpsert {
            device_id: "20FFAE01".into(),
            ip_address: Some("10.0.0.6".into()),
            tuner_count: 2,
            ..DeviceUpsert::default()
        })
        .unwrap();

    let offlined = store
        .mark_devices_offline(&["1052AE6F".to_string()])
        .unwrap();
    assert_eq!(offlined, 1);
    let online = store.list_devices(true).unwrap();
    assert_eq!(online.len(), 1);
    assert_eq!(online[0].device_id, "1052AE6F");

    // A later observation brings the device back.
    store
        .upsert_device(&DeviceUpsert {
            device_id: "20FFAE01".into(),
            ip_address: Some("10.0.0.7".into()),
            tuner_count: 2,
            ..DeviceUpsert::default()
        })
        .unwrap();
    assert_eq!(store.list_devices(true).unwrap().len(), 2);
}

#[test]
fn credential_device_prefers_dvr_capable() {
    let dir = TempDir::new().unwrap();
    let store = setup_store(&dir);
    store
        .upsert_device(&DeviceUpsert {
            device_id: "00000001".into(),
            device_auth: Some("tuner-only".into()),
            tuner_count: 2,
            ..DeviceUpsert::default()
        })
        .unwrap();
    seed_device(&store);

    let device = store.primary_device_auth().unwrap().unwrap();
    assert_eq!(device.device_id, "1052AE6F");
    assert_eq!(device.device_auth.as_deref(), Some("secret-token"));

    store.update_device_auth("1052AE6F", "rotated").unwrap();
    let device = store.primary_device_auth().unwrap().unwrap();
    assert_eq!(device.device_auth.as_deref(), Some("rotated"));
}

#[test]
fn guide_programs_append_by_natural_key() {
    let dir = TempDir::new().unwrap();
    let store = setup_store(&dir);
    let channel = store
        .upsert_guide_channel("2.1", Some("KTVU"), None, 1_700_000_000)
        .unwrap();

    let program = GuideProgramUpsert {
        series_id: "S9".into(),
        title: Some("News".into()),
        start_time: 1_700_000_000,
        end_time: 1_700_003_600,
        ..GuideProgramUpsert::default()
    };
    let inserted = store
        .insert_guide_programs(channel, &[program.clone()])
        .unwrap();
    assert_eq!(inserted, 1);
    // The same (channel, series, start) tuple never lands twice.
    let inserted = store.insert_guide_programs(channel, &[program]).unwrap();
    assert_eq!(inserted, 0);

    let window = store
        .guide_window(1_700_000_000, 1_700_086_400)
        .unwrap();
    assert_eq!(window.len(), 1);
    assert_eq!(window[0].1.len(), 1);

    let now = store.guide_now(1_700_000_100).unwrap();
    assert_eq!(now.len(), 1);
    assert_eq!(now[0].0.guide_number, "2.1");
}

#[test]
fn guide_search_respects_window_and_channel() {
    let dir = TempDir::new().unwrap();
    let store = setup_store(&dir);
    let now = 1_700_000_000;
    let channel = store
        .upsert_guide_channel("2.1", Some("KTVU"), None, now)
        .unwrap();
    let other = store
        .upsert_guide_channel("7.1", Some("KGO"), None, now)
        .unwrap();

    store
        .insert_guide_programs(
            channel,
            &[GuideProgramUpsert {
                series_id: "S1".into(),
                title: Some("Cosmos Tonight".into()),
                start_time: now + 600,
                end_time: now + 4200,
                ..GuideProgramUpsert::default()
            }],
        )
        .unwrap();
    store
        .insert_guide_programs(
            other,
            &[GuideProgramUpsert {
                series_id: "S2".into(),
                synopsis: Some("A journey through the cosmos.".into()),
                start_time: now + 600,
                end_time: now + 4200,
                ..GuideProgramUpsert::default()
            }],
        )
        .unwrap();
    // Beyond the 7-day forward window.
    store
        .insert_guide_programs(
            channel,
            &[GuideProgramUpsert {
                series_id: "S1".into(),
                title: Some("Cosmos Tonight".into()),
                start_time: now + 8 * 24 * 3600,
                end_time: now + 8 * 24 * 3600 + 3600,
                ..GuideProgramUpsert::default()
            }],
        )
        .unwrap();

    let matches = store
        .guide_search("cosmos", None, 10, now, now + 7 * 24 * 3600)
        .unwrap();
    assert_eq!(matches.len(), 2);

    let matches = store
        .guide_search("cosmos", Some("2.1"), 10, now, now + 7 * 24 * 3600)
        .unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].0.guide_number, "2.1");
}

#[test]
fn rules_reconcile_by_full_replace() {
    let dir = TempDir::new().unwrap();
    let store = setup_store(&dir);

    let rule = |id: &str| RecordingRule {
        rule_id: id.into(),
        series_id: Some("S1".into()),
        title: Some("Nature Hour".into()),
        synopsis: None,
        image_url: None,
        channel_only: Some("2.1".into()),
        team_only: None,
        recent_only: true,
        after_original_airdate_only: None,
        datetime_only: None,
        priority: Some(1),
        start_padding: 30,
        end_padding: 120,
    };

    store.replace_rules(&[rule("R1"), rule("R2")]).unwrap();
    assert_eq!(store.list_rules().unwrap().len(), 2);

    // The cloud forgot R2; so do we.
    store.replace_rules(&[rule("R1")]).unwrap();
    let rules = store.list_rules().unwrap();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].rule_id, "R1");
    assert!(rules[0].recent_only);

    store.delete_rule("R1").unwrap();
    assert!(matches!(
        store.delete_rule("R1").unwrap_err(),
        StoreError::RuleNotFound { .. }
    ));
}

#[test]
fn tuner_mirror_roundtrip() {
    let dir = TempDir::new().unwrap();
    let store = setup_store(&dir);

    store
        .save_tuner(&TunerRow {
            tuner_id: "1052AE6F-tuner-0".into(),
            device_id: "1052AE6F".into(),
            tuner_index: 0,
            state: TunerState::Active,
            channel: Some("2.1".into()),
            viewer_count: 3,
            last_accessed: 1_700_000_000,
        })
        .unwrap();
    store
        .save_viewer(&ViewerRow {
            client_id: "client-a".into(),
            tuner_id: "1052AE6F-tuner-0".into(),
            channel: "2.1".into(),
            last_heartbeat: 1_700_000_000,
        })
        .unwrap();

    let tuners = store.load_tuners().unwrap();
    assert_eq!(tuners.len(), 1);
    assert_eq!(tuners[0].state, TunerState::Active);
    assert_eq!(tuners[0].viewer_count, 3);

    assert_eq!(store.clear_viewers().unwrap(), 1);
    store.remove_tuner("1052AE6F-tuner-0").unwrap();
    assert!(store.load_tuners().unwrap().is_empty());
}
