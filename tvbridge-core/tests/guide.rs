use chrono::Utc;
use tempfile::TempDir;
use tvbridge_core::store::guide::GuideProgramUpsert;
use tvbridge_core::{ApplianceClient, GuidePlane, MediaStore};

fn setup() -> (TempDir, MediaStore, GuidePlane) {
    let dir = TempDir::new().unwrap();
    let store = MediaStore::builder()
        .path(dir.path().join("media.sqlite"))
        .create_if_missing(true)
        .build()
        .unwrap();
    store.initialize().unwrap();
    let plane = GuidePlane::new(
        tvbridge_core::config::GuideSection::default(),
        ApplianceClient::new().unwrap(),
        store.clone(),
    );
    (dir, store, plane)
}

#[tokio::test]
async fn fresh_cache_short_circuits_refresh() {
    let (_dir, store, plane) = setup();
    // Watermark within the staleness window: no cloud call is attempted,
    // so this succeeds with no credential and no network.
    store
        .upsert_guide_channel("2.1", Some("KTVU"), None, Utc::now().timestamp())
        .unwrap();
    let refreshed = plane.refresh_if_stale().await.unwrap();
    assert!(!refreshed);
}

#[tokio::test]
async fn stale_cache_requires_a_credential() {
    let (_dir, store, plane) = setup();
    store
        .upsert_guide_channel("2.1", Some("KTVU"), None, 1_000_000)
        .unwrap();
    // No devices registered, so the refresh path must fail on credentials.
    let err = plane.refresh_if_stale().await.unwrap_err();
    assert!(matches!(err, tvbridge_core::GuideError::MissingCredential));
}

#[tokio::test]
async fn search_is_store_backed_and_windowed() {
    let (_dir, store, plane) = setup();
    let now = Utc::now().timestamp();
    let channel = store
        .upsert_guide_channel("2.1", Some("KTVU"), None, now)
        .unwrap();
    store
        .insert_guide_programs(
            channel,
            &[
                GuideProgramUpsert {
                    series_id: "S1".into(),
                    title: Some("Morning Tide Report".into()),
                    start_time: now + 3600,
                    end_time: now + 7200,
                    ..GuideProgramUpsert::default()
                },
                GuideProgramUpsert {
                    series_id: "S1".into(),
                    title: Some("Morning Tide Report".into()),
                    start_time: now + 10 * 24 * 3600,
                    end_time: now + 10 * 24 * 3600 + 3600,
                    ..GuideProgramUpsert::default()
                },
            ],
        )
        .unwrap();

    let matches = plane.search("tide", None, 10).await.unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].0.guide_number, "2.1");

    let matches = plane.search("tide", Some("9.9"), 10).await.unwrap();
    assert!(matches.is_empty());
}
