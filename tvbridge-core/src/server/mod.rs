//! Thin HTTP adapter over the core components: route translation, play-URL
//! rewriting and status-code mapping live here, nothing else.

pub mod catalog_routes;
pub mod error;
pub mod guide_routes;
pub mod live_routes;
pub mod stream_routes;

use std::sync::Arc;

use axum::routing::{delete, get, post, put};
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::discovery::Discoverer;
use crate::guide::GuidePlane;
use crate::live::TunerPool;
use crate::store::MediaStore;
use crate::sync::CatalogSync;
use crate::transcode::TranscodeEngine;

pub use error::{ApiError, ApiResult};

#[derive(Clone)]
pub struct BridgeState {
    pub store: MediaStore,
    pub engine: Arc<TranscodeEngine>,
    pub pool: Arc<TunerPool>,
    pub guide: Arc<GuidePlane>,
    pub discovery: Arc<Discoverer>,
    pub sync: Arc<CatalogSync>,
}

pub fn create_router(state: BridgeState) -> Router {
    Router::new()
        .route("/health", get(health))
        // Devices and discovery
        .route("/devices", get(catalog_routes::list_devices))
        .route("/discover", post(catalog_routes::trigger_discovery))
        .route("/sync", post(catalog_routes::trigger_sync))
        // Catalog
        .route("/series", get(catalog_routes::list_series))
        .route("/series/:id/episodes", get(catalog_routes::list_episodes))
        .route("/episodes/:id", get(catalog_routes::get_episode))
        .route("/episodes/:id/progress", put(catalog_routes::put_progress))
        .route("/episodes/:id", delete(catalog_routes::delete_episode))
        // Recorded playback
        .route(
            "/stream/:episode_id/playlist.m3u8",
            get(stream_routes::playlist),
        )
        .route("/stream/:episode_id/status", get(stream_routes::status))
        .route("/stream/:episode_id/:filename", get(stream_routes::segment))
        .route("/transcodes", get(stream_routes::overview))
        .route("/transcodes/backfill", post(stream_routes::backfill))
        // Live
        .route("/live/watch", post(live_routes::watch))
        .route("/live/heartbeat", post(live_routes::heartbeat))
        .route("/live/stop", post(live_routes::stop))
        .route("/live/tuners", get(live_routes::tuners))
        .route(
            "/live/:tuner_id/playlist.m3u8",
            get(live_routes::playlist),
        )
        .route("/live/:tuner_id/:segment", get(live_routes::segment))
        // Guide and rules
        .route("/guide", get(guide_routes::guide))
        .route("/guide/now", get(guide_routes::now_playing))
        .route("/guide/search", get(guide_routes::search))
        .route("/recording-rules", get(guide_routes::list_rules))
        .route("/recording-rules", post(guide_routes::add_rule))
        .route("/recording-rules/:id", put(guide_routes::change_rule))
        .route("/recording-rules/:id", delete(guide_routes::delete_rule))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

/// Bind and serve until the process is asked to stop.
pub async fn run(state: BridgeState, listen_addr: &str) -> std::io::Result<()> {
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    info!(addr = %listen_addr, "request surface listening");
    axum::serve(listener, router).await
}

/// Long-running maintenance: retention sweeps, viewer reaping, cooldown
/// expiry and the periodic guide refresh.
pub fn spawn_background_tasks(state: &BridgeState) {
    tokio::spawn(Arc::clone(&state.engine).run_cleanup());
    tokio::spawn(Arc::clone(&state.pool).run_viewer_sweep());
    tokio::spawn(Arc::clone(&state.pool).run_tuner_sweep());
    tokio::spawn(Arc::clone(&state.guide).run_periodic_refresh());
}
