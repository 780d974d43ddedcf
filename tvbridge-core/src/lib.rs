pub mod appliance;
pub mod config;
pub mod discovery;
pub mod error;
pub mod guide;
pub mod live;
pub mod process;
pub mod server;
pub mod sqlite;
pub mod store;
pub mod sync;
pub mod transcode;

pub use appliance::{ApplianceClient, ApplianceError, DeviceDescription, LiveProbeError};
pub use config::{load_bridge_config, BridgeConfig};
pub use discovery::{Appliance, Discoverer, DiscoveryError};
pub use error::{ConfigError, CoreError, Result};
pub use guide::{GuideError, GuidePlane, RuleRequest};
pub use live::worker::{LiveStreamWorker, LiveWorkerSettings};
pub use live::{AvailabilityProbe, LiveError, LiveSettings, TunerPool, TunerSnapshot, WatchGrant};
pub use process::{FfmpegLauncher, TranscodeLauncher};
pub use server::{create_router, run, spawn_background_tasks, BridgeState};
pub use store::models::{
    Device, Episode, GuideChannel, GuideProgram, RecordingRule, Series, TunerState,
};
pub use store::{MediaStore, MediaStoreBuilder, StoreError};
pub use sync::{CatalogSync, SyncError, SyncReport};
pub use transcode::backfill::{BackfillItem, BackfillReport, BulkBackfill};
pub use transcode::{
    TranscodeEngine, TranscodeError, TranscodeMetadata, TranscodeMode, TranscodeSettings,
    TranscodeState, TranscodeStatus,
};
