//! Live tuner allocator: every tuner across every appliance is one pool,
//! shared by channel, guarded by heartbeats and wound down through cooldown.

pub mod worker;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::appliance::{ApplianceClient, LiveProbeError};
use crate::config::BridgeConfig;
use crate::discovery::Appliance;
use crate::store::models::{TunerRow, TunerState, ViewerRow};
use crate::store::{MediaStore, StoreError};

use self::worker::LiveStreamWorker;

#[derive(Debug, Error)]
pub enum LiveError {
    #[error("no tuners available for channel {channel}")]
    NoTunersAvailable { channel: String },
    #[error("channel {channel} is DRM protected")]
    DrmProtected { channel: String },
    #[error("appliance live feed unavailable (status {status})")]
    UpstreamUnavailable { status: u16 },
    #[error("appliance unreachable: {0}")]
    UpstreamUnreachable(String),
    #[error("live worker for tuner {tuner_id} produced no playlist in time")]
    WorkerStartupTimeout { tuner_id: String },
    #[error("unknown viewer {client_id}")]
    UnknownViewer { client_id: String },
    #[error("invalid live artifact name {name:?}")]
    InvalidArtifactName { name: String },
    #[error("live artifact {name} for tuner {tuner_id} not found")]
    ArtifactNotFound { tuner_id: String, name: String },
    #[error("live cache io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to spawn live transcoder: {source}")]
    Spawn { source: std::io::Error },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Appliance-facing checks the allocator performs before claiming a tuner.
/// The appliance serves clients outside our control, so our own idea of
/// "idle" is advisory until re-checked.
#[async_trait]
pub trait AvailabilityProbe: Send + Sync {
    async fn has_free_tuner(&self, base_url: &str) -> Result<bool, LiveError>;
    async fn probe_live(&self, ip: &str, channel: &str) -> Result<(), LiveError>;
}

#[async_trait]
impl AvailabilityProbe for ApplianceClient {
    async fn has_free_tuner(&self, base_url: &str) -> Result<bool, LiveError> {
        ApplianceClient::has_free_tuner(self, base_url)
            .await
            .map_err(|err| LiveError::UpstreamUnreachable(err.to_string()))
    }

    async fn probe_live(&self, ip: &str, channel: &str) -> Result<(), LiveError> {
        match ApplianceClient::probe_live(self, ip, channel).await {
            Ok(()) => Ok(()),
            Err(LiveProbeError::AllTunersBusy) | Err(LiveProbeError::TunerBusy) => {
                Err(LiveError::NoTunersAvailable {
                    channel: channel.to_string(),
                })
            }
            Err(LiveProbeError::DrmProtected) => Err(LiveError::DrmProtected {
                channel: channel.to_string(),
            }),
            Err(LiveProbeError::Unavailable { status }) => {
                Err(LiveError::UpstreamUnavailable { status })
            }
            Err(LiveProbeError::Unreachable(reason)) => {
                Err(LiveError::UpstreamUnreachable(reason))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct LiveSettings {
    pub heartbeat: Duration,
    pub missed_heartbeats: u32,
    pub cooldown: Duration,
    pub max_viewers_per_tuner: u32,
    pub viewer_sweep: Duration,
    pub tuner_sweep: Duration,
}

impl LiveSettings {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            heartbeat: Duration::from_secs(config.live.client_heartbeat_secs),
            missed_heartbeats: config.live.missed_heartbeats,
            cooldown: Duration::from_secs(config.live.tuner_cooldown_secs),
            max_viewers_per_tuner: config.live.max_viewers_per_tuner,
            viewer_sweep: Duration::from_secs(config.live.viewer_sweep_secs),
            tuner_sweep: Duration::from_secs(config.live.tuner_sweep_secs),
        }
    }

    fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.heartbeat * self.missed_heartbeats)
            .unwrap_or_else(|_| chrono::Duration::seconds(60))
    }
}

#[derive(Debug, Clone)]
struct Tuner {
    tuner_id: String,
    device_id: String,
    tuner_index: u32,
    device_ip: Option<String>,
    base_url: Option<String>,
    state: TunerState,
    channel: Option<String>,
    viewer_count: u32,
    last_accessed: DateTime<Utc>,
}

impl Tuner {
    fn to_row(&self) -> TunerRow {
        TunerRow {
            tuner_id: self.tuner_id.clone(),
            device_id: self.device_id.clone(),
            tuner_index: self.tuner_index,
            state: self.state,
            channel: self.channel.clone(),
            viewer_count: self.viewer_count,
            last_accessed: self.last_accessed.timestamp(),
        }
    }
}

#[derive(Debug, Clone)]
struct Viewer {
    client_id: String,
    tuner_id: String,
    channel: String,
    last_heartbeat: DateTime<Utc>,
}

#[derive(Default)]
struct PoolState {
    tuners: BTreeMap<String, Tuner>,
    viewers: HashMap<String, Viewer>,
}

/// A tuner eligible for allocation, with the addressing the checks need.
struct Candidate {
    device_id: String,
    tuner_index: u32,
    tuner_id: String,
    ip: String,
    base_url: String,
}

/// Eligible tuners in the scan order allocation requires: by device id,
/// then numeric tuner index. The formatted tuner_id string sorts
/// "tuner-10" before "tuner-2", so it cannot serve as the scan key.
fn candidates_in_scan_order<F>(state: &PoolState, eligible: F) -> Vec<Candidate>
where
    F: Fn(&Tuner) -> bool,
{
    let mut candidates: Vec<Candidate> = state
        .tuners
        .values()
        .filter(|tuner| eligible(tuner))
        .filter_map(|tuner| match (&tuner.device_ip, &tuner.base_url) {
            (Some(ip), Some(base)) => Some(Candidate {
                device_id: tuner.device_id.clone(),
                tuner_index: tuner.tuner_index,
                tuner_id: tuner.tuner_id.clone(),
                ip: ip.clone(),
                base_url: base.clone(),
            }),
            _ => None,
        })
        .collect();
    candidates.sort_by(|a, b| {
        a.device_id
            .cmp(&b.device_id)
            .then(a.tuner_index.cmp(&b.tuner_index))
    });
    candidates
}

#[derive(Debug, Clone, Serialize)]
pub struct WatchGrant {
    pub tuner_id: String,
    pub channel: String,
    pub playlist_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TunerSnapshot {
    pub tuner_id: String,
    pub device_id: String,
    pub tuner_index: u32,
    pub state: TunerState,
    pub channel: Option<String>,
    pub viewer_count: u32,
    pub last_accessed: i64,
}

pub fn tuner_id_for(device_id: &str, index: u32) -> String {
    format!("{device_id}-tuner-{index}")
}

pub struct TunerPool {
    settings: LiveSettings,
    store: MediaStore,
    probe: Arc<dyn AvailabilityProbe>,
    worker: Arc<LiveStreamWorker>,
    state: Mutex<PoolState>,
}

impl TunerPool {
    /// Load the durable mirror. Nothing that claimed a worker before the
    /// restart keeps it: Active rows come back Idle with zero viewers.
    pub fn new(
        settings: LiveSettings,
        store: MediaStore,
        probe: Arc<dyn AvailabilityProbe>,
        worker: Arc<LiveStreamWorker>,
    ) -> Result<Self, LiveError> {
        let mut tuners = BTreeMap::new();
        for row in store.load_tuners()? {
            let state = if row.state == TunerState::Active {
                TunerState::Idle
            } else {
                row.state
            };
            let tuner = Tuner {
                tuner_id: row.tuner_id.clone(),
                device_id: row.device_id,
                tuner_index: row.tuner_index,
                device_ip: None,
                base_url: None,
                state,
                channel: None,
                viewer_count: 0,
                last_accessed: DateTime::from_timestamp(row.last_accessed, 0)
                    .unwrap_or_else(Utc::now),
            };
            store.save_tuner(&tuner.to_row())?;
            tuners.insert(tuner.tuner_id.clone(), tuner);
        }
        store.clear_viewers()?;
        Ok(Self {
            settings,
            store,
            probe,
            worker,
            state: Mutex::new(PoolState {
                tuners,
                viewers: HashMap::new(),
            }),
        })
    }

    pub fn settings(&self) -> &LiveSettings {
        &self.settings
    }

    pub fn worker(&self) -> &Arc<LiveStreamWorker> {
        &self.worker
    }

    /// Fold a discovery pass into the pool: observed appliances contribute
    /// tuners, everything else goes offline.
    pub async fn register_appliances(&self, appliances: &[Appliance]) {
        let mut state = self.state.lock().await;
        let mut seen_devices = Vec::new();
        for appliance in appliances {
            seen_devices.push(appliance.device_id.clone());
            for index in 0..appliance.tuner_count {
                let tuner_id = tuner_id_for(&appliance.device_id, index);
                let entry = state.tuners.entry(tuner_id.clone()).or_insert_with(|| Tuner {
                    tuner_id: tuner_id.clone(),
                    device_id: appliance.device_id.clone(),
                    tuner_index: index,
                    device_ip: None,
                    base_url: None,
                    state: TunerState::Idle,
                    channel: None,
                    viewer_count: 0,
                    last_accessed: Utc::now(),
                });
                entry.device_ip = Some(appliance.ip_address.clone());
                entry.base_url = appliance.base_url.clone();
                if entry.state == TunerState::Offline {
                    entry.state = TunerState::Idle;
                    entry.channel = None;
                    entry.viewer_count = 0;
                }
                self.persist_tuner(entry);
            }
        }

        let orphaned: Vec<String> = state
            .tuners
            .values()
            .filter(|tuner| !seen_devices.contains(&tuner.device_id))
            .map(|tuner| tuner.tuner_id.clone())
            .collect();
        for tuner_id in orphaned {
            self.worker.stop(&tuner_id).await;
            let stale_viewers: Vec<String> = state
                .viewers
                .values()
                .filter(|viewer| viewer.tuner_id == tuner_id)
                .map(|viewer| viewer.client_id.clone())
                .collect();
            for client_id in stale_viewers {
                state.viewers.remove(&client_id);
                if let Err(err) = self.store.remove_viewer(&client_id) {
                    warn!(client_id = %client_id, error = %err, "failed to drop mirrored viewer");
                }
            }
            if let Some(tuner) = state.tuners.get_mut(&tuner_id) {
                tuner.state = TunerState::Offline;
                tuner.channel = None;
                tuner.viewer_count = 0;
                self.persist_tuner(tuner);
            }
            info!(tuner_id = %tuner_id, "tuner offline, appliance deregistered");
        }
    }

    /// Bind a viewer to a tuner streaming `channel`, starting a worker only
    /// when no running one can be shared.
    pub async fn watch(&self, channel: &str, client_id: &str) -> Result<WatchGrant, LiveError> {
        let mut state = self.state.lock().await;

        // A client re-watching rebinds: its previous seat is released first.
        if state.viewers.contains_key(client_id) {
            self.release_locked(&mut state, client_id)?;
        }

        // Channel share: a running tuner on the same channel takes the
        // viewer without any new worker.
        if let Some(tuner_id) = state
            .tuners
            .values()
            .find(|tuner| {
                tuner.state == TunerState::Active
                    && tuner.channel.as_deref() == Some(channel)
                    && tuner.viewer_count < self.settings.max_viewers_per_tuner
            })
            .map(|tuner| tuner.tuner_id.clone())
        {
            self.register_viewer(&mut state, &tuner_id, channel, client_id);
            return Ok(self.grant(&state, &tuner_id, channel));
        }

        // Cooldown tuner already on this channel: re-attach, worker intact.
        if let Some(tuner_id) = state
            .tuners
            .values()
            .find(|tuner| {
                tuner.state == TunerState::Cooldown
                    && tuner.channel.as_deref() == Some(channel)
                    && tuner.viewer_count == 0
            })
            .map(|tuner| tuner.tuner_id.clone())
        {
            debug!(tuner_id = %tuner_id, channel, "re-attaching to cooldown tuner");
            if let Some(tuner) = state.tuners.get_mut(&tuner_id) {
                tuner.state = TunerState::Active;
                self.persist_tuner(tuner);
            }
            self.register_viewer(&mut state, &tuner_id, channel, client_id);
            return Ok(self.grant(&state, &tuner_id, channel));
        }

        // Idle tuners, scanned by device id and numeric tuner index and
        // re-checked against the appliance before the claim.
        let idle = candidates_in_scan_order(&state, |tuner| tuner.state == TunerState::Idle);
        for candidate in idle {
            match self.probe.has_free_tuner(&candidate.base_url).await {
                Ok(true) => {
                    return self
                        .claim(&mut state, &candidate.tuner_id, &candidate.ip, channel, client_id)
                        .await;
                }
                Ok(false) => continue,
                Err(err) => {
                    debug!(tuner_id = %candidate.tuner_id, error = %err, "appliance availability check failed");
                    continue;
                }
            }
        }

        // Cooldown tuners on other channels: stop their worker and retune.
        let cooling = candidates_in_scan_order(&state, |tuner| {
            tuner.state == TunerState::Cooldown && tuner.viewer_count == 0
        });
        for candidate in cooling {
            match self.probe.has_free_tuner(&candidate.base_url).await {
                Ok(true) => {
                    self.worker.stop(&candidate.tuner_id).await;
                    return self
                        .claim(&mut state, &candidate.tuner_id, &candidate.ip, channel, client_id)
                        .await;
                }
                Ok(false) => continue,
                Err(err) => {
                    debug!(tuner_id = %candidate.tuner_id, error = %err, "appliance availability check failed");
                    continue;
                }
            }
        }

        Err(LiveError::NoTunersAvailable {
            channel: channel.to_string(),
        })
    }

    /// Pre-check the live URL, start the worker, and commit the transition.
    /// Pre-check failures surface once; the allocator does not spin.
    async fn claim(
        &self,
        state: &mut PoolState,
        tuner_id: &str,
        ip: &str,
        channel: &str,
        client_id: &str,
    ) -> Result<WatchGrant, LiveError> {
        self.probe.probe_live(ip, channel).await?;
        let source_url = ApplianceClient::live_stream_url(ip, channel);
        self.worker.start(tuner_id, &source_url).await?;

        if let Some(tuner) = state.tuners.get_mut(tuner_id) {
            tuner.state = TunerState::Active;
            tuner.channel = Some(channel.to_string());
            tuner.viewer_count = 0;
            tuner.last_accessed = Utc::now();
            self.persist_tuner(tuner);
        }
        self.register_viewer(state, tuner_id, channel, client_id);
        info!(tuner_id, channel, client_id, "tuner allocated");
        Ok(self.grant(state, tuner_id, channel))
    }

    fn grant(&self, _state: &PoolState, tuner_id: &str, channel: &str) -> WatchGrant {
        WatchGrant {
            tuner_id: tuner_id.to_string(),
            channel: channel.to_string(),
            playlist_url: format!("/live/{tuner_id}/playlist.m3u8"),
        }
    }

    fn register_viewer(
        &self,
        state: &mut PoolState,
        tuner_id: &str,
        channel: &str,
        client_id: &str,
    ) {
        let now = Utc::now();
        state.viewers.insert(
            client_id.to_string(),
            Viewer {
                client_id: client_id.to_string(),
                tuner_id: tuner_id.to_string(),
                channel: channel.to_string(),
                last_heartbeat: now,
            },
        );
        if let Some(tuner) = state.tuners.get_mut(tuner_id) {
            tuner.viewer_count += 1;
            tuner.last_accessed = now;
            self.persist_tuner(tuner);
        }
        if let Err(err) = self.store.save_viewer(&ViewerRow {
            client_id: client_id.to_string(),
            tuner_id: tuner_id.to_string(),
            channel: channel.to_string(),
            last_heartbeat: now.timestamp(),
        }) {
            warn!(client_id, error = %err, "failed to mirror viewer");
        }
    }

    /// Refresh a viewer's heartbeat. Returns whether the client was known.
    pub async fn heartbeat(&self, client_id: &str) -> bool {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        match state.viewers.get_mut(client_id) {
            Some(viewer) => {
                viewer.last_heartbeat = now;
                let row = ViewerRow {
                    client_id: viewer.client_id.clone(),
                    tuner_id: viewer.tuner_id.clone(),
                    channel: viewer.channel.clone(),
                    last_heartbeat: now.timestamp(),
                };
                if let Err(err) = self.store.save_viewer(&row) {
                    warn!(client_id, error = %err, "failed to mirror heartbeat");
                }
                true
            }
            None => false,
        }
    }

    pub async fn release(&self, client_id: &str) -> Result<(), LiveError> {
        let mut state = self.state.lock().await;
        self.release_locked(&mut state, client_id)
    }

    fn release_locked(&self, state: &mut PoolState, client_id: &str) -> Result<(), LiveError> {
        let viewer = state
            .viewers
            .remove(client_id)
            .ok_or_else(|| LiveError::UnknownViewer {
                client_id: client_id.to_string(),
            })?;
        if let Err(err) = self.store.remove_viewer(client_id) {
            warn!(client_id, error = %err, "failed to drop mirrored viewer");
        }
        if let Some(tuner) = state.tuners.get_mut(&viewer.tuner_id) {
            tuner.viewer_count = tuner.viewer_count.saturating_sub(1);
            if tuner.viewer_count == 0 && tuner.state == TunerState::Active {
                tuner.state = TunerState::Cooldown;
                tuner.last_accessed = Utc::now();
                debug!(tuner_id = %tuner.tuner_id, "last viewer left, tuner cooling down");
            }
            self.persist_tuner(tuner);
        }
        Ok(())
    }

    /// Drop viewers whose heartbeats stopped. Exactly at the threshold a
    /// viewer survives; strictly beyond it is reaped.
    pub async fn sweep_viewers(&self) -> usize {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let stale_after = self.settings.stale_after();
        let stale: Vec<String> = state
            .viewers
            .values()
            .filter(|viewer| now.signed_duration_since(viewer.last_heartbeat) > stale_after)
            .map(|viewer| viewer.client_id.clone())
            .collect();
        let count = stale.len();
        for client_id in stale {
            info!(client_id = %client_id, "reaping dead viewer");
            let _ = self.release_locked(&mut state, &client_id);
        }
        count
    }

    /// Stop workers on tuners whose cooldown has expired.
    pub async fn sweep_idle(&self) -> usize {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let cooldown = chrono::Duration::from_std(self.settings.cooldown)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let expired: Vec<String> = state
            .tuners
            .values()
            .filter(|tuner| {
                tuner.state == TunerState::Cooldown
                    && tuner.viewer_count == 0
                    && tuner.last_accessed + cooldown < now
            })
            .map(|tuner| tuner.tuner_id.clone())
            .collect();
        let count = expired.len();
        for tuner_id in expired {
            info!(tuner_id = %tuner_id, "cooldown expired, stopping live worker");
            self.worker.stop(&tuner_id).await;
            if let Some(tuner) = state.tuners.get_mut(&tuner_id) {
                tuner.state = TunerState::Idle;
                tuner.channel = None;
                self.persist_tuner(tuner);
            }
        }
        count
    }

    pub async fn run_viewer_sweep(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.settings.viewer_sweep);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let reaped = self.sweep_viewers().await;
            if reaped > 0 {
                info!(reaped, "dead-viewer sweep released viewers");
            }
        }
    }

    pub async fn run_tuner_sweep(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.settings.tuner_sweep);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let idled = self.sweep_idle().await;
            if idled > 0 {
                info!(idled, "idle-tuner sweep stopped workers");
            }
        }
    }

    pub async fn tuners(&self) -> Vec<TunerSnapshot> {
        let state = self.state.lock().await;
        state
            .tuners
            .values()
            .map(|tuner| TunerSnapshot {
                tuner_id: tuner.tuner_id.clone(),
                device_id: tuner.device_id.clone(),
                tuner_index: tuner.tuner_index,
                state: tuner.state,
                channel: tuner.channel.clone(),
                viewer_count: tuner.viewer_count,
                last_accessed: tuner.last_accessed.timestamp(),
            })
            .collect()
    }

    pub async fn viewer_count(&self) -> usize {
        self.state.lock().await.viewers.len()
    }

    pub async fn shutdown(&self) {
        self.worker.stop_all().await;
    }

    fn persist_tuner(&self, tuner: &Tuner) {
        if let Err(err) = self.store.save_tuner(&tuner.to_row()) {
            warn!(tuner_id = %tuner.tuner_id, error = %err, "failed to mirror tuner");
        }
    }
}
