pub mod packet;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Deserialize;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::appliance::{ApplianceClient, ApplianceError, DeviceDescription};
use crate::config::DiscoverySection;
use crate::store::catalog::DeviceUpsert;
use crate::store::{MediaStore, StoreError};

use self::packet::{encode_discover_request, parse_discover_reply, DISCOVER_PORT};

/// Model strings containing this marker are accepted during subnet scans.
const VENDOR_MARKER: &str = "HDHomeRun";

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("a discovery pass is already running")]
    Busy,
    #[error("discovery socket error: {0}")]
    Socket(#[from] std::io::Error),
    #[error("appliance error: {0}")]
    Appliance(#[from] ApplianceError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("cloud device lookup failed: {0}")]
    Cloud(reqwest::Error),
}

pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiscoverySource {
    Udp,
    Cloud,
    Scan,
    Static,
}

/// Authoritative record for one appliance, as assembled by a discovery pass.
#[derive(Debug, Clone)]
pub struct Appliance {
    pub device_id: String,
    pub ip_address: String,
    pub friendly_name: Option<String>,
    pub model_number: Option<String>,
    pub firmware_name: Option<String>,
    pub firmware_version: Option<String>,
    pub base_url: Option<String>,
    pub lineup_url: Option<String>,
    pub storage_url: Option<String>,
    pub device_auth: Option<String>,
    pub tuner_count: u32,
    pub total_space: Option<i64>,
    pub free_space: Option<i64>,
    pub source: DiscoverySource,
}

impl Appliance {
    /// Identity falls back to the probe address when the appliance reports
    /// no device id, so merge and persistence still key on something stable.
    pub fn from_description(
        ip: String,
        description: DeviceDescription,
        source: DiscoverySource,
    ) -> Self {
        let device_id = description
            .device_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| ip.clone());
        Self {
            device_id,
            base_url: description
                .base_url
                .clone()
                .or_else(|| Some(format!("http://{ip}"))),
            ip_address: ip,
            friendly_name: description.friendly_name,
            model_number: description.model_number,
            firmware_name: description.firmware_name,
            firmware_version: description.firmware_version,
            lineup_url: description.lineup_url,
            storage_url: description.storage_url,
            device_auth: description.device_auth,
            tuner_count: description.tuner_count.unwrap_or(0),
            total_space: description.total_space,
            free_space: description.free_space,
            source,
        }
    }

    pub fn dvr_capable(&self) -> bool {
        self.storage_url.is_some()
    }

    pub fn to_upsert(&self) -> DeviceUpsert {
        DeviceUpsert {
            device_id: self.device_id.clone(),
            friendly_name: self.friendly_name.clone(),
            model_number: self.model_number.clone(),
            firmware_name: self.firmware_name.clone(),
            firmware_version: self.firmware_version.clone(),
            ip_address: Some(self.ip_address.clone()),
            base_url: self.base_url.clone(),
            lineup_url: self.lineup_url.clone(),
            storage_url: self.storage_url.clone(),
            device_auth: self.device_auth.clone(),
            tuner_count: self.tuner_count,
            total_space: self.total_space,
            free_space: self.free_space,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct CloudDeviceEntry {
    #[serde(rename = "DeviceID", default)]
    device_id: Option<String>,
    #[serde(rename = "LocalIP", default)]
    local_ip: Option<String>,
}

/// Locates appliances on the local network and keeps the device table
/// authoritative. A single pass may run at a time.
pub struct Discoverer {
    config: DiscoverySection,
    client: ApplianceClient,
    store: MediaStore,
    in_progress: Arc<AtomicBool>,
}

struct PassGuard(Arc<AtomicBool>);

impl Drop for PassGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Discoverer {
    pub fn new(config: DiscoverySection, client: ApplianceClient, store: MediaStore) -> Self {
        Self {
            config,
            client,
            store,
            in_progress: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Run one full pass: UDP broadcast, HTTP fallbacks, detail fetch, merge,
    /// persist. Observers see either the previous device set or the new one.
    pub async fn discover(&self) -> DiscoveryResult<Vec<Appliance>> {
        if self.in_progress.swap(true, Ordering::SeqCst) {
            return Err(DiscoveryError::Busy);
        }
        let _guard = PassGuard(Arc::clone(&self.in_progress));

        let mut candidates: Vec<(String, DiscoverySource)> = Vec::new();
        match self.udp_discover().await {
            Ok(ips) => {
                candidates.extend(ips.into_iter().map(|ip| (ip, DiscoverySource::Udp)));
            }
            Err(err) => warn!(error = %err, "udp discovery failed, falling back to http"),
        }
        for address in &self.config.static_addresses {
            candidates.push((address.clone(), DiscoverySource::Static));
        }
        match self.cloud_candidates().await {
            Ok(ips) => {
                candidates.extend(ips.into_iter().map(|ip| (ip, DiscoverySource::Cloud)));
            }
            Err(err) => debug!(error = %err, "cloud device lookup unavailable"),
        }
        if candidates.is_empty() {
            candidates.extend(
                self.scan_local_subnet()
                    .await
                    .into_iter()
                    .map(|ip| (ip, DiscoverySource::Scan)),
            );
        }

        let appliances = self.fetch_details(candidates).await;
        let merged = merge_appliances(appliances);

        let upserts: Vec<_> = merged.iter().map(Appliance::to_upsert).collect();
        let offline = self.store.apply_discovery(&upserts)?;
        if offline > 0 {
            info!(count = offline, "appliances not observed this pass marked offline");
        }
        info!(count = merged.len(), "discovery pass complete");
        Ok(merged)
    }

    /// Broadcast a discover-request and collect replies for the configured
    /// window. Replies only nominate candidates; details come over HTTP.
    async fn udp_discover(&self) -> DiscoveryResult<Vec<String>> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.set_broadcast(true)?;
        let request = encode_discover_request();
        socket
            .send_to(&request, (Ipv4Addr::BROADCAST, DISCOVER_PORT))
            .await?;

        let deadline = Instant::now() + Duration::from_secs(self.config.reply_window_secs);
        let mut buf = [0u8; 1024];
        let mut ips = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, socket.recv_from(&mut buf)).await {
                Ok(Ok((len, peer))) => match parse_discover_reply(&buf[..len]) {
                    Ok(reply) => {
                        debug!(
                            peer = %peer,
                            device_id = ?reply.device_id_hex(),
                            tuners = ?reply.tuner_count,
                            "discovery reply"
                        );
                        ips.push(peer.ip().to_string());
                    }
                    Err(err) => debug!(peer = %peer, error = %err, "ignoring invalid datagram"),
                },
                Ok(Err(err)) => return Err(DiscoveryError::Socket(err)),
                Err(_) => break,
            }
        }
        Ok(ips)
    }

    async fn cloud_candidates(&self) -> DiscoveryResult<Vec<String>> {
        let response = reqwest::Client::new()
            .get(&self.config.cloud_discover_url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(DiscoveryError::Cloud)?;
        let entries: Vec<CloudDeviceEntry> =
            response.json().await.map_err(DiscoveryError::Cloud)?;
        Ok(entries
            .into_iter()
            .filter(|entry| entry.device_id.is_some())
            .filter_map(|entry| entry.local_ip)
            .collect())
    }

    /// Probe the interface-adjacent /24 at bounded parallelism, keeping hosts
    /// whose model string names the vendor.
    async fn scan_local_subnet(&self) -> Vec<String> {
        let Some(local) = local_ipv4().await else {
            warn!("could not determine local address, skipping subnet scan");
            return Vec::new();
        };
        let octets = local.octets();
        let client = self.client.clone();
        let hosts = (1u8..255).filter_map(move |last| {
            if last == octets[3] {
                None
            } else {
                Some(Ipv4Addr::new(octets[0], octets[1], octets[2], last).to_string())
            }
        });

        futures::stream::iter(hosts)
            .map(|ip| {
                let client = client.clone();
                async move {
                    match client.discover(&ip).await {
                        Ok(description)
                            if description
                                .model_number
                                .as_deref()
                                .map(|model| model.contains(VENDOR_MARKER))
                                .unwrap_or(false) =>
                        {
                            Some(ip)
                        }
                        _ => None,
                    }
                }
            })
            .buffer_unordered(self.config.scan_parallelism)
            .filter_map(|found| async move { found })
            .collect()
            .await
    }

    async fn fetch_details(
        &self,
        candidates: Vec<(String, DiscoverySource)>,
    ) -> Vec<Appliance> {
        let mut appliances = Vec::new();
        for (ip, source) in candidates {
            match self.client.discover(&ip).await {
                Ok(description) => {
                    appliances.push(Appliance::from_description(ip, description, source));
                }
                Err(err) => debug!(ip = %ip, error = %err, "device details unavailable"),
            }
        }
        appliances
    }
}

/// Merge duplicate discoveries of the same device, keyed by device id with
/// the probe address standing in when no id was ever reported. UDP-sourced
/// entries win the address fields; everything else keeps the first
/// non-empty value.
pub fn merge_appliances(appliances: Vec<Appliance>) -> Vec<Appliance> {
    let mut by_id: HashMap<String, Appliance> = HashMap::new();
    for appliance in appliances {
        let key = appliance.device_id.clone();
        match by_id.get_mut(&key) {
            None => {
                by_id.insert(key, appliance);
            }
            Some(existing) => {
                if appliance.source == DiscoverySource::Udp
                    && existing.source != DiscoverySource::Udp
                {
                    let kept_auth = existing.device_auth.take();
                    *existing = appliance;
                    if existing.device_auth.is_none() {
                        existing.device_auth = kept_auth;
                    }
                } else {
                    if existing.storage_url.is_none() {
                        existing.storage_url = appliance.storage_url;
                    }
                    if existing.device_auth.is_none() {
                        existing.device_auth = appliance.device_auth;
                    }
                }
            }
        }
    }
    let mut merged: Vec<Appliance> = by_id.into_values().collect();
    merged.sort_by(|a, b| a.device_id.cmp(&b.device_id));
    merged
}

/// Learn the primary interface address by opening an unconnected datagram
/// socket toward a routable host; no packet is sent.
async fn local_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await.ok()?;
    socket.connect(("203.0.113.1", 1)).await.ok()?;
    match socket.local_addr().ok()? {
        std::net::SocketAddr::V4(addr) => Some(*addr.ip()),
        _ => None,
    }
}
