use super::{ConnectionHistory, Device, DeviceAddresses};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::Deserialize;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Identifies the device answering at an address.
#[async_trait]
pub trait DeviceApi: Send + Sync {
    /// `Ok(None)` when nothing (or something else) answers there.
    async fn identify(&self, address: IpAddr) -> Result<Option<Device>>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceInfo {
    id: String,
    #[serde(alias = "name")]
    display_name: String,
    local_address: Option<IpAddr>,
    overlay_address: Option<IpAddr>,
}

/// Device API over plain HTTP.
pub struct HttpDeviceApi {
    client: reqwest::Client,
    port: u16,
}

impl HttpDeviceApi {
    pub fn new(port: u16, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::validation(format!("http client: {}", e)))?;
        Ok(Self { client, port })
    }
}

#[async_trait]
impl DeviceApi for HttpDeviceApi {
    async fn identify(&self, address: IpAddr) -> Result<Option<Device>> {
        let host = match address {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => format!("[{}]", v6),
        };
        let url = format!("http://{}:{}/v1/device", host, self.port);

        let response = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!("No device at {}: {}", address, e);
                return Ok(None);
            }
        };
        if !response.status().is_success() {
            debug!("{} answered {}", url, response.status());
            return Ok(None);
        }

        let info: DeviceInfo = response
            .json()
            .await
            .map_err(|e| Error::validation(format!("malformed device info from {}: {}", address, e)))?;

        let mut addresses = DeviceAddresses {
            local: info.local_address,
            overlay: info.overlay_address,
        };
        // The address that answered is reachable even if the device did not report it.
        if addresses.local.is_none() && addresses.overlay != Some(address) {
            addresses.local = Some(address);
        }

        let device = Device {
            id: info.id,
            display_name: info.display_name,
            addresses,
            online: true,
            shares: Vec::new(),
        };
        device.validate()?;
        Ok(Some(device))
    }
}

/// Known devices plus the one the user picked.
#[derive(Clone)]
pub struct DeviceDirectory {
    api: Arc<dyn DeviceApi>,
    history: ConnectionHistory,
    known_hosts: Arc<Vec<String>>,
    devices: Arc<RwLock<Vec<Device>>>,
    current: Arc<RwLock<Option<Device>>>,
}

impl DeviceDirectory {
    pub fn new(api: Arc<dyn DeviceApi>, history: ConnectionHistory, known_hosts: Vec<String>) -> Self {
        Self {
            api,
            history,
            known_hosts: Arc::new(known_hosts),
            devices: Arc::new(RwLock::new(Vec::new())),
            current: Arc::new(RwLock::new(None)),
        }
    }

    pub fn history(&self) -> &ConnectionHistory {
        &self.history
    }

    /// Probe known hosts and recent gateways. Devices missing from this scan
    /// are kept but marked offline.
    pub async fn discover(&self) -> Result<Vec<Device>> {
        let candidates = self.candidates().await;
        info!("Discovering devices on {} candidate addresses", candidates.len());

        let results = join_all(candidates.iter().map(|addr| self.api.identify(*addr))).await;

        let mut found: Vec<Device> = Vec::new();
        for (addr, result) in candidates.iter().zip(results) {
            match result {
                Ok(Some(device)) => {
                    if !found.iter().any(|d| d.id == device.id) {
                        found.push(device);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("Ignoring device at {}: {}", addr, e),
            }
        }

        {
            let mut devices = self.devices.write();
            for device in devices.iter_mut() {
                device.online = found.iter().any(|d| d.id == device.id);
            }
            for device in &found {
                upsert(&mut devices, device.clone());
            }
        }

        if let Some(current) = self.current.write().as_mut() {
            current.online = found.iter().any(|d| d.id == current.id);
        }

        info!("Discovery found {} devices", found.len());
        Ok(found)
    }

    pub async fn device_by_ip(&self, address: IpAddr) -> Result<Device> {
        let device = self
            .api
            .identify(address)
            .await?
            .ok_or_else(|| Error::not_found("device", address.to_string()))?;
        upsert(&mut self.devices.write(), device.clone());
        Ok(device)
    }

    /// Resolve through the gateway recorded for the overlay network.
    pub async fn device_by_network_id(&self, network_id: &str) -> Result<Device> {
        let entry = self
            .history
            .find(network_id)
            .ok_or_else(|| Error::not_found("network", network_id))?;
        let gateway: IpAddr = entry.gateway_address.parse().map_err(|_| {
            Error::validation(format!("bad gateway address {}", entry.gateway_address))
        })?;
        self.device_by_ip(gateway).await
    }

    pub fn devices(&self) -> Vec<Device> {
        self.devices.read().clone()
    }

    pub fn has_device(&self) -> bool {
        self.current.read().is_some()
    }

    pub fn device(&self) -> Option<Device> {
        self.current.read().clone()
    }

    pub fn set_device(&self, device: Device) -> Result<()> {
        device.validate()?;
        upsert(&mut self.devices.write(), device.clone());
        info!(device = %device.id, "Current device set to {}", device.display_name);
        *self.current.write() = Some(device);
        Ok(())
    }

    async fn candidates(&self) -> Vec<IpAddr> {
        let mut candidates: Vec<IpAddr> = Vec::new();

        for host in self.known_hosts.iter() {
            match host.parse::<IpAddr>() {
                Ok(ip) => candidates.push(ip),
                Err(_) => match tokio::net::lookup_host((host.as_str(), 0)).await {
                    Ok(addrs) => candidates.extend(addrs.map(|a| a.ip())),
                    Err(e) => debug!("Could not resolve {}: {}", host, e),
                },
            }
        }

        candidates.extend(
            self.history
                .list()
                .iter()
                .filter_map(|e| e.gateway_address.parse::<IpAddr>().ok()),
        );

        candidates.sort();
        candidates.dedup();
        candidates
    }
}

fn upsert(devices: &mut Vec<Device>, device: Device) {
    match devices.iter_mut().find(|d| d.id == device.id) {
        Some(existing) => *existing = device,
        None => devices.push(device),
    }
}
