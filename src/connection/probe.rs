use super::{ConnectionMethod, ConnectionPath, Device, PathProbe};
use crate::error::{Error, Result};
use crate::utils::config::ConnectionConfig;
use async_trait::async_trait;
use futures::future::join_all;
use once_cell::sync::Lazy;
use regex::Regex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::TcpSocket;
use tokio::process::Command;
use tracing::debug;

static INET_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d+:\s+(\S+)\s+inet\s+(\d{1,3}(?:\.\d{1,3}){3})/(\d{1,2})").expect("valid regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
struct LocalInterface {
    name: String,
    address: Ipv4Addr,
    prefix: u8,
}

/// Probes routes through the host's IPv4 interfaces.
pub struct SystemPathProbe {
    config: ConnectionConfig,
    sys_class_net: PathBuf,
}

impl SystemPathProbe {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            sys_class_net: PathBuf::from("/sys/class/net"),
        }
    }

    async fn interfaces(&self) -> Result<Vec<LocalInterface>> {
        let output = Command::new("ip")
            .args(["-o", "-4", "addr", "show"])
            .output()
            .await
            .map_err(|e| Error::NotReachable(format!("cannot list interfaces: {}", e)))?;

        if !output.status.success() {
            return Err(Error::NotReachable(format!(
                "ip addr failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(parse_interfaces(&String::from_utf8_lossy(&output.stdout)))
    }

    /// Pair each interface with the device address that lives on its subnet.
    async fn candidates(&self, interfaces: &[LocalInterface], device: &Device) -> Vec<ConnectionPath> {
        let mut paths = Vec::new();

        for iface in interfaces {
            if iface.address.is_loopback() {
                continue;
            }
            let method = classify(&iface.name, &self.config.overlay_interface_prefix, &self.sys_class_net).await;
            let target = match method {
                ConnectionMethod::Remote => device.addresses.overlay,
                _ => device.addresses.local,
            };
            let Some(IpAddr::V4(target)) = target else {
                continue;
            };
            if in_subnet(iface.address, target, iface.prefix) {
                paths.push(ConnectionPath {
                    method,
                    local_address: IpAddr::V4(iface.address),
                    remote_address: IpAddr::V4(target),
                    interface: Some(iface.name.clone()),
                });
            }
        }

        paths
    }
}

#[async_trait]
impl PathProbe for SystemPathProbe {
    async fn probe_paths(&self, device: &Device) -> Result<Vec<ConnectionPath>> {
        let interfaces = self.interfaces().await?;
        let candidates = self.candidates(&interfaces, device).await;

        let port = self.config.api_port;
        let timeout = self.config.probe_timeout;
        let checks = join_all(
            candidates
                .iter()
                .map(|p| reachable(p.local_address, p.remote_address, port, timeout)),
        )
        .await;

        let paths: Vec<ConnectionPath> = candidates
            .into_iter()
            .zip(checks)
            .filter_map(|(path, ok)| ok.then_some(path))
            .collect();

        debug!(device = %device.id, "{} reachable paths", paths.len());
        Ok(paths)
    }
}

fn parse_interfaces(output: &str) -> Vec<LocalInterface> {
    output
        .lines()
        .filter_map(|line| {
            let caps = INET_LINE.captures(line)?;
            let name = caps[1].split('@').next()?.trim_end_matches(':').to_string();
            Some(LocalInterface {
                name,
                address: caps[2].parse().ok()?,
                prefix: caps[3].parse::<u8>().ok().filter(|p| *p <= 32)?,
            })
        })
        .collect()
}

async fn classify(name: &str, overlay_prefix: &str, sys_class_net: &Path) -> ConnectionMethod {
    if !overlay_prefix.is_empty() && name.starts_with(overlay_prefix) {
        return ConnectionMethod::Remote;
    }

    let dev = sys_class_net.join(name);
    if name.starts_with("thunderbolt")
        || driver_name(&dev).await.map_or(false, |d| d.contains("thunderbolt"))
    {
        return ConnectionMethod::Thunderbolt;
    }
    if name.starts_with("wl") || exists(&dev.join("wireless")).await || exists(&dev.join("phy80211")).await {
        return ConnectionMethod::Wifi;
    }
    ConnectionMethod::Ethernet
}

async fn driver_name(dev: &Path) -> Option<String> {
    let target = tokio::fs::read_link(dev.join("device").join("driver")).await.ok()?;
    Some(target.file_name()?.to_string_lossy().into_owned())
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

fn in_subnet(a: Ipv4Addr, b: Ipv4Addr, prefix: u8) -> bool {
    let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - u32::from(prefix)) };
    (u32::from(a) & mask) == (u32::from(b) & mask)
}

async fn reachable(local: IpAddr, remote: IpAddr, port: u16, timeout: Duration) -> bool {
    let socket = match remote {
        IpAddr::V4(_) => TcpSocket::new_v4(),
        IpAddr::V6(_) => TcpSocket::new_v6(),
    };
    let Ok(socket) = socket else {
        return false;
    };
    if socket.bind(SocketAddr::new(local, 0)).is_err() {
        return false;
    }
    matches!(
        tokio::time::timeout(timeout, socket.connect(SocketAddr::new(remote, port))).await,
        Ok(Ok(_))
    )
}
