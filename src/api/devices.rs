use axum::extract::{Path, State};
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;
use tracing::warn;

use super::{ok, ApiResult, AppState, Payload};
use crate::connection::{ConnectionPath, Device, RecentConnection};
use crate::error::Error;
use crate::storage::keys;

fn current_device(state: &AppState) -> Result<Device, Error> {
    state
        .devices
        .device()
        .ok_or_else(|| Error::not_found("device", "current"))
}

pub async fn list(State(state): State<AppState>) -> ApiResult<Vec<Device>> {
    ok(state.devices.devices())
}

pub async fn discover(State(state): State<AppState>) -> ApiResult<Vec<Device>> {
    ok(state.devices.discover().await?)
}

pub async fn by_network_id(
    State(state): State<AppState>,
    Path(network_id): Path<String>,
) -> ApiResult<Device> {
    ok(state.devices.device_by_network_id(&network_id).await?)
}

pub async fn by_ip(State(state): State<AppState>, Path(ip): Path<String>) -> ApiResult<Device> {
    let address: IpAddr = ip
        .parse()
        .map_err(|_| Error::validation(format!("not an IP address: {}", ip)))?;
    ok(state.devices.device_by_ip(address).await?)
}

pub async fn has_device(State(state): State<AppState>) -> ApiResult<bool> {
    ok(state.devices.has_device())
}

pub async fn get_device(State(state): State<AppState>) -> ApiResult<Option<Device>> {
    ok(state.devices.device())
}

pub async fn set_device(State(state): State<AppState>, Payload(device): Payload<Device>) -> ApiResult<Device> {
    state.devices.set_device(device.clone())?;
    if let Err(e) = state.storage.put(keys::LAST_DEVICE, &device).await {
        warn!("Could not remember device {}: {}", device.id, e);
    }
    ok(device)
}

pub async fn available_paths(State(state): State<AppState>) -> ApiResult<Vec<ConnectionPath>> {
    let device = current_device(&state)?;
    ok(state.resolver.available_paths(&device).await?)
}

pub async fn current_path(State(state): State<AppState>) -> ApiResult<Option<ConnectionPath>> {
    let device = current_device(&state)?;
    ok(state.resolver.current_path(&device).await?)
}

/// Path recorded by the last successful `wait-ready`, without probing.
pub async fn last_path(State(state): State<AppState>) -> ApiResult<Option<ConnectionPath>> {
    ok(state.storage.get(keys::LAST_CONNECTION_PATH).await?)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitForReady {
    timeout_ms: Option<u64>,
    interval_ms: Option<u64>,
}

pub async fn wait_for_ready(
    State(state): State<AppState>,
    Payload(request): Payload<Option<WaitForReady>>,
) -> ApiResult<ConnectionPath> {
    let device = current_device(&state)?;
    let request = request.unwrap_or_default();
    let timeout = request
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(state.config.connection.ready_timeout);
    let interval = request
        .interval_ms
        .map(Duration::from_millis)
        .unwrap_or(state.config.connection.ready_interval);
    if interval.is_zero() {
        return Err(Error::validation("intervalMs must be greater than zero").into());
    }

    let path = state.resolver.wait_for_ready(&device, timeout, interval).await?;
    if let Err(e) = state.storage.put(keys::LAST_CONNECTION_PATH, &path).await {
        warn!("Could not remember connection path: {}", e);
    }
    ok(path)
}

pub async fn recent_connections(State(state): State<AppState>) -> ApiResult<Vec<RecentConnection>> {
    ok(state.devices.history().list())
}

pub async fn save_recent_connection(
    State(state): State<AppState>,
    Payload(entry): Payload<RecentConnection>,
) -> ApiResult<Vec<RecentConnection>> {
    if entry.network_id.trim().is_empty() {
        return Err(Error::validation("networkId is empty").into());
    }
    let list = state.devices.history().save(entry.clone());
    state.storage.save_recent_connection(&entry).await?;
    state
        .storage
        .trim_recent_connections(state.config.connection.history_limit)
        .await?;
    ok(list)
}
