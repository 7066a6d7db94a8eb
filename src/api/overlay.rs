use axum::extract::State;
use serde_json::Value;

use super::{ok, ApiResult, AppState};
use crate::overlay::OverlayClientState;

pub async fn get_state(State(state): State<AppState>) -> ApiResult<OverlayClientState> {
    ok(state.overlay.refresh().await?)
}

/// The installed version, or `false` when the client is not installed.
pub async fn check_installation(State(state): State<AppState>) -> ApiResult<Value> {
    let data = match state.overlay.check_installation().await? {
        Some(version) => Value::String(version),
        None => Value::Bool(false),
    };
    ok(data)
}

pub async fn check_running(State(state): State<AppState>) -> ApiResult<bool> {
    ok(state.overlay.check_running().await?)
}

/// `null` when the token exists but cannot be read.
pub async fn get_auth_token(State(state): State<AppState>) -> ApiResult<Option<String>> {
    ok(state.overlay.get_auth_token().await?)
}

pub async fn init_auth_token(State(state): State<AppState>) -> ApiResult<String> {
    ok(state.overlay.init_auth_token().await?)
}

pub async fn check_capabilities(State(state): State<AppState>) -> ApiResult<bool> {
    ok(state.overlay.check_capabilities().await?)
}

pub async fn setcap_command(State(state): State<AppState>) -> ApiResult<String> {
    ok(state.overlay.setcap_command())
}

pub async fn install(State(state): State<AppState>) -> ApiResult<OverlayClientState> {
    state.overlay.install().await?;
    ok(state.overlay.state())
}

pub async fn uninstall(State(state): State<AppState>) -> ApiResult<OverlayClientState> {
    state.overlay.uninstall().await?;
    ok(state.overlay.state())
}

pub async fn start(State(state): State<AppState>) -> ApiResult<OverlayClientState> {
    state.overlay.start().await?;
    ok(state.overlay.state())
}

pub async fn stop(State(state): State<AppState>) -> ApiResult<OverlayClientState> {
    state.overlay.stop().await?;
    ok(state.overlay.state())
}

pub async fn start_monitor(State(state): State<AppState>) -> ApiResult<bool> {
    state.overlay.start_monitor().await?;
    ok(state.overlay.monitor_active())
}

pub async fn stop_monitor(State(state): State<AppState>) -> ApiResult<bool> {
    state.overlay.stop_monitor().await;
    ok(state.overlay.monitor_active())
}
