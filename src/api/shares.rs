use axum::extract::{Path, State};
use serde::Deserialize;

use super::{ok, ApiResult, AppState, Payload};
use crate::shares::{Credentials, Share, ShareKey, SpaceStats};

#[derive(Debug, Deserialize)]
pub struct DiscoverRequest {
    host: String,
    #[serde(default)]
    credentials: Option<Credentials>,
}

pub async fn discover(
    State(state): State<AppState>,
    Payload(request): Payload<DiscoverRequest>,
) -> ApiResult<Vec<Share>> {
    ok(state
        .shares
        .discover_shares(&request.host, request.credentials.as_ref())
        .await?)
}

pub async fn list_pinned(State(state): State<AppState>) -> ApiResult<Vec<Share>> {
    ok(state.shares.list_pinned())
}

#[derive(Debug, Deserialize)]
pub struct PinRequest {
    share: Share,
    #[serde(default)]
    credentials: Option<Credentials>,
}

pub async fn pin(State(state): State<AppState>, Payload(request): Payload<PinRequest>) -> ApiResult<Share> {
    ok(state.shares.pin_share(request.share, request.credentials).await?)
}

pub async fn unpin(State(state): State<AppState>, Path((host, name)): Path<(String, String)>) -> ApiResult<()> {
    state.shares.unpin_share(&ShareKey::new(host, name)).await?;
    ok(())
}

#[derive(Debug, Deserialize)]
pub struct SpaceRequest {
    host: String,
    name: String,
    #[serde(default)]
    credentials: Option<Credentials>,
}

pub async fn space(State(state): State<AppState>, Payload(request): Payload<SpaceRequest>) -> ApiResult<SpaceStats> {
    let key = ShareKey::new(request.host, request.name);
    ok(state.shares.get_space(&key, request.credentials).await?)
}
