use axum::extract::{Path, State};
use serde::Deserialize;

use super::{ok, ApiResult, AppState, Payload};
use crate::backup::{BackupJob, JobPatch, JobSpec};
use crate::shares::Credentials;
use crate::utils::log_buffer::LogEntry;

pub async fn list(State(state): State<AppState>) -> ApiResult<Vec<BackupJob>> {
    ok(state.backups.list_jobs())
}

pub async fn create(State(state): State<AppState>, Payload(spec): Payload<JobSpec>) -> ApiResult<BackupJob> {
    ok(state.backups.create_job(spec).await?)
}

pub async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<BackupJob> {
    ok(state.backups.get_job(&id)?)
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Payload(patch): Payload<JobPatch>,
) -> ApiResult<BackupJob> {
    ok(state.backups.update_job(&id, patch).await?)
}

pub async fn remove(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<()> {
    state.backups.delete_job(&id).await?;
    ok(())
}

#[derive(Debug, Default, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    credentials: Option<Credentials>,
}

pub async fn run(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Payload(request): Payload<Option<RunRequest>>,
) -> ApiResult<BackupJob> {
    let credentials = request.unwrap_or_default().credentials;
    ok(state.backups.run(&id, credentials).await?)
}

pub async fn stop(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<BackupJob> {
    state.backups.stop(&id).await?;
    ok(state.backups.get_job(&id)?)
}

pub async fn pause(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<BackupJob> {
    ok(state.backups.pause(&id).await?)
}

pub async fn resume(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<BackupJob> {
    ok(state.backups.resume(&id).await?)
}

pub async fn logs(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Vec<LogEntry>> {
    state.backups.get_job(&id)?;
    ok(state.backups.job_logs(&id))
}
