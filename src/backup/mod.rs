pub mod manager;
pub mod mirror;
pub mod progress;
pub mod scanner;
pub mod scheduler;
pub mod worker;

pub use manager::BackupManager;
pub use mirror::{FsMirror, MirrorOutcome, MirrorPrimitive};
pub use scheduler::Scheduler;

use crate::error::{Error, Result};
use crate::shares::ShareKey;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub type JobId = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    InProgress,
    Paused,
    Stopped,
    Error,
    Complete,
}

impl JobStatus {
    /// A worker exists for the job.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::InProgress | JobStatus::Paused)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobStats {
    pub total_size: u64,
    pub total_files: u64,
    pub transferred_size: u64,
    pub transferred_files: u64,
    /// Unix seconds of the last completed run
    pub last_backup_time: Option<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Manual,
    Daily,
    Weekly,
    Monthly,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub frequency: Frequency,
    /// Local wall-clock time, `HH:MM`
    #[serde(default = "default_time")]
    pub time: String,
    /// 0 = Sunday
    #[serde(default)]
    pub day_of_week: Option<u8>,
    /// Clamped to the last day of shorter months
    #[serde(default)]
    pub day_of_month: Option<u8>,
}

fn default_time() -> String {
    "00:00".to_string()
}

impl Schedule {
    pub fn hour_minute(&self) -> Result<(u32, u32)> {
        let bad = || Error::validation(format!("schedule time must be HH:MM, got {:?}", self.time));
        let (h, m) = self.time.split_once(':').ok_or_else(bad)?;
        let hour: u32 = h.trim().parse().map_err(|_| bad())?;
        let minute: u32 = m.trim().parse().map_err(|_| bad())?;
        if hour > 23 || minute > 59 {
            return Err(bad());
        }
        Ok((hour, minute))
    }

    pub fn validate(&self) -> Result<()> {
        if self.frequency == Frequency::Manual {
            return Ok(());
        }
        self.hour_minute()?;
        match self.frequency {
            Frequency::Weekly => match self.day_of_week {
                Some(d) if d <= 6 => Ok(()),
                _ => Err(Error::validation("weekly schedule needs dayOfWeek 0-6")),
            },
            Frequency::Monthly => match self.day_of_month {
                Some(d) if (1..=31).contains(&d) => Ok(()),
                _ => Err(Error::validation("monthly schedule needs dayOfMonth 1-31")),
            },
            _ => Ok(()),
        }
    }
}

/// Glob patterns applied to paths relative to the job's source.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Filters {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupJob {
    pub id: JobId,
    pub name: String,
    pub source_path: PathBuf,
    pub target_share: ShareKey,
    /// Directory inside the share, relative to its root
    pub target_path: String,
    pub filters: Filters,
    pub keep_revision: bool,
    pub schedule: Option<Schedule>,
    pub status: JobStatus,
    pub stats: JobStats,
    pub last_error: Option<String>,
    pub created_at: i64,
}

/// Everything a caller provides to create a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub name: String,
    pub source_path: PathBuf,
    pub target_share: ShareKey,
    #[serde(default)]
    pub target_path: String,
    #[serde(default)]
    pub filters: Filters,
    #[serde(default)]
    pub keep_revision: bool,
    #[serde(default)]
    pub schedule: Option<Schedule>,
}

/// Partial update. `id` may be repeated but never changed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPatch {
    pub id: Option<JobId>,
    pub name: Option<String>,
    pub source_path: Option<PathBuf>,
    pub target_share: Option<ShareKey>,
    pub target_path: Option<String>,
    pub filters: Option<Filters>,
    pub keep_revision: Option<bool>,
    pub schedule: Option<Schedule>,
}

fn validate_definition(
    name: &str,
    source_path: &std::path::Path,
    target_share: &ShareKey,
    target_path: &str,
    schedule: Option<&Schedule>,
) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::validation("job name is empty"));
    }
    if !source_path.is_absolute() {
        return Err(Error::validation(format!(
            "source path must be absolute: {}",
            source_path.display()
        )));
    }
    target_share.validate()?;
    if std::path::Path::new(target_path)
        .components()
        .any(|c| !matches!(c, std::path::Component::Normal(_)))
    {
        return Err(Error::validation(format!(
            "target path must be relative to the share: {}",
            target_path
        )));
    }
    if let Some(schedule) = schedule {
        schedule.validate()?;
    }
    Ok(())
}

impl JobSpec {
    pub fn validate(&self) -> Result<()> {
        validate_definition(
            &self.name,
            &self.source_path,
            &self.target_share,
            &self.target_path,
            self.schedule.as_ref(),
        )
    }
}

impl BackupJob {
    pub fn validate(&self) -> Result<()> {
        validate_definition(
            &self.name,
            &self.source_path,
            &self.target_share,
            &self.target_path,
            self.schedule.as_ref(),
        )
    }

    /// Apply a patch, rejecting any attempt to change the id.
    pub fn apply(&mut self, patch: JobPatch) -> Result<()> {
        if let Some(id) = &patch.id {
            if id != &self.id {
                return Err(Error::validation("job id cannot be changed"));
            }
        }
        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(source_path) = patch.source_path {
            self.source_path = source_path;
        }
        if let Some(target_share) = patch.target_share {
            self.target_share = target_share;
        }
        if let Some(target_path) = patch.target_path {
            self.target_path = target_path;
        }
        if let Some(filters) = patch.filters {
            self.filters = filters;
        }
        if let Some(keep_revision) = patch.keep_revision {
            self.keep_revision = keep_revision;
        }
        if let Some(schedule) = patch.schedule {
            self.schedule = Some(schedule);
        }
        self.validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupProgress {
    pub job_id: JobId,
    pub status: JobStatus,
    pub transferred_bytes: u64,
    pub transferred_files: u64,
    pub total_bytes: u64,
    pub total_files: u64,
    pub speed_bytes_per_sec: f64,
    pub elapsed_seconds: f64,
    /// Absent while the speed is zero
    pub estimated_remaining_seconds: Option<f64>,
    pub current_file: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum BackupEvent {
    Progress(BackupProgress),
    JobChanged(BackupJob),
    JobDeleted { id: JobId },
}

impl BackupEvent {
    pub fn job_id(&self) -> &str {
        match self {
            BackupEvent::Progress(p) => &p.job_id,
            BackupEvent::JobChanged(job) => &job.id,
            BackupEvent::JobDeleted { id } => id,
        }
    }
}

/// Persistence for job definitions.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn save_job(&self, job: &BackupJob) -> Result<()>;
    async fn delete_job(&self, id: &str) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    pub struct MemoryJobStore {
        pub jobs: Mutex<HashMap<JobId, BackupJob>>,
    }

    #[async_trait]
    impl JobStore for MemoryJobStore {
        async fn save_job(&self, job: &BackupJob) -> Result<()> {
            self.jobs.lock().insert(job.id.clone(), job.clone());
            Ok(())
        }

        async fn delete_job(&self, id: &str) -> Result<()> {
            self.jobs.lock().remove(id);
            Ok(())
        }
    }

    pub fn spec(source: &std::path::Path) -> JobSpec {
        JobSpec {
            name: "documents".to_string(),
            source_path: source.to_path_buf(),
            target_share: ShareKey::new("nas", "backup"),
            target_path: "laptop".to_string(),
            filters: Filters::default(),
            keep_revision: false,
            schedule: None,
        }
    }
}
