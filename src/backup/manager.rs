use super::mirror::MirrorPrimitive;
use super::worker::{BackupWorker, RunControl, RunReport};
use super::{BackupEvent, BackupJob, JobId, JobPatch, JobSpec, JobStats, JobStatus, JobStore};
use crate::error::{Error, Result};
use crate::shares::{Credentials, ShareRegistry};
use crate::utils::config::BackupConfig;
use crate::utils::log_buffer::{LogBuffer, LogEntry};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Semaphore};
use tracing::{debug, error, info, warn};

pub(crate) type JobTable = Arc<RwLock<BTreeMap<JobId, BackupJob>>>;

struct RunHandle {
    control: watch::Sender<RunControl>,
    done: watch::Receiver<bool>,
}

/// Clears the running entry and wakes stoppers when a run task ends,
/// however it ends.
struct RunGuard {
    running: Arc<Mutex<HashMap<JobId, RunHandle>>>,
    id: JobId,
    done: watch::Sender<bool>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.running.lock().remove(&self.id);
        let _ = self.done.send(true);
    }
}

/// Owns every backup job and the workers that run them.
#[derive(Clone)]
pub struct BackupManager {
    config: Arc<BackupConfig>,
    jobs: JobTable,
    running: Arc<Mutex<HashMap<JobId, RunHandle>>>,
    permits: Arc<Semaphore>,
    shares: ShareRegistry,
    mirror: Arc<dyn MirrorPrimitive>,
    store: Arc<dyn JobStore>,
    event_tx: broadcast::Sender<BackupEvent>,
    log_buffer: LogBuffer,
}

impl BackupManager {
    pub fn new(
        config: BackupConfig,
        shares: ShareRegistry,
        mirror: Arc<dyn MirrorPrimitive>,
        store: Arc<dyn JobStore>,
        log_buffer: LogBuffer,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(1024);

        let max_jobs = if config.max_concurrent_jobs == 0 {
            std::cmp::max(1, num_cpus::get() / 2)
        } else {
            config.max_concurrent_jobs
        };
        debug!("Backup engine allows {} concurrent jobs", max_jobs);

        Self {
            config: Arc::new(config),
            jobs: Arc::new(RwLock::new(BTreeMap::new())),
            running: Arc::new(Mutex::new(HashMap::new())),
            permits: Arc::new(Semaphore::new(max_jobs)),
            shares,
            mirror,
            store,
            event_tx,
            log_buffer,
        }
    }

    /// Load persisted jobs. Runs do not survive a restart, so active jobs
    /// come back as stopped.
    pub fn restore(&self, jobs: Vec<BackupJob>) -> usize {
        let mut table = self.jobs.write();
        for mut job in jobs {
            if job.status.is_active() {
                job.status = JobStatus::Stopped;
            }
            table.insert(job.id.clone(), job);
        }
        info!("Restored {} backup jobs", table.len());
        table.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackupEvent> {
        self.event_tx.subscribe()
    }

    pub async fn create_job(&self, spec: JobSpec) -> Result<BackupJob> {
        spec.validate()?;

        let job = BackupJob {
            id: uuid::Uuid::new_v4().to_string(),
            name: spec.name,
            source_path: spec.source_path,
            target_share: spec.target_share,
            target_path: spec.target_path,
            filters: spec.filters,
            keep_revision: spec.keep_revision,
            schedule: spec.schedule,
            status: JobStatus::Stopped,
            stats: JobStats::default(),
            last_error: None,
            created_at: chrono::Utc::now().timestamp(),
        };

        self.jobs.write().insert(job.id.clone(), job.clone());
        self.store.save_job(&job).await?;

        info!(job = %job.id, "Created job {}", job.name);
        self.log_buffer
            .add_log("info", format!("Created job {}", job.name), Some(job.id.clone()));
        let _ = self.event_tx.send(BackupEvent::JobChanged(job.clone()));
        Ok(job)
    }

    /// Jobs in creation order.
    pub fn list_jobs(&self) -> Vec<BackupJob> {
        let mut jobs: Vec<BackupJob> = self.jobs.read().values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    pub fn get_job(&self, id: &str) -> Result<BackupJob> {
        self.jobs
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("job", id))
    }

    /// Allowed while running; the change applies from the next run.
    pub async fn update_job(&self, id: &str, patch: JobPatch) -> Result<BackupJob> {
        let job = {
            let mut jobs = self.jobs.write();
            let job = jobs.get_mut(id).ok_or_else(|| Error::not_found("job", id))?;
            let mut updated = job.clone();
            updated.apply(patch)?;
            *job = updated.clone();
            updated
        };

        self.store.save_job(&job).await?;
        info!(job = %job.id, "Updated job {}", job.name);
        let _ = self.event_tx.send(BackupEvent::JobChanged(job.clone()));
        Ok(job)
    }

    pub async fn delete_job(&self, id: &str) -> Result<()> {
        self.stop(id).await?;

        let removed = self.jobs.write().remove(id);
        let Some(job) = removed else {
            return Err(Error::not_found("job", id));
        };
        self.store.delete_job(id).await?;

        info!(job = %id, "Deleted job {}", job.name);
        self.log_buffer
            .add_log("info", format!("Deleted job {}", job.name), Some(id.to_string()));
        let _ = self.event_tx.send(BackupEvent::JobDeleted { id: id.to_string() });
        Ok(())
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.running.lock().contains_key(id)
    }

    /// Start a worker. Credentials default to the ones pinned for the
    /// target share.
    pub async fn run(&self, id: &str, credentials: Option<Credentials>) -> Result<BackupJob> {
        let (job, control_rx, done_tx) = {
            let mut running = self.running.lock();
            if running.contains_key(id) {
                return Err(Error::ConflictAlreadyRunning(id.to_string()));
            }

            let mut jobs = self.jobs.write();
            let job = jobs.get_mut(id).ok_or_else(|| Error::not_found("job", id))?;
            job.status = JobStatus::InProgress;
            job.last_error = None;
            job.stats.transferred_size = 0;
            job.stats.transferred_files = 0;

            let (control_tx, control_rx) = watch::channel(RunControl::Run);
            let (done_tx, done_rx) = watch::channel(false);
            running.insert(
                id.to_string(),
                RunHandle {
                    control: control_tx,
                    done: done_rx,
                },
            );
            (job.clone(), control_rx, done_tx)
        };

        let guard = RunGuard {
            running: self.running.clone(),
            id: job.id.clone(),
            done: done_tx,
        };

        if let Err(e) = self.store.save_job(&job).await {
            warn!(job = %job.id, "Could not persist job state: {}", e);
        }
        info!(job = %job.id, "Running job {}", job.name);
        let _ = self.event_tx.send(BackupEvent::JobChanged(job.clone()));

        let worker = BackupWorker::new(
            job.clone(),
            credentials,
            self.shares.clone(),
            self.mirror.clone(),
            self.permits.clone(),
            control_rx,
            self.config.clone(),
            self.log_buffer.clone(),
            self.event_tx.clone(),
            self.jobs.clone(),
        );

        let manager = self.clone();
        let job_id = job.id.clone();
        tokio::spawn(async move {
            let report = match tokio::spawn(worker.run()).await {
                Ok(report) => report,
                Err(e) => {
                    error!(job = %job_id, "Worker crashed: {}", e);
                    RunReport {
                        status: JobStatus::Error,
                        error: Some(format!("worker crashed: {}", e)),
                        progress: None,
                    }
                }
            };
            manager.finish(&job_id, report).await;
            drop(guard);
        });

        Ok(job)
    }

    async fn finish(&self, id: &str, report: RunReport) {
        let job = {
            let mut jobs = self.jobs.write();
            jobs.get_mut(id).map(|job| {
                job.status = report.status;
                job.last_error = report.error.clone();
                if let Some(p) = &report.progress {
                    job.stats.total_size = p.total_bytes;
                    job.stats.total_files = p.total_files;
                    job.stats.transferred_size = p.transferred_bytes;
                    job.stats.transferred_files = p.transferred_files;
                }
                if report.status == JobStatus::Complete {
                    job.stats.last_backup_time = Some(chrono::Utc::now().timestamp());
                }
                job.clone()
            })
        };

        if let Some(progress) = report.progress {
            let _ = self.event_tx.send(BackupEvent::Progress(progress));
        }

        let Some(job) = job else {
            return;
        };
        if let Err(e) = self.store.save_job(&job).await {
            warn!(job = %job.id, "Could not persist job state: {}", e);
        }

        let level = if job.status == JobStatus::Error { "error" } else { "info" };
        let message = match &job.last_error {
            Some(err) => format!("{} finished as {:?}: {}", job.name, job.status, err),
            None => format!("{} finished as {:?}", job.name, job.status),
        };
        info!(job = %job.id, "{}", message);
        self.log_buffer.add_log(level, message, Some(job.id.clone()));
        let _ = self.event_tx.send(BackupEvent::JobChanged(job));
    }

    /// Ask the worker to stop after its current file and wait until it has
    /// exited. A job that is not running is left alone.
    pub async fn stop(&self, id: &str) -> Result<()> {
        if !self.jobs.read().contains_key(id) {
            return Err(Error::not_found("job", id));
        }

        let done = {
            let running = self.running.lock();
            match running.get(id) {
                Some(handle) => {
                    handle.control.send_replace(RunControl::Stop);
                    handle.done.clone()
                }
                None => return Ok(()),
            }
        };

        info!(job = %id, "Stopping job");
        wait_done(done).await;
        Ok(())
    }

    pub async fn pause(&self, id: &str) -> Result<BackupJob> {
        self.steer(id, RunControl::Pause, JobStatus::Paused).await
    }

    pub async fn resume(&self, id: &str) -> Result<BackupJob> {
        self.steer(id, RunControl::Run, JobStatus::InProgress).await
    }

    async fn steer(&self, id: &str, to: RunControl, status: JobStatus) -> Result<BackupJob> {
        let job = {
            let running = self.running.lock();
            let handle = running
                .get(id)
                .ok_or_else(|| Error::validation(format!("job {} is not running", id)))?;
            if *handle.control.borrow() == RunControl::Stop {
                return self.get_job(id);
            }
            handle.control.send_replace(to);

            let mut jobs = self.jobs.write();
            let job = jobs.get_mut(id).ok_or_else(|| Error::not_found("job", id))?;
            job.status = status;
            job.clone()
        };

        info!(job = %id, "Job now {:?}", status);
        let _ = self.event_tx.send(BackupEvent::JobChanged(job.clone()));
        Ok(job)
    }

    /// Stop every worker, for shutdown.
    pub async fn stop_all(&self) {
        let ids: Vec<JobId> = self.running.lock().keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                warn!(job = %id, "Stop during shutdown failed: {}", e);
            }
        }
    }

    pub fn get_logs(&self, limit: Option<usize>) -> Vec<LogEntry> {
        self.log_buffer.get_logs(limit)
    }

    pub fn job_logs(&self, id: &str) -> Vec<LogEntry> {
        self.log_buffer.for_job(id)
    }
}

async fn wait_done(mut done: watch::Receiver<bool>) {
    loop {
        let finished = *done.borrow_and_update();
        if finished || done.changed().await.is_err() {
            return;
        }
    }
}
