use super::manager::JobTable;
use super::mirror::MirrorPrimitive;
use super::progress::ProgressTracker;
use super::scanner::{scan_source, FileFilter};
use super::{BackupEvent, BackupJob, BackupProgress, JobStatus};
use crate::error::{Error, Result};
use crate::shares::{Credentials, ShareRegistry};
use crate::utils::config::BackupConfig;
use crate::utils::log_buffer::LogBuffer;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Semaphore};
use tracing::{debug, error, info, warn};

/// What the manager wants a running worker to do next. Observed between
/// files only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunControl {
    Run,
    Pause,
    Stop,
}

#[derive(Debug)]
pub struct RunReport {
    pub status: JobStatus,
    pub error: Option<String>,
    pub progress: Option<BackupProgress>,
}

/// Publishes snapshots to subscribers and mirrors the counters onto the
/// job record so listings show live stats.
struct Emitter {
    job_id: String,
    event_tx: broadcast::Sender<BackupEvent>,
    jobs: JobTable,
}

impl Emitter {
    fn emit(&self, tracker: &mut ProgressTracker, status: JobStatus, error: Option<String>) -> BackupProgress {
        let progress = tracker.snapshot(status, error);
        if let Some(job) = self.jobs.write().get_mut(&self.job_id) {
            job.stats.total_size = progress.total_bytes;
            job.stats.total_files = progress.total_files;
            job.stats.transferred_size = progress.transferred_bytes;
            job.stats.transferred_files = progress.transferred_files;
        }
        let _ = self.event_tx.send(BackupEvent::Progress(progress.clone()));
        progress
    }
}

pub struct BackupWorker {
    job: BackupJob,
    credentials: Option<Credentials>,
    shares: ShareRegistry,
    mirror: Arc<dyn MirrorPrimitive>,
    permits: Arc<Semaphore>,
    control: watch::Receiver<RunControl>,
    config: Arc<BackupConfig>,
    log_buffer: LogBuffer,
    emitter: Emitter,
}

impl BackupWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        job: BackupJob,
        credentials: Option<Credentials>,
        shares: ShareRegistry,
        mirror: Arc<dyn MirrorPrimitive>,
        permits: Arc<Semaphore>,
        control: watch::Receiver<RunControl>,
        config: Arc<BackupConfig>,
        log_buffer: LogBuffer,
        event_tx: broadcast::Sender<BackupEvent>,
        jobs: JobTable,
    ) -> Self {
        let emitter = Emitter {
            job_id: job.id.clone(),
            event_tx,
            jobs,
        };
        Self {
            job,
            credentials,
            shares,
            mirror,
            permits,
            control,
            config,
            log_buffer,
            emitter,
        }
    }

    pub async fn run(self) -> RunReport {
        let tracker = Mutex::new(ProgressTracker::new(
            self.job.id.clone(),
            self.config.progress_interval,
            self.config.speed_window,
        ));
        let mut control = self.control.clone();

        let result = self.execute(&tracker, &mut control).await;
        let stop_requested = *control.borrow() == RunControl::Stop;

        let (status, error) = match result {
            Ok(()) if stop_requested => (JobStatus::Stopped, None),
            Ok(()) => (JobStatus::Complete, None),
            Err(e) => {
                error!(job = %self.job.id, "Backup failed: {}", e);
                self.log_buffer
                    .add_log("error", format!("{} failed: {}", self.job.name, e), Some(self.job.id.clone()));
                // Once a stop is acknowledged nothing but stopped is final.
                let status = if stop_requested { JobStatus::Stopped } else { JobStatus::Error };
                (status, Some(e.to_string()))
            }
        };

        let progress = tracker.lock().snapshot(status, error.clone());
        RunReport {
            status,
            error,
            progress: Some(progress),
        }
    }

    async fn execute(
        &self,
        tracker: &Mutex<ProgressTracker>,
        control: &mut watch::Receiver<RunControl>,
    ) -> Result<()> {
        let job = &self.job;

        let _permit = tokio::select! {
            permit = self.permits.clone().acquire_owned() => permit
                .map_err(|_| Error::validation("backup engine is shutting down"))?,
            _ = stop_requested(control) => return Ok(()),
        };

        let share_root = self.shares.open(&job.target_share, self.credentials.clone()).await?;
        let dest_root = share_root.join(&job.target_path);
        info!(job = %job.id, "Mirroring {} to {}", job.source_path.display(), dest_root.display());
        self.log_buffer.add_log(
            "info",
            format!("Starting {} into {}", job.name, job.target_share),
            Some(job.id.clone()),
        );

        let filter = FileFilter::new(&job.filters, &self.config.default_excludes)?;
        let files = scan_source(job.source_path.clone(), filter).await?;

        let total_bytes: u64 = files.iter().map(|f| f.size).sum();
        {
            let mut t = tracker.lock();
            t.set_totals(total_bytes, files.len() as u64);
            self.emitter.emit(&mut t, JobStatus::InProgress, None);
        }
        self.log_buffer.add_log(
            "info",
            format!("{} files ({:.2} MB) to mirror", files.len(), total_bytes as f64 / 1_048_576.0),
            Some(job.id.clone()),
        );

        for file in &files {
            if !self.checkpoint(tracker, control).await {
                info!(job = %job.id, "Stopped before {}", file.relative.display());
                return Ok(());
            }

            let name = file.relative.to_string_lossy().into_owned();
            tracker.lock().start_file(name.clone());

            let reported = AtomicU64::new(0);
            let on_progress = |n: u64| {
                reported.fetch_add(n, Ordering::Relaxed);
                let mut t = tracker.lock();
                t.add_bytes(n);
                if t.due() {
                    self.emitter.emit(&mut t, JobStatus::InProgress, None);
                }
            };

            let dest = dest_root.join(&file.relative);
            let outcome = self
                .mirror
                .mirror_file(&file.path, &dest, job.keep_revision, &on_progress)
                .await?;
            debug!(job = %job.id, "{}: {:?}", name, outcome);

            let mut t = tracker.lock();
            t.finish_file(reported.load(Ordering::Relaxed), file.size);
            self.emitter.emit(&mut t, JobStatus::InProgress, None);
        }

        let (bytes, count) = tracker.lock().transferred();
        info!(job = %job.id, "Mirrored {} files, {} bytes", count, bytes);
        Ok(())
    }

    /// Wait out a pause. Returns false when the run should end.
    async fn checkpoint(&self, tracker: &Mutex<ProgressTracker>, control: &mut watch::Receiver<RunControl>) -> bool {
        let mut announced = false;
        loop {
            let state = *control.borrow_and_update();
            match state {
                RunControl::Run => return true,
                RunControl::Stop => return false,
                RunControl::Pause => {
                    if !announced {
                        info!(job = %self.job.id, "Paused");
                        self.emitter.emit(&mut tracker.lock(), JobStatus::Paused, None);
                        announced = true;
                    }
                    if control.changed().await.is_err() {
                        warn!(job = %self.job.id, "Control channel closed while paused");
                        return false;
                    }
                }
            }
        }
    }
}

async fn stop_requested(control: &mut watch::Receiver<RunControl>) {
    loop {
        let stop = *control.borrow_and_update() == RunControl::Stop;
        if stop || control.changed().await.is_err() {
            return;
        }
    }
}
