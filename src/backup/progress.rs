use super::{BackupProgress, JobId, JobStatus};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Sliding-window transfer rate.
///
/// Samples are cumulative byte counts. The rate is the growth over the last
/// `window`, divided by the window length, or by the elapsed time while the
/// run is younger than one window.
#[derive(Debug)]
pub struct SpeedWindow {
    window: Duration,
    started: Instant,
    samples: VecDeque<(Instant, u64)>,
}

impl SpeedWindow {
    pub fn new(window: Duration, started: Instant) -> Self {
        let mut samples = VecDeque::new();
        samples.push_back((started, 0));
        Self {
            window,
            started,
            samples,
        }
    }

    pub fn record(&mut self, now: Instant, total: u64) {
        self.samples.push_back((now, total));
        // Keep one sample at or before the window start as the baseline.
        while self.samples.len() > 2 {
            match self.samples.get(1) {
                Some((t, _)) if now.saturating_duration_since(*t) >= self.window => {
                    self.samples.pop_front();
                }
                _ => break,
            }
        }
    }

    pub fn bytes_per_sec(&self, now: Instant) -> f64 {
        let Some(&(_, latest)) = self.samples.back() else {
            return 0.0;
        };
        let cutoff = now.checked_sub(self.window);
        let baseline = self
            .samples
            .iter()
            .rev()
            .find(|(t, _)| cutoff.map_or(*t <= self.started, |c| *t <= c))
            .or_else(|| self.samples.front())
            .map(|(_, bytes)| *bytes)
            .unwrap_or(0);

        let span = now.saturating_duration_since(self.started).min(self.window);
        if span.is_zero() {
            return 0.0;
        }
        latest.saturating_sub(baseline) as f64 / span.as_secs_f64()
    }
}

/// Running counters for one job run.
///
/// Counters only move forward and never pass the totals found by the scan.
#[derive(Debug)]
pub struct ProgressTracker {
    job_id: JobId,
    total_bytes: u64,
    total_files: u64,
    transferred_bytes: u64,
    transferred_files: u64,
    current_file: Option<String>,
    started: Instant,
    speed: SpeedWindow,
    interval: Duration,
    last_emit: Option<Instant>,
}

impl ProgressTracker {
    pub fn new(job_id: JobId, interval: Duration, window: Duration) -> Self {
        let started = Instant::now();
        Self {
            job_id,
            total_bytes: 0,
            total_files: 0,
            transferred_bytes: 0,
            transferred_files: 0,
            current_file: None,
            started,
            speed: SpeedWindow::new(window, started),
            interval,
            last_emit: None,
        }
    }

    pub fn set_totals(&mut self, bytes: u64, files: u64) {
        self.total_bytes = bytes;
        self.total_files = files;
    }

    pub fn start_file(&mut self, name: String) {
        self.current_file = Some(name);
    }

    pub fn add_bytes(&mut self, n: u64) {
        self.transferred_bytes = self.transferred_bytes.saturating_add(n).min(self.total_bytes);
        self.speed.record(Instant::now(), self.transferred_bytes);
    }

    /// Close the current file and top its bytes up to `expected` if the
    /// mirror reported fewer.
    pub fn finish_file(&mut self, reported: u64, expected: u64) {
        if reported < expected {
            self.add_bytes(expected - reported);
        }
        self.transferred_files = (self.transferred_files + 1).min(self.total_files);
    }

    pub fn transferred(&self) -> (u64, u64) {
        (self.transferred_bytes, self.transferred_files)
    }

    /// True once `interval` has passed since the last emitted snapshot.
    pub fn due(&self) -> bool {
        self.last_emit
            .map_or(true, |t| Instant::now().saturating_duration_since(t) >= self.interval)
    }

    pub fn snapshot(&mut self, status: JobStatus, error: Option<String>) -> BackupProgress {
        let now = Instant::now();
        self.last_emit = Some(now);

        let speed = self.speed.bytes_per_sec(now);
        let remaining = self.total_bytes.saturating_sub(self.transferred_bytes);
        let estimated_remaining_seconds = (speed > 0.0).then(|| remaining as f64 / speed);

        BackupProgress {
            job_id: self.job_id.clone(),
            status,
            transferred_bytes: self.transferred_bytes,
            transferred_files: self.transferred_files,
            total_bytes: self.total_bytes,
            total_files: self.total_files,
            speed_bytes_per_sec: speed,
            elapsed_seconds: now.saturating_duration_since(self.started).as_secs_f64(),
            estimated_remaining_seconds,
            current_file: self.current_file.clone(),
            error,
        }
    }
}
