use super::{BackupJob, BackupManager, Frequency, JobId, Schedule};
use crate::error::ErrorKind;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, Local, NaiveDate, TimeZone};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// First instant strictly after `after` at which `schedule` fires.
/// Manual schedules never fire.
pub fn next_run<Tz: TimeZone>(schedule: &Schedule, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
    if schedule.frequency == Frequency::Manual {
        return None;
    }
    let (hour, minute) = schedule.hour_minute().ok()?;
    let tz = after.timezone();
    let today = after.date_naive();

    let at = |date: NaiveDate| -> Option<DateTime<Tz>> {
        let naive = date.and_hms_opt(hour, minute, 0)?;
        // Skipped by a DST jump: no such wall-clock time that day.
        tz.from_local_datetime(&naive).earliest()
    };

    match schedule.frequency {
        Frequency::Manual => None,
        Frequency::Daily => (0..=2)
            .filter_map(|d| at(today + ChronoDuration::days(d)))
            .find(|t| t > after),
        Frequency::Weekly => {
            let weekday = u32::from(schedule.day_of_week?);
            (0..=14)
                .map(|d| today + ChronoDuration::days(d))
                .filter(|date| date.weekday().num_days_from_sunday() == weekday)
                .filter_map(at)
                .find(|t| t > after)
        }
        Frequency::Monthly => {
            let day = u32::from(schedule.day_of_month?);
            let (mut year, mut month) = (today.year(), today.month());
            for _ in 0..=13 {
                let date = NaiveDate::from_ymd_opt(year, month, day.min(days_in_month(year, month)?))?;
                if let Some(t) = at(date).filter(|t| t > after) {
                    return Some(t);
                }
                if month == 12 {
                    year += 1;
                    month = 1;
                } else {
                    month += 1;
                }
            }
            None
        }
    }
}

fn days_in_month(year: i32, month: u32) -> Option<u32> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    u32::try_from((next - first).num_days()).ok()
}

/// Jobs with a firing instant in `(since, now]`, minus the ones already
/// running.
pub fn due_jobs<Tz: TimeZone>(jobs: &[BackupJob], since: &DateTime<Tz>, now: &DateTime<Tz>) -> Vec<JobId> {
    jobs.iter()
        .filter(|job| !job.status.is_active())
        .filter(|job| {
            job.schedule
                .as_ref()
                .and_then(|s| next_run(s, since))
                .map_or(false, |t| &t <= now)
        })
        .map(|job| job.id.clone())
        .collect()
}

/// Fires scheduled jobs in local time.
pub struct Scheduler {
    manager: BackupManager,
    tick: Duration,
}

impl Scheduler {
    pub fn new(manager: BackupManager, tick: Duration) -> Self {
        Self { manager, tick }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self) {
        info!("Scheduler started, checking every {:?}", self.tick);
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut since = Local::now();

        loop {
            interval.tick().await;
            let now = Local::now();
            let jobs = self.manager.list_jobs();

            for job in jobs.iter().filter(|j| j.status.is_active()) {
                if job.schedule.as_ref().and_then(|s| next_run(s, &since)).map_or(false, |t| t <= now) {
                    info!(job = %job.id, "Skipping scheduled run, job is already running");
                }
            }

            for id in due_jobs(&jobs, &since, &now) {
                // Pinned credentials of the target share are used.
                match self.manager.run(&id, None).await {
                    Ok(job) => info!(job = %id, "Scheduled run of {} started", job.name),
                    Err(e) if e.kind() == ErrorKind::ConflictAlreadyRunning => {
                        debug!(job = %id, "Scheduled run skipped: {}", e)
                    }
                    Err(e) => warn!(job = %id, "Scheduled run failed to start: {}", e),
                }
            }
            since = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{testing, JobStatus};
    use chrono::Utc;
    use std::path::Path;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn schedule(frequency: Frequency, time: &str, dow: Option<u8>, dom: Option<u8>) -> Schedule {
        Schedule {
            frequency,
            time: time.to_string(),
            day_of_week: dow,
            day_of_month: dom,
        }
    }

    #[test]
    fn manual_never_fires() {
        let s = schedule(Frequency::Manual, "10:00", None, None);
        assert!(next_run(&s, &at("2024-03-01T09:00:00Z")).is_none());
    }

    #[test]
    fn daily_fires_today_or_tomorrow() {
        let s = schedule(Frequency::Daily, "10:00", None, None);
        assert_eq!(next_run(&s, &at("2024-03-01T09:00:00Z")), Some(at("2024-03-01T10:00:00Z")));
        assert_eq!(next_run(&s, &at("2024-03-01T10:00:00Z")), Some(at("2024-03-02T10:00:00Z")));
    }

    #[test]
    fn weekly_picks_the_weekday() {
        // 2024-03-01 is a Friday; 1 = Monday.
        let s = schedule(Frequency::Weekly, "08:30", Some(1), None);
        assert_eq!(next_run(&s, &at("2024-03-01T12:00:00Z")), Some(at("2024-03-04T08:30:00Z")));

        let friday = schedule(Frequency::Weekly, "08:30", Some(5), None);
        assert_eq!(next_run(&friday, &at("2024-03-01T12:00:00Z")), Some(at("2024-03-08T08:30:00Z")));
    }

    #[test]
    fn monthly_clamps_to_month_end() {
        let s = schedule(Frequency::Monthly, "23:00", None, Some(31));
        assert_eq!(next_run(&s, &at("2024-02-10T00:00:00Z")), Some(at("2024-02-29T23:00:00Z")));
        assert_eq!(next_run(&s, &at("2024-03-31T23:30:00Z")), Some(at("2024-04-30T23:00:00Z")));
        assert_eq!(next_run(&s, &at("2024-12-31T23:30:00Z")), Some(at("2025-01-31T23:00:00Z")));
    }

    #[test]
    fn due_jobs_skip_running_ones() {
        let mut job = crate::backup::BackupJob {
            id: "a".into(),
            name: "a".into(),
            source_path: Path::new("/src").to_path_buf(),
            target_share: testing::spec(Path::new("/src")).target_share,
            target_path: String::new(),
            filters: Default::default(),
            keep_revision: false,
            schedule: Some(schedule(Frequency::Daily, "10:00", None, None)),
            status: JobStatus::Stopped,
            stats: Default::default(),
            last_error: None,
            created_at: 0,
        };
        let since = at("2024-03-01T09:59:30Z");
        let now = at("2024-03-01T10:00:00Z");
        assert_eq!(due_jobs(&[job.clone()], &since, &now), vec!["a".to_string()]);

        let later = at("2024-03-01T10:00:30Z");
        assert!(due_jobs(&[job.clone()], &now, &later).is_empty());

        job.status = JobStatus::InProgress;
        assert!(due_jobs(&[job], &since, &now).is_empty());
    }
}
