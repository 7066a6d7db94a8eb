use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: i64,
    pub level: String,
    pub message: String,
    pub job_id: Option<String>,
}

/// Bounded ring of user-facing activity entries.
#[derive(Clone)]
pub struct LogBuffer {
    buffer: Arc<Mutex<VecDeque<LogEntry>>>,
    max_entries: usize,
}

impl LogBuffer {
    pub fn new(max_entries: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(VecDeque::with_capacity(max_entries))),
            max_entries,
        }
    }

    pub fn add_log(&self, level: &str, message: String, job_id: Option<String>) {
        let entry = LogEntry {
            timestamp: Utc::now().timestamp(),
            level: level.to_string(),
            message,
            job_id,
        };

        let mut buffer = self.buffer.lock();
        if buffer.len() >= self.max_entries {
            buffer.pop_front();
        }
        buffer.push_back(entry);
    }

    /// Most recent entries, oldest first
    pub fn get_logs(&self, limit: Option<usize>) -> Vec<LogEntry> {
        let buffer = self.buffer.lock();
        let skip = match limit {
            Some(n) => buffer.len().saturating_sub(n),
            None => 0,
        };
        buffer.iter().skip(skip).cloned().collect()
    }

    pub fn for_job(&self, job_id: &str) -> Vec<LogEntry> {
        self.buffer
            .lock()
            .iter()
            .filter(|e| e.job_id.as_deref() == Some(job_id))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_oldest_when_full() {
        let logs = LogBuffer::new(2);
        logs.add_log("info", "one".into(), None);
        logs.add_log("info", "two".into(), Some("j1".into()));
        logs.add_log("error", "three".into(), Some("j1".into()));

        let all = logs.get_logs(None);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].message, "two");
        assert_eq!(logs.get_logs(Some(1))[0].message, "three");
        assert_eq!(logs.for_job("j1").len(), 2);
    }
}
