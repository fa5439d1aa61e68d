use crate::backup::JobKind;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub job: JobKind,
    pub line: String,
}

/// Bounded in-memory tail of operator log lines, shared by all jobs
#[derive(Clone)]
pub struct LogBuffer {
    buffer: Arc<Mutex<VecDeque<LogEntry>>>,
    max_entries: usize,
}

impl LogBuffer {
    pub fn new(max_entries: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(VecDeque::with_capacity(max_entries))),
            max_entries: max_entries.max(1),
        }
    }

    pub fn add_log(&self, job: JobKind, line: String) {
        let mut buffer = self.buffer.lock();
        if buffer.len() >= self.max_entries {
            buffer.pop_front();
        }
        buffer.push_back(LogEntry { job, line });
    }

    /// Oldest first; `limit` keeps only the newest `n`
    pub fn get_logs(&self, limit: Option<usize>) -> Vec<LogEntry> {
        let buffer = self.buffer.lock();
        let skip = match limit {
            Some(n) => buffer.len().saturating_sub(n),
            None => 0,
        };
        buffer.iter().skip(skip).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_drops_oldest() {
        let logs = LogBuffer::new(2);
        logs.add_log(JobKind::Backup, "one".into());
        logs.add_log(JobKind::Backup, "two".into());
        logs.add_log(JobKind::Restore, "three".into());

        let lines: Vec<_> = logs.get_logs(None).into_iter().map(|e| e.line).collect();
        assert_eq!(lines, vec!["two", "three"]);
    }

    #[test]
    fn test_limit_keeps_newest_in_order() {
        let logs = LogBuffer::new(10);
        for i in 0..5 {
            logs.add_log(JobKind::Backup, i.to_string());
        }
        let lines: Vec<_> = logs.get_logs(Some(2)).into_iter().map(|e| e.line).collect();
        assert_eq!(lines, vec!["3", "4"]);

        let all: Vec<_> = logs.get_logs(None).into_iter().map(|e| e.line).collect();
        assert_eq!(all, vec!["0", "1", "2", "3", "4"]);
    }
}
