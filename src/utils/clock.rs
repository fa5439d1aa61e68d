use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};

/// Timestamp format embedded in archive file names
pub const ARCHIVE_STAMP: &str = "%Y%m%d_%H%M%S";

/// Timestamp format embedded in restore directory names
pub const RESTORE_STAMP: &str = "%Y-%m-%d_%H-%M-%S";

/// Timestamp format used as the prefix of operator log lines
pub const LOG_STAMP: &str = "%Y-%m-%d %H:%M:%S";

pub const ARCHIVE_EXTENSION: &str = "tar.gz";

/// Source of the current time. Jobs take one so naming and log stamps
/// can be pinned in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Clock frozen at a single instant
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Local>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Local> {
        self.0
    }
}

/// `<dir>/<prefix>_<YYYYMMDD_HHMMSS>.tar.gz`
pub fn archive_path(dir: &Path, prefix: &str, at: DateTime<Local>) -> PathBuf {
    dir.join(format!(
        "{}_{}.{}",
        prefix,
        at.format(ARCHIVE_STAMP),
        ARCHIVE_EXTENSION
    ))
}

/// `<base>/<prefix>_<YYYY-MM-DD_HH-MM-SS>`
pub fn restore_dir(base: &Path, prefix: &str, at: DateTime<Local>) -> PathBuf {
    base.join(format!("{}_{}", prefix, at.format(RESTORE_STAMP)))
}

pub fn log_stamp(at: DateTime<Local>) -> String {
    at.format(LOG_STAMP).to_string()
}
