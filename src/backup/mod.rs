pub mod engine;
pub mod error;
pub mod exclusion;
pub mod job;
pub mod manager;
pub mod progress;
pub mod reader;
pub mod scanner;
pub mod worker;
pub mod writer;

pub use engine::Engine;
pub use error::EngineError;
pub use exclusion::ExclusionPolicy;
pub use job::{CancelFlag, JobEvent, JobHandle, JobResult, JobState, Outcome};
pub use manager::BackupManager;
pub use reader::ArchiveReader;
pub use scanner::FileScanner;
pub use writer::ArchiveWriter;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Backup,
    Restore,
}

impl JobKind {
    pub fn label(self) -> &'static str {
        match self {
            JobKind::Backup => "Backup",
            JobKind::Restore => "Restore",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Backup => f.write_str("backup"),
            JobKind::Restore => f.write_str("restore"),
        }
    }
}

/// An enumerated file: where it lives, and the name it gets in the archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub path: PathBuf,
    pub archive_name: PathBuf,
}

impl FileRecord {
    /// `archive_name` is `path` relative to `root`, reduced to normal
    /// components so it never starts with a separator
    pub fn new(root: &Path, path: PathBuf) -> Self {
        let relative = path.strip_prefix(root).unwrap_or(&path);
        let archive_name = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part),
                _ => None,
            })
            .collect();
        Self { path, archive_name }
    }
}

/// Why one file or member was left out. The job always continues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    PermissionDenied,
    Vanished,
    UnsafePath,
    Other(String),
}

impl SkipReason {
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => SkipReason::PermissionDenied,
            io::ErrorKind::NotFound => SkipReason::Vanished,
            _ => SkipReason::Other(err.to_string()),
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::PermissionDenied => f.write_str("permission denied"),
            SkipReason::Vanished => f.write_str("file vanished"),
            SkipReason::UnsafePath => f.write_str("path escapes destination"),
            SkipReason::Other(msg) => f.write_str(msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Added,
    Skipped(SkipReason),
}

/// Per-item tallies of one archive pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArchiveStats {
    pub total: usize,
    pub processed: usize,
    pub added: usize,
    pub skipped: usize,
}

impl ArchiveStats {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    pub fn record(&mut self, outcome: &ItemOutcome) {
        self.processed += 1;
        match outcome {
            ItemOutcome::Added => self.added += 1,
            ItemOutcome::Skipped(_) => self.skipped += 1,
        }
    }
}
