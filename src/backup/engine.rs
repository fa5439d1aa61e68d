use super::error::Result;
use super::exclusion::ExclusionPolicy;
use super::job::{Job, JobHandle};
use super::reader::{ArchiveReader, MemberInfo};
use super::worker::{BackupJob, RestoreJob};
use super::JobKind;
use crate::utils::clock::{self, Clock, SystemClock, ARCHIVE_EXTENSION};
use crate::utils::Config;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

const RESTORE_PREFIX: &str = "restore";

/// What a backup covers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackupSource {
    /// The user's home directory
    Home,
    /// The whole filesystem from `/`
    System,
    Path(PathBuf),
}

impl BackupSource {
    pub fn root(&self, home: &Path) -> PathBuf {
        match self {
            BackupSource::Home => home.to_path_buf(),
            BackupSource::System => PathBuf::from("/"),
            BackupSource::Path(path) => path.clone(),
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            BackupSource::Home => "home_backup",
            BackupSource::System => "rsr_full",
            BackupSource::Path(_) => "backup",
        }
    }
}

/// An archive found in the backup directory
#[derive(Debug, Clone, Serialize)]
pub struct BackupEntry {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified: Option<DateTime<Local>>,
}

/// Starts backup and restore jobs. Holds no per-job state, so one engine
/// can serve any number of jobs; single-flight is the caller's business.
#[derive(Clone)]
pub struct Engine {
    backup_dir: PathBuf,
    restore_base_dir: PathBuf,
    home_dir: PathBuf,
    event_capacity: usize,
    exclusions: ExclusionPolicy,
    clock: Arc<dyn Clock>,
}

impl Engine {
    pub fn new(config: &Config) -> Self {
        Self {
            backup_dir: config.backup_dir.clone(),
            restore_base_dir: config.restore_base_dir.clone(),
            home_dir: config.home_dir.clone(),
            event_capacity: config.event_capacity,
            exclusions: ExclusionPolicy::system(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Back up `source` into a new timestamped archive under the backup dir
    pub fn start_backup(&self, source: &BackupSource) -> io::Result<JobHandle> {
        let destination = clock::archive_path(&self.backup_dir, source.prefix(), self.clock.now());
        let job = BackupJob {
            source_root: source.root(&self.home_dir),
            destination: destination.clone(),
            // Never archive our own output
            exclusions: self
                .exclusions
                .extended([self.backup_dir.clone(), self.restore_base_dir.clone()]),
        };

        info!("Starting backup of {} into {}", job.source_root.display(), destination.display());
        Job::new(JobKind::Backup, destination, self.clock.clone(), self.event_capacity, move |ctx| {
            job.run(ctx)
        })
        .start()
    }

    /// Restore `archive` into a new timestamped directory under
    /// `destination_root`, or under the configured restore dir
    pub fn start_restore(&self, archive: &Path, destination_root: Option<&Path>) -> io::Result<JobHandle> {
        let base = destination_root.unwrap_or(&self.restore_base_dir);
        let destination = clock::restore_dir(base, RESTORE_PREFIX, self.clock.now());
        let job = RestoreJob {
            archive: archive.to_path_buf(),
            destination: destination.clone(),
        };

        info!("Starting test restore of {} into {}", archive.display(), destination.display());
        Job::new(JobKind::Restore, destination, self.clock.clone(), self.event_capacity, move |ctx| {
            job.run(ctx)
        })
        .start()
    }

    pub fn cancel(&self, handle: &JobHandle) {
        info!("Cancelling {} job {}", handle.kind(), handle.id());
        handle.cancel();
    }

    /// Archives in the backup dir, newest first. A missing dir has none.
    pub fn list_backups(&self) -> io::Result<Vec<BackupEntry>> {
        let entries = match fs::read_dir(&self.backup_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let suffix = format!(".{}", ARCHIVE_EXTENSION);
        let mut backups = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(&suffix) {
                continue;
            }
            let metadata = match entry.metadata() {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            backups.push(BackupEntry {
                name,
                path: entry.path(),
                size: metadata.len(),
                modified: metadata.modified().ok().map(DateTime::<Local>::from),
            });
        }

        backups.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.name.cmp(&a.name)));
        Ok(backups)
    }

    pub fn list_members(&self, archive: &Path) -> Result<Vec<MemberInfo>> {
        ArchiveReader::new(archive).list_members()
    }
}
