//! Bodies of the two job types. Each runs on its job's worker thread and
//! returns how it ended; the job runner turns that into the terminal result.

use super::exclusion::ExclusionPolicy;
use super::job::{JobContext, Outcome};
use super::reader::ArchiveReader;
use super::scanner::FileScanner;
use super::writer::ArchiveWriter;
use anyhow::Result;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::info;

/// One backup run: `source_root` into a new archive at `destination`
#[derive(Debug, Clone)]
pub struct BackupJob {
    pub source_root: PathBuf,
    pub destination: PathBuf,
    pub exclusions: ExclusionPolicy,
}

impl BackupJob {
    pub fn run(self, ctx: &JobContext) -> Result<Outcome<String>> {
        let reporter = &ctx.reporter;
        let started = Instant::now();

        reporter.log(format!(
            "Starting backup of '{}' -> {}",
            self.source_root.display(),
            self.destination.display()
        ));
        reporter.progress(0);

        reporter.log("Preparing file list (this may take a while)...");
        let records = match FileScanner::new(self.exclusions).scan(&self.source_root, ctx)? {
            Outcome::Completed(records) => records,
            Outcome::Cancelled(partial) => {
                info!("Backup cancelled during scan ({} files seen)", partial.len());
                return Ok(Outcome::Cancelled(String::new()));
            }
        };
        reporter.log(format!("Files to archive: {}", records.len()));

        let stats = match ArchiveWriter::new(&self.destination).write(&records, ctx)? {
            Outcome::Completed(stats) => stats,
            Outcome::Cancelled(stats) => {
                reporter.log(format!(
                    "Stopped after {} of {} files, partial archive removed",
                    stats.processed, stats.total
                ));
                return Ok(Outcome::Cancelled(String::new()));
            }
        };

        reporter.log(format!(
            "Backup finished in {}. Files added: {}, skipped: {}",
            humantime::format_duration(whole_seconds(started)),
            stats.added,
            stats.skipped
        ));
        Ok(Outcome::Completed(format!(
            "Backup created: {}",
            self.destination.display()
        )))
    }
}

/// One test restore: `archive` into the fresh directory `destination`
#[derive(Debug, Clone)]
pub struct RestoreJob {
    pub archive: PathBuf,
    pub destination: PathBuf,
}

impl RestoreJob {
    pub fn run(self, ctx: &JobContext) -> Result<Outcome<String>> {
        let reporter = &ctx.reporter;
        let started = Instant::now();

        reporter.log(format!(
            "Starting test restore {} -> {}",
            self.archive.display(),
            self.destination.display()
        ));
        reporter.progress(0);

        let stats = match ArchiveReader::new(&self.archive).extract(&self.destination, ctx)? {
            Outcome::Completed(stats) => stats,
            Outcome::Cancelled(stats) => {
                reporter.log(format!(
                    "Stopped after {} of {} members, partial restore left in {}",
                    stats.processed,
                    stats.total,
                    self.destination.display()
                ));
                return Ok(Outcome::Cancelled(String::new()));
            }
        };

        reporter.log(format!(
            "Test restore finished in {}. Members extracted: {}, skipped: {}",
            humantime::format_duration(whole_seconds(started)),
            stats.added,
            stats.skipped
        ));
        Ok(Outcome::Completed(format!(
            "Test restore finished. Directory: {}",
            self.destination.display()
        )))
    }
}

fn whole_seconds(started: Instant) -> Duration {
    Duration::from_secs(started.elapsed().as_secs())
}
