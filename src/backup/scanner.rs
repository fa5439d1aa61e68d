use super::error::{EngineError, Result};
use super::exclusion::ExclusionPolicy;
use super::job::{JobContext, Outcome};
use super::{FileRecord, SkipReason};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Walks a source tree and lists the files a backup should contain
pub struct FileScanner {
    policy: ExclusionPolicy,
}

impl FileScanner {
    pub fn new(policy: ExclusionPolicy) -> Self {
        Self { policy }
    }

    /// Pre-order walk of `root`, entries sorted by name within each directory.
    ///
    /// Excluded directories contribute nothing and are not descended into.
    /// Symlinks are listed as entries, never followed. Unreadable
    /// subdirectories are reported as skips. Cancellation is checked at every
    /// directory and yields the records gathered so far.
    pub fn scan(&self, root: &Path, ctx: &JobContext) -> Result<Outcome<Vec<FileRecord>>> {
        let root = readable_root(root)?;
        let policy = self.policy.scoped_to(&root);

        info!("Scanning files in {}", root.display());
        let mut records = Vec::new();
        let mut walker = WalkDir::new(&root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();

        while let Some(entry) = walker.next() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
                    let reason = err
                        .io_error()
                        .map(SkipReason::from_io)
                        .unwrap_or_else(|| SkipReason::Other(err.to_string()));
                    ctx.reporter.skip(path.display(), &reason);
                    continue;
                }
            };

            if entry.file_type().is_dir() {
                if ctx.is_cancelled() {
                    debug!("Scan cancelled after {} files", records.len());
                    return Ok(Outcome::Cancelled(records));
                }
                if policy.is_excluded(entry.path()) {
                    debug!("Skipping excluded directory: {}", entry.path().display());
                    walker.skip_current_dir();
                }
                continue;
            }

            records.push(FileRecord::new(&root, entry.into_path()));
        }

        info!("Found {} files under {}", records.len(), root.display());
        Ok(Outcome::Completed(records))
    }
}

/// Absolute form of `root`, verified to be a directory we can list
fn readable_root(root: &Path) -> Result<PathBuf> {
    let unreadable = |source: io::Error| EngineError::SourceUnreadable {
        path: root.to_path_buf(),
        source,
    };

    let root = std::path::absolute(root).map_err(unreadable)?;
    let metadata = fs::metadata(&root).map_err(unreadable)?;
    if !metadata.is_dir() {
        return Err(unreadable(io::Error::new(
            io::ErrorKind::InvalidInput,
            "not a directory",
        )));
    }
    fs::read_dir(&root).map_err(unreadable)?;
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::SystemClock;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn ctx() -> JobContext {
        JobContext::detached(Arc::new(SystemClock)).0
    }

    fn names(records: &[FileRecord]) -> Vec<String> {
        records
            .iter()
            .map(|r| r.archive_name.to_string_lossy().replace('\\', "/"))
            .collect()
    }

    #[test]
    fn test_scan_lists_files_in_preorder() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir(temp_dir.path().join("sub"))?;
        fs::write(temp_dir.path().join("b.txt"), b"b")?;
        fs::write(temp_dir.path().join("a.txt"), b"a")?;
        fs::write(temp_dir.path().join("sub/c.txt"), b"c")?;

        let scanner = FileScanner::new(ExclusionPolicy::none());
        let records = scanner.scan(temp_dir.path(), &ctx())?.into_inner();

        assert_eq!(names(&records), vec!["a.txt", "b.txt", "sub/c.txt"]);
        assert!(records.iter().all(|r| r.path.is_absolute()));
        Ok(())
    }

    #[test]
    fn test_excluded_subtree_contributes_nothing() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let skipped = temp_dir.path().join("cache");
        fs::create_dir_all(skipped.join("deep"))?;
        fs::write(skipped.join("x.bin"), b"x")?;
        fs::write(skipped.join("deep/y.bin"), b"y")?;
        fs::create_dir(temp_dir.path().join("cachex"))?;
        fs::write(temp_dir.path().join("cachex/keep.txt"), b"k")?;

        let scanner = FileScanner::new(ExclusionPolicy::new([skipped.clone()]));
        let records = scanner.scan(temp_dir.path(), &ctx())?.into_inner();

        assert_eq!(names(&records), vec!["cachex/keep.txt"]);
        assert!(records.iter().all(|r| !r.path.starts_with(&skipped)));
        Ok(())
    }

    #[test]
    fn test_enclosing_system_exclusion_does_not_hide_root() -> anyhow::Result<()> {
        // Temp dirs usually live under /tmp, which the system list excludes
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("file.txt"), b"data")?;

        let scanner = FileScanner::new(ExclusionPolicy::system());
        let records = scanner.scan(temp_dir.path(), &ctx())?.into_inner();
        assert_eq!(records.len(), 1);
        Ok(())
    }

    #[test]
    fn test_cancelled_scan_returns_partial() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("file.txt"), b"data")?;

        let ctx = ctx();
        ctx.cancel.cancel();
        let outcome = FileScanner::new(ExclusionPolicy::none()).scan(temp_dir.path(), &ctx)?;
        assert!(outcome.is_cancelled());
        assert!(outcome.into_inner().is_empty());
        Ok(())
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("nope");
        let err = FileScanner::new(ExclusionPolicy::none())
            .scan(&missing, &ctx())
            .unwrap_err();
        assert!(matches!(err, EngineError::SourceUnreadable { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_are_listed_not_followed() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let target = temp_dir.path().join("real");
        fs::create_dir(&target)?;
        fs::write(target.join("inner.txt"), b"i")?;
        std::os::unix::fs::symlink(&target, temp_dir.path().join("link"))?;

        let records = FileScanner::new(ExclusionPolicy::none())
            .scan(temp_dir.path(), &ctx())?
            .into_inner();
        assert_eq!(names(&records), vec!["link", "real/inner.txt"]);
        Ok(())
    }
}
