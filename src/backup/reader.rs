use super::error::{EngineError, Result};
use super::job::{JobContext, Outcome};
use super::progress::ProgressState;
use super::{ArchiveStats, ItemOutcome, SkipReason};
use flate2::read::GzDecoder;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Entry, EntryType};
use tracing::debug;

type TarGzArchive = Archive<GzDecoder<BufReader<File>>>;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MemberKind {
    File,
    Directory,
    Symlink,
    Hardlink,
    Other,
}

impl From<EntryType> for MemberKind {
    fn from(kind: EntryType) -> Self {
        match kind {
            EntryType::Regular | EntryType::Continuous => MemberKind::File,
            EntryType::Directory => MemberKind::Directory,
            EntryType::Symlink => MemberKind::Symlink,
            EntryType::Link => MemberKind::Hardlink,
            _ => MemberKind::Other,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MemberInfo {
    pub name: PathBuf,
    pub kind: MemberKind,
    pub size: u64,
}

/// Streams members out of a gzip-compressed tar archive
pub struct ArchiveReader {
    archive: PathBuf,
}

impl ArchiveReader {
    pub fn new(archive: impl Into<PathBuf>) -> Self {
        Self {
            archive: archive.into(),
        }
    }

    /// Every member header, in archive order. A damaged stream fails the
    /// whole listing.
    pub fn list_members(&self) -> Result<Vec<MemberInfo>> {
        let mut archive = self.open()?;
        let entries = archive.entries().map_err(|e| self.invalid(e))?;

        let mut members = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| self.invalid(e))?;
            let name = entry.path().map_err(|e| self.invalid(e))?.into_owned();
            members.push(MemberInfo {
                name,
                kind: entry.header().entry_type().into(),
                size: entry.size(),
            });
        }
        Ok(members)
    }

    /// Extract into `destination`, which must not exist yet.
    ///
    /// Members are listed up front to bound progress. A member that cannot
    /// be written, or whose path would leave `destination`, is skipped and
    /// logged. Cancellation stops between members and leaves what was
    /// already extracted in place.
    pub fn extract(&self, destination: &Path, ctx: &JobContext) -> Result<Outcome<ArchiveStats>> {
        if fs::symlink_metadata(destination).is_ok() {
            return Err(EngineError::DestinationExists(destination.to_path_buf()));
        }

        let members = self.list_members()?;
        if members.is_empty() {
            return Err(EngineError::EmptyArchive(self.archive.clone()));
        }
        ctx.reporter.log(format!("Members in archive: {}", members.len()));

        create_fresh_dir(destination)?;

        let mut archive = self.open()?;
        archive.set_preserve_permissions(false);
        let entries = archive.entries().map_err(|e| self.invalid(e))?;

        let mut stats = ArchiveStats::new(members.len());
        let mut progress = ProgressState::new(members.len());

        for (member, entry) in members.iter().zip(entries) {
            if ctx.is_cancelled() {
                debug!("Extraction cancelled after {} of {} members", stats.processed, stats.total);
                return Ok(Outcome::Cancelled(stats));
            }

            let outcome = match entry {
                Ok(mut entry) => unpack_member(&mut entry, destination),
                Err(e) => ItemOutcome::Skipped(SkipReason::from_io(&e)),
            };
            if let ItemOutcome::Skipped(reason) = &outcome {
                ctx.reporter.skip(member.name.display(), reason);
            }
            stats.record(&outcome);
            ctx.reporter.progress_from(&mut progress);
        }

        ctx.reporter.complete(&mut progress);
        Ok(Outcome::Completed(stats))
    }

    fn open(&self) -> Result<TarGzArchive> {
        let file = File::open(&self.archive).map_err(|source| EngineError::ArchiveUnreadable {
            path: self.archive.clone(),
            source,
        })?;
        Ok(Archive::new(GzDecoder::new(BufReader::new(file))))
    }

    fn invalid(&self, source: io::Error) -> EngineError {
        EngineError::InvalidArchive {
            path: self.archive.clone(),
            source,
        }
    }
}

fn create_fresh_dir(destination: &Path) -> Result<()> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).map_err(|source| EngineError::DestinationUncreatable {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    fs::create_dir(destination).map_err(|source| match source.kind() {
        io::ErrorKind::AlreadyExists => EngineError::DestinationExists(destination.to_path_buf()),
        _ => EngineError::DestinationUncreatable {
            path: destination.to_path_buf(),
            source,
        },
    })
}

fn unpack_member<R: Read>(entry: &mut Entry<'_, R>, destination: &Path) -> ItemOutcome {
    let raw = match entry.path() {
        Ok(path) => path.into_owned(),
        Err(e) => return ItemOutcome::Skipped(SkipReason::from_io(&e)),
    };
    if sanitize_member_path(&raw).is_none() {
        return ItemOutcome::Skipped(SkipReason::UnsafePath);
    }

    // unpack_in also refuses paths and link targets that resolve outside
    match entry.unpack_in(destination) {
        Ok(true) => ItemOutcome::Added,
        Ok(false) => ItemOutcome::Skipped(SkipReason::UnsafePath),
        Err(e) => ItemOutcome::Skipped(SkipReason::from_io(&e)),
    }
}

/// Member path relative to the destination, or `None` if it climbs out
/// through `..`. A leading root or drive prefix is dropped.
pub fn sanitize_member_path(raw: &Path) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for comp in raw.components() {
        match comp {
            Component::Normal(part) => clean.push(part),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => return None,
        }
    }
    Some(clean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::job::JobEvent;
    use crate::utils::SystemClock;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::sync::Arc;
    use tar::{Builder, Header};
    use tempfile::TempDir;

    fn ctx() -> (JobContext, crossbeam_channel::Receiver<JobEvent>) {
        JobContext::detached(Arc::new(SystemClock))
    }

    /// Writes raw member names, bypassing the builder's own path checks
    fn archive_with(path: &Path, members: &[(&str, &[u8])]) {
        let encoder = GzEncoder::new(File::create(path).unwrap(), Compression::default());
        let mut builder = Builder::new(encoder);
        for (name, data) in members {
            let mut header = Header::new_gnu();
            let raw = name.as_bytes();
            header.as_old_mut().name[..raw.len()].copy_from_slice(raw);
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_entry_type(EntryType::Regular);
            header.set_cksum();
            builder.append(&header, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn test_sanitize_member_path() {
        assert_eq!(sanitize_member_path(Path::new("a/b.txt")), Some(PathBuf::from("a/b.txt")));
        assert_eq!(sanitize_member_path(Path::new("./a")), Some(PathBuf::from("a")));
        assert_eq!(sanitize_member_path(Path::new("/etc/passwd")), Some(PathBuf::from("etc/passwd")));
        assert_eq!(sanitize_member_path(Path::new("../evil")), None);
        assert_eq!(sanitize_member_path(Path::new("a/../../evil")), None);
    }

    #[test]
    fn test_extract_writes_members() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let archive = temp_dir.path().join("in.tar.gz");
        archive_with(&archive, &[("a.txt", b"hi"), ("sub/b.txt", b"bye")]);

        let dest = temp_dir.path().join("restore/R");
        let (ctx, _rx) = ctx();
        let stats = ArchiveReader::new(&archive).extract(&dest, &ctx)?.into_inner();

        assert_eq!((stats.added, stats.skipped), (2, 0));
        assert_eq!(fs::read_to_string(dest.join("a.txt"))?, "hi");
        assert_eq!(fs::read_to_string(dest.join("sub/b.txt"))?, "bye");
        Ok(())
    }

    #[test]
    fn test_escaping_member_is_skipped() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let archive = temp_dir.path().join("evil.tar.gz");
        archive_with(&archive, &[("../evil.txt", b"gotcha"), ("ok.txt", b"fine")]);

        let dest = temp_dir.path().join("R");
        let (ctx, rx) = ctx();
        let stats = ArchiveReader::new(&archive).extract(&dest, &ctx)?.into_inner();
        drop(ctx);

        assert_eq!((stats.added, stats.skipped), (1, 1));
        assert!(!temp_dir.path().join("evil.txt").exists());
        assert_eq!(fs::read_to_string(dest.join("ok.txt"))?, "fine");
        assert!(rx.iter().any(|e| matches!(
            e,
            JobEvent::Log { line } if line.contains("path escapes destination")
        )));
        Ok(())
    }

    #[test]
    fn test_existing_destination_is_untouched() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let archive = temp_dir.path().join("in.tar.gz");
        archive_with(&archive, &[("a.txt", b"new")]);
        let dest = temp_dir.path().join("R");
        fs::create_dir(&dest)?;
        fs::write(dest.join("a.txt"), b"old")?;

        let (ctx, _rx) = ctx();
        let err = ArchiveReader::new(&archive).extract(&dest, &ctx).unwrap_err();

        assert!(matches!(err, EngineError::DestinationExists(_)));
        assert_eq!(fs::read_to_string(dest.join("a.txt"))?, "old");
        Ok(())
    }

    #[test]
    fn test_empty_archive_fails_without_creating_destination() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let archive = temp_dir.path().join("empty.tar.gz");
        archive_with(&archive, &[]);
        let dest = temp_dir.path().join("R");

        let (ctx, _rx) = ctx();
        let err = ArchiveReader::new(&archive).extract(&dest, &ctx).unwrap_err();

        assert!(matches!(err, EngineError::EmptyArchive(_)));
        assert!(!dest.exists());
        Ok(())
    }

    #[test]
    fn test_garbage_is_not_an_archive() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let archive = temp_dir.path().join("junk.tar.gz");
        fs::write(&archive, b"definitely not gzip data")?;

        let err = ArchiveReader::new(&archive).list_members().unwrap_err();
        assert!(matches!(err, EngineError::InvalidArchive { .. }));

        let missing = ArchiveReader::new(temp_dir.path().join("missing.tar.gz"))
            .list_members()
            .unwrap_err();
        assert!(matches!(missing, EngineError::ArchiveUnreadable { .. }));
        Ok(())
    }

    #[test]
    fn test_list_members_reports_kinds() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let archive = temp_dir.path().join("in.tar.gz");
        archive_with(&archive, &[("a.txt", b"12345")]);

        let members = ArchiveReader::new(&archive).list_members()?;
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].name, PathBuf::from("a.txt"));
        assert_eq!(members[0].kind, MemberKind::File);
        assert_eq!(members[0].size, 5);
        Ok(())
    }
}
