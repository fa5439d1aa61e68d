use super::error::{EngineError, Result};
use super::job::{JobContext, Outcome};
use super::progress::ProgressState;
use super::{ArchiveStats, FileRecord, ItemOutcome, SkipReason};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Take, Write};
use std::path::PathBuf;
use tar::{Builder, Header, HeaderMode};
use tracing::{debug, warn};

type TarGzBuilder = Builder<GzEncoder<BufWriter<File>>>;

/// Streams enumerated files into a gzip-compressed tar archive
pub struct ArchiveWriter {
    destination: PathBuf,
}

impl ArchiveWriter {
    pub fn new(destination: impl Into<PathBuf>) -> Self {
        Self {
            destination: destination.into(),
        }
    }

    /// Add every record, in order, under its archive name.
    ///
    /// A file that cannot be read is skipped and logged; no single file stops
    /// the archive. A failure writing the archive itself fails the whole
    /// write. An empty record list fails before anything is created.
    /// The archive is never written over an existing file. A cancelled or
    /// failed write removes the partial archive.
    pub fn write(&self, records: &[FileRecord], ctx: &JobContext) -> Result<Outcome<ArchiveStats>> {
        if records.is_empty() {
            return Err(EngineError::NothingToBackUp(self.destination.clone()));
        }

        let mut builder = self.create()?;
        let outcome = match append_all(&mut builder, records, ctx) {
            Ok(outcome) => outcome,
            Err(source) => {
                drop(builder);
                self.discard();
                return Err(self.write_failed(source));
            }
        };

        match outcome {
            Outcome::Completed(stats) => {
                if let Err(source) = finish(builder) {
                    self.discard();
                    return Err(self.write_failed(source));
                }
                Ok(Outcome::Completed(stats))
            }
            Outcome::Cancelled(stats) => {
                drop(builder);
                self.discard();
                Ok(Outcome::Cancelled(stats))
            }
        }
    }

    fn create(&self) -> Result<TarGzBuilder> {
        if let Some(parent) = self.destination.parent() {
            fs::create_dir_all(parent).map_err(|source| EngineError::DestinationUncreatable {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.destination)
            .map_err(|source| match source.kind() {
                io::ErrorKind::AlreadyExists => EngineError::DestinationExists(self.destination.clone()),
                _ => EngineError::DestinationUncreatable {
                    path: self.destination.clone(),
                    source,
                },
            })?;

        let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        Ok(Builder::new(encoder))
    }

    fn write_failed(&self, source: io::Error) -> EngineError {
        EngineError::ArchiveWrite {
            path: self.destination.clone(),
            source,
        }
    }

    fn discard(&self) {
        if let Err(e) = fs::remove_file(&self.destination) {
            warn!("Could not remove partial archive {}: {}", self.destination.display(), e);
        }
    }
}

/// `Err` only when the archive stream itself could not be written
fn append_all(builder: &mut TarGzBuilder, records: &[FileRecord], ctx: &JobContext) -> io::Result<Outcome<ArchiveStats>> {
    let mut stats = ArchiveStats::new(records.len());
    let mut progress = ProgressState::new(records.len());

    for record in records {
        if ctx.is_cancelled() {
            debug!("Archive cancelled after {} of {} files", stats.processed, stats.total);
            return Ok(Outcome::Cancelled(stats));
        }

        let outcome = append_one(builder, record, ctx)?;
        if let ItemOutcome::Skipped(reason) = &outcome {
            ctx.reporter.skip(record.path.display(), reason);
        }
        stats.record(&outcome);
        ctx.reporter.progress_from(&mut progress);
    }

    ctx.reporter.complete(&mut progress);
    Ok(Outcome::Completed(stats))
}

/// Append one record. Source-side problems come back as a skip; any error
/// returned means the archive stream is damaged.
fn append_one<W: Write>(builder: &mut Builder<W>, record: &FileRecord, ctx: &JobContext) -> io::Result<ItemOutcome> {
    let metadata = match fs::symlink_metadata(&record.path) {
        Ok(m) => m,
        Err(e) => return Ok(ItemOutcome::Skipped(SkipReason::from_io(&e))),
    };
    let file_type = metadata.file_type();

    if file_type.is_symlink() {
        // Stored as a link, never followed
        let target = match fs::read_link(&record.path) {
            Ok(t) => t,
            Err(e) => return Ok(ItemOutcome::Skipped(SkipReason::from_io(&e))),
        };
        let mut header = header_for(&metadata);
        builder.append_link(&mut header, &record.archive_name, &target)?;
        return Ok(ItemOutcome::Added);
    }

    if !file_type.is_file() {
        // Fifos, sockets and devices carry no data
        let mut header = header_for(&metadata);
        header.set_size(0);
        builder.append_data(&mut header, &record.archive_name, io::empty())?;
        return Ok(ItemOutcome::Added);
    }

    let file = match File::open(&record.path) {
        Ok(f) => f,
        Err(e) => return Ok(ItemOutcome::Skipped(SkipReason::from_io(&e))),
    };
    // Stat the open handle so the header matches what we are about to read
    let metadata = match file.metadata() {
        Ok(m) => m,
        Err(e) => return Ok(ItemOutcome::Skipped(SkipReason::from_io(&e))),
    };
    let mut header = header_for(&metadata);
    let size = header.size()?;

    let mut data = ExactReader::new(file, size);
    builder.append_data(&mut header, &record.archive_name, &mut data)?;

    if let Some(change) = data.change() {
        ctx.reporter.warning(format!(
            "File changed while reading ({}): {}",
            change,
            record.path.display()
        ));
    }
    Ok(ItemOutcome::Added)
}

fn header_for(metadata: &fs::Metadata) -> Header {
    let mut header = Header::new_gnu();
    header.set_metadata_in_mode(metadata, HeaderMode::Complete);
    header
}

/// Yields exactly `size` bytes whatever the file does meanwhile: reads stop
/// at `size`, and a short or failing read is padded with zeros. Never
/// returns an error, so the tar stream always matches its header.
struct ExactReader<R> {
    inner: Take<R>,
    size: u64,
    copied: u64,
    padded: u64,
    read_error: Option<io::Error>,
}

impl<R: Read> ExactReader<R> {
    fn new(inner: R, size: u64) -> Self {
        Self {
            inner: inner.take(size),
            size,
            copied: 0,
            padded: 0,
            read_error: None,
        }
    }

    /// How the source differed from its stat size, once fully consumed
    fn change(&mut self) -> Option<String> {
        if let Some(e) = &self.read_error {
            return Some(format!("read failed after {} of {} bytes: {}", self.copied, self.size, e));
        }
        if self.padded > 0 {
            return Some(format!("shrank to {} of {} bytes", self.copied, self.size));
        }
        let mut extra = [0u8; 1];
        match self.inner.get_mut().read(&mut extra) {
            Ok(n) if n > 0 => Some(format!("grew past {} bytes", self.size)),
            _ => None,
        }
    }
}

impl<R: Read> Read for ExactReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.size - self.copied - self.padded;
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }

        if self.read_error.is_none() && self.padded == 0 {
            match self.inner.read(buf) {
                Ok(0) => {}
                Ok(n) => {
                    self.copied += n as u64;
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => return Err(e),
                Err(e) => self.read_error = Some(e),
            }
        }

        let pad = remaining.min(buf.len() as u64) as usize;
        buf[..pad].fill(0);
        self.padded += pad as u64;
        Ok(pad)
    }
}

fn finish(builder: TarGzBuilder) -> io::Result<()> {
    let encoder = builder.into_inner()?;
    let mut out = encoder.finish()?;
    out.flush()?;
    out.get_ref().sync_all()
}
