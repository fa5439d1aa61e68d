use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Job-level failures. Per-item problems never become one of these;
/// they are reported as [`super::SkipReason`] and the job carries on.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Source is not readable: {path}: {source}")]
    SourceUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot create destination {path}: {source}")]
    DestinationUncreatable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot write archive {path}: {source}")]
    ArchiveWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Destination already exists: {0}")]
    DestinationExists(PathBuf),

    #[error("Nothing to back up: no files for {0}")]
    NothingToBackUp(PathBuf),

    #[error("Archive is empty: {0}")]
    EmptyArchive(PathBuf),

    #[error("Cannot open archive {path}: {source}")]
    ArchiveUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Not a valid archive: {path}: {source}")]
    InvalidArchive {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
