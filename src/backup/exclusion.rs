use std::path::{Path, PathBuf};

/// Virtual, runtime, temporary and removable-media locations that a full
/// system backup never descends into.
pub const SYSTEM_EXCLUSIONS: &[&str] = &[
    "/proc",
    "/sys",
    "/dev",
    "/run",
    "/tmp",
    "/mnt",
    "/media",
    "/lost+found",
    "/var/tmp",
    "/var/run",
];

/// Decides whether a directory subtree is skipped during enumeration.
///
/// Matching is component-wise: a directory is excluded when it equals an
/// exclusion root or lies beneath one, so `/tmpx` is not caught by `/tmp`.
/// The set is fixed at construction.
#[derive(Debug, Clone, Default)]
pub struct ExclusionPolicy {
    roots: Vec<PathBuf>,
}

impl ExclusionPolicy {
    pub fn new<I, P>(roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            roots: roots.into_iter().map(Into::into).collect(),
        }
    }

    /// The fixed system list from [`SYSTEM_EXCLUSIONS`]
    pub fn system() -> Self {
        Self::new(SYSTEM_EXCLUSIONS.iter().copied())
    }

    /// Excludes nothing
    pub fn none() -> Self {
        Self::default()
    }

    /// This policy plus `more` roots
    pub fn extended<I, P>(&self, more: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let mut roots = self.roots.clone();
        roots.extend(more.into_iter().map(Into::into));
        Self { roots }
    }

    /// Policy for a walk starting at `root`.
    ///
    /// Exclusion roots that contain `root` (or equal it) are dropped: the
    /// caller asked for that subtree explicitly. Roots below `root` stay.
    pub fn scoped_to(&self, root: &Path) -> Self {
        Self {
            roots: self
                .roots
                .iter()
                .filter(|ex| !root.starts_with(ex))
                .cloned()
                .collect(),
        }
    }

    pub fn is_excluded(&self, dir: &Path) -> bool {
        self.roots.iter().any(|ex| dir.starts_with(ex))
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }
}
