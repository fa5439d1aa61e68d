//! Compressed tar.gz backups of a directory tree, and test restores of
//! those archives into fresh directories.
//!
//! Both run as cancellable jobs on worker threads; see [`backup::job`].

pub mod api;
pub mod backup;
pub mod utils;
pub mod web;
