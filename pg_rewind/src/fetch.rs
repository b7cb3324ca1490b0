//!
//! Fetching data from a local or remote data directory.
//!
//! The planner and executor don't care where the source cluster lives; they
//! work against this trait. [`crate::local_source::LocalSource`] reads a
//! directory, [`crate::libpq_source::LibpqSource`] talks to a live server.
//!

use camino::Utf8Path;

use crate::filemap::{FileListSink, FileMap};
use crate::target::TargetWriter;

/// A required artifact (control file, history file) could not be read.
/// Distinguished from environment problems by the exit code.
#[derive(Debug, thiserror::Error)]
#[error("could not read file \"{path}\"")]
pub struct FileReadError {
    pub path: String,
    #[source]
    pub source: std::io::Error,
}

/// Upcast any error into an opaque [`std::io::Error`], for wrapping
/// non-filesystem read failures into [`FileReadError`].
pub fn io_error(e: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, e)
}

pub trait FetchBackend {
    /// Stream the source cluster's file inventory into the sink: every
    /// regular file, directory and symlink under the source root, with type,
    /// size, and link target where applicable.
    fn list_files(&mut self, sink: &mut dyn FileListSink) -> anyhow::Result<()>;

    /// Fetch the full contents of one file.
    fn fetch_file(&mut self, path: &str) -> anyhow::Result<Vec<u8>>;

    /// Apply a finalized file map to the target, performing all file data
    /// transfers this backend is responsible for.
    fn execute_map(&mut self, map: &FileMap, writer: &mut TargetWriter) -> anyhow::Result<()>;

    /// Fail fast if the source and the given target root are the same
    /// underlying directory.
    fn check_same(&mut self, target_root: &Utf8Path) -> anyhow::Result<()>;

    /// Release whatever the backend set up on the source. Called once after
    /// a successful run.
    fn finish(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Read a file from under `datadir` into memory.
pub fn slurp_file(datadir: &Utf8Path, path: &str) -> Result<Vec<u8>, FileReadError> {
    let fullpath = datadir.join(path);
    std::fs::read(&fullpath).map_err(|e| FileReadError {
        path: fullpath.into_string(),
        source: e,
    })
}
