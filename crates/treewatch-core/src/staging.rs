//! Local staging files.

use std::path::{Path, PathBuf};

/// A local file removed when dropped.
///
/// Holds intermediate downloads and encodings so that every exit path of a
/// job, including errors, cleans up after itself.
#[derive(Debug)]
pub(crate) struct StagedFile(PathBuf);

impl StagedFile {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self(path)
    }

    pub(crate) fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.0.display(), error = %e, "failed to remove staged file");
            }
        }
    }
}
