//! Output Commit
//!
//! Generated files and the descriptor set land on disk together or not at all.
//! Every file is first written to a temporary file beside its destination,
//! then all of them are moved into place. A failed move undoes the earlier
//! ones: new files are removed, replaced files are restored and directories
//! created along the way are removed again.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::{NamedTempFile, TempPath};
use tracing::{debug, info, warn};

use crate::error::{CodegenError, Result};

const SCRATCH_PREFIX: &str = ".protoc-sandbox-";

fn write_error(path: &Path, source: std::io::Error) -> CodegenError {
    CodegenError::Write {
        path: path.to_path_buf(),
        source,
    }
}

/// Closest existing directory that will hold `target`, so scratch files share
/// its filesystem and can be renamed into place
fn nearest_directory(target: &Path) -> PathBuf {
    target
        .ancestors()
        .skip(1)
        .find(|dir| dir.is_dir())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

struct Pending {
    target: PathBuf,
    scratch: NamedTempFile,
}

/// A set of files written as one unit
#[derive(Default)]
pub struct OutputTransaction {
    pending: Vec<Pending>,
}

impl OutputTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Write `content` to a scratch file for `target`. Nothing is visible at
    /// `target` until [`commit`](Self::commit).
    pub fn stage(&mut self, target: impl Into<PathBuf>, content: &[u8]) -> Result<()> {
        let target = target.into();
        let mut scratch = tempfile::Builder::new()
            .prefix(SCRATCH_PREFIX)
            .tempfile_in(nearest_directory(&target))
            .map_err(|e| write_error(&target, e))?;
        scratch
            .write_all(content)
            .and_then(|_| scratch.flush())
            .map_err(|e| write_error(&target, e))?;

        debug!(path = %target.display(), bytes = content.len(), "output staged");
        self.pending.push(Pending { target, scratch });
        Ok(())
    }

    /// Move every staged file into place. On error the destination tree is
    /// left as it was before the commit.
    pub fn commit(self) -> Result<Vec<PathBuf>> {
        let mut journal = Journal::default();
        let mut written = Vec::with_capacity(self.pending.len());

        for pending in self.pending {
            let target = pending.target.clone();
            if let Err(err) = journal.place(pending) {
                journal.roll_back();
                return Err(err);
            }
            info!(path = %target.display(), "file written");
            written.push(target);
        }
        Ok(written)
    }
}

/// What a commit changed so far
#[derive(Default)]
struct Journal {
    created_dirs: Vec<PathBuf>,
    /// Destination plus the previous file moved out of its way
    placed: Vec<(PathBuf, Option<TempPath>)>,
}

impl Journal {
    fn place(&mut self, pending: Pending) -> Result<()> {
        let Pending { target, scratch } = pending;
        if let Some(parent) = target.parent() {
            self.create_dirs(parent)?;
        }

        let backup = if target.is_file() {
            let backup = tempfile::Builder::new()
                .prefix(SCRATCH_PREFIX)
                .tempfile_in(nearest_directory(&target))
                .map_err(|e| write_error(&target, e))?
                .into_temp_path();
            fs::rename(&target, &backup).map_err(|e| write_error(&target, e))?;
            Some(backup)
        } else {
            None
        };

        match scratch.persist(&target) {
            Ok(_) => {
                self.placed.push((target, backup));
                Ok(())
            }
            Err(e) => {
                if let Some(backup) = &backup {
                    restore(backup, &target);
                }
                Err(write_error(&target, e.error))
            }
        }
    }

    fn create_dirs(&mut self, dir: &Path) -> Result<()> {
        let missing: Vec<&Path> = dir
            .ancestors()
            .take_while(|d| !d.as_os_str().is_empty() && !d.exists())
            .collect();
        for dir in missing.into_iter().rev() {
            fs::create_dir(dir).map_err(|e| write_error(dir, e))?;
            self.created_dirs.push(dir.to_path_buf());
        }
        Ok(())
    }

    fn roll_back(self) {
        warn!(placed = self.placed.len(), "output commit failed, rolling back");
        for (target, backup) in self.placed.into_iter().rev() {
            match backup {
                Some(backup) => restore(&backup, &target),
                None => {
                    if let Err(e) = fs::remove_file(&target) {
                        warn!(path = %target.display(), error = %e, "could not remove written file");
                    }
                }
            }
        }
        for dir in self.created_dirs.iter().rev() {
            if let Err(e) = fs::remove_dir(dir) {
                warn!(path = %dir.display(), error = %e, "could not remove created directory");
            }
        }
    }
}

fn restore(backup: &Path, target: &Path) {
    if let Err(e) = fs::rename(backup, target) {
        warn!(path = %target.display(), error = %e, "could not restore previous file");
    }
}
