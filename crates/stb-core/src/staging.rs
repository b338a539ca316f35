//! Scoped ownership of files in the local working area.
//!
//! Every file the pipeline creates locally (fetched copy, archive) is held by a
//! [`ScopedFile`] guard, so it is removed on every exit path: explicit cleanup,
//! early `?` return, panic unwinding, or the run future being dropped.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use tracing::{debug, warn};

use crate::{domain::remote_file_name, errors::Error, Result};

/// Remove a file, treating "already gone" as success.
///
/// Returns whether a file was actually removed.
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// A local file that is deleted when the guard goes away.
#[derive(Debug)]
pub struct ScopedFile {
    path: PathBuf,
    armed: bool,
}

impl ScopedFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            armed: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the file now and surface the I/O error, if any.
    pub fn remove(mut self) -> io::Result<()> {
        self.armed = false;
        remove_if_exists(&self.path).map(|_| ())
    }

}

impl Drop for ScopedFile {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match remove_if_exists(&self.path) {
            Ok(true) => debug!(path = %self.path.display(), "removed local file"),
            Ok(false) => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove local file"),
        }
    }
}

/// Create the working area, or verify an existing one.
///
/// The directory must be a real directory (not a symlink) owned by the
/// effective user with no group or world access. Anything else is refused,
/// never repaired.
pub fn prepare_work_dir(dir: &Path) -> Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir)?;

    let meta = fs::symlink_metadata(dir)?;
    if meta.file_type().is_symlink() || !meta.is_dir() {
        return Err(Error::Config(format!(
            "work dir {} is not a plain directory",
            dir.display()
        )));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;

        let euid = nix::unistd::geteuid().as_raw();
        if meta.uid() != euid {
            return Err(Error::Config(format!(
                "work dir {} is owned by uid {}, expected {euid}",
                dir.display(),
                meta.uid()
            )));
        }
        let mode = meta.mode() & 0o777;
        if mode & 0o077 != 0 {
            return Err(Error::Config(format!(
                "work dir {} has mode {mode:o}, expected 700",
                dir.display()
            )));
        }
    }
    Ok(())
}

/// A remote file copied into the working area, pending packaging and delivery.
#[derive(Debug)]
pub struct StagedFile {
    file: ScopedFile,
    origin_remote_path: String,
}

impl StagedFile {
    /// Claim the staging slot for `remote_path` inside `work_dir`.
    ///
    /// The guard exists before any byte is written, so a transfer that dies
    /// halfway still leaves nothing behind.
    pub fn claim(work_dir: &Path, remote_path: &str) -> Result<Self> {
        let Some(name) = remote_file_name(remote_path) else {
            return Err(Error::InvalidPath {
                path: PathBuf::from(remote_path),
                reason: "remote path has no file name".to_string(),
            });
        };
        Ok(Self {
            file: ScopedFile::new(work_dir.join(name)),
            origin_remote_path: remote_path.to_string(),
        })
    }

    pub fn local_path(&self) -> &Path {
        self.file.path()
    }

    pub fn origin_remote_path(&self) -> &str {
        &self.origin_remote_path
    }

    pub(crate) fn into_file(self) -> ScopedFile {
        self.file
    }
}
