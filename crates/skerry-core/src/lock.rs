//! Host-wide sandbox lock.
//!
//! One advisory `flock` per sandbox, on `<dir>/sandbox.lock`. The kernel
//! drops the lock when its holder exits, crash included. A VMM left
//! behind by a crashed holder is caught by the liveness check on join.

use crate::error::Result;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

/// File name of the lock inside a sandbox directory.
pub const LOCK_FILE: &str = "sandbox.lock";

/// Exclusive hold on one sandbox. Released on drop.
#[derive(Debug)]
pub struct SandboxLock {
    file: File,
    path: PathBuf,
}

impl SandboxLock {
    /// Block until the lock on `dir` is held, creating it if needed.
    pub async fn acquire(dir: &Path) -> Result<Self> {
        let dir = dir.to_path_buf();
        let lock = tokio::task::spawn_blocking(move || Self::lock(&dir, true))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("lock task failed: {e}")))??;
        lock.ok_or_else(|| io::Error::new(io::ErrorKind::WouldBlock, "lock contended").into())
    }

    /// Take the lock only if nobody holds it.
    pub fn try_acquire(dir: &Path) -> Result<Option<Self>> {
        Ok(Self::lock(dir, false)?)
    }

    fn lock(dir: &Path, blocking: bool) -> io::Result<Option<Self>> {
        let path = dir.join(LOCK_FILE);
        loop {
            std::fs::create_dir_all(dir)?;
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;

            if blocking {
                FileExt::lock_exclusive(&file)?;
            } else if let Err(e) = FileExt::try_lock_exclusive(&file) {
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
                {
                    return Ok(None);
                }
                return Err(e);
            }

            // The previous holder may have removed the sandbox while we waited
            if !same_file(&file, &path)? {
                tracing::debug!(path = %path.display(), "Lock file replaced while waiting, retrying");
                continue;
            }

            file.set_len(0)?;
            writeln!(file, "{}", std::process::id())?;
            tracing::debug!(path = %path.display(), "Sandbox lock acquired");
            return Ok(Some(Self { file, path }));
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock and remove the lock file, along with its directory
    /// if nothing else is left in it.
    pub fn discard(self) {
        let _ = std::fs::remove_file(&self.path);
        if let Some(dir) = self.path.parent() {
            let _ = std::fs::remove_dir(dir);
        }
    }
}

impl Drop for SandboxLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to unlock sandbox");
        } else {
            tracing::trace!(path = %self.path.display(), "Sandbox lock released");
        }
    }
}

fn same_file(file: &File, path: &Path) -> io::Result<bool> {
    let held = file.metadata()?;
    match std::fs::metadata(path) {
        Ok(current) => Ok(held.dev() == current.dev() && held.ino() == current.ino()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
