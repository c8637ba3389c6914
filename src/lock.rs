//! Process-wide run lock.
//!
//! One advisory (fs2) exclusive lock per registry: `<config-file>.lock`.
//! Acquisition never blocks; a second instance gets `LockError::Contended`
//! and is expected to exit immediately. Released on Drop.

use fs2::FileExt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another instance holds {}", .0.display())]
    Contended(PathBuf),

    #[error("lock file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub struct RunLock {
    file: std::fs::File,
    path: PathBuf,
}

impl RunLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        // unlock errors on drop are ignored, the OS drops the lock with the fd anyway
        let _ = self.file.unlock();
    }
}

/// `<config-file>.lock` next to the registry.
pub fn lock_file_path(config_file: &Path) -> PathBuf {
    let mut name = config_file
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    config_file.with_file_name(name)
}

/// Try to take the run lock; never waits.
pub fn try_acquire_run_lock(config_file: &Path) -> Result<RunLock, LockError> {
    let path = lock_file_path(config_file);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&path)
        .map_err(|source| LockError::Io {
            path: path.clone(),
            source,
        })?;

    match file.try_lock_exclusive() {
        Ok(()) => Ok(RunLock { file, path }),
        Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
            Err(LockError::Contended(path))
        }
        Err(source) => Err(LockError::Io { path, source }),
    }
}
