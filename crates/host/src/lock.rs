//! Single-instance lock
//!
//! An exclusive `flock` on a pid file. The lock lives as long as the
//! returned guard; the kernel drops it if the process dies.

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another instance holds {}", .0.display())]
    Held(PathBuf),

    #[error("cannot open lock file {}: {source}", path.display())]
    Open { path: PathBuf, source: io::Error },

    #[error("cannot lock {}: {source}", path.display())]
    Lock { path: PathBuf, source: Errno },

    #[error("cannot write pid to {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
}

#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    _file: Flock<File>,
}

impl InstanceLock {
    /// Take the lock without blocking and record our pid in the file
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        // Not truncated until locked: the holder's pid must survive a failed attempt
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|source| LockError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        let file = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(file) => file,
            Err((_, Errno::EWOULDBLOCK)) => return Err(LockError::Held(path.to_path_buf())),
            Err((_, source)) => {
                return Err(LockError::Lock {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        let write_pid = |mut file: &File| -> io::Result<()> {
            file.set_len(0)?;
            writeln!(file, "{}", std::process::id())?;
            file.flush()
        };
        write_pid(&*file).map_err(|source| LockError::Write {
            path: path.to_path_buf(),
            source,
        })?;

        debug!("Acquired instance lock {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            _file: file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_writes_pid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("simple-rt.lock");

        let lock = InstanceLock::acquire(&path).unwrap();
        assert_eq!(lock.path(), path);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
    }

    #[test]
    fn test_second_acquire_is_refused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("simple-rt.lock");

        let _held = InstanceLock::acquire(&path).unwrap();
        let second = InstanceLock::acquire(&path);
        assert!(matches!(second, Err(LockError::Held(_))));

        // The holder's pid is untouched
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("simple-rt.lock");

        drop(InstanceLock::acquire(&path).unwrap());
        assert!(InstanceLock::acquire(&path).is_ok());
    }

    #[test]
    fn test_missing_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing").join("simple-rt.lock");
        assert!(matches!(
            InstanceLock::acquire(&path),
            Err(LockError::Open { .. })
        ));
    }
}
