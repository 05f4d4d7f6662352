use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use crate::error::Result;
use crate::Error;

pub const LOCK_FILE: &str = "sessiondb.lock";

/// Exclusive advisory lock over a store directory.
///
/// Held for as long as an `Env` is open, so that a directory has at most one
/// owner per host. Released by the OS when the handle is dropped.
pub struct DirLock {
    _file: File,
    path: PathBuf,
}

impl DirLock {
    /// Locks `dir`, creating the lock file if needed. Fails immediately
    /// rather than waiting when another owner holds the lock.
    pub fn acquire<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let path = dir.as_ref().join(LOCK_FILE);

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        Self::try_lock(&file).map_err(Error::LockError)?;

        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { _file: file, path })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};

        let fd = file.as_raw_fd();
        let result = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock(_file: &File) -> io::Result<()> {
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for DirLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirLock").field("path", &self.path).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_lock_writes_pid() -> Result<()> {
        let dir = TempDir::new()?;
        let lock = DirLock::acquire(dir.path())?;

        assert_eq!(lock.path(), dir.path().join(LOCK_FILE));
        let content = fs::read_to_string(lock.path())?;
        assert!(content.contains(&std::process::id().to_string()));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_second_owner_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        let _first = DirLock::acquire(dir.path())?;

        match DirLock::acquire(dir.path()) {
            Err(Error::LockError(_)) => {}
            other => panic!("expected lock error, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_released_on_drop() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let _lock = DirLock::acquire(dir.path())?;
        }
        let _again = DirLock::acquire(dir.path())?;
        Ok(())
    }
}
