//! Advisory directory locking.
//!
//! The lock is taken with `flock` on the directory file descriptor:
//! exclusive for read-write databases, shared for read-only ones. A `LOCK`
//! pid file is written inside the directory for debugging. The pid file is
//! not part of the locking mechanism.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use crate::error::{Error, Result};

/// Name of the advisory pid file written inside a locked directory.
pub const LOCK_FILE: &str = "LOCK";

/// Holds a lock on a database directory, plus the pid file inside it.
pub struct DirLockGuard {
    dir: File,
    pid_path: PathBuf,
    read_only: bool,
}

impl DirLockGuard {
    /// Locks `dir`, exclusively unless `read_only`. In read-write mode the
    /// current process id is written to `dir/LOCK`.
    pub fn acquire(dir: &Path, read_only: bool) -> Result<DirLockGuard> {
        let pid_path = dir.join(LOCK_FILE);
        let handle = File::open(dir)
            .map_err(|e| Error::Io(format!("cannot open directory {:?}: {e}", dir)))?;

        Self::try_lock(&handle, read_only).map_err(|_| {
            Error::Lock(format!(
                "cannot acquire directory lock on {:?}, another process is using this database",
                dir
            ))
        })?;

        if !read_only {
            let mut pid_file = File::create(&pid_path)?;
            writeln!(pid_file, "{}", std::process::id())?;
            pid_file.flush()?;
        }

        Ok(DirLockGuard {
            dir: handle,
            pid_path,
            read_only,
        })
    }

    #[cfg(unix)]
    fn try_lock(file: &File, shared: bool) -> std::io::Result<()> {
        let operation = if shared {
            libc::LOCK_SH | libc::LOCK_NB
        } else {
            libc::LOCK_EX | libc::LOCK_NB
        };
        let rc = unsafe { libc::flock(file.as_raw_fd(), operation) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock(_file: &File, _shared: bool) -> std::io::Result<()> {
        Ok(())
    }

    /// Removes the pid file and drops the lock. Equivalent to dropping the
    /// guard, but reports errors.
    pub fn release(self) -> Result<()> {
        if !self.read_only {
            fs::remove_file(&self.pid_path)?;
        }
        // The flock is released when the directory handle closes (at the
        // end of this scope, via the Drop impl below).
        Ok(())
    }
}

impl Drop for DirLockGuard {
    fn drop(&mut self) {
        if !self.read_only {
            let _ = fs::remove_file(&self.pid_path);
        }
    }
}

/// Fsyncs a directory so that file creations, deletions and renames inside
/// it survive a crash.
pub fn sync_dir(path: &Path) -> Result<()> {
    let dir = File::open(path)
        .map_err(|e| Error::Io(format!("cannot open directory {:?} for sync: {e}", path)))?;
    dir.sync_all()
        .map_err(|e| Error::Io(format!("cannot sync directory {:?}: {e}", path)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_exclusive_lock_blocks_second_holder() {
        let dir = TempDir::new().unwrap();

        let first = DirLockGuard::acquire(dir.path(), false).unwrap();
        assert!(matches!(
            DirLockGuard::acquire(dir.path(), false),
            Err(Error::Lock(_))
        ));

        first.release().unwrap();
        let second = DirLockGuard::acquire(dir.path(), false).unwrap();
        second.release().unwrap();
    }

    #[test]
    fn test_shared_locks_coexist() {
        let dir = TempDir::new().unwrap();

        let a = DirLockGuard::acquire(dir.path(), true).unwrap();
        let b = DirLockGuard::acquire(dir.path(), true).unwrap();
        a.release().unwrap();
        b.release().unwrap();
    }

    #[test]
    fn test_pid_file_written_and_removed() {
        let dir = TempDir::new().unwrap();
        let pid_path = dir.path().join(LOCK_FILE);

        let guard = DirLockGuard::acquire(dir.path(), false).unwrap();
        let contents = fs::read_to_string(&pid_path).unwrap();
        assert!(contents.contains(&std::process::id().to_string()));

        guard.release().unwrap();
        assert!(!pid_path.exists());
    }

    #[test]
    fn test_read_only_writes_no_pid_file() {
        let dir = TempDir::new().unwrap();
        let guard = DirLockGuard::acquire(dir.path(), true).unwrap();
        assert!(!dir.path().join(LOCK_FILE).exists());
        guard.release().unwrap();
    }

    #[test]
    fn test_sync_dir() {
        let dir = TempDir::new().unwrap();
        sync_dir(dir.path()).unwrap();
    }
}
