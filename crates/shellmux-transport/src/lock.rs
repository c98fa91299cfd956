use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Result, TransportError};

/// Exclusive advisory lock on a file, held for the lifetime of the value.
///
/// The kernel releases a `flock` when the owning process exits for any
/// reason, so a crashed owner never blocks the next one. The holder's pid is
/// written into the file for diagnostics.
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Try to take the lock without blocking.
    ///
    /// Returns `Ok(None)` when another open file description holds it.
    pub fn try_acquire(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref().to_path_buf();
        let lock_err = |source| TransportError::Lock {
            path: path.clone(),
            source,
        };

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .mode(0o600)
            .open(&path)
            .map_err(lock_err)?;

        // SAFETY: `file` owns an open descriptor for the duration of the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                debug!(?path, "lock held elsewhere");
                return Ok(None);
            }
            return Err(lock_err(err));
        }

        file.set_len(0).map_err(lock_err)?;
        file.seek(SeekFrom::Start(0)).map_err(lock_err)?;
        write!(file, "{}", std::process::id()).map_err(lock_err)?;
        file.flush().map_err(lock_err)?;

        debug!(?path, "lock acquired");
        Ok(Some(Self { file, path }))
    }

    /// The lock file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pid recorded by the most recent holder of the lock at `path`, if any.
    pub fn holder_pid(path: impl AsRef<Path>) -> Option<u32> {
        let mut contents = String::new();
        File::open(path).ok()?.read_to_string(&mut contents).ok()?;
        contents.trim().parse().ok()
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        // SAFETY: the descriptor is still open; closing it would release the lock anyway.
        let _ = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        debug!(path = ?self.path, "lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_path(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "shmx-lock-{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join("instance.lock")
    }

    #[test]
    fn second_acquire_is_refused_until_release() {
        let path = lock_path("exclusive");

        let first = InstanceLock::try_acquire(&path).unwrap();
        assert!(first.is_some());
        assert!(InstanceLock::try_acquire(&path).unwrap().is_none());

        drop(first);
        assert!(InstanceLock::try_acquire(&path).unwrap().is_some());

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn records_holder_pid() {
        let path = lock_path("pid");

        let lock = InstanceLock::try_acquire(&path).unwrap().unwrap();
        assert_eq!(lock.path(), path.as_path());
        assert_eq!(InstanceLock::holder_pid(&path), Some(std::process::id()));

        drop(lock);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn missing_directory_is_a_lock_error() {
        let path = std::env::temp_dir()
            .join(format!("shmx-lock-absent-{}", std::process::id()))
            .join("nested")
            .join("instance.lock");
        let result = InstanceLock::try_acquire(&path);
        assert!(matches!(result, Err(TransportError::Lock { .. })));
    }
}
