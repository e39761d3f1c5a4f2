//! Advisory per-notebook locking.
//!
//! Each notebook `foo.ipynb` is guarded by an OS-level exclusive lock on the
//! sidecar file `foo.ipynb.lock`. Acquisition is non-blocking and retried on a
//! fixed interval until the caller's timeout elapses.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, warn};
use tokio::time::Instant;

use crate::error::{NotebookError, Result};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Longest wait a deadline is computed for. Larger timeouts are treated as
/// unbounded.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `now + timeout`, saturating instead of overflowing.
pub(crate) fn deadline_after(timeout: Duration) -> Instant {
    Instant::now() + timeout.min(FAR_FUTURE)
}

/// Path of the sidecar lock file for a notebook.
pub fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

pub struct LockManager {
    poll_interval: Duration,
    held: Mutex<HashMap<PathBuf, File>>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

impl LockManager {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            held: Mutex::new(HashMap::new()),
        }
    }

    /// Try to take the lock for `path`, waiting at most `timeout`.
    ///
    /// Returns false on timeout or if the sidecar cannot be opened.
    pub async fn acquire(&self, path: &Path, timeout: Duration) -> bool {
        match self.acquire_inner(path, timeout).await {
            Ok(acquired) => acquired,
            Err(e) => {
                warn!("[lock] Failed to open lock file for {:?}: {}", path, e);
                false
            }
        }
    }

    /// Acquire the lock and return a guard that releases it on drop.
    pub async fn lock(&self, path: &Path, timeout: Duration) -> Result<LockGuard<'_>> {
        let acquired = self
            .acquire_inner(path, timeout)
            .await
            .map_err(|e| NotebookError::io(sidecar_path(path), e))?;
        if !acquired {
            return Err(NotebookError::LockTimeout {
                path: path.to_path_buf(),
                timeout,
            });
        }
        Ok(LockGuard {
            manager: self,
            path: path.to_path_buf(),
        })
    }

    async fn acquire_inner(&self, path: &Path, timeout: Duration) -> io::Result<bool> {
        let lock_path = sidecar_path(path);
        let deadline = deadline_after(timeout);

        loop {
            if let Some(file) = try_lock(&lock_path)? {
                debug!("[lock] Acquired {:?}", lock_path);
                self.held_map().insert(path.to_path_buf(), file);
                return Ok(true);
            }
            if Instant::now() >= deadline {
                debug!("[lock] Timed out waiting for {:?}", lock_path);
                return Ok(false);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Unlock and remove the sidecar. Safe to call when not held.
    pub fn release(&self, path: &Path) {
        let Some(file) = self.held_map().remove(path) else {
            return;
        };
        let lock_path = sidecar_path(path);

        if let Err(e) = unlock(&file) {
            warn!("[lock] Failed to unlock {:?}: {}", lock_path, e);
        }
        drop(file);

        match std::fs::remove_file(&lock_path) {
            Ok(()) => debug!("[lock] Released {:?}", lock_path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("[lock] Lock file {:?} already gone", lock_path)
            }
            Err(e) => warn!("[lock] Failed to remove {:?}: {}", lock_path, e),
        }
    }

    pub fn is_held(&self, path: &Path) -> bool {
        self.held_map().contains_key(path)
    }

    fn held_map(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, File>> {
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Holds a notebook lock until dropped.
pub struct LockGuard<'a> {
    manager: &'a LockManager,
    path: PathBuf,
}

impl LockGuard<'_> {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.manager.release(&self.path);
    }
}

/// One non-blocking attempt. `Ok(None)` means someone else holds it.
fn try_lock(lock_path: &Path) -> io::Result<Option<File>> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(lock_path)?;

    if !lock_exclusive(&file) {
        return Ok(None);
    }

    // The previous holder may have unlinked the sidecar between our open and
    // our flock, leaving us locking an orphaned inode. This narrows the window
    // without closing it: the unlink can still land after the check, and a
    // later caller then locks a fresh sidecar while we hold the old inode.
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        let ours = file.metadata()?;
        match std::fs::metadata(lock_path) {
            Ok(current) if current.dev() == ours.dev() && current.ino() == ours.ino() => {}
            _ => return Ok(None),
        }
    }

    Ok(Some(file))
}

#[cfg(unix)]
fn lock_exclusive(file: &File) -> bool {
    use std::os::unix::io::AsRawFd;
    let fd = file.as_raw_fd();
    let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
    result == 0
}

#[cfg(unix)]
fn unlock(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let fd = file.as_raw_fd();
    let result = unsafe { libc::flock(fd, libc::LOCK_UN) };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(windows)]
fn lock_exclusive(file: &File) -> bool {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::HANDLE;
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };

    let handle = file.as_raw_handle() as HANDLE;
    let result = unsafe {
        let mut overlapped = std::mem::zeroed();
        LockFileEx(
            handle,
            LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
            0,
            1,
            0,
            &mut overlapped,
        )
    };
    result != 0
}

#[cfg(windows)]
fn unlock(file: &File) -> io::Result<()> {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::HANDLE;
    use windows_sys::Win32::Storage::FileSystem::UnlockFile;

    let handle = file.as_raw_handle() as HANDLE;
    let result = unsafe { UnlockFile(handle, 0, 0, 1, 0) };
    if result == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
