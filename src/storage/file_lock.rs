//! OS-level named locks backed by lock files.
//!
//! Every key maps to one file in the lock directory. Holding a key means
//! holding an exclusive, non-blocking `flock` (unix) or `LockFileEx`
//! (windows) on that file. The OS drops the lock when the handle closes, so
//! a session that is dropped or a process that dies releases everything it
//! held.
//!
//! # Safety
//! - File names are the hex encoding of the key, so distinct keys never
//!   share a file
//! - Lock files are created on demand and never deleted

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::storage::traits::{LockBackend, LockKey, LockSession, StorageError};

const LOCK_FILE_SUFFIX: &str = ".lock";

/// Longest key whose encoded file name fits common 255-byte name limits.
const MAX_KEY_BYTES: usize = (255 - LOCK_FILE_SUFFIX.len()) / 2;

/// Named-lock backend rooted at a lock directory.
#[derive(Debug, Clone)]
pub struct FileLockBackend {
    dir: PathBuf,
}

impl FileLockBackend {
    /// Opens a backend in `dir`, creating the directory if needed.
    ///
    /// # Errors
    /// Returns `StorageError::Io` if the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// The lock directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the lock file guarding `key`.
    ///
    /// # Errors
    /// Returns `StorageError::InvalidLockKey` for empty or over-long keys.
    pub fn lock_path(&self, key: &LockKey) -> Result<PathBuf, StorageError> {
        lock_path(&self.dir, key)
    }
}

fn lock_path(dir: &Path, key: &LockKey) -> Result<PathBuf, StorageError> {
    let raw = key.as_str().as_bytes();
    if raw.is_empty() {
        return Err(StorageError::InvalidLockKey {
            key: key.to_string(),
            reason: "key is empty".to_string(),
        });
    }
    if raw.len() > MAX_KEY_BYTES {
        return Err(StorageError::InvalidLockKey {
            key: key.to_string(),
            reason: format!("key exceeds {MAX_KEY_BYTES} bytes"),
        });
    }
    Ok(dir.join(format!("{}{LOCK_FILE_SUFFIX}", hex::encode(raw))))
}

impl LockBackend for FileLockBackend {
    fn open_session(&self) -> Result<Box<dyn LockSession>, StorageError> {
        Ok(Box::new(FileLockSession {
            dir: self.dir.clone(),
            held: HashMap::new(),
        }))
    }
}

/// Open lock-file handles of one session. Closing a handle unlocks it.
#[derive(Debug)]
struct FileLockSession {
    dir: PathBuf,
    held: HashMap<LockKey, File>,
}

impl LockSession for FileLockSession {
    fn try_acquire(&mut self, key: &LockKey) -> Result<bool, StorageError> {
        if self.held.contains_key(key) {
            return Ok(true);
        }
        let path = lock_path(&self.dir, key)?;
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        match try_lock(&file) {
            Ok(()) => {
                debug!(key = %key, path = %path.display(), "lock file acquired");
                self.held.insert(key.clone(), file);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    fn release(&mut self, key: &LockKey) -> Result<bool, StorageError> {
        // Dropping the handle closes it, which releases the OS lock.
        Ok(self.held.remove(key).is_some())
    }
}

#[cfg(unix)]
fn try_lock(file: &File) -> IoResult<()> {
    use std::os::unix::io::AsRawFd;

    let fd = file.as_raw_fd();
    // SAFETY: `fd` is a valid descriptor owned by `file` for the whole call.
    let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

    if result != 0 {
        let errno = IoError::last_os_error();
        if errno.raw_os_error() == Some(libc::EWOULDBLOCK) {
            return Err(IoError::new(
                ErrorKind::WouldBlock,
                "lock is held by another session",
            ));
        }
        return Err(errno);
    }

    Ok(())
}

#[cfg(windows)]
fn try_lock(file: &File) -> IoResult<()> {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::{ERROR_LOCK_VIOLATION, HANDLE};
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };

    let handle = file.as_raw_handle() as HANDLE;
    // SAFETY: `handle` is owned by `file`; `overlapped` outlives the call.
    let result = unsafe {
        let mut overlapped = std::mem::zeroed::<windows_sys::Win32::System::IO::OVERLAPPED>();
        LockFileEx(
            handle,
            LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
            0,
            1,
            0,
            &mut overlapped,
        )
    };

    if result == 0 {
        let err = IoError::last_os_error();
        if err.raw_os_error() == Some(ERROR_LOCK_VIOLATION as i32) {
            return Err(IoError::new(
                ErrorKind::WouldBlock,
                "lock is held by another session",
            ));
        }
        return Err(err);
    }

    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn try_lock(_file: &File) -> IoResult<()> {
    Err(IoError::new(
        ErrorKind::Unsupported,
        "file locking not supported on this platform",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_lock_acquire_release() {
        let dir = tempdir().unwrap();
        let backend = FileLockBackend::new(dir.path().join("locks")).unwrap();
        let key = LockKey::for_profile("p-1");

        let mut session = backend.open_session().unwrap();
        assert!(session.try_acquire(&key).unwrap());
        assert!(backend.lock_path(&key).unwrap().exists());
        assert!(session.release(&key).unwrap());
        assert!(!session.release(&key).unwrap());
    }

    #[test]
    fn test_lock_prevents_second_session() {
        let dir = tempdir().unwrap();
        let backend = FileLockBackend::new(dir.path()).unwrap();
        let key = LockKey::for_profile("p-1");

        let mut first = backend.open_session().unwrap();
        let mut second = backend.open_session().unwrap();
        assert!(first.try_acquire(&key).unwrap());
        assert!(first.try_acquire(&key).unwrap());
        assert!(!second.try_acquire(&key).unwrap());
        assert!(second.try_acquire(&LockKey::for_profile("p-2")).unwrap());

        drop(first);
        assert!(second.try_acquire(&key).unwrap());
    }

    #[test]
    fn test_keys_map_to_distinct_files() {
        let dir = tempdir().unwrap();
        let backend = FileLockBackend::new(dir.path()).unwrap();
        let a = backend.lock_path(&LockKey::for_profile("a/b")).unwrap();
        let b = backend.lock_path(&LockKey::for_profile("a_b")).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.parent(), Some(dir.path()));
    }

    #[test]
    fn test_rejects_unrepresentable_keys() {
        let dir = tempdir().unwrap();
        let backend = FileLockBackend::new(dir.path()).unwrap();
        let mut session = backend.open_session().unwrap();

        let long = LockKey::for_profile("x".repeat(MAX_KEY_BYTES + 1));
        assert!(matches!(
            session.try_acquire(&long),
            Err(StorageError::InvalidLockKey { .. })
        ));
        assert!(matches!(
            session.try_acquire(&LockKey::for_profile("")),
            Err(StorageError::InvalidLockKey { .. })
        ));
        assert!(session
            .try_acquire(&LockKey::for_profile("x".repeat(MAX_KEY_BYTES)))
            .unwrap());
    }
}
