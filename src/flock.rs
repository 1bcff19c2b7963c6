use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

#[cfg(windows)]
use std::os::windows::io::AsRawHandle;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Exclusive advisory lock on a sidecar file, released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Blocks until the lock is held.
    /// The lock file contains the holder's process ID for debugging purposes.
    pub fn lock<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = Self::open(&path)?;

        Self::acquire(&file, true)?;

        Self::stamp(Self { file, path })
    }

    /// Takes the lock only if nobody holds it.
    pub fn try_lock<P: AsRef<Path>>(path: P) -> io::Result<Option<Self>> {
        let path = path.as_ref().to_path_buf();
        let file = Self::open(&path)?;

        match Self::acquire(&file, false) {
            Ok(()) => Self::stamp(Self { file, path }).map(Some),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Polls [`FileLock::try_lock`] until `timeout` has elapsed.
    pub fn lock_timeout<P: AsRef<Path>>(path: P, timeout: Duration) -> io::Result<Self> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(lock) = Self::try_lock(path.as_ref())? {
                return Ok(lock);
            }
            if Instant::now() >= deadline {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("timed out waiting for {}", path.as_ref().display()),
                ));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn open(path: &Path) -> io::Result<File> {
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
    }

    fn stamp(mut lock: Self) -> io::Result<Self> {
        lock.file.set_len(0)?;
        writeln!(lock.file, "{}", std::process::id())?;
        lock.file.flush()?;
        Ok(lock)
    }

    #[cfg(unix)]
    fn acquire(file: &File, block: bool) -> io::Result<()> {
        use libc::{flock, EWOULDBLOCK, LOCK_EX, LOCK_NB};

        let operation = if block { LOCK_EX } else { LOCK_EX | LOCK_NB };
        let fd = file.as_raw_fd();
        loop {
            // SAFETY: fd is a valid descriptor owned by `file`.
            let result = unsafe { flock(fd, operation) };
            if result == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(code) if code == EWOULDBLOCK => {
                    return Err(io::Error::from(io::ErrorKind::WouldBlock))
                }
                _ => return Err(err),
            }
        }
    }

    #[cfg(windows)]
    fn acquire(file: &File, block: bool) -> io::Result<()> {
        use winapi::shared::winerror::ERROR_LOCK_VIOLATION;
        use winapi::um::fileapi::LockFileEx;
        use winapi::um::minwinbase::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, OVERLAPPED};

        let mut flags = LOCKFILE_EXCLUSIVE_LOCK;
        if !block {
            flags |= LOCKFILE_FAIL_IMMEDIATELY;
        }
        let handle = file.as_raw_handle();
        // SAFETY: handle is owned by `file`; the OVERLAPPED is zeroed as LockFileEx expects.
        let result = unsafe {
            let mut overlapped: OVERLAPPED = std::mem::zeroed();
            LockFileEx(handle as *mut _, flags, 0, !0, !0, &mut overlapped)
        };

        if result == 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(ERROR_LOCK_VIOLATION as i32) {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            return Err(err);
        }
        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    fn acquire(_file: &File, _block: bool) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "file locking is not supported on this platform",
        ))
    }

    /// Get the path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Canonical form of `path`, which may not exist yet. Two spellings of the
/// same file resolve to the same value.
pub fn canonical_path(path: &Path) -> io::Result<PathBuf> {
    if let Ok(resolved) = path.canonicalize() {
        return Ok(resolved);
    }
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut resolved = parent.canonicalize()?;
    if let Some(name) = path.file_name() {
        resolved.push(name);
    }
    Ok(resolved)
}

impl FileLock {
    #[cfg(unix)]
    fn release(&self) {
        // SAFETY: fd is a valid descriptor owned by `self.file`.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }

    #[cfg(windows)]
    fn release(&self) {
        // SAFETY: handle is owned by `self.file`.
        unsafe {
            winapi::um::fileapi::UnlockFile(self.file.as_raw_handle() as *mut _, 0, 0, !0, !0);
        }
    }

    #[cfg(not(any(unix, windows)))]
    fn release(&self) {}
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // The lock file itself stays behind so waiters keep a stable inode.
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_lock_records_pid() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let lock_path = dir.path().join("db.lock");

        let lock = FileLock::lock(&lock_path).expect("Failed to acquire lock");

        assert!(lock_path.exists());
        let content = fs::read_to_string(&lock_path).expect("Failed to read lock file");
        assert_eq!(content.trim(), std::process::id().to_string());
        assert_eq!(lock.path(), lock_path.as_path());
    }

    #[test]
    fn test_double_lock() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let lock_path = dir.path().join("db.lock");

        let _lock1 = FileLock::lock(&lock_path).expect("Failed to acquire first lock");

        // flock locks belong to the open file description, so a second
        // open in the same process is refused.
        let lock2 = FileLock::try_lock(&lock_path).expect("try_lock failed");
        assert!(lock2.is_none());
    }

    #[test]
    fn test_auto_unlock_on_drop() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let lock_path = dir.path().join("db.lock");

        {
            let _lock = FileLock::lock(&lock_path).expect("Failed to acquire lock");
        }

        let lock2 = FileLock::try_lock(&lock_path).expect("try_lock failed");
        assert!(lock2.is_some());
    }

    #[test]
    fn test_canonical_path_merges_spellings() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let plain = dir.path().join("data.yun");
        let dotted = dir.path().join(".").join("data.yun");

        // Not created yet, then created.
        assert_eq!(canonical_path(&plain).unwrap(), canonical_path(&dotted).unwrap());
        fs::write(&plain, b"x").unwrap();
        assert_eq!(canonical_path(&plain).unwrap(), canonical_path(&dotted).unwrap());

        assert!(canonical_path(&dir.path().join("missing").join("data.yun")).is_err());
    }

    #[test]
    fn test_lock_timeout_expires() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let lock_path = dir.path().join("db.lock");

        let _held = FileLock::lock(&lock_path).expect("Failed to acquire lock");
        let err = FileLock::lock_timeout(&lock_path, Duration::from_millis(30))
            .expect_err("lock should time out");
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_blocking_lock_waits_for_release() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let lock_path = dir.path().join("db.lock");

        let held = FileLock::lock(&lock_path).expect("Failed to acquire lock");
        let waiter = {
            let lock_path = lock_path.clone();
            thread::spawn(move || {
                let start = Instant::now();
                let _lock = FileLock::lock(&lock_path).expect("Failed to acquire lock");
                start.elapsed()
            })
        };

        thread::sleep(Duration::from_millis(50));
        drop(held);

        let waited = waiter.join().expect("waiter panicked");
        assert!(waited >= Duration::from_millis(40));
    }
}
