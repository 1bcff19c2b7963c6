//! Lock/cache guard.
//!
//! All access to a data file goes through [`Guard::acquire`], which takes the
//! cross-process lock, opens the file and decides whether the in-memory
//! [`CacheState`] can still be trusted. The returned [`Access`] releases the
//! file handle and then the lock when dropped.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{Cache, KeyPositions};
use crate::config::Config;
use crate::error::Result;
use crate::flock::{canonical_path, FileLock};
use crate::hasher::lock_file_name;
use crate::index::{IndexCell, IndexHeader, SESSION_OFFSET};
use crate::session::{Session, SESSION_SIZE};
use crate::Error;

/// Everything cached about one data file between lock acquisitions.
pub struct CacheState {
    /// Segment chain as `(segment offset, header)`, loaded on first use.
    pub indexes: Option<Vec<(u64, IndexHeader)>>,
    /// Decoded cells keyed by file offset.
    pub cells: BTreeMap<u64, IndexCell>,
    pub keypos: KeyPositions,
    pub blocks: Cache<Vec<u8>, Vec<u8>>,
    /// Cell offset to the offset of the segment that owns it.
    pub index_cell_translation: HashMap<u64, u64>,
    /// Segments whose cells are all present in `cells`.
    pub safe_indexes: HashSet<u64>,
    capacity: usize,
    generation: u64,
}

impl CacheState {
    pub fn new(capacity: usize) -> Self {
        Self {
            indexes: None,
            cells: BTreeMap::new(),
            keypos: KeyPositions::new(capacity),
            blocks: Cache::new(capacity),
            index_cell_translation: HashMap::new(),
            safe_indexes: HashSet::new(),
            capacity,
            generation: 0,
        }
    }

    /// Drops everything and starts a new generation.
    pub fn reset(&mut self) {
        let generation = self.generation + 1;
        *self = Self::new(self.capacity);
        self.generation = generation;
    }

    /// Incremented on every reset; lets upper layers tie their own caches
    /// to the lifetime of this one.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Invalidates what a write to the cell at `position` makes stale.
    pub fn mark_cell_modified(&mut self, position: u64) {
        self.keypos.remove_position(position);
        self.cells.remove(&position);
        if let Some(segment) = self.index_cell_translation.get(&position) {
            self.safe_indexes.remove(segment);
        }
    }
}

/// Lock file and data file handles of one acquisition. Fields drop in
/// order, so the data file is closed before the lock is released.
struct Held {
    file: File,
    _lock: FileLock,
}

struct Target {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Option<Duration>,
    instance: [u8; 4],
}

pub struct Guard {
    target: Target,
    cache: CacheState,
    pinned: Option<Held>,
}

impl Guard {
    /// The lock file is named after the canonical data path, so every
    /// spelling of one file shares a lock.
    pub fn new(config: &Config) -> Result<Self> {
        let canonical = canonical_path(&config.path)?;
        let lock_path = config.lock_dir.join(lock_file_name(&canonical));
        Ok(Self {
            target: Target {
                path: config.path.clone(),
                lock_path,
                lock_timeout: config.lock_timeout,
                instance: rand::random(),
            },
            cache: CacheState::new(config.cache_capacity),
            pinned: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.target.path
    }

    pub fn lock_path(&self) -> &Path {
        &self.target.lock_path
    }

    pub fn cache(&self) -> &CacheState {
        &self.cache
    }

    /// Takes the lock, or reuses the pinned acquisition if there is one.
    pub fn acquire(&mut self) -> Result<Access<'_>> {
        let lease = match self.pinned.as_mut() {
            Some(held) => Lease::Pinned(held),
            None => Lease::Scoped(open(&self.target, &mut self.cache)?),
        };
        Ok(Access {
            lease,
            cache: &mut self.cache,
        })
    }

    /// Holds the lock until [`Guard::unpin`] or drop.
    pub fn pin(&mut self) -> Result<()> {
        if self.pinned.is_none() {
            self.pinned = Some(open(&self.target, &mut self.cache)?);
        }
        Ok(())
    }

    pub fn unpin(&mut self) {
        self.pinned = None;
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned.is_some()
    }
}

fn open(target: &Target, cache: &mut CacheState) -> Result<Held> {
    let lock = match target.lock_timeout {
        Some(timeout) => FileLock::lock_timeout(&target.lock_path, timeout).map_err(|e| {
            tracing::warn!(
                path = %target.path.display(),
                timeout_ms = timeout.as_millis() as u64,
                "Timed out waiting for store lock"
            );
            Error::LockError(e)
        })?,
        None => FileLock::lock(&target.lock_path).map_err(Error::LockError)?,
    };

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&target.path)?;

    let session = Session::current(target.instance).encode();
    let len = file.metadata()?.len();

    let same = if len >= (SESSION_OFFSET + SESSION_SIZE) as u64 {
        let mut stored = [0u8; SESSION_SIZE];
        file.seek(SeekFrom::Start(SESSION_OFFSET as u64))?;
        file.read_exact(&mut stored)?;
        stored == session
    } else {
        false
    };

    if !same {
        let (hits, misses) = cache.blocks.stats();
        tracing::debug!(
            path = %target.path.display(),
            generation = cache.generation() + 1,
            cached_blocks = cache.blocks.len(),
            hits,
            misses,
            "Session changed, discarding cache"
        );
        cache.reset();
        if len != 0 {
            file.seek(SeekFrom::Start(SESSION_OFFSET as u64))?;
            file.write_all(&session)?;
        }
    }

    Ok(Held { file, _lock: lock })
}

enum Lease<'a> {
    Pinned(&'a mut Held),
    Scoped(Held),
}

/// One lock acquisition: the open data file plus the cache it validated.
pub struct Access<'a> {
    lease: Lease<'a>,
    pub cache: &'a mut CacheState,
}

impl Access<'_> {
    pub fn file(&mut self) -> &mut File {
        match &mut self.lease {
            Lease::Pinned(held) => &mut held.file,
            Lease::Scoped(held) => &mut held.file,
        }
    }

    pub fn is_pinned(&self) -> bool {
        matches!(self.lease, Lease::Pinned(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flock::FileLock;
    use crate::index::Layout;
    use std::fs;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> Config {
        let path = dir.path().join("guard.yun");
        let layout = Layout::new(128, 32).unwrap();
        fs::write(&path, layout.blank_segment().unwrap()).unwrap();
        Config::new(path).lock_dir(dir.path())
    }

    fn stored_session(path: &Path) -> [u8; SESSION_SIZE] {
        let bytes = fs::read(path).unwrap();
        let mut out = [0u8; SESSION_SIZE];
        out.copy_from_slice(&bytes[SESSION_OFFSET..SESSION_OFFSET + SESSION_SIZE]);
        out
    }

    #[test]
    fn test_session_written_after_identity_header() {
        let dir = TempDir::new().unwrap();
        let config = setup(&dir);
        let mut guard = Guard::new(&config).unwrap();

        drop(guard.acquire().unwrap());

        let bytes = fs::read(&config.path).unwrap();
        assert_eq!(&bytes[..24], b"################YUNYUN01");
        let session = Session::decode(&stored_session(&config.path));
        assert_eq!(session.process_id, std::process::id());
        assert_eq!(session.instance, guard.target.instance);
    }

    #[test]
    fn test_cache_survives_own_reacquisition() {
        let dir = TempDir::new().unwrap();
        let config = setup(&dir);
        let mut guard = Guard::new(&config).unwrap();

        {
            let access = guard.acquire().unwrap();
            access.cache.blocks.insert(b"k".to_vec(), b"v".to_vec());
        }
        let generation = guard.cache().generation();

        let access = guard.acquire().unwrap();
        assert_eq!(access.cache.generation(), generation);
        assert!(access.cache.blocks.contains(&b"k"[..]));
    }

    #[test]
    fn test_other_instance_invalidates_cache() {
        let dir = TempDir::new().unwrap();
        let config = setup(&dir);
        let mut first = Guard::new(&config).unwrap();
        let mut second = Guard::new(&config).unwrap();

        {
            let access = first.acquire().unwrap();
            access.cache.blocks.insert(b"k".to_vec(), b"v".to_vec());
            assert!(access.cache.blocks.get(&b"k"[..]).is_some());
        }
        let generation = first.cache().generation();
        assert_eq!(first.cache().blocks.stats(), (1, 0));

        drop(second.acquire().unwrap());

        let access = first.acquire().unwrap();
        assert_eq!(access.cache.generation(), generation + 1);
        assert_eq!(access.cache.blocks.len(), 0);
        assert_eq!(access.cache.blocks.stats(), (0, 0));
    }

    #[test]
    fn test_empty_file_gets_no_session() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.yun");
        fs::write(&path, b"").unwrap();
        let mut guard = Guard::new(&Config::new(&path).lock_dir(dir.path())).unwrap();

        drop(guard.acquire().unwrap());
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn test_access_holds_the_lock() {
        let dir = TempDir::new().unwrap();
        let config = setup(&dir);
        let mut guard = Guard::new(&config).unwrap();
        let lock_path = guard.lock_path().to_path_buf();

        {
            let _access = guard.acquire().unwrap();
            assert!(FileLock::try_lock(&lock_path).unwrap().is_none());
        }
        assert!(FileLock::try_lock(&lock_path).unwrap().is_some());
    }

    #[test]
    fn test_path_spellings_share_one_lock() {
        let dir = TempDir::new().unwrap();
        let config = setup(&dir).lock_timeout(Duration::from_millis(50));
        let dotted = Config {
            path: dir.path().join(".").join("guard.yun"),
            ..config.clone()
        };

        let mut first = Guard::new(&config).unwrap();
        let mut second = Guard::new(&dotted).unwrap();
        assert_eq!(first.lock_path(), second.lock_path());

        first.pin().unwrap();
        assert!(matches!(second.acquire(), Err(Error::LockError(_))));
        first.unpin();
        assert!(second.acquire().is_ok());
    }

    #[test]
    fn test_pinned_guard_keeps_lock_between_acquisitions() {
        let dir = TempDir::new().unwrap();
        let config = setup(&dir);
        let mut guard = Guard::new(&config).unwrap();
        let lock_path = guard.lock_path().to_path_buf();

        guard.pin().unwrap();
        {
            let access = guard.acquire().unwrap();
            assert!(access.is_pinned());
        }
        assert!(FileLock::try_lock(&lock_path).unwrap().is_none());

        guard.unpin();
        assert!(FileLock::try_lock(&lock_path).unwrap().is_some());
    }

    #[test]
    fn test_lock_timeout_surfaces_lock_error() {
        let dir = TempDir::new().unwrap();
        let config = setup(&dir).lock_timeout(Duration::from_millis(20));
        let mut holder = Guard::new(&config).unwrap();
        let mut waiter = Guard::new(&config).unwrap();

        holder.pin().unwrap();
        match waiter.acquire() {
            Err(Error::LockError(e)) => assert_eq!(e.kind(), std::io::ErrorKind::TimedOut),
            Err(other) => panic!("unexpected error {:?}", other),
            Ok(_) => panic!("lock should not be available"),
        }
    }

    #[test]
    fn test_mark_cell_modified_is_local() {
        let mut cache = CacheState::new(16);
        cache.cells.insert(100, IndexCell::default());
        cache.cells.insert(124, IndexCell::default());
        cache.index_cell_translation.insert(100, 0);
        cache.index_cell_translation.insert(124, 0);
        cache.safe_indexes.insert(0);
        cache.safe_indexes.insert(4096);
        cache.keypos.set(b"a", 100);
        cache.keypos.set(b"b", 124);

        cache.mark_cell_modified(100);

        assert!(!cache.cells.contains_key(&100));
        assert!(cache.cells.contains_key(&124));
        assert_eq!(cache.keypos.get(b"a"), None);
        assert_eq!(cache.keypos.get(b"b"), Some(124));
        assert!(!cache.safe_indexes.contains(&0));
        assert!(cache.safe_indexes.contains(&4096));
    }
}
