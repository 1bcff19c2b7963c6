//! Process-wide mutexes keyed by store path.
//!
//! The file lock already orders access between processes. These mutexes order
//! the shelves of one process, so two threads never interleave the read and
//! write halves of a key-set update. Entries live for the whole process.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::error::Result;
use crate::flock::canonical_path;

pub type PathLock = Arc<Mutex<()>>;

type Registry = Lazy<Mutex<HashMap<PathBuf, PathLock>>>;

static SHELVE_LOCKS: Registry = Lazy::new(|| Mutex::new(HashMap::with_capacity(16)));
static INSTANCE_LOCKS: Registry = Lazy::new(|| Mutex::new(HashMap::with_capacity(16)));

/// Mutex shared by every shelve operating on `path`.
pub fn shelve_lock(path: &Path) -> Result<PathLock> {
    lookup(&SHELVE_LOCKS, path)
}

/// Mutex held by an instance-locked shelve for its whole lifetime.
pub fn instance_lock(path: &Path) -> Result<PathLock> {
    lookup(&INSTANCE_LOCKS, path)
}

fn lookup(registry: &Registry, path: &Path) -> Result<PathLock> {
    let key = canonical_path(path)?;
    let mut locks = registry.lock();
    Ok(Arc::clone(locks.entry(key).or_default()))
}
