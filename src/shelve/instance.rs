use std::hash::Hash;
use std::ops::{Deref, DerefMut};

use parking_lot::{ArcMutexGuard, RawMutex};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{registry, Shelve};
use crate::config::ShelveConfig;
use crate::error::Result;

/// A [`Shelve`] that keeps the store locked for as long as it lives.
///
/// Operations skip the per-call lock round trip and keep the cache warm, but
/// no other thread or process can use the store until this is dropped or
/// [`released`](InstanceLockedShelve::release).
pub struct InstanceLockedShelve<K, V>
where
    K: Serialize + DeserializeOwned + Eq + Hash + Clone,
    V: Serialize + DeserializeOwned,
{
    shelve: Shelve<K, V>,
    _instance: ArcMutexGuard<RawMutex, ()>,
}

impl<K, V> InstanceLockedShelve<K, V>
where
    K: Serialize + DeserializeOwned + Eq + Hash + Clone,
    V: Serialize + DeserializeOwned,
{
    pub fn open(config: impl Into<ShelveConfig>) -> Result<Self> {
        let mut shelve = Shelve::open(config)?;
        let instance = registry::instance_lock(shelve.path())?.lock_arc();
        shelve.pin()?;
        tracing::debug!(path = %shelve.path().display(), "Pinned shelve lock");

        Ok(Self {
            shelve,
            _instance: instance,
        })
    }

    /// Drops the store lock and the instance lock.
    pub fn release(self) {}
}

impl<K, V> Deref for InstanceLockedShelve<K, V>
where
    K: Serialize + DeserializeOwned + Eq + Hash + Clone,
    V: Serialize + DeserializeOwned,
{
    type Target = Shelve<K, V>;

    fn deref(&self) -> &Self::Target {
        &self.shelve
    }
}

impl<K, V> DerefMut for InstanceLockedShelve<K, V>
where
    K: Serialize + DeserializeOwned + Eq + Hash + Clone,
    V: Serialize + DeserializeOwned,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.shelve
    }
}

impl<K, V> Drop for InstanceLockedShelve<K, V>
where
    K: Serialize + DeserializeOwned + Eq + Hash + Clone,
    V: Serialize + DeserializeOwned,
{
    fn drop(&mut self) {
        // The file lock goes first; the instance mutex drops with the fields.
        self.shelve.unpin();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::flock::{canonical_path, FileLock};
    use crate::hasher::lock_file_name;
    use std::panic;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> ShelveConfig {
        ShelveConfig::from(
            Config::new(dir.path().join("pinned.yun"))
                .index_size(1024)
                .block_size(128)
                .lock_dir(dir.path()),
        )
    }

    fn lock_path(dir: &TempDir) -> std::path::PathBuf {
        let data = canonical_path(&dir.path().join("pinned.yun")).unwrap();
        dir.path().join(lock_file_name(&data))
    }

    #[test]
    fn test_holds_lock_until_release() {
        let dir = TempDir::new().unwrap();
        let mut shelve: InstanceLockedShelve<String, u32> =
            InstanceLockedShelve::open(config(&dir)).unwrap();

        shelve.insert("a".to_string(), &1).unwrap();
        assert_eq!(shelve.get(&"a".to_string()).unwrap(), Some(1));
        assert!(FileLock::try_lock(&lock_path(&dir)).unwrap().is_none());

        shelve.release();
        assert!(FileLock::try_lock(&lock_path(&dir)).unwrap().is_some());

        let mut plain: Shelve<String, u32> = Shelve::open(config(&dir)).unwrap();
        assert_eq!(plain.get(&"a".to_string()).unwrap(), Some(1));
    }

    #[test]
    fn test_releases_on_unwind() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir);

        let result = panic::catch_unwind(|| {
            let _shelve: InstanceLockedShelve<String, u32> =
                InstanceLockedShelve::open(cfg.clone()).unwrap();
            panic!("boom");
        });
        assert!(result.is_err());

        assert!(FileLock::try_lock(&lock_path(&dir)).unwrap().is_some());
        let again: InstanceLockedShelve<String, u32> =
            InstanceLockedShelve::open(config(&dir)).unwrap();
        drop(again);
    }
}
