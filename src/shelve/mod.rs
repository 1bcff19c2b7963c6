//! Persistent map on top of multi-block nodes.
//!
//! Every key is serialized with bincode and hashed with SHA-256; the digest
//! names the node holding the bincode-encoded value. The set of live keys is
//! kept LZ4-compressed in a dedicated node so the map can be enumerated.

mod instance;
pub mod registry;

pub use instance::InstanceLockedShelve;

use std::collections::HashSet;
use std::hash::Hash;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::ShelveConfig;
use crate::encoding::{bincode, compress};
use crate::error::Result;
use crate::hasher::sha256;
use crate::multiblock::MultiblockHandler;
use crate::store::Locked;
use crate::Error;

use registry::PathLock;

/// Smallest block size a shelve accepts.
pub const MIN_SHELVE_BLOCK_SIZE: usize = 96;

/// Node holding the key set, named the way a value stored under the byte
/// string `__KEYS__` would be. That key is refused by [`node_key`].
static KEYS_NODE: Lazy<[u8; 32]> = Lazy::new(|| {
    let name = b"__KEYS__";
    // bincode layout of a byte string: u64 LE length, then the bytes.
    let mut encoded = (name.len() as u64).to_le_bytes().to_vec();
    encoded.extend_from_slice(name);
    sha256(&encoded)
});

pub struct Shelve<K, V> {
    nodes: MultiblockHandler,
    lock: PathLock,
    track_keys: bool,
    /// Decoded key set and the cache generation it was read under.
    keys: Option<(u64, HashSet<K>)>,
    _value: PhantomData<fn() -> V>,
}

impl<K, V> Shelve<K, V>
where
    K: Serialize + DeserializeOwned + Eq + Hash + Clone,
    V: Serialize + DeserializeOwned,
{
    pub fn open(config: impl Into<ShelveConfig>) -> Result<Self> {
        let config = config.into();
        let mut nodes = MultiblockHandler::open(config.store.clone())?;

        if nodes.block_size() < MIN_SHELVE_BLOCK_SIZE {
            return Err(Error::InvalidFormat(format!(
                "Shelve mapping block size must be at least {} bytes, store has {}.",
                MIN_SHELVE_BLOCK_SIZE,
                nodes.block_size()
            )));
        }

        let lock = registry::shelve_lock(&config.store.path)?;
        {
            let mut locked = nodes.lock()?;
            let _held = lock.lock();
            if !locked.node_exists(&KEYS_NODE[..])? {
                locked.make_node(&KEYS_NODE[..])?;
                locked.write_node(&KEYS_NODE[..], &encode_keys(&HashSet::<K>::new())?)?;
                tracing::info!(path = %config.store.path.display(), "Initialized shelve");
            }
        }

        Ok(Self {
            nodes,
            lock,
            track_keys: config.track_keys,
            keys: None,
            _value: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        self.nodes.store().path()
    }

    pub fn track_keys(&self) -> bool {
        self.track_keys
    }

    /// Turns key tracking on or off. Keys written while tracking is off are
    /// not added to the key set.
    pub fn set_track_keys(&mut self, enabled: bool) {
        self.track_keys = enabled;
    }

    pub fn get(&mut self, key: &K) -> Result<Option<V>> {
        let node = node_key(key)?;
        let lock = Arc::clone(&self.lock);
        let mut locked = self.nodes.lock()?;
        let _held = lock.lock();

        if !locked.node_exists(&node)? {
            return Ok(None);
        }
        match locked.read_node(&node) {
            Ok(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn contains_key(&mut self, key: &K) -> Result<bool> {
        let node = node_key(key)?;
        let lock = Arc::clone(&self.lock);
        let mut locked = self.nodes.lock()?;
        let _held = lock.lock();
        locked.node_exists(&node)
    }

    pub fn insert(&mut self, key: K, value: &V) -> Result<()> {
        let node = node_key(&key)?;
        let value = bincode::serialize(value)?;

        let lock = Arc::clone(&self.lock);
        let mut locked = self.nodes.lock()?;
        let _held = lock.lock();

        locked.write_node(&node, &value)?;

        if self.track_keys {
            let keys = load_keys(&mut locked, &mut self.keys)?;
            if keys.insert(key) {
                let packed = encode_keys(keys)?;
                if let Err(e) = locked.write_node(&KEYS_NODE[..], &packed) {
                    self.keys = None;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Removes `key`. Fails with [`Error::KeyNotFound`] when it is not
    /// present.
    pub fn remove(&mut self, key: &K) -> Result<()> {
        let node = node_key(key)?;
        let lock = Arc::clone(&self.lock);
        let mut locked = self.nodes.lock()?;
        let _held = lock.lock();

        if self.track_keys && !load_keys(&mut locked, &mut self.keys)?.contains(key) {
            return Err(Error::KeyNotFound);
        }

        match locked.remove_node(&node) {
            Ok(()) => {}
            // A tracked key whose node is gone is still dropped from the set.
            Err(e) if e.is_not_found() && self.track_keys => {}
            Err(e) if e.is_not_found() => return Err(Error::KeyNotFound),
            Err(e) => return Err(e),
        }

        if self.track_keys {
            let keys = load_keys(&mut locked, &mut self.keys)?;
            keys.remove(key);
            let packed = encode_keys(keys)?;
            if let Err(e) = locked.write_node(&KEYS_NODE[..], &packed) {
                self.keys = None;
                return Err(e);
            }
        }
        Ok(())
    }

    /// All tracked keys, or `None` when key tracking is off.
    pub fn keys(&mut self) -> Result<Option<Vec<K>>> {
        if !self.track_keys {
            return Ok(None);
        }
        let lock = Arc::clone(&self.lock);
        let mut locked = self.nodes.lock()?;
        let _held = lock.lock();
        let keys = load_keys(&mut locked, &mut self.keys)?;
        Ok(Some(keys.iter().cloned().collect()))
    }

    pub fn len(&mut self) -> Result<Option<usize>> {
        if !self.track_keys {
            return Ok(None);
        }
        let lock = Arc::clone(&self.lock);
        let mut locked = self.nodes.lock()?;
        let _held = lock.lock();
        Ok(Some(load_keys(&mut locked, &mut self.keys)?.len()))
    }

    pub fn is_empty(&mut self) -> Result<Option<bool>> {
        Ok(self.len()?.map(|len| len == 0))
    }

    fn pin(&mut self) -> Result<()> {
        self.nodes.store_mut().pin()
    }

    fn unpin(&mut self) {
        self.nodes.store_mut().unpin()
    }
}

fn node_key<K: Serialize>(key: &K) -> Result<[u8; 32]> {
    let digest = sha256(&bincode::serialize(key)?);
    if digest == *KEYS_NODE {
        return Err(Error::InvalidOperation(
            "key encodes the same as the reserved key set name".to_string(),
        ));
    }
    Ok(digest)
}

fn encode_keys<K: Serialize + Eq + Hash>(keys: &HashSet<K>) -> Result<Vec<u8>> {
    Ok(compress::compress(&bincode::serialize(keys)?))
}

/// The key set as of the current lock acquisition, read from disk unless the
/// copy in `cache` was loaded under the same cache generation.
fn load_keys<'c, K>(
    locked: &mut Locked<'_>,
    cache: &'c mut Option<(u64, HashSet<K>)>,
) -> Result<&'c mut HashSet<K>>
where
    K: DeserializeOwned + Eq + Hash,
{
    let generation = locked.cache_generation();
    if matches!(cache, Some((loaded, _)) if *loaded != generation) {
        *cache = None;
    }

    match cache {
        Some((_, keys)) => Ok(keys),
        None => {
            let packed = locked.read_node(&KEYS_NODE[..])?;
            let keys: HashSet<K> = bincode::deserialize(&compress::decompress(&packed)?)?;
            tracing::debug!(generation, keys = keys.len(), "Loaded shelve key set");
            Ok(&mut cache.insert((generation, keys)).1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use serde::Deserialize;
    use std::thread;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Record {
        id: u64,
        name: String,
        tags: Vec<String>,
    }

    fn config(dir: &TempDir) -> ShelveConfig {
        ShelveConfig::from(
            Config::new(dir.path().join("shelve.yun"))
                .index_size(1024)
                .block_size(128)
                .lock_dir(dir.path()),
        )
    }

    fn record(id: u64) -> Record {
        Record {
            id,
            name: format!("record-{}", id),
            tags: vec!["a".into(), "b".into()],
        }
    }

    #[test]
    fn test_insert_get_remove() {
        let dir = TempDir::new().unwrap();
        let mut shelve: Shelve<String, Record> = Shelve::open(config(&dir)).unwrap();

        assert_eq!(shelve.get(&"one".to_string()).unwrap(), None);
        assert_eq!(shelve.len().unwrap(), Some(0));
        assert_eq!(shelve.is_empty().unwrap(), Some(true));

        shelve.insert("one".to_string(), &record(1)).unwrap();
        shelve.insert("two".to_string(), &record(2)).unwrap();
        assert_eq!(shelve.get(&"one".to_string()).unwrap(), Some(record(1)));
        assert!(shelve.contains_key(&"two".to_string()).unwrap());
        assert_eq!(shelve.len().unwrap(), Some(2));

        shelve.insert("one".to_string(), &record(11)).unwrap();
        assert_eq!(shelve.get(&"one".to_string()).unwrap(), Some(record(11)));
        assert_eq!(shelve.len().unwrap(), Some(2));

        shelve.remove(&"one".to_string()).unwrap();
        assert_eq!(shelve.get(&"one".to_string()).unwrap(), None);
        assert!(matches!(
            shelve.remove(&"one".to_string()),
            Err(Error::KeyNotFound)
        ));

        let mut keys = shelve.keys().unwrap().unwrap();
        keys.sort();
        assert_eq!(keys, vec!["two".to_string()]);
    }

    #[test]
    fn test_large_values_span_blocks() {
        let dir = TempDir::new().unwrap();
        let mut shelve: Shelve<u32, Vec<u8>> = Shelve::open(config(&dir)).unwrap();

        let big: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        shelve.insert(7, &big).unwrap();
        assert_eq!(shelve.get(&7).unwrap(), Some(big));

        shelve.insert(7, &vec![1, 2, 3]).unwrap();
        assert_eq!(shelve.get(&7).unwrap(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut shelve: Shelve<String, u64> = Shelve::open(config(&dir)).unwrap();
            for i in 0..20u64 {
                shelve.insert(format!("k{}", i), &(i * i)).unwrap();
            }
        }

        let mut shelve: Shelve<String, u64> = Shelve::open(config(&dir)).unwrap();
        assert_eq!(shelve.len().unwrap(), Some(20));
        assert_eq!(shelve.get(&"k9".to_string()).unwrap(), Some(81));
    }

    #[test]
    fn test_key_set_node_name() {
        let dir = TempDir::new().unwrap();
        {
            let mut shelve: Shelve<String, u64> = Shelve::open(config(&dir)).unwrap();
            shelve.insert("a".to_string(), &1).unwrap();
        }

        let mut nodes = MultiblockHandler::open(config(&dir).store).unwrap();
        let name = sha256(&bincode::serialize(&b"__KEYS__"[..]).unwrap());
        assert!(nodes.node_exists(&name).unwrap());
        assert!(!nodes.node_exists(b"__KEYS__").unwrap());

        let packed = nodes.read_node(&name).unwrap();
        let keys: HashSet<String> =
            bincode::deserialize(&compress::decompress(&packed).unwrap()).unwrap();
        assert_eq!(keys, HashSet::from(["a".to_string()]));
    }

    #[test]
    fn test_reserved_key_refused() {
        let dir = TempDir::new().unwrap();
        let mut shelve: Shelve<String, u64> = Shelve::open(config(&dir)).unwrap();
        shelve.insert("a".to_string(), &1).unwrap();

        assert!(matches!(
            shelve.insert("__KEYS__".to_string(), &2),
            Err(Error::InvalidOperation(_))
        ));
        assert_eq!(shelve.keys().unwrap().unwrap(), vec!["a".to_string()]);

        let mut bytes: Shelve<Vec<u8>, u64> = Shelve::open(config(&dir)).unwrap();
        assert!(matches!(
            bytes.get(&b"__KEYS__".to_vec()),
            Err(Error::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_without_key_tracking() {
        let dir = TempDir::new().unwrap();
        let mut shelve: Shelve<String, u64> =
            Shelve::open(config(&dir).track_keys(false)).unwrap();

        shelve.insert("k".to_string(), &1).unwrap();
        assert_eq!(shelve.get(&"k".to_string()).unwrap(), Some(1));
        assert_eq!(shelve.keys().unwrap(), None);
        assert_eq!(shelve.len().unwrap(), None);
        assert_eq!(shelve.is_empty().unwrap(), None);

        shelve.remove(&"k".to_string()).unwrap();
        assert!(!shelve.contains_key(&"k".to_string()).unwrap());
        assert!(matches!(
            shelve.remove(&"k".to_string()),
            Err(Error::KeyNotFound)
        ));

        // Untracked inserts stay out of the key set.
        shelve.insert("hidden".to_string(), &2).unwrap();
        shelve.set_track_keys(true);
        assert_eq!(shelve.len().unwrap(), Some(0));
    }

    #[test]
    fn test_rejects_small_blocks() {
        let dir = TempDir::new().unwrap();
        let config = ShelveConfig::from(
            Config::new(dir.path().join("small.yun"))
                .index_size(1024)
                .block_size(64)
                .lock_dir(dir.path()),
        );
        let result: Result<Shelve<String, String>> = Shelve::open(config);
        assert!(matches!(result, Err(Error::InvalidFormat(_))));
    }

    #[test]
    fn test_two_shelves_share_key_set() {
        let dir = TempDir::new().unwrap();
        let mut a: Shelve<String, String> = Shelve::open(config(&dir)).unwrap();
        let mut b: Shelve<String, String> = Shelve::open(config(&dir)).unwrap();

        a.insert("from-a".to_string(), &"1".to_string()).unwrap();
        assert_eq!(b.len().unwrap(), Some(1));
        b.insert("from-b".to_string(), &"2".to_string()).unwrap();
        assert_eq!(a.len().unwrap(), Some(2));
        assert_eq!(
            a.get(&"from-b".to_string()).unwrap(),
            Some("2".to_string())
        );
    }

    #[test]
    fn test_threads_with_own_shelves() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir);
        drop(Shelve::<u32, u32>::open(cfg.clone()).unwrap());

        let workers: Vec<_> = (0..4u32)
            .map(|t| {
                let cfg = cfg.clone();
                thread::spawn(move || {
                    let mut shelve: Shelve<u32, u32> = Shelve::open(cfg).unwrap();
                    for i in 0..10 {
                        shelve.insert(t * 100 + i, &(t + i)).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("worker panicked");
        }

        let mut shelve: Shelve<u32, u32> = Shelve::open(cfg).unwrap();
        assert_eq!(shelve.len().unwrap(), Some(40));
        assert_eq!(shelve.get(&305).unwrap(), Some(8));
    }
}
