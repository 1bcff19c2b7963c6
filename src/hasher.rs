use std::fmt;
use std::path::Path;

use crc::{Crc, Digest, CRC_64_ECMA_182};
use sha2::{Digest as _, Sha256};
use xxhash_rust::xxh64::xxh64;

static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// Prefix of every node data block key.
pub const NODE_BLOCK_PREFIX: &[u8; 8] = b"INODEBLK";

/// 64-bit fingerprint of a key or value as stored in index cells.
pub fn fingerprint(data: &[u8]) -> u64 {
    xxh64(data, 0)
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Block store key of data block `index` of the node stored under `key`.
pub fn node_block_key(key: &[u8], index: u32) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(key);
    hasher.update(index.to_le_bytes());

    let mut out = Vec::with_capacity(NODE_BLOCK_PREFIX.len() + 32);
    out.extend_from_slice(NODE_BLOCK_PREFIX);
    out.extend_from_slice(&hasher.finalize());
    out
}

/// Incremental CRC-64 used to name sidecar lock files.
#[derive(Clone)]
pub struct Hasher {
    digest: Digest<'static, u64>,
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hasher")
    }
}

impl Hasher {
    pub fn new() -> Self {
        Self {
            digest: CRC64.digest(),
        }
    }

    pub fn write(&mut self, data: &[u8]) {
        self.digest.update(data);
    }

    pub fn checksum(&self) -> u64 {
        self.digest.clone().finalize()
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// File name of the lock file guarding `path`.
pub fn lock_file_name(path: &Path) -> String {
    let mut hasher = Hasher::new();
    hasher.write(path.as_os_str().to_string_lossy().as_bytes());
    hasher.write(b".lock");
    format!("{:016x}.ylf", hasher.checksum())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incremental_checksum() {
        let mut hasher1 = Hasher::new();
        hasher1.write(b"hello ");
        hasher1.write(b"world");

        let mut hasher2 = Hasher::new();
        hasher2.write(b"hello world");

        assert_eq!(hasher1.checksum(), hasher2.checksum());
    }

    #[test]
    fn test_fingerprint_is_xxh64() {
        // Reference value of XXH64("") with seed 0.
        assert_eq!(fingerprint(b""), 0xef46db3751d8e999);
        assert_ne!(fingerprint(b"a"), fingerprint(b"b"));
    }

    #[test]
    fn test_node_block_key_layout() {
        let key = node_block_key(b"node", 3);
        assert_eq!(key.len(), 40);
        assert_eq!(&key[..8], b"INODEBLK");

        let mut raw = b"node".to_vec();
        raw.extend_from_slice(&3u32.to_le_bytes());
        assert_eq!(&key[8..], &sha256(&raw));

        assert_ne!(node_block_key(b"node", 0), node_block_key(b"node", 1));
    }

    #[test]
    fn test_lock_file_name_is_stable() {
        let a = lock_file_name(Path::new("/tmp/a.yun"));
        let b = lock_file_name(Path::new("/tmp/b.yun"));

        assert_eq!(a, lock_file_name(Path::new("/tmp/a.yun")));
        assert_ne!(a, b);
        assert!(a.ends_with(".ylf"));
        assert_eq!(a.len(), 16 + 4);
    }
}
