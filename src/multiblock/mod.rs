//! Multi-block virtual files.
//!
//! A node is a byte string of arbitrary length spread over fixed-size blocks.
//! Its metadata block lives under the node key itself:
//!
//! ```text
//! blocks(u32 LE) | size(u32 LE) | original key bytes
//! ```
//!
//! and data block `i` lives under [`node_block_key`]`(key, i)`. Every data
//! block is written at full block size; bytes past `size` are always zero.

mod handle;

pub use handle::FileHandle;

use std::path::PathBuf;

use byteorder::{ByteOrder, LittleEndian};

use crate::config::Config;
use crate::error::Result;
use crate::hasher::node_block_key;
use crate::store::{Interface, Locked};
use crate::Error;

const META_PREFIX: usize = 8;

/// Decoded node metadata block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMeta {
    pub blocks: u32,
    pub size: u32,
    pub key: Vec<u8>,
}

impl NodeMeta {
    fn empty(key: &[u8]) -> Self {
        Self {
            blocks: 0,
            size: 0,
            key: key.to_vec(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; META_PREFIX + self.key.len()];
        LittleEndian::write_u32(&mut buf[0..4], self.blocks);
        LittleEndian::write_u32(&mut buf[4..8], self.size);
        buf[META_PREFIX..].copy_from_slice(&self.key);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < META_PREFIX {
            return Err(Error::InvalidFormat(format!(
                "node metadata is {} bytes, expected at least {}",
                bytes.len(),
                META_PREFIX
            )));
        }
        Ok(Self {
            blocks: LittleEndian::read_u32(&bytes[0..4]),
            size: LittleEndian::read_u32(&bytes[4..8]),
            key: bytes[META_PREFIX..].to_vec(),
        })
    }
}

fn blocks_for(size: u64, block_size: usize) -> u64 {
    size.div_ceil(block_size as u64)
}

fn node_size_limit(size: u64) -> Result<u32> {
    u32::try_from(size).map_err(|_| {
        Error::InvalidOperation(format!("node size {} exceeds the 32-bit limit", size))
    })
}

/// Node operations under one held lock.
impl Locked<'_> {
    pub fn node_exists(&mut self, key: &[u8]) -> Result<bool> {
        Ok(self.key_exists(key)? != 0)
    }

    pub fn node_meta(&mut self, key: &[u8]) -> Result<NodeMeta> {
        match self.read_block(key) {
            Ok(bytes) => NodeMeta::decode(&bytes),
            Err(Error::BlockNotFound(_)) => Err(Error::NodeDoesNotExist(hex::encode(key))),
            Err(e) => Err(e),
        }
    }

    fn set_node_meta(&mut self, key: &[u8], meta: &NodeMeta) -> Result<()> {
        self.write_block(key, &meta.encode())
    }

    pub fn make_node(&mut self, key: &[u8]) -> Result<()> {
        if self.node_exists(key)? {
            return Err(Error::NodeExists(hex::encode(key)));
        }
        self.set_node_meta(key, &NodeMeta::empty(key))
    }

    pub fn remove_node(&mut self, key: &[u8]) -> Result<()> {
        if !self.node_exists(key)? {
            return Err(Error::NodeDoesNotExist(hex::encode(key)));
        }

        let meta = self.node_meta(key)?;
        self.discard_block(key)?;
        for block in 0..meta.blocks {
            self.discard_block(&node_block_key(key, block))?;
        }
        Ok(())
    }

    pub fn rename_node(&mut self, key: &[u8], new_key: &[u8]) -> Result<()> {
        if !self.node_exists(key)? {
            return Err(Error::NodeDoesNotExist(hex::encode(key)));
        }
        if self.node_exists(new_key)? {
            return Err(Error::TargetExists(hex::encode(new_key)));
        }

        let meta = self.node_meta(key)?;
        self.change_block_key(key, new_key)?;
        for block in 0..meta.blocks {
            self.change_block_key(
                &node_block_key(key, block),
                &node_block_key(new_key, block),
            )?;
        }
        Ok(())
    }

    pub fn node_size(&mut self, key: &[u8]) -> Result<u64> {
        Ok(self.node_meta(key)?.size as u64)
    }

    /// Resizes the node to exactly `size` bytes. New bytes read as zero.
    pub fn truncate_node(&mut self, key: &[u8], size: u64) -> Result<()> {
        let new_size = node_size_limit(size)?;
        let mut meta = self.node_meta(key)?;
        let block_size = self.block_size();

        let current_blocks = meta.blocks as u64;
        let final_blocks = blocks_for(size, block_size);

        if final_blocks > current_blocks {
            let zeroes = vec![0u8; block_size];
            for block in current_blocks..final_blocks {
                self.write_block(&node_block_key(key, block as u32), &zeroes)?;
            }
        } else if final_blocks < current_blocks {
            for block in final_blocks..current_blocks {
                self.discard_block(&node_block_key(key, block as u32))?;
            }
        }

        // Keep the tail of a partially used last block zeroed so growing
        // again never exposes old bytes.
        let tail = (size % block_size as u64) as usize;
        if size < meta.size as u64 && tail != 0 {
            let last = node_block_key(key, (final_blocks - 1) as u32);
            let mut bytes = self.read_block(&last)?;
            bytes.resize(block_size, 0);
            bytes[tail..].fill(0);
            self.write_block(&last, &bytes)?;
        }

        meta.size = new_size;
        meta.blocks = final_blocks as u32;
        self.set_node_meta(key, &meta)
    }

    /// Bytes `[start, end)` of the node, clamped to its current size.
    pub fn read_range(&mut self, key: &[u8], start: u64, end: u64) -> Result<Vec<u8>> {
        let size = self.node_size(key)?;
        let end = end.min(size);
        if start >= end {
            return Ok(Vec::new());
        }

        let block_size = self.block_size() as u64;
        let first = start / block_size;
        let last = blocks_for(end, block_size as usize);

        let mut joined = Vec::with_capacity(((last - first) * block_size) as usize);
        for block in first..last {
            joined.extend(self.read_block(&node_block_key(key, block as u32))?);
        }

        let from = (start - first * block_size) as usize;
        let to = from + (end - start) as usize;
        if to > joined.len() {
            return Err(Error::InvalidFormat(format!(
                "node {} has short data blocks",
                hex::encode(key)
            )));
        }
        Ok(joined[from..to].to_vec())
    }

    /// Writes `data` at byte `position`, growing the node when needed.
    pub fn write_at(&mut self, key: &[u8], position: u64, data: &[u8]) -> Result<usize> {
        let end = position.checked_add(data.len() as u64).ok_or_else(|| {
            Error::InvalidOperation(format!(
                "write of {} bytes at {} overflows the node length",
                data.len(),
                position
            ))
        })?;
        node_size_limit(end)?;

        if self.node_size(key)? < end {
            self.truncate_node(key, end)?;
        }
        if data.is_empty() {
            return Ok(0);
        }

        let block_size = self.block_size();
        let first = position / block_size as u64;
        let last = (end - 1) / block_size as u64;
        let span = (last - first + 1) as usize;

        // Only the edge blocks can hold bytes the write does not replace.
        let mut buffer = vec![0u8; span * block_size];
        let head = self.read_block(&node_block_key(key, first as u32))?;
        let n = head.len().min(block_size);
        buffer[..n].copy_from_slice(&head[..n]);
        if last != first {
            let tail = self.read_block(&node_block_key(key, last as u32))?;
            let n = tail.len().min(block_size);
            let at = (span - 1) * block_size;
            buffer[at..at + n].copy_from_slice(&tail[..n]);
        }

        let offset = (position - first * block_size as u64) as usize;
        buffer[offset..offset + data.len()].copy_from_slice(data);

        for (i, chunk) in buffer.chunks(block_size).enumerate() {
            self.write_block(&node_block_key(key, (first as u32) + i as u32), chunk)?;
        }
        Ok(data.len())
    }

    pub fn read_node(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        let size = self.node_size(key)?;
        self.read_range(key, 0, size)
    }

    /// Replaces the whole content of the node, creating it if absent.
    pub fn write_node(&mut self, key: &[u8], data: &[u8]) -> Result<()> {
        if !self.node_exists(key)? {
            self.make_node(key)?;
        }
        self.truncate_node(key, data.len() as u64)?;
        self.write_at(key, 0, data)?;
        Ok(())
    }
}

/// Block store holding multi-block nodes.
pub struct MultiblockHandler {
    store: Interface,
}

impl MultiblockHandler {
    pub fn new(path: impl Into<PathBuf>, index_size: usize, block_size: usize) -> Result<Self> {
        Ok(Self {
            store: Interface::new(path, index_size, block_size)?,
        })
    }

    pub fn open(config: Config) -> Result<Self> {
        Ok(Self {
            store: Interface::open(config)?,
        })
    }

    pub fn store(&self) -> &Interface {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut Interface {
        &mut self.store
    }

    pub fn block_size(&self) -> usize {
        self.store.block_size()
    }

    pub fn lock(&mut self) -> Result<Locked<'_>> {
        self.store.lock()
    }

    pub fn make_node(&mut self, key: &[u8]) -> Result<()> {
        self.lock()?.make_node(key)
    }

    pub fn remove_node(&mut self, key: &[u8]) -> Result<()> {
        self.lock()?.remove_node(key)
    }

    pub fn rename_node(&mut self, key: &[u8], new_key: &[u8]) -> Result<()> {
        self.lock()?.rename_node(key, new_key)
    }

    pub fn node_exists(&mut self, key: &[u8]) -> Result<bool> {
        self.lock()?.node_exists(key)
    }

    pub fn node_size(&mut self, key: &[u8]) -> Result<u64> {
        self.lock()?.node_size(key)
    }

    pub fn read_node(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        self.lock()?.read_node(key)
    }

    pub fn write_node(&mut self, key: &[u8], data: &[u8]) -> Result<()> {
        self.lock()?.write_node(key, data)
    }

    /// Positioned read/write access to an existing node.
    pub fn get_handle(&mut self, key: &[u8]) -> Result<FileHandle<'_>> {
        if !self.node_exists(key)? {
            return Err(Error::NodeDoesNotExist(hex::encode(key)));
        }
        Ok(FileHandle::new(self, key))
    }
}
