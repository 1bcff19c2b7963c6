//! Block store.
//!
//! [`Interface`] maps byte keys to single fixed-size blocks inside one file.
//! Each public method takes the file lock for its own duration; use
//! [`Interface::lock`] to run several operations under one acquisition.

mod locked;

pub use locked::Locked;

use std::fs::{self, File, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::Result;
use crate::guard::Guard;
use crate::index::{IndexHeader, Layout, HEADER_SIZE, IDENTITY_HEADER};
use crate::Error;

pub struct Interface {
    layout: Layout,
    hard_allocate: bool,
    guard: Guard,
}

impl Interface {
    /// Opens or creates a store with the given geometry. An existing file
    /// keeps the geometry recorded in it.
    pub fn new(path: impl Into<PathBuf>, index_size: usize, block_size: usize) -> Result<Self> {
        Self::open(
            Config::new(path)
                .index_size(index_size)
                .block_size(block_size),
        )
    }

    pub fn open(config: Config) -> Result<Self> {
        let requested = Layout::new(config.index_size, config.block_size)?;

        let created = prepare_file(&config.path)?;
        let mut guard = Guard::new(&config)?;

        let recorded = {
            let mut locked = Locked {
                layout: &requested,
                hard_allocate: config.hard_allocate,
                access: guard.acquire()?,
            };
            match locked.indexes()?.first() {
                Some((_, header)) => Some(Layout::from_header(header)?),
                None => {
                    locked.create_index()?;
                    None
                }
            }
        };

        let layout = match recorded {
            Some(on_disk) if on_disk != requested => {
                tracing::debug!(
                    path = %config.path.display(),
                    index_size = on_disk.index_size(),
                    block_size = on_disk.block_size(),
                    "Using geometry recorded in existing store"
                );
                on_disk
            }
            _ => requested,
        };

        tracing::info!(
            path = %config.path.display(),
            created,
            index_size = layout.index_size(),
            block_size = layout.block_size(),
            "Opened block store"
        );

        Ok(Self {
            layout,
            hard_allocate: config.hard_allocate,
            guard,
        })
    }

    /// Takes the file lock and returns a handle for running several
    /// operations under it.
    pub fn lock(&mut self) -> Result<Locked<'_>> {
        Ok(Locked {
            layout: &self.layout,
            hard_allocate: self.hard_allocate,
            access: self.guard.acquire()?,
        })
    }

    /// Keeps the file lock held across calls until [`Interface::unpin`].
    pub fn pin(&mut self) -> Result<()> {
        self.guard.pin()
    }

    pub fn unpin(&mut self) {
        self.guard.unpin()
    }

    pub fn is_pinned(&self) -> bool {
        self.guard.is_pinned()
    }

    pub fn path(&self) -> &Path {
        self.guard.path()
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn block_size(&self) -> usize {
        self.layout.block_size()
    }

    pub fn index_size(&self) -> usize {
        self.layout.index_size()
    }

    pub fn cells_per_index(&self) -> usize {
        self.layout.cells_per_index()
    }

    pub fn write_block(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.lock()?.write_block(key, value)
    }

    pub fn write_block_hard(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.lock()?.write_block_hard(key, value)
    }

    pub fn read_block(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        self.lock()?.read_block(key)
    }

    pub fn discard_block(&mut self, key: &[u8]) -> Result<()> {
        self.lock()?.discard_block(key)
    }

    pub fn change_block_key(&mut self, key: &[u8], new_key: &[u8]) -> Result<()> {
        self.lock()?.change_block_key(key, new_key)
    }

    pub fn key_exists(&mut self, key: &[u8]) -> Result<u64> {
        self.lock()?.key_exists(key)
    }

    /// The segment chain as `(offset, header)` pairs.
    pub fn indexes(&mut self) -> Result<Vec<(u64, IndexHeader)>> {
        self.lock()?.indexes()
    }

    pub fn index_offsets(&mut self) -> Result<Vec<u64>> {
        Ok(self.indexes()?.into_iter().map(|(offset, _)| offset).collect())
    }
}

/// Creates the file if it is missing and checks the identity header of a
/// non-empty one. Returns whether the file started out empty.
fn prepare_file(path: &Path) -> Result<bool> {
    let len = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
        Err(e) => return Err(e.into()),
    };

    if len == 0 {
        OpenOptions::new().create(true).append(true).open(path)?;
        return Ok(true);
    }

    let mut identity = Vec::with_capacity(IDENTITY_HEADER.len());
    File::open(path)?
        .take(IDENTITY_HEADER.len() as u64)
        .read_to_end(&mut identity)?;
    if identity != IDENTITY_HEADER[..] || len < HEADER_SIZE as u64 {
        return Err(Error::InvalidFormat(format!(
            "Not a YunYun file: {}",
            path.display()
        )));
    }
    Ok(false)
}
