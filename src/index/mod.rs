//! On-disk layout of index segments.
//!
//! ```text
//! segment:  identity(24) | session(16) | flags(1) next(u32) index_size(u16) block_size(u16) | cell * n
//! cell:     occupied(1) | reserved(1) | key_fp(u64) | block_offset(u32) | value_len(u16) | value_fp(u64)
//! ```
//!
//! All integers are little-endian. Segments chain through `next`; blocks live
//! after whichever segment was the tail when they were allocated.

pub mod cell;
pub mod header;

pub use cell::{IndexCell, CELL_SIZE};
pub use header::{IndexHeader, FIELDS_OFFSET, HEADER_SIZE, IDENTITY_HEADER, SESSION_OFFSET};

use crate::error::Result;
use crate::Error;

pub const MIN_BLOCK_SIZE: usize = 16;
pub const MIN_INDEX_SIZE: usize = 64;

/// Geometry shared by every segment of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    index_size: u16,
    block_size: u16,
    cells_per_index: usize,
}

impl Layout {
    pub fn new(index_size: usize, block_size: usize) -> Result<Self> {
        if block_size < MIN_BLOCK_SIZE {
            return Err(Error::InvalidFormat("Block size is far too low.".to_string()));
        }
        if index_size < MIN_INDEX_SIZE {
            return Err(Error::InvalidFormat("Index size is far too low.".to_string()));
        }
        let (Ok(index_size), Ok(block_size)) = (u16::try_from(index_size), u16::try_from(block_size))
        else {
            return Err(Error::InvalidFormat(format!(
                "Index and block sizes must not exceed {} bytes.",
                u16::MAX
            )));
        };

        let cells_per_index = (index_size as usize - HEADER_SIZE) / CELL_SIZE;
        if cells_per_index == 0 {
            return Err(Error::InvalidFormat(format!(
                "Index size {} leaves no room for a single cell.",
                index_size
            )));
        }

        Ok(Self {
            index_size,
            block_size,
            cells_per_index,
        })
    }

    /// Geometry recorded in an existing segment header.
    pub fn from_header(header: &IndexHeader) -> Result<Self> {
        Self::new(header.index_size as usize, header.block_size as usize)
    }

    pub fn index_size(&self) -> usize {
        self.index_size as usize
    }

    pub fn block_size(&self) -> usize {
        self.block_size as usize
    }

    pub fn cells_per_index(&self) -> usize {
        self.cells_per_index
    }

    /// Header for a fresh tail segment of this geometry.
    pub fn header(&self) -> IndexHeader {
        IndexHeader::new(self.index_size, self.block_size)
    }

    /// File offsets of every cell in the segment starting at `segment`.
    pub fn cell_positions(&self, segment: u64) -> impl Iterator<Item = u64> {
        let first = segment + HEADER_SIZE as u64;
        (0..self.cells_per_index as u64).map(move |i| first + i * CELL_SIZE as u64)
    }

    /// A whole blank segment: header, empty cells, zero padding up to `index_size`.
    pub fn blank_segment(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.index_size()];
        buf[..HEADER_SIZE].copy_from_slice(&self.header().encode()?);
        // Blank cells encode to zeroes, so the remainder is already correct.
        Ok(buf)
    }
}
