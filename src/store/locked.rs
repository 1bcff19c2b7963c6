use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::Result;
use crate::guard::Access;
use crate::hasher::fingerprint;
use crate::index::{IndexCell, IndexHeader, Layout, CELL_SIZE, FIELDS_OFFSET, HEADER_SIZE};
use crate::Error;

/// Block store operations under one held lock.
///
/// Obtained from [`Interface::lock`](super::Interface::lock). Every operation
/// performed through the same `Locked` sees one consistent cache, and the
/// lock is released when it is dropped.
pub struct Locked<'a> {
    pub(crate) layout: &'a Layout,
    pub(crate) hard_allocate: bool,
    pub(crate) access: Access<'a>,
}

impl<'a> Locked<'a> {
    pub fn layout(&self) -> &Layout {
        self.layout
    }

    pub fn block_size(&self) -> usize {
        self.layout.block_size()
    }

    /// Generation of the guard's cache; changes whenever the cache is discarded.
    pub fn cache_generation(&self) -> u64 {
        self.access.cache.generation()
    }

    /// Writes `value` as the whole content of the block stored under `key`,
    /// allocating a cell and block for new keys.
    pub fn write_block(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let hard = self.hard_allocate;
        self.write_block_with(key, value, hard)
    }

    /// Like [`Locked::write_block`], but a newly allocated block is
    /// physically zero-filled rather than left sparse.
    pub fn write_block_hard(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write_block_with(key, value, true)
    }

    fn write_block_with(&mut self, key: &[u8], value: &[u8], hard: bool) -> Result<()> {
        if value.len() > self.layout.block_size() {
            return Err(Error::WriteAboveBlockSize {
                len: value.len(),
                block_size: self.layout.block_size(),
            });
        }

        let mut position = self.key_exists(key)?;
        if position == 0 {
            position = self.request_free_index_cell()?;
            self.access.cache.keypos.remove(key);

            let cell = self.read_cell(position)?;
            let block_offset = match cell.block_offset {
                0 => self.allocate_block(hard)?,
                offset => offset,
            };
            self.write_cell(
                position,
                &IndexCell {
                    occupied: true,
                    key_fingerprint: fingerprint(key),
                    block_offset,
                    ..cell
                },
            )?;
        }

        let cell = self.read_cell(position)?;
        let value_fingerprint = fingerprint(value);

        if cell.value_fingerprint != value_fingerprint || cell.value_length as usize != value.len()
        {
            self.write_bytes_at(cell.block_offset as u64, value)?;
            self.write_cell(
                position,
                &IndexCell {
                    value_length: value.len() as u16,
                    value_fingerprint,
                    ..cell
                },
            )?;
        }

        let cache = &mut *self.access.cache;
        cache.blocks.insert(key.to_vec(), value.to_vec());
        cache.keypos.set(key, position);
        Ok(())
    }

    /// Returns the bytes last written under `key`.
    pub fn read_block(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        if let Some(value) = self.access.cache.blocks.get(key) {
            return Ok(value.clone());
        }

        let position = self.key_exists(key)?;
        if position == 0 {
            return Err(Error::BlockNotFound(hex::encode(key)));
        }

        let cell = self.read_cell(position)?;
        let value = self.read_bytes_at(cell.block_offset as u64, cell.value_length as usize)?;
        self.access
            .cache
            .blocks
            .insert(key.to_vec(), value.clone());
        Ok(value)
    }

    /// Frees the cell holding `key`. The block keeps its bytes and stays
    /// attached to the cell for the next key that claims it.
    pub fn discard_block(&mut self, key: &[u8]) -> Result<()> {
        let position = self.key_exists(key)?;
        if position == 0 {
            return Err(Error::BlockNotFound(hex::encode(key)));
        }

        let cell = self.read_cell(position)?;
        self.write_cell(
            position,
            &IndexCell {
                occupied: false,
                key_fingerprint: 0,
                ..cell
            },
        )?;

        let cache = &mut *self.access.cache;
        cache.blocks.remove(key);
        cache.keypos.set(key, 0);
        Ok(())
    }

    /// Moves the block stored under `key` to `new_key`.
    pub fn change_block_key(&mut self, key: &[u8], new_key: &[u8]) -> Result<()> {
        if self.key_exists(new_key)? != 0 {
            return Err(Error::TargetExists(hex::encode(new_key)));
        }

        let position = self.key_exists(key)?;
        if position == 0 {
            return Err(Error::BlockNotFound(hex::encode(key)));
        }

        let cell = self.read_cell(position)?;
        self.write_cell(
            position,
            &IndexCell {
                key_fingerprint: fingerprint(new_key),
                ..cell
            },
        )?;

        let cache = &mut *self.access.cache;
        cache.blocks.remove(key);
        cache.blocks.remove(new_key);
        cache.keypos.set(key, 0);
        cache.keypos.set(new_key, position);
        Ok(())
    }

    /// File offset of the occupied cell holding `key`, or 0 if there is none.
    pub fn key_exists(&mut self, key: &[u8]) -> Result<u64> {
        if let Some(position) = self.access.cache.keypos.get(key) {
            return Ok(position);
        }

        let wanted = fingerprint(key);
        self.load_cells()?;

        let cache = &mut *self.access.cache;
        // Newest cells first.
        let position = cache
            .cells
            .iter()
            .rev()
            .find(|(_, cell)| cell.occupied && cell.key_fingerprint == wanted)
            .map(|(position, _)| *position)
            .unwrap_or(0);

        cache.keypos.set(key, position);
        Ok(position)
    }

    /// Offset of the first free cell, appending a new index segment when
    /// every existing cell is occupied.
    pub fn request_free_index_cell(&mut self) -> Result<u64> {
        loop {
            self.load_cells()?;
            let free = self
                .access
                .cache
                .cells
                .iter()
                .find(|(_, cell)| !cell.occupied)
                .map(|(position, _)| *position);

            if let Some(position) = free {
                return Ok(position);
            }
            self.create_index()?;
        }
    }

    /// The segment chain as `(offset, header)` pairs, in chain order.
    pub fn indexes(&mut self) -> Result<Vec<(u64, IndexHeader)>> {
        if let Some(indexes) = &self.access.cache.indexes {
            return Ok(indexes.clone());
        }

        let length = self.file_len()?;
        let mut indexes = Vec::new();
        let mut position = 0u64;

        while position + (HEADER_SIZE as u64) <= length {
            let bytes = self.read_bytes_at(position, HEADER_SIZE)?;
            let header = IndexHeader::try_from(&bytes[..])?;
            indexes.push((position, header));

            if !header.continuation {
                break;
            }
            let next = header.continuation_offset as u64;
            if next <= position {
                return Err(Error::InvalidFormat(format!(
                    "index segment at {} continues backwards to {}",
                    position, next
                )));
            }
            position = next;
        }

        self.access.cache.indexes = Some(indexes.clone());
        Ok(indexes)
    }

    /// Appends a blank index segment and chains the current tail to it.
    pub fn create_index(&mut self) -> Result<()> {
        let indexes = self.indexes()?;
        let length = self.file_len()?;
        let offset = to_file_offset(length)?;
        to_file_offset(length + self.layout.index_size() as u64)?;

        if let Some((tail, header)) = indexes.last().copied() {
            let chained = header.continued_at(offset);
            self.write_bytes_at(tail + FIELDS_OFFSET as u64, &chained.encode_fields()?)?;
            if let Some(cached) = self.access.cache.indexes.as_mut().and_then(|v| v.last_mut()) {
                cached.1 = chained;
            }
        }

        let segment = self.layout.blank_segment()?;
        self.write_bytes_at(length, &segment)?;

        tracing::debug!(
            segment = length,
            previous = indexes.last().map(|(o, _)| *o),
            cells = self.layout.cells_per_index(),
            "Created index segment"
        );

        let header = self.layout.header();
        self.access
            .cache
            .indexes
            .get_or_insert_with(Vec::new)
            .push((length, header));
        Ok(())
    }

    fn load_cells(&mut self) -> Result<()> {
        let indexes = self.indexes()?;
        let span = self.layout.cells_per_index() * CELL_SIZE;

        for (segment, _) in indexes {
            if self.access.cache.safe_indexes.contains(&segment) {
                continue;
            }

            let bytes = self.read_bytes_at(segment + HEADER_SIZE as u64, span)?;
            let positions: Vec<u64> = self.layout.cell_positions(segment).collect();

            let cache = &mut *self.access.cache;
            for (position, raw) in positions.into_iter().zip(bytes.chunks_exact(CELL_SIZE)) {
                cache.cells.insert(position, IndexCell::decode(raw)?);
                cache.index_cell_translation.insert(position, segment);
            }
            cache.safe_indexes.insert(segment);
        }
        Ok(())
    }

    fn read_cell(&mut self, position: u64) -> Result<IndexCell> {
        if let Some(cell) = self.access.cache.cells.get(&position) {
            return Ok(*cell);
        }
        let bytes = self.read_bytes_at(position, CELL_SIZE)?;
        IndexCell::decode(&bytes)
    }

    fn write_cell(&mut self, position: u64, cell: &IndexCell) -> Result<()> {
        self.write_bytes_at(position, &cell.encode()?)?;
        self.access.cache.mark_cell_modified(position);
        Ok(())
    }

    fn allocate_block(&mut self, hard: bool) -> Result<u32> {
        let length = self.file_len()?;
        let block_size = self.layout.block_size() as u64;
        let offset = to_file_offset(length)?;
        to_file_offset(length + block_size)?;

        if hard {
            self.write_bytes_at(length, &vec![0u8; block_size as usize])?;
        } else {
            self.access.file().set_len(length + block_size)?;
        }
        Ok(offset)
    }

    fn file_len(&mut self) -> Result<u64> {
        Ok(self.access.file().metadata()?.len())
    }

    fn read_bytes_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let file = self.access.file();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn write_bytes_at(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        let file = self.access.file();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes)?;
        Ok(())
    }
}

fn to_file_offset(offset: u64) -> Result<u32> {
    u32::try_from(offset).map_err(|_| {
        Error::InvalidOperation(format!(
            "file offset {} exceeds the 32-bit range of the format",
            offset
        ))
    })
}
