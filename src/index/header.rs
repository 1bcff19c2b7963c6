use crate::error::Result;
use crate::Error;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::session::SESSION_SIZE;

/// Format identity written at the start of every index segment.
pub const IDENTITY_HEADER: &[u8; IDENTITY_SIZE] = b"################YUNYUN01";
pub const IDENTITY_SIZE: usize = 24;

/// Segment-relative offset of the session region.
pub const SESSION_OFFSET: usize = IDENTITY_SIZE;
/// Segment-relative offset of the packed header fields.
pub const FIELDS_OFFSET: usize = SESSION_OFFSET + SESSION_SIZE;
// bool + u32 + u16 + u16
pub const FIELDS_SIZE: usize = 9;
pub const HEADER_SIZE: usize = FIELDS_OFFSET + FIELDS_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexHeader {
    pub continuation: bool,
    pub continuation_offset: u32,
    pub index_size: u16,
    pub block_size: u16,
}

impl IndexHeader {
    /// Header of a tail segment.
    pub fn new(index_size: u16, block_size: u16) -> Self {
        Self {
            continuation: false,
            continuation_offset: 0,
            index_size,
            block_size,
        }
    }

    /// The same header chained to the segment at `offset`.
    pub fn continued_at(self, offset: u32) -> Self {
        Self {
            continuation: true,
            continuation_offset: offset,
            ..self
        }
    }

    /// Full header bytes: identity, an empty session region, then the fields.
    pub fn encode(&self) -> Result<[u8; HEADER_SIZE]> {
        let mut buf = [0u8; HEADER_SIZE];
        buf[..IDENTITY_SIZE].copy_from_slice(IDENTITY_HEADER);
        HeaderEncoder::new(&mut buf[FIELDS_OFFSET..]).encode(self)?;
        Ok(buf)
    }

    /// Only the packed fields, for rewriting a header in place without
    /// touching the identity or session regions.
    pub fn encode_fields(&self) -> Result<[u8; FIELDS_SIZE]> {
        let mut buf = [0u8; FIELDS_SIZE];
        HeaderEncoder::new(&mut buf[..]).encode(self)?;
        Ok(buf)
    }
}

impl TryFrom<&[u8]> for IndexHeader {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::InvalidFormat(format!(
                "index header truncated to {} bytes",
                bytes.len()
            )));
        }
        if &bytes[..IDENTITY_SIZE] != IDENTITY_HEADER {
            return Err(Error::InvalidFormat("Not a YunYun file!".to_string()));
        }

        HeaderDecoder::new(&bytes[FIELDS_OFFSET..HEADER_SIZE]).decode()
    }
}

pub struct HeaderDecoder<R: Read> {
    reader: R,
}

impl<R: Read> HeaderDecoder<R> {
    pub fn new(reader: R) -> Self {
        HeaderDecoder { reader }
    }

    pub fn decode(&mut self) -> Result<IndexHeader> {
        let continuation = self
            .reader
            .read_u8()
            .map_err(|e| Error::Decode("continuation", e))?
            != 0;

        let continuation_offset = self
            .reader
            .read_u32::<LittleEndian>()
            .map_err(|e| Error::Decode("continuation_offset", e))?;

        let index_size = self
            .reader
            .read_u16::<LittleEndian>()
            .map_err(|e| Error::Decode("index_size", e))?;

        let block_size = self
            .reader
            .read_u16::<LittleEndian>()
            .map_err(|e| Error::Decode("block_size", e))?;

        Ok(IndexHeader {
            continuation,
            continuation_offset,
            index_size,
            block_size,
        })
    }
}

pub struct HeaderEncoder<W: Write> {
    writer: W,
}

impl<W: Write> HeaderEncoder<W> {
    pub fn new(writer: W) -> Self {
        HeaderEncoder { writer }
    }

    pub fn encode(&mut self, header: &IndexHeader) -> Result<()> {
        self.writer
            .write_u8(header.continuation as u8)
            .map_err(|e| Error::Encode("continuation", e))?;

        self.writer
            .write_u32::<LittleEndian>(header.continuation_offset)
            .map_err(|e| Error::Encode("continuation_offset", e))?;

        self.writer
            .write_u16::<LittleEndian>(header.index_size)
            .map_err(|e| Error::Encode("index_size", e))?;

        self.writer
            .write_u16::<LittleEndian>(header.block_size)
            .map_err(|e| Error::Encode("block_size", e))?;

        Ok(())
    }
}
