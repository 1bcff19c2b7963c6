use crate::error::Result;
use crate::Error;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

// bool + pad + u64 + u32 + u16 + u64
pub const CELL_SIZE: usize = 24;

/// One slot of an index segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexCell {
    pub occupied: bool,
    pub key_fingerprint: u64,
    /// File offset of the block, 0 when none has been assigned yet.
    pub block_offset: u32,
    pub value_length: u16,
    pub value_fingerprint: u64,
}

impl IndexCell {
    pub fn encode(&self) -> Result<[u8; CELL_SIZE]> {
        let mut buf = [0u8; CELL_SIZE];
        CellEncoder::new(&mut buf[..]).encode(self)?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < CELL_SIZE {
            return Err(Error::InvalidFormat(format!(
                "index cell truncated to {} bytes",
                bytes.len()
            )));
        }
        CellDecoder::new(Cursor::new(&bytes[..CELL_SIZE])).decode()
    }
}

pub struct CellDecoder<R: Read> {
    reader: R,
}

impl<R: Read> CellDecoder<R> {
    pub fn new(reader: R) -> Self {
        CellDecoder { reader }
    }

    pub fn decode(&mut self) -> Result<IndexCell> {
        let occupied = self
            .reader
            .read_u8()
            .map_err(|e| Error::Decode("occupied", e))?
            != 0;

        self.reader
            .read_u8()
            .map_err(|e| Error::Decode("reserved", e))?;

        let key_fingerprint = self
            .reader
            .read_u64::<LittleEndian>()
            .map_err(|e| Error::Decode("key_fingerprint", e))?;

        let block_offset = self
            .reader
            .read_u32::<LittleEndian>()
            .map_err(|e| Error::Decode("block_offset", e))?;

        let value_length = self
            .reader
            .read_u16::<LittleEndian>()
            .map_err(|e| Error::Decode("value_length", e))?;

        let value_fingerprint = self
            .reader
            .read_u64::<LittleEndian>()
            .map_err(|e| Error::Decode("value_fingerprint", e))?;

        Ok(IndexCell {
            occupied,
            key_fingerprint,
            block_offset,
            value_length,
            value_fingerprint,
        })
    }
}

pub struct CellEncoder<W: Write> {
    writer: W,
}

impl<W: Write> CellEncoder<W> {
    pub fn new(writer: W) -> Self {
        CellEncoder { writer }
    }

    pub fn encode(&mut self, cell: &IndexCell) -> Result<()> {
        self.writer
            .write_u8(cell.occupied as u8)
            .map_err(|e| Error::Encode("occupied", e))?;

        self.writer
            .write_u8(0)
            .map_err(|e| Error::Encode("reserved", e))?;

        self.writer
            .write_u64::<LittleEndian>(cell.key_fingerprint)
            .map_err(|e| Error::Encode("key_fingerprint", e))?;

        self.writer
            .write_u32::<LittleEndian>(cell.block_offset)
            .map_err(|e| Error::Encode("block_offset", e))?;

        self.writer
            .write_u16::<LittleEndian>(cell.value_length)
            .map_err(|e| Error::Encode("value_length", e))?;

        self.writer
            .write_u64::<LittleEndian>(cell.value_fingerprint)
            .map_err(|e| Error::Encode("value_fingerprint", e))?;

        Ok(())
    }
}
