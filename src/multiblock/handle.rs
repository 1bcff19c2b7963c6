use std::io::{self, SeekFrom};

use super::MultiblockHandler;
use crate::error::Result;
use crate::Error;

/// File-like cursor over one node.
///
/// Every call takes the store lock for its own duration, so the node may be
/// changed by others between calls.
pub struct FileHandle<'a> {
    handler: &'a mut MultiblockHandler,
    key: Vec<u8>,
    position: u64,
}

impl<'a> FileHandle<'a> {
    pub(super) fn new(handler: &'a mut MultiblockHandler, key: &[u8]) -> Self {
        Self {
            handler,
            key: key.to_vec(),
            position: 0,
        }
    }

    pub fn tell(&self) -> u64 {
        self.position
    }

    /// Current size of the node in bytes.
    pub fn length(&mut self) -> Result<u64> {
        self.handler.lock()?.node_size(&self.key)
    }

    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::Current(delta) => self.position as i128 + delta as i128,
            SeekFrom::End(0) => self.length()? as i128,
            SeekFrom::End(_) => {
                return Err(Error::IoError(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "can't do nonzero end-relative seeks",
                )))
            }
        };

        if target < 0 {
            return Err(Error::IoError(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative position",
            )));
        }
        self.position = u64::try_from(target).map_err(|_| {
            Error::IoError(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek position out of range",
            ))
        })?;
        Ok(self.position)
    }

    /// Resizes the node; `None` keeps the current length. The position is
    /// left where it is.
    pub fn truncate(&mut self, size: Option<u64>) -> Result<u64> {
        let mut locked = self.handler.lock()?;
        let size = match size {
            Some(size) => size,
            None => locked.node_size(&self.key)?,
        };
        locked.truncate_node(&self.key, size)?;
        Ok(size)
    }

    /// Reads up to `size` bytes from the current position, or everything up
    /// to the end of the node when `size` is `None`.
    pub fn read(&mut self, size: Option<usize>) -> Result<Vec<u8>> {
        let mut locked = self.handler.lock()?;
        let end = match size {
            Some(size) => self.position.saturating_add(size as u64),
            None => locked.node_size(&self.key)?,
        };
        let data = locked.read_range(&self.key, self.position, end)?;
        self.position += data.len() as u64;
        Ok(data)
    }

    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        let written = self
            .handler
            .lock()?
            .write_at(&self.key, self.position, data)?;
        self.position += written as u64;
        Ok(written)
    }

    pub fn close(self) {}
}

impl io::Read for FileHandle<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let data = FileHandle::read(self, Some(buf.len()))?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }
}

impl io::Write for FileHandle<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(FileHandle::write(self, buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Seek for FileHandle<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        Ok(FileHandle::seek(self, pos)?)
    }
}
