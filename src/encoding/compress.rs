use super::EncodingError;
use crate::error::Result;

/// LZ4 block compression with the uncompressed length prepended.
pub fn compress(data: &[u8]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(data)
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    lz4_flex::decompress_size_prepended(data)
        .map_err(|e| EncodingError::Decompression(e.to_string()).into())
}
