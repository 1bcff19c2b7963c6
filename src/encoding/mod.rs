//! Encodings used by the shelve layer: bincode for keys and values, LZ4 for
//! the key-set node.

pub mod bincode;
pub mod compress;

/// Error type for encoding operations
#[derive(Debug)]
pub enum EncodingError {
    InvalidFormat(String),
    TruncatedData,
    Decompression(String),
}

impl std::fmt::Display for EncodingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodingError::InvalidFormat(msg) => write!(f, "Invalid encoding format: {}", msg),
            EncodingError::TruncatedData => write!(f, "Truncated data"),
            EncodingError::Decompression(msg) => write!(f, "Decompression failed: {}", msg),
        }
    }
}

impl std::error::Error for EncodingError {}

impl From<EncodingError> for crate::Error {
    fn from(err: EncodingError) -> Self {
        crate::Error::Serialization(err.to_string())
    }
}
