use super::EncodingError;
use crate::error::Result;
use serde::{de::DeserializeOwned, Serialize};

/// Serialize a value using bincode
pub fn serialize<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value)
        .map_err(|e| EncodingError::InvalidFormat(format!("Serialization failed: {}", e)).into())
}

/// Deserialize a value from a byte slice using bincode
pub fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| decode_error(*e))
}

fn decode_error(err: bincode::ErrorKind) -> crate::Error {
    match err {
        bincode::ErrorKind::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            EncodingError::TruncatedData.into()
        }
        other => EncodingError::InvalidFormat(format!("Deserialization failed: {}", other)).into(),
    }
}
