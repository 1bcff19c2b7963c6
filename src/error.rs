use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    Decode(&'static str, io::Error),
    Encode(&'static str, io::Error),
    LockError(io::Error),
    /// No occupied cell holds the key (hex encoded).
    BlockNotFound(String),
    WriteAboveBlockSize { len: usize, block_size: usize },
    NodeExists(String),
    NodeDoesNotExist(String),
    TargetExists(String),
    InvalidFormat(String),
    KeyNotFound,
    Serialization(String),
    InvalidOperation(String),
}

impl Error {
    /// True for the errors a mapping layer reports as a missing key.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::BlockNotFound(_) | Error::NodeDoesNotExist(_) | Error::KeyNotFound
        )
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::IoError(e) | Error::LockError(e) => e,
            Error::Decode(_, e) | Error::Encode(_, e) => e,
            Error::BlockNotFound(_) | Error::NodeDoesNotExist(_) | Error::KeyNotFound => {
                io::Error::new(io::ErrorKind::NotFound, err.to_string())
            }
            Error::NodeExists(_) | Error::TargetExists(_) => {
                io::Error::new(io::ErrorKind::AlreadyExists, err.to_string())
            }
            Error::WriteAboveBlockSize { .. } | Error::InvalidOperation(_) => {
                io::Error::new(io::ErrorKind::InvalidInput, err.to_string())
            }
            Error::InvalidFormat(_) | Error::Serialization(_) => {
                io::Error::new(io::ErrorKind::InvalidData, err.to_string())
            }
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::Decode(field, err) => write!(f, "Failed to decode {}: {}", field, err),
            Error::Encode(field, err) => write!(f, "Failed to encode {}: {}", field, err),
            Error::LockError(err) => write!(f, "Lock error: {}", err),
            Error::BlockNotFound(key) => write!(f, "Block not found: {}", key),
            Error::WriteAboveBlockSize { len, block_size } => write!(
                f,
                "Write length was {}, block size is {}",
                len, block_size
            ),
            Error::NodeExists(key) => write!(f, "Node already exists: {}", key),
            Error::NodeDoesNotExist(key) => write!(f, "Node does not exist: {}", key),
            Error::TargetExists(key) => write!(f, "Target already exists: {}", key),
            Error::InvalidFormat(msg) => write!(f, "Invalid format: {}", msg),
            Error::KeyNotFound => write!(f, "Key not found"),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::InvalidOperation(msg) => write!(f, "Invalid operation: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(err) | Error::LockError(err) => Some(err),
            Error::Decode(_, err) | Error::Encode(_, err) => Some(err),
            _ => None,
        }
    }
}
