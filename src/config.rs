use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a block store file
#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the data file
    pub path: PathBuf,

    /// Bytes occupied by one index segment (default: 4096).
    /// Only used when the file is created; existing files keep their own.
    pub index_size: usize,

    /// Payload bytes per block (default: 4096).
    /// Only used when the file is created; existing files keep their own.
    pub block_size: usize,

    /// Zero-fill new blocks with an explicit write instead of extending the
    /// file length (default: false)
    pub hard_allocate: bool,

    /// Maximum entries kept in each of the key-position and block caches (default: 8192)
    pub cache_capacity: usize,

    /// Directory holding the sidecar lock files (default: OS temp dir)
    pub lock_dir: PathBuf,

    /// Give up acquiring the file lock after this long (default: wait forever)
    pub lock_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./yunyun.db"),
            index_size: 4096,
            block_size: 4096,
            hard_allocate: false,
            cache_capacity: 8192,
            lock_dir: std::env::temp_dir(),
            lock_timeout: None,
        }
    }
}

impl Config {
    /// Create a new config for the given data file
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Set index segment size
    pub fn index_size(mut self, size: usize) -> Self {
        self.index_size = size;
        self
    }

    /// Set block size
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Physically zero-fill newly allocated blocks
    pub fn hard_allocate(mut self, enabled: bool) -> Self {
        self.hard_allocate = enabled;
        self
    }

    /// Set cache capacity
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Set lock file directory
    pub fn lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = dir.into();
        self
    }

    /// Bound the time spent waiting for the file lock
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }
}

/// Configuration for a [`Shelve`](crate::Shelve)
#[derive(Debug, Clone)]
pub struct ShelveConfig {
    /// Underlying store configuration
    pub store: Config,

    /// Maintain the persisted set of live keys (default: true).
    /// Without it `keys` and `len` are unavailable but writes are cheaper.
    pub track_keys: bool,
}

impl Default for ShelveConfig {
    fn default() -> Self {
        Self {
            store: Config::default(),
            track_keys: true,
        }
    }
}

impl ShelveConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            store: Config::new(path),
            ..Default::default()
        }
    }

    /// Replace the store configuration
    pub fn store(mut self, config: Config) -> Self {
        self.store = config;
        self
    }

    /// Enable or disable key tracking
    pub fn track_keys(mut self, enabled: bool) -> Self {
        self.track_keys = enabled;
        self
    }
}

impl From<Config> for ShelveConfig {
    fn from(store: Config) -> Self {
        Self {
            store,
            track_keys: true,
        }
    }
}
