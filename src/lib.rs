pub mod cache;
pub mod config;
pub mod encoding;
pub mod error;
pub mod flock;
pub mod guard;
pub mod hasher;
pub mod index;
pub mod multiblock;
pub mod session;
pub mod shelve;
pub mod store;

pub use config::{Config, ShelveConfig};
pub use error::{Error, Result};
pub use hasher::Hasher;
pub use multiblock::{FileHandle, MultiblockHandler};
pub use shelve::{InstanceLockedShelve, Shelve};
pub use store::{Interface, Locked};
