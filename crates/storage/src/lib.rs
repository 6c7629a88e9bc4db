//! Node-local persistent state.
//!
//! - `KeyshareStore`: the party's threshold key share, one JSON file.
//! - `BlockStore`: chain listener watermarks in SQLite.

pub mod blocks;
pub mod error;
pub mod keyshare;

pub use blocks::BlockStore;
pub use error::StorageError;
pub use keyshare::{KeyshareGuard, KeyshareStore, StoredKeyshare};
