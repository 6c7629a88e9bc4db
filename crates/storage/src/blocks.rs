//! Chain listener watermarks.
//!
//! Each listener records the last block it fully processed per
//! `(chain_id, key)` so a restart resumes instead of rescanning.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StorageError;

pub struct BlockStore {
    conn: Mutex<Connection>,
}

impl BlockStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StorageError::Io {
                    path: parent.display().to_string(),
                    source: e,
                })?;
            }
        }
        let store = Self {
            conn: Mutex::new(Connection::open(path)?),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS watermarks (
                chain_id INTEGER NOT NULL,
                key TEXT NOT NULL,
                block INTEGER NOT NULL,
                PRIMARY KEY (chain_id, key)
            )",
            [],
        )?;
        tracing::debug!("Block store schema initialized");
        Ok(())
    }

    pub fn get_watermark(&self, chain_id: u64, key: &str) -> Result<Option<u64>, StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
        let block: Option<i64> = conn
            .query_row(
                "SELECT block FROM watermarks WHERE chain_id = ?1 AND key = ?2",
                params![chain_id as i64, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(block.map(|b| b as u64))
    }

    /// Record `block` unless an equal or later block is already stored.
    pub fn set_watermark(&self, chain_id: u64, key: &str, block: u64) -> Result<(), StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
        conn.execute(
            "INSERT INTO watermarks (chain_id, key, block) VALUES (?1, ?2, ?3)
             ON CONFLICT(chain_id, key) DO UPDATE SET block = MAX(block, excluded.block)",
            params![chain_id as i64, key, block as i64],
        )?;
        Ok(())
    }
}
