//! Non-volatile key-value persistence.
//!
//! The engine sees storage through the narrow [`KeyValueStore`] trait: string
//! keys mapping to small binary blobs. The host binary backs it with `sled`;
//! tests use the in-memory implementation. Storage is only ever touched from
//! the engine loop, never from the radio interrupt path.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

/// Persisted keys. Keep in sync with `factory_reset`.
pub const KEY_NET_KEY: &str = "net_key";
pub const KEY_NONCE_COUNTER: &str = "nonce_counter";
pub const KEY_NODE_NAME: &str = "node_name";
pub const KEY_NODE_NAMES_TABLE: &str = "node_names_table";
pub const KEY_ROUTE_CACHE: &str = "route_cache";

/// Upper bound on any single persisted blob. Oversized values are rejected
/// before deserialization so a corrupt store cannot exhaust memory.
pub const MAX_VALUE_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("value for '{key}' too large: {len} bytes")]
    ValueTooLarge { key: String, len: usize },

    #[error("corrupt value for '{key}'")]
    Corrupt { key: String },
}

/// Minimal blob store contract the protocol engine depends on.
pub trait KeyValueStore: Send {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    fn store(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// Block until previous writes are durable. The nonce counter relies on
    /// this after every persist-stride crossing.
    fn flush(&self) -> Result<(), StorageError>;

    /// Drop every persisted key (`factory_reset`).
    fn clear(&self) -> Result<(), StorageError> {
        for key in [
            KEY_NET_KEY,
            KEY_NONCE_COUNTER,
            KEY_NODE_NAME,
            KEY_NODE_NAMES_TABLE,
            KEY_ROUTE_CACHE,
        ] {
            self.remove(key)?;
        }
        self.flush()
    }
}

fn check_size(key: &str, len: usize) -> Result<(), StorageError> {
    if len > MAX_VALUE_SIZE {
        return Err(StorageError::ValueTooLarge { key: key.to_string(), len });
    }
    Ok(())
}

/// Sled-backed store used by the host binary.
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(Self { db })
    }
}

impl KeyValueStore for SledStore {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let value = self
            .db
            .get(key)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        match value {
            Some(ivec) => {
                check_size(key, ivec.len())?;
                Ok(Some(ivec.to_vec()))
            }
            None => Ok(None),
        }
    }

    fn store(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        check_size(key, value.len())?;
        self.db
            .insert(key, value)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.db
            .remove(key)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db
            .flush()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }
}

/// In-memory store for tests and the simulator.
#[derive(Default)]
pub struct MemoryStore {
    map: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.map.lock().unwrap().get(key).cloned())
    }

    fn store(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        check_size(key, value.len())?;
        self.map
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.map.lock().unwrap().remove(key);
        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
