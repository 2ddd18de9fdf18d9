//! Node persistence layer
//!
//! Small JSON documents in the data directory: the peer registry snapshot,
//! the offline queue, and the node id. Every write goes to a temporary file
//! first and is renamed into place, so a crash mid-write leaves the previous
//! version intact.

use crate::network::message::PeerId;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Registry snapshot file
pub const PEERS_FILE: &str = "peers.json";

/// Offline queue file
pub const QUEUE_FILE: &str = "queue.json";

/// Stable node identity
pub const NODE_ID_FILE: &str = "node_id";

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Corrupt store {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

/// File-backed store rooted at the node's data directory
#[derive(Debug, Clone)]
pub struct Storage {
    data_dir: PathBuf,
}

impl Storage {
    /// Open (creating if needed) a data directory
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)?;
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.data_dir.join(name)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path(name).exists()
    }

    /// Load a JSON document. A missing file is `Ok(None)`; a file that exists
    /// but cannot be read or parsed is `Corrupt`.
    pub fn load<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, StorageError> {
        let path = self.path(name);
        if !path.exists() {
            return Ok(None);
        }

        let file = fs::File::open(&path).map_err(|e| StorageError::Corrupt {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let reader = BufReader::new(file);

        serde_json::from_reader(reader)
            .map(Some)
            .map_err(|e| StorageError::Corrupt {
                path,
                reason: e.to_string(),
            })
    }

    /// Write a JSON document atomically
    pub fn save<T: Serialize>(&self, name: &str, value: &T) -> Result<(), StorageError> {
        let data = serde_json::to_vec_pretty(value)?;
        self.write_atomic(name, &data)
    }

    /// Delete a document if present
    pub fn delete(&self, name: &str) -> Result<(), StorageError> {
        let path = self.path(name);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Read the node id, generating and persisting one on first start
    pub fn load_or_create_node_id(&self) -> Result<PeerId, StorageError> {
        let path = self.path(NODE_ID_FILE);

        if path.exists() {
            let id = fs::read_to_string(&path)?.trim().to_string();
            let valid = id.len() == 32 && id.chars().all(|c| c.is_ascii_hexdigit());
            if !valid {
                return Err(StorageError::Corrupt {
                    path,
                    reason: format!("not a node id: '{}'", id),
                });
            }
            return Ok(id);
        }

        let id = hex::encode(rand::random::<[u8; 16]>());
        self.write_atomic(NODE_ID_FILE, id.as_bytes())?;
        log::info!("Generated node id {}", id);
        Ok(id)
    }

    /// Write to a temporary file first, sync, then rename over the target
    fn write_atomic(&self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        let path = self.path(name);
        let temp_path = self.path(&format!("{}.tmp", name));

        {
            let file = fs::File::create(&temp_path)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(data)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        // Atomic rename
        fs::rename(&temp_path, &path)?;
        Ok(())
    }
}
