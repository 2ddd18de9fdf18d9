//! Storage module for node persistence

pub mod persistence;

pub use persistence::{Storage, StorageError, NODE_ID_FILE, PEERS_FILE, QUEUE_FILE};
