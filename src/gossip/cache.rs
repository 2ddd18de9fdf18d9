//! Bounded cache of recent transaction payloads
//!
//! Holds what this node distributed or accepted so peers that received a
//! notification can pull the payload. Oldest entries leave first.

use crate::network::message::TxHash;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};

#[derive(Debug)]
pub struct PayloadCache {
    entries: HashMap<TxHash, Bytes>,
    order: VecDeque<TxHash>,
    capacity: usize,
}

impl PayloadCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn insert(&mut self, hash: TxHash, payload: Bytes) {
        if self.entries.contains_key(&hash) {
            return;
        }
        while self.entries.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
        self.order.push_back(hash.clone());
        self.entries.insert(hash, payload);
    }

    pub fn get(&self, hash: &str) -> Option<Bytes> {
        self.entries.get(hash).cloned()
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_oldest() {
        let mut cache = PayloadCache::new(2);
        cache.insert("a".to_string(), Bytes::from_static(b"1"));
        cache.insert("b".to_string(), Bytes::from_static(b"2"));
        cache.insert("c".to_string(), Bytes::from_static(b"3"));

        assert!(!cache.contains("a"));
        assert_eq!(cache.get("c"), Some(Bytes::from_static(b"3")));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_duplicate_insert_keeps_position() {
        let mut cache = PayloadCache::new(2);
        cache.insert("a".to_string(), Bytes::from_static(b"1"));
        cache.insert("a".to_string(), Bytes::from_static(b"1"));
        cache.insert("b".to_string(), Bytes::from_static(b"2"));
        assert_eq!(cache.len(), 2);
    }
}
