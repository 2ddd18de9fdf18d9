//! Bloom filter for "have I seen this transaction" checks
//!
//! Fixed size, no false negatives. The gossip layer clears it on a timer so
//! the false-positive rate stays bounded as it fills.

use sha2::{Digest, Sha256};

/// Default filter size (bits)
pub const DEFAULT_BLOOM_BITS: usize = 10_000_000;

/// Default number of hash functions
pub const DEFAULT_HASH_FUNCS: u8 = 3;

/// Probabilistic set of byte strings
#[derive(Debug, Clone)]
pub struct BloomFilter {
    /// Filter data (bit array)
    data: Vec<u8>,
    num_bits: usize,
    hash_funcs: u8,
    /// Tweak for hash randomization
    tweak: u32,
    /// Insertions since the last clear
    inserted: usize,
}

impl BloomFilter {
    /// Create a new bloom filter
    pub fn new(size_bits: usize, hash_funcs: u8) -> Self {
        let size_bits = size_bits.max(8);
        Self {
            data: vec![0u8; size_bits.div_ceil(8)],
            num_bits: size_bits,
            hash_funcs: hash_funcs.clamp(1, 50),
            tweak: rand::random(),
            inserted: 0,
        }
    }

    /// Add data to the filter
    pub fn insert(&mut self, data: &[u8]) {
        for i in 0..self.hash_funcs as u32 {
            let idx = self.hash(data, i);
            self.set_bit(idx);
        }
        self.inserted += 1;
    }

    /// Check if data might be in the filter
    pub fn contains(&self, data: &[u8]) -> bool {
        (0..self.hash_funcs as u32).all(|i| self.get_bit(self.hash(data, i)))
    }

    /// Insert and report whether the data was (probably) already present
    pub fn check_and_insert(&mut self, data: &[u8]) -> bool {
        let present = self.contains(data);
        if !present {
            self.insert(data);
        }
        present
    }

    /// Clear the filter
    pub fn clear(&mut self) {
        self.data.fill(0);
        self.inserted = 0;
    }

    pub fn len(&self) -> usize {
        self.inserted
    }

    pub fn is_empty(&self) -> bool {
        self.inserted == 0
    }

    pub fn size_bits(&self) -> usize {
        self.num_bits
    }

    /// Expected false-positive rate at the current fill: (1 - e^(-kn/m))^k
    pub fn estimated_false_positive_rate(&self) -> f64 {
        let k = self.hash_funcs as f64;
        let n = self.inserted as f64;
        let m = self.num_bits as f64;
        (1.0 - (-k * n / m).exp()).powf(k)
    }

    // Private helpers

    fn hash(&self, data: &[u8], n: u32) -> usize {
        let seed = n.wrapping_mul(0xFBA4C795).wrapping_add(self.tweak);
        let mut hasher = Sha256::new();
        hasher.update(seed.to_le_bytes());
        hasher.update(data);
        let hash = hasher.finalize();

        let idx = u64::from_le_bytes([
            hash[0], hash[1], hash[2], hash[3], hash[4], hash[5], hash[6], hash[7],
        ]);
        (idx % self.num_bits as u64) as usize
    }

    fn set_bit(&mut self, idx: usize) {
        self.data[idx / 8] |= 1 << (idx % 8);
    }

    fn get_bit(&self, idx: usize) -> bool {
        (self.data[idx / 8] & (1 << (idx % 8))) != 0
    }
}

impl Default for BloomFilter {
    fn default() -> Self {
        Self::new(DEFAULT_BLOOM_BITS, DEFAULT_HASH_FUNCS)
    }
}
