//! Bloom filter over the series ids of a file

use crate::SeriesId;

/// Bloom filter with double hashing over a fixed 64-bit mix.
///
/// The hash must stay stable across builds since filters are persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: usize,
    num_hashes: u32,
}

impl BloomFilter {
    /// Create a filter sized for `num_keys` ids
    pub fn new(num_keys: usize, bits_per_key: usize) -> Self {
        let num_bits = (num_keys.max(1) * bits_per_key.max(1)).max(64);
        let num_bytes = (num_bits + 7) / 8;

        // Optimal number of hash functions
        let num_hashes = ((bits_per_key as f64) * 0.69).round() as u32;
        let num_hashes = num_hashes.clamp(1, 30);

        Self {
            bits: vec![0u8; num_bytes],
            num_bits: num_bytes * 8,
            num_hashes,
        }
    }

    /// Rebuild a persisted filter
    pub fn from_bytes(data: Vec<u8>, num_hashes: u32) -> Self {
        let num_bits = data.len() * 8;
        Self {
            bits: data,
            num_bits,
            num_hashes,
        }
    }

    pub fn add(&mut self, id: SeriesId) {
        let (h1, h2) = hash_id(id);
        for i in 0..self.num_hashes {
            let bit = self.bit_position(h1, h2, i);
            self.bits[bit / 8] |= 1 << (bit % 8);
        }
    }

    /// False means the id is definitely absent
    pub fn may_contain(&self, id: SeriesId) -> bool {
        if self.num_bits == 0 {
            return true;
        }
        let (h1, h2) = hash_id(id);
        (0..self.num_hashes).all(|i| {
            let bit = self.bit_position(h1, h2, i);
            self.bits[bit / 8] & (1 << (bit % 8)) != 0
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Estimated false positive rate
    pub fn false_positive_rate(&self, num_keys: usize) -> f64 {
        let k = self.num_hashes as f64;
        let m = self.num_bits as f64;
        let n = num_keys as f64;
        (1.0 - (-k * n / m).exp()).powf(k)
    }

    fn bit_position(&self, h1: u64, h2: u64, i: u32) -> usize {
        let hash = h1.wrapping_add(u64::from(i).wrapping_mul(h2));
        (hash % self.num_bits as u64) as usize
    }
}

fn hash_id(id: SeriesId) -> (u64, u64) {
    let h1 = mix64(id);
    (h1, mix64(h1 ^ 0x9e37_79b9_7f4a_7c15) | 1)
}

// splitmix64 finalizer
fn mix64(mut x: u64) -> u64 {
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bloom_filter_basic() {
        let mut filter = BloomFilter::new(100, 10);
        for id in 0..100u64 {
            filter.add(id * 7);
        }
        for id in 0..100u64 {
            assert!(filter.may_contain(id * 7));
        }

        let false_positives = (1000..10_000u64)
            .filter(|id| filter.may_contain(id * 7 + 1))
            .count();
        let fp_rate = false_positives as f64 / 9000.0;
        assert!(fp_rate < 0.05, "False positive rate too high: {}", fp_rate);
    }

    #[test]
    fn test_bloom_filter_persisted() {
        let mut filter = BloomFilter::new(50, 10);
        (0..50).for_each(|id| filter.add(id));

        let restored = BloomFilter::from_bytes(filter.as_bytes().to_vec(), filter.num_hashes());
        assert_eq!(restored, filter);
        assert!((0..50).all(|id| restored.may_contain(id)));
    }
}
