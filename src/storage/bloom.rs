//! Bloom filter over segment row keys
//!
//! Double hashing on a CRC32 base hash: probe `i` tests bit
//! `h + i * delta` where `delta` is `h` rotated by 15 bits.
//!
//! ## Encoding
//! ```text
//! ┌──────────────────────┬──────────────┐
//! │ bit array (n bytes)  │ probes (1)   │
//! └──────────────────────┴──────────────┘
//! ```

/// Probabilistic set of row keys
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_probes: u8,
}

impl BloomFilter {
    /// Build a filter over `keys` with `bits_per_key` bits per key
    pub fn build<'a, I>(keys: I, count: usize, bits_per_key: usize) -> Self
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        // k = ln(2) * bits_per_key minimizes the false positive rate
        let num_probes = ((bits_per_key as f64) * 0.69).round().clamp(1.0, 30.0) as u8;
        let num_bits = (count * bits_per_key).max(64);
        let mut filter = Self {
            bits: vec![0u8; (num_bits + 7) / 8],
            num_probes,
        };
        for key in keys {
            filter.insert(key);
        }
        filter
    }

    fn insert(&mut self, key: &[u8]) {
        let num_bits = (self.bits.len() * 8) as u32;
        let mut h = crc32fast::hash(key);
        let delta = h.rotate_left(15);
        for _ in 0..self.num_probes {
            let bit = h % num_bits;
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
            h = h.wrapping_add(delta);
        }
    }

    /// `false` means the key is definitely absent
    pub fn may_contain(&self, key: &[u8]) -> bool {
        if self.bits.is_empty() {
            return true;
        }
        let num_bits = (self.bits.len() * 8) as u32;
        let mut h = crc32fast::hash(key);
        let delta = h.rotate_left(15);
        for _ in 0..self.num_probes {
            let bit = h % num_bits;
            if self.bits[(bit / 8) as usize] & (1 << (bit % 8)) == 0 {
                return false;
            }
            h = h.wrapping_add(delta);
        }
        true
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.bits.clone();
        out.push(self.num_probes);
        out
    }

    /// Decode; `None` if the bytes cannot be a filter
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let (&num_probes, bits) = bytes.split_last()?;
        if num_probes == 0 || num_probes > 30 || bits.is_empty() {
            return None;
        }
        Some(Self {
            bits: bits.to_vec(),
            num_probes,
        })
    }
}
