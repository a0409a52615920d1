//! Membership filter for negative-lookup elimination.
//!
//! Each partition keeps one live filter over its record ids and tokens, and
//! every segment and cold archive carries a sidecar filter of the ids it
//! holds. A lookup checks the filter first; if the key is definitely absent
//! the partition or file is skipped entirely.
//!
//! Bits live in atomic words so inserts never need a lock. Probe positions
//! come from blake3, which is stable across processes and platforms, so a
//! sidecar written by one run is valid in the next.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::error::VaultResult;
use crate::types::{FrameId, Token};

const ID_DOMAIN: u8 = b'i';
const TOKEN_DOMAIN: u8 = b't';

/// A bloom filter using double hashing (Kirsch-Mitzenmacker).
#[derive(Debug)]
pub struct BloomFilter {
    bits: Vec<AtomicU64>,
    num_bits: usize,
    num_hashes: u32,
    capacity: usize,
    inserted: AtomicUsize,
}

/// Serialized form of a [`BloomFilter`].
#[derive(Serialize, Deserialize)]
struct BloomImage {
    num_bits: usize,
    num_hashes: u32,
    capacity: usize,
    inserted: usize,
    words: Vec<u64>,
}

impl BloomFilter {
    /// Create a bloom filter sized for `expected_keys` with the given
    /// false-positive rate (e.g. 0.01 = 1%).
    pub fn new(expected_keys: usize, fp_rate: f64) -> Self {
        let expected_keys = expected_keys.max(1);
        let fp_rate = fp_rate.clamp(1e-10, 0.5);

        // Optimal number of bits: m = -n * ln(p) / (ln2)^2
        let num_bits = (-(expected_keys as f64) * fp_rate.ln() / 2.0_f64.ln().powi(2)).ceil() as usize;
        let num_bits = num_bits.max(64);

        // Optimal number of hashes: k = (m/n) * ln2
        let num_hashes = ((num_bits as f64 / expected_keys as f64) * 2.0_f64.ln()).ceil() as u32;

        Self {
            bits: (0..num_bits.div_ceil(64)).map(|_| AtomicU64::new(0)).collect(),
            num_bits,
            num_hashes: num_hashes.clamp(1, 30),
            capacity: expected_keys,
            inserted: AtomicUsize::new(0),
        }
    }

    pub fn insert_id(&self, id: FrameId) {
        self.insert(ID_DOMAIN, &id.to_le_bytes());
    }

    pub fn insert_token(&self, token: Token) {
        self.insert(TOKEN_DOMAIN, &token.0.to_le_bytes());
    }

    /// `false` means the id is definitely absent.
    pub fn may_contain_id(&self, id: FrameId) -> bool {
        self.may_contain(ID_DOMAIN, &id.to_le_bytes())
    }

    /// `false` means no record carries the token.
    pub fn may_contain_token(&self, token: Token) -> bool {
        self.may_contain(TOKEN_DOMAIN, &token.0.to_le_bytes())
    }

    fn insert(&self, domain: u8, key: &[u8]) {
        let (h1, h2) = hash_pair(domain, key);
        for i in 0..self.num_hashes {
            let idx = self.bit_index(h1, h2, i);
            self.bits[idx / 64].fetch_or(1u64 << (idx % 64), Ordering::Relaxed);
        }
        self.inserted.fetch_add(1, Ordering::Relaxed);
    }

    fn may_contain(&self, domain: u8, key: &[u8]) -> bool {
        let (h1, h2) = hash_pair(domain, key);
        (0..self.num_hashes).all(|i| {
            let idx = self.bit_index(h1, h2, i);
            self.bits[idx / 64].load(Ordering::Relaxed) & (1u64 << (idx % 64)) != 0
        })
    }

    fn bit_index(&self, h1: u64, h2: u64, i: u32) -> usize {
        (h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.num_bits as u64) as usize
    }

    /// Keys inserted so far (including duplicates).
    pub fn inserted(&self) -> usize {
        self.inserted.load(Ordering::Relaxed)
    }

    /// Number of keys the filter was sized for.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Once twice the design capacity has gone in, the false-positive rate
    /// is well above target and the filter should be rebuilt larger.
    pub fn is_saturated(&self) -> bool {
        self.inserted() > self.capacity.saturating_mul(2)
    }

    /// Number of bits in the filter.
    pub fn size_bits(&self) -> usize {
        self.num_bits
    }

    /// Serialize with bincode for a sidecar file.
    pub fn to_bytes(&self) -> VaultResult<Vec<u8>> {
        let image = BloomImage {
            num_bits: self.num_bits,
            num_hashes: self.num_hashes,
            capacity: self.capacity,
            inserted: self.inserted(),
            words: self.bits.iter().map(|w| w.load(Ordering::Relaxed)).collect(),
        };
        Ok(bincode::serialize(&image)?)
    }

    pub fn from_bytes(data: &[u8]) -> VaultResult<Self> {
        let image: BloomImage = bincode::deserialize(data)?;
        if image.words.len() != image.num_bits.div_ceil(64) || image.num_bits == 0 {
            return Err(crate::error::VaultError::corrupt(
                "bloom sidecar",
                "word count does not match bit count",
            ));
        }
        Ok(Self {
            bits: image.words.into_iter().map(AtomicU64::new).collect(),
            num_bits: image.num_bits,
            num_hashes: image.num_hashes,
            capacity: image.capacity,
            inserted: AtomicUsize::new(image.inserted),
        })
    }
}

fn hash_pair(domain: u8, key: &[u8]) -> (u64, u64) {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[domain]);
    hasher.update(key);
    let digest = hasher.finalize();
    let bytes = digest.as_bytes();
    let mut a = [0u8; 8];
    let mut b = [0u8; 8];
    a.copy_from_slice(&bytes[0..8]);
    b.copy_from_slice(&bytes[8..16]);
    // An even h2 would cycle through only half the positions.
    (u64::from_le_bytes(a), u64::from_le_bytes(b) | 1)
}

/// A partition's live filter, replaceable without blocking readers.
#[derive(Debug)]
pub struct MembershipFilter {
    current: ArcSwap<BloomFilter>,
    fp_rate: f64,
}

impl MembershipFilter {
    pub fn new(expected_keys: usize, fp_rate: f64) -> Self {
        Self {
            current: ArcSwap::from_pointee(BloomFilter::new(expected_keys, fp_rate)),
            fp_rate,
        }
    }

    /// The filter readers should consult.
    pub fn load(&self) -> Arc<BloomFilter> {
        self.current.load_full()
    }

    pub fn insert_id(&self, id: FrameId) {
        self.current.load().insert_id(id);
    }

    pub fn insert_token(&self, token: Token) {
        self.current.load().insert_token(token);
    }

    pub fn may_contain_id(&self, id: FrameId) -> bool {
        self.current.load().may_contain_id(id)
    }

    pub fn may_contain_token(&self, token: Token) -> bool {
        self.current.load().may_contain_token(token)
    }

    pub fn is_saturated(&self) -> bool {
        self.current.load().is_saturated()
    }

    /// Publish a freshly built filter sized for `expected_keys`.
    ///
    /// The caller fills it from the partition's indexes while holding the
    /// write section, so no insert can slip between build and publish.
    pub fn rebuild(&self, expected_keys: usize, fill: impl FnOnce(&BloomFilter)) {
        let fresh = BloomFilter::new(expected_keys, self.fp_rate);
        fill(&fresh);
        self.current.store(Arc::new(fresh));
    }
}
