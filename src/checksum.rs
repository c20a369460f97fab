//! content fingerprints for deduplication
//!
//! both dedup paths (whole-block and fragment-tail) key their lookup tables
//! on a rolling Adler-32 over the uncompressed bytes. Adler is cheap enough
//! to run inline with ingestion; a hit is always confirmed by a byte
//! comparison before any reference is collapsed, so collisions cost time,
//! not correctness.

use adler32::RollingAdler32;

/// rolling Adler-32 over a byte stream
pub struct Checksum {
    inner: RollingAdler32,
}

impl Checksum {
    pub fn new() -> Self {
        Self {
            inner: RollingAdler32::new(),
        }
    }

    /// feed bytes
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update_buffer(data);
    }

    /// current checksum value
    pub fn value(&self) -> u32 {
        self.inner.hash()
    }
}

impl Default for Checksum {
    fn default() -> Self {
        Self::new()
    }
}

/// one-shot checksum of a buffer
pub fn checksum_of(data: &[u8]) -> u32 {
    let mut c = Checksum::new();
    c.update(data);
    c.value()
}

/// fingerprint of one data block: (checksum, uncompressed length)
pub type BlockDigest = (u32, u32);

pub fn block_digest(data: &[u8]) -> BlockDigest {
    (checksum_of(data), data.len() as u32)
}
