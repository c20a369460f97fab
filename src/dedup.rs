//! content fingerprint tables for deduplication
//!
//! two independent tables: fragment tails keyed by (checksum, length),
//! whole files keyed by their sequence of per-block fingerprints. both keep
//! the first-recorded owner; a lookup hit is only a candidate until the
//! caller confirms the bytes match (fragments are read back from the image,
//! block sequences carry per-block lengths in the key).

use std::collections::HashMap;

use crate::checksum::BlockDigest;
use crate::pending::SharedBlockList;

/// location of a previously packed fragment tail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentRef {
    pub fragment: u32,
    pub offset: u32,
}

#[derive(Default)]
pub struct DedupTables {
    fragments: HashMap<(u32, u32), FragmentRef>,
    blocks: HashMap<Vec<BlockDigest>, SharedBlockList>,
}

impl DedupTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find_fragment(&self, digest: (u32, u32)) -> Option<FragmentRef> {
        self.fragments.get(&digest).copied()
    }

    /// remember a freshly packed tail; the first owner wins
    pub fn record_fragment(&mut self, digest: (u32, u32), fragment: FragmentRef) {
        self.fragments.entry(digest).or_insert(fragment);
    }

    pub fn find_blocks(&self, digests: &[BlockDigest]) -> Option<&SharedBlockList> {
        self.blocks.get(digests)
    }

    /// remember a completed file's block sequence; the first owner wins
    pub fn record_blocks(&mut self, digests: Vec<BlockDigest>, blocks: SharedBlockList) {
        self.blocks.entry(digests).or_insert(blocks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::block_digest;

    #[test]
    fn test_fragment_first_owner_wins() {
        let mut t = DedupTables::new();
        let d = (0xabcd, 5);
        t.record_fragment(
            d,
            FragmentRef {
                fragment: 0,
                offset: 0,
            },
        );
        t.record_fragment(
            d,
            FragmentRef {
                fragment: 3,
                offset: 100,
            },
        );
        assert_eq!(
            t.find_fragment(d),
            Some(FragmentRef {
                fragment: 0,
                offset: 0
            })
        );
    }

    #[test]
    fn test_fragment_miss() {
        let t = DedupTables::new();
        assert_eq!(t.find_fragment((1, 2)), None);
    }

    #[test]
    fn test_block_sequence_lookup() {
        let mut t = DedupTables::new();
        let digests = vec![block_digest(b"one"), block_digest(b"two")];
        let owner = SharedBlockList::new();
        owner.record(96, 3);
        t.record_blocks(digests.clone(), owner);

        let hit = t.find_blocks(&digests).unwrap();
        assert_eq!(hit.snapshot().0, 96);

        // different sequence, same first block
        let other = vec![block_digest(b"one")];
        assert!(t.find_blocks(&other).is_none());
    }
}
