//! Transaction merkle root.

use stakd_consensus::Hash256;

use crate::hash::hash_pair;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MerkleRoot {
    pub root: Hash256,
    /// Set when two identical sibling hashes were combined at any level. Such a tree
    /// has the same root as a different transaction list, so the block is malleated.
    pub mutated: bool,
}

pub fn merkle_root(leaves: &[Hash256]) -> MerkleRoot {
    if leaves.is_empty() {
        return MerkleRoot {
            root: [0u8; 32],
            mutated: false,
        };
    }
    let mut level = leaves.to_vec();
    let mut mutated = false;
    while level.len() > 1 {
        for pair in level.chunks_exact(2) {
            if pair[0] == pair[1] {
                mutated = true;
            }
        }
        if level.len() % 2 == 1 {
            if let Some(last) = level.last().copied() {
                level.push(last);
            }
        }
        level = level
            .chunks_exact(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]))
            .collect();
    }
    MerkleRoot {
        root: level[0],
        mutated,
    }
}
