//! Adaptive token masks.
//!
//! For one scannable parser state, the vocabulary partitions into accepted,
//! rejected, and uncertain tokens. Three storage layouts keep the mask
//! compact: a sorted list of the accepted side, a sorted list of the
//! rejected side, or a dense bitset over token ids, chosen by
//! [`USE_BITSET_THRESHOLD`]. Index lists index into the byte-sorted
//! vocabulary; the bitset is over original token ids.

use std::collections::HashSet;

use crate::support::Bitset;

/// Size bound for the sparse layouts.
pub const USE_BITSET_THRESHOLD: usize = 200;

/// Which side of the partition is materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskStore {
    /// `accepted_indices` holds the accepted tokens.
    Accepted,
    /// `rejected_indices` holds the rejected tokens.
    Rejected,
    /// `accepted_bitset` holds accepted token ids densely.
    AcceptedBitset,
}

/// The per-state token classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdaptiveTokenMask {
    /// Storage layout.
    pub store: MaskStore,
    /// Sorted-vocab indices of accepted tokens (`MaskStore::Accepted`).
    pub accepted_indices: Vec<u32>,
    /// Sorted-vocab indices of rejected tokens (`MaskStore::Rejected`).
    pub rejected_indices: Vec<u32>,
    /// Dense accepted set over token ids (`MaskStore::AcceptedBitset`).
    pub accepted_bitset: Option<Bitset>,
    /// Sorted-vocab indices whose acceptance depends on later input.
    pub uncertain_indices: Vec<u32>,
}

impl AdaptiveTokenMask {
    /// Build a mask when both the accepted and rejected sides were
    /// materialized by the sweep.
    pub fn with_rejected(
        vocab_size: usize,
        sorted_vocab: &[(u32, Vec<u8>)],
        accepted: Vec<u32>,
        rejected: Vec<u32>,
        uncertain: Vec<u32>,
    ) -> Self {
        if accepted.len() < USE_BITSET_THRESHOLD {
            return Self {
                store: MaskStore::Accepted,
                accepted_indices: accepted,
                rejected_indices: Vec::new(),
                accepted_bitset: None,
                uncertain_indices: uncertain,
            };
        }
        if rejected.len() < USE_BITSET_THRESHOLD {
            return Self {
                store: MaskStore::Rejected,
                accepted_indices: Vec::new(),
                rejected_indices: rejected,
                accepted_bitset: None,
                uncertain_indices: uncertain,
            };
        }
        Self {
            store: MaskStore::AcceptedBitset,
            accepted_indices: Vec::new(),
            rejected_indices: Vec::new(),
            accepted_bitset: Some(bitset_from_accepted(vocab_size, sorted_vocab, &accepted)),
            uncertain_indices: uncertain,
        }
    }

    /// Build a mask when only the accepted side was materialized (the
    /// rejected side is implicit).
    pub fn accepted_only(
        vocab_size: usize,
        sorted_vocab: &[(u32, Vec<u8>)],
        accepted: Vec<u32>,
        uncertain: Vec<u32>,
    ) -> Self {
        if accepted.len() < USE_BITSET_THRESHOLD {
            return Self {
                store: MaskStore::Accepted,
                accepted_indices: accepted,
                rejected_indices: Vec::new(),
                accepted_bitset: None,
                uncertain_indices: uncertain,
            };
        }
        Self {
            store: MaskStore::AcceptedBitset,
            accepted_indices: Vec::new(),
            rejected_indices: Vec::new(),
            accepted_bitset: Some(bitset_from_accepted(vocab_size, sorted_vocab, &accepted)),
            uncertain_indices: uncertain,
        }
    }

    /// Convert the rejected layout to a dense bitset: everything allowed
    /// except specials, rejected, and uncertain tokens.
    pub fn bitset_from_rejected(
        vocab_size: usize,
        sorted_vocab: &[(u32, Vec<u8>)],
        special_token_ids: &HashSet<u32>,
        rejected: &[u32],
        uncertain: &[u32],
    ) -> Bitset {
        let mut bitset = Bitset::all_set(vocab_size);
        for &id in special_token_ids {
            if (id as usize) < vocab_size {
                bitset.reset(id as usize);
            }
        }
        for &idx in rejected.iter().chain(uncertain.iter()) {
            bitset.reset(sorted_vocab[idx as usize].0 as usize);
        }
        bitset
    }

    /// Heap footprint, used by cache byte accounting.
    pub fn memory_bytes(&self) -> usize {
        self.accepted_indices.len() * 4
            + self.rejected_indices.len() * 4
            + self.uncertain_indices.len() * 4
            + self.accepted_bitset.as_ref().map_or(0, Bitset::memory_bytes)
            + std::mem::size_of::<Self>()
    }
}

/// Dense accepted set over token ids from sorted-vocab indices.
pub fn bitset_from_accepted(
    vocab_size: usize,
    sorted_vocab: &[(u32, Vec<u8>)],
    accepted: &[u32],
) -> Bitset {
    let mut bitset = Bitset::new(vocab_size);
    for &idx in accepted {
        bitset.set(sorted_vocab[idx as usize].0 as usize);
    }
    bitset
}

/// Merge `extra` into `base`, keeping the result sorted and unique.
pub fn union_sorted(base: &mut Vec<u32>, extra: &[u32]) {
    if extra.is_empty() {
        return;
    }
    let mut merged = Vec::with_capacity(base.len() + extra.len());
    let (mut i, mut j) = (0, 0);
    while i < base.len() || j < extra.len() {
        let next = match (base.get(i), extra.get(j)) {
            (Some(&a), Some(&b)) if a < b => {
                i += 1;
                a
            }
            (Some(&a), Some(&b)) if a > b => {
                j += 1;
                b
            }
            (Some(&a), Some(_)) => {
                i += 1;
                j += 1;
                a
            }
            (Some(&a), None) => {
                i += 1;
                a
            }
            (None, Some(&b)) => {
                j += 1;
                b
            }
            (None, None) => break,
        };
        merged.push(next);
    }
    *base = merged;
}

/// Sorted set difference `base \ remove`.
pub fn difference_sorted(base: &[u32], remove: &[u32]) -> Vec<u32> {
    let mut out = Vec::with_capacity(base.len());
    let mut j = 0;
    for &v in base {
        while j < remove.len() && remove[j] < v {
            j += 1;
        }
        if j < remove.len() && remove[j] == v {
            continue;
        }
        out.push(v);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab(n: usize) -> Vec<(u32, Vec<u8>)> {
        (0..n as u32).map(|i| (i, format!("{i:05}").into_bytes())).collect()
    }

    #[test]
    fn small_accepted_side_uses_accepted_layout() {
        let v = vocab(1000);
        let mask =
            AdaptiveTokenMask::with_rejected(1000, &v, vec![1, 2, 3], (4..900).collect(), vec![]);
        assert_eq!(mask.store, MaskStore::Accepted);
        assert_eq!(mask.accepted_indices, vec![1, 2, 3]);
        assert!(mask.rejected_indices.is_empty());
    }

    #[test]
    fn small_rejected_side_uses_rejected_layout() {
        let v = vocab(1000);
        let accepted: Vec<u32> = (0..900).collect();
        let mask = AdaptiveTokenMask::with_rejected(1000, &v, accepted, vec![901, 902], vec![]);
        assert_eq!(mask.store, MaskStore::Rejected);
        assert_eq!(mask.rejected_indices, vec![901, 902]);
    }

    #[test]
    fn both_sides_large_uses_bitset() {
        let v = vocab(1000);
        let accepted: Vec<u32> = (0..500).collect();
        let rejected: Vec<u32> = (500..1000).collect();
        let mask = AdaptiveTokenMask::with_rejected(1000, &v, accepted, rejected, vec![]);
        assert_eq!(mask.store, MaskStore::AcceptedBitset);
        let bitset = mask.accepted_bitset.as_ref().unwrap();
        assert_eq!(bitset.count_ones(), 500);
    }

    #[test]
    fn union_sorted_merges_and_dedups() {
        let mut base = vec![1, 3, 5];
        union_sorted(&mut base, &[2, 3, 6]);
        assert_eq!(base, vec![1, 2, 3, 5, 6]);
    }

    #[test]
    fn difference_sorted_removes_members() {
        assert_eq!(difference_sorted(&[1, 2, 3, 4], &[2, 4]), vec![1, 3]);
        assert_eq!(difference_sorted(&[1, 2], &[]), vec![1, 2]);
    }
}
