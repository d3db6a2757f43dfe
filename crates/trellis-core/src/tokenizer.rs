//! Tokenizer vocabulary artifact.
//!
//! [`TokenizerInfo`] is the frozen per-vocabulary input to mask
//! compilation: the decoded vocabulary sorted byte-lexicographically, trie
//! subtree ranges for batch prefix rejection, the special-token set, and a
//! 64-bit vocabulary hash used in crossing-cache keys. Tokens are raw
//! decoded byte strings; decoding (byte-fallback, byte-level BPE) happens
//! upstream in the tokenizer loader.

use std::collections::HashSet;

use crate::error::{Result, TrellisError};
use crate::support::{hash_bytes, hash_combine64};

/// Frozen vocabulary information for grammar compilation.
#[derive(Debug, Clone)]
pub struct TokenizerInfo {
    vocab_size: usize,
    /// `(token_id, decoded bytes)`, sorted byte-lexicographically.
    sorted_decoded_vocab: Vec<(u32, Vec<u8>)>,
    /// For `sorted_decoded_vocab[i]`, the index one past the last entry
    /// whose bytes have entry `i` as a prefix.
    trie_subtree_ranges: Vec<u32>,
    special_token_ids: HashSet<u32>,
    tokenizer_hash: u64,
}

impl TokenizerInfo {
    /// Build from a decoded vocabulary.
    ///
    /// Tokens with an empty decoded string are treated as special, in
    /// addition to the ids passed in `special_token_ids`. `vocab_size`
    /// defaults to the vocabulary length; it may be larger (padded model
    /// heads), never smaller.
    pub fn new(
        decoded_vocab: Vec<Vec<u8>>,
        special_token_ids: Vec<u32>,
        vocab_size: Option<usize>,
    ) -> Result<Self> {
        let vocab_size = vocab_size.unwrap_or(decoded_vocab.len());
        if vocab_size < decoded_vocab.len() {
            return Err(TrellisError::TokenizerError(format!(
                "vocab_size ({vocab_size}) is smaller than the vocabulary ({})",
                decoded_vocab.len()
            )));
        }

        let mut specials: HashSet<u32> = special_token_ids.into_iter().collect();
        let mut sorted_decoded_vocab = Vec::with_capacity(decoded_vocab.len());
        for (id, bytes) in decoded_vocab.into_iter().enumerate() {
            let id = id as u32;
            if bytes.is_empty() {
                specials.insert(id);
            } else if !specials.contains(&id) {
                sorted_decoded_vocab.push((id, bytes));
            }
        }
        sorted_decoded_vocab.sort_by(|a, b| a.1.cmp(&b.1));

        let trie_subtree_ranges = build_trie_subtree_ranges(&sorted_decoded_vocab);
        let tokenizer_hash = hash_vocab(&sorted_decoded_vocab, &specials, vocab_size);

        Ok(Self {
            vocab_size,
            sorted_decoded_vocab,
            trie_subtree_ranges,
            special_token_ids: specials,
            tokenizer_hash,
        })
    }

    /// Convenience constructor from string tokens.
    pub fn from_str_vocab<S: AsRef<str>>(vocab: &[S]) -> Result<Self> {
        Self::new(
            vocab.iter().map(|s| s.as_ref().as_bytes().to_vec()).collect(),
            Vec::new(),
            None,
        )
    }

    /// Total vocabulary size, including special and padding tokens.
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// The decoded vocabulary sorted byte-lexicographically.
    pub fn sorted_decoded_vocab(&self) -> &[(u32, Vec<u8>)] {
        &self.sorted_decoded_vocab
    }

    /// Subtree range array parallel to [`Self::sorted_decoded_vocab`]:
    /// `[i + 1, range[i])` are exactly the tokens prefixed by token `i`.
    pub fn trie_subtree_ranges(&self) -> &[u32] {
        &self.trie_subtree_ranges
    }

    /// Ids of special tokens (control tokens, padding, empty strings).
    pub fn special_token_ids(&self) -> &HashSet<u32> {
        &self.special_token_ids
    }

    /// 64-bit vocabulary fingerprint.
    pub fn tokenizer_hash(&self) -> u64 {
        self.tokenizer_hash
    }
}

fn build_trie_subtree_ranges(sorted: &[(u32, Vec<u8>)]) -> Vec<u32> {
    let n = sorted.len();
    let mut ranges = vec![n as u32; n];
    let mut stack: Vec<usize> = Vec::new();
    for i in 0..n {
        while let Some(&top) = stack.last() {
            if sorted[i].1.starts_with(&sorted[top].1) {
                break;
            }
            ranges[top] = i as u32;
            stack.pop();
        }
        stack.push(i);
    }
    ranges
}

fn hash_vocab(sorted: &[(u32, Vec<u8>)], specials: &HashSet<u32>, vocab_size: usize) -> u64 {
    let mut acc = hash_combine64(&[vocab_size as u64, sorted.len() as u64]);
    for (id, bytes) in sorted {
        acc = hash_combine64(&[acc, *id as u64, hash_bytes(bytes)]);
    }
    let mut special_ids: Vec<u32> = specials.iter().copied().collect();
    special_ids.sort_unstable();
    for id in special_ids {
        acc = hash_combine64(&[acc, id as u64]);
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vocab_is_sorted_bytewise() {
        let info = TokenizerInfo::from_str_vocab(&["banana", "apple", "app"]).unwrap();
        let sorted: Vec<&[u8]> = info
            .sorted_decoded_vocab()
            .iter()
            .map(|(_, b)| b.as_slice())
            .collect();
        assert_eq!(sorted, vec![b"app".as_slice(), b"apple", b"banana"]);
    }

    #[test]
    fn empty_tokens_become_special() {
        let info = TokenizerInfo::new(
            vec![b"a".to_vec(), Vec::new(), b"b".to_vec()],
            vec![2],
            None,
        )
        .unwrap();
        assert!(info.special_token_ids().contains(&1));
        assert!(info.special_token_ids().contains(&2));
        assert_eq!(info.sorted_decoded_vocab().len(), 1);
    }

    #[test]
    fn subtree_ranges_enumerate_prefix_subtrees() {
        let info = TokenizerInfo::from_str_vocab(&["a", "ab", "abc", "b", "bc"]).unwrap();
        assert_eq!(info.trie_subtree_ranges(), &[3, 3, 3, 5, 5]);
    }

    #[test]
    fn hash_depends_on_vocab_content() {
        let a = TokenizerInfo::from_str_vocab(&["x", "y"]).unwrap();
        let b = TokenizerInfo::from_str_vocab(&["x", "z"]).unwrap();
        let a2 = TokenizerInfo::from_str_vocab(&["x", "y"]).unwrap();
        assert_ne!(a.tokenizer_hash(), b.tokenizer_hash());
        assert_eq!(a.tokenizer_hash(), a2.tokenizer_hash());
    }

    #[test]
    fn vocab_size_smaller_than_vocab_is_rejected() {
        let result = TokenizerInfo::new(vec![b"a".to_vec(), b"b".to_vec()], vec![], Some(1));
        assert!(result.is_err());
    }
}
