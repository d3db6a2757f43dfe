//! Small shared utilities: dense bitsets and hash combining.

mod bitset;
mod hash;

pub use bitset::Bitset;
pub use hash::{hash_bytes, hash_combine64};
