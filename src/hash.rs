//! Zero-sized hash builder for the runtime's internal collections.
//!
//! Edge sets, job queues and write logs all key on small integer ids, so we
//! use foldhash with a fixed seed: fast, deterministic, and zero bytes per
//! collection. HashDoS resistance is irrelevant for arena indices.

use std::hash::BuildHasher;

pub use foldhash::fast::{FixedState, FoldHasher};

/// A zero-sized `BuildHasher` over foldhash with a fixed seed.
///
/// Every instance hashes identically, which keeps iteration order of the
/// insertion-ordered collections reproducible across runs.
#[derive(Clone, Copy, Debug, Default)]
pub struct FixedHashBuilder;

impl BuildHasher for FixedHashBuilder {
    type Hasher = FoldHasher;

    #[inline]
    fn build_hasher(&self) -> Self::Hasher {
        FixedState::with_seed(0x9e3779b97f4a7c15).build_hasher()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_is_zero_sized() {
        assert_eq!(std::mem::size_of::<FixedHashBuilder>(), 0);
    }

    #[test]
    fn hashing_is_deterministic() {
        let a = FixedHashBuilder.hash_one(41u32);
        let b = FixedHashBuilder.hash_one(41u32);
        assert_eq!(a, b);
    }
}
