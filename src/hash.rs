//! Hasher for the engine's internal id sets.
//!
//! Edge sets, listener tables and pending deliveries are keyed by small
//! integer ids chosen by the engine itself, so HashDoS resistance buys
//! nothing there. `FastHashBuilder` uses foldhash with a fixed seed and adds
//! no per-collection state.

use std::hash::BuildHasher;

use foldhash::fast::{FixedState, FoldHasher};

const SEED: u64 = 0x9e37_79b9_7f4a_7c15;

/// Zero-sized, deterministic `BuildHasher` backed by foldhash.
#[derive(Clone, Copy, Debug, Default)]
pub struct FastHashBuilder;

impl BuildHasher for FastHashBuilder {
    type Hasher = FoldHasher<'static>;

    #[inline]
    fn build_hasher(&self) -> Self::Hasher {
        FixedState::with_seed(SEED).build_hasher()
    }
}
