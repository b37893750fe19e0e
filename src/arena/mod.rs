// Arena-based storage for the dependency graph
//
// This module provides the two halves of an engine's shared state:
// - Node arena: per-cell metadata (currency state, dependency edges)
// - Tracking: the stack of active recomputations that reads are attributed to
//
// Both live inside the engine's lock. Cell handles only carry a CellId that
// indexes into the node arena.

pub mod node_arena;
pub mod tracking;

pub use node_arena::{CellId, CellState};
pub(crate) use node_arena::{NodeArena, NodeMetadata};
pub(crate) use tracking::{ActiveStack, FrameGuard, UntrackedGuard, record_read};
