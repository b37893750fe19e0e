// Node arena - per-engine storage for cell metadata
//
// Every cell (leaf or derived) owns one slot in its engine's slab. The slot
// holds the currency state and both directions of every dependency edge:
// - sources: cells the last recomputation of this cell read
// - subscribers: derived cells whose last recomputation read this cell
//
// The typed values live in the cell handles, not here. The arena only sees
// ids, which keeps it monomorphic and lets one engine host cells of any type.
//
// Edges are kept symmetric: every mutation that touches one direction touches
// the other in the same call. Slab slots are reused after removal, so a stale
// id left in an edge set would silently point at an unrelated cell.

use crate::hash::FastHashBuilder;
use indexmap::IndexSet;
use slab::Slab;
use std::fmt;
use tracing::trace;

/// Ordered, deduplicated set of cell ids.
pub(crate) type CellSet = IndexSet<CellId, FastHashBuilder>;

/// Identity of a cell within its engine.
///
/// Ids are only meaningful together with the engine that issued them, and are
/// reused once the cell they named has been dropped.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, PartialOrd, Ord)]
pub struct CellId(u32);

impl CellId {
    /// Create a CellId from a raw arena index
    pub(crate) fn new(index: u32) -> Self {
        Self(index)
    }

    /// Convert to usize for slab indexing
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cell#{}", self.0)
    }
}

/// Currency of a cell's cached value.
///
/// Leaf cells are always `Current`. Derived cells move
/// `Dirty -> Updating -> Current` when read, and back to `Dirty` when an
/// upstream cell changes or they are invalidated by hand.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CellState {
    /// Cached value is stale and will be recomputed on the next read
    Dirty,
    /// The computation is running right now
    Updating,
    /// Cached value is fresh
    Current,
}

/// Metadata for one cell stored in the arena.
#[derive(Debug)]
pub(crate) struct NodeMetadata {
    state: CellState,
    sources: CellSet,
    subscribers: CellSet,
}

impl NodeMetadata {
    /// Metadata for an observable leaf cell
    pub(crate) fn leaf() -> Self {
        Self::with_state(CellState::Current)
    }

    /// Metadata for a derived cell that has not computed yet
    pub(crate) fn derived() -> Self {
        Self::with_state(CellState::Dirty)
    }

    fn with_state(state: CellState) -> Self {
        Self {
            state,
            sources: CellSet::default(),
            subscribers: CellSet::default(),
        }
    }
}

/// Slab of node metadata owned by one engine.
#[derive(Debug, Default)]
pub(crate) struct NodeArena {
    nodes: Slab<NodeMetadata>,
}

impl NodeArena {
    /// Insert a node and return its id
    pub(crate) fn insert(&mut self, metadata: NodeMetadata) -> CellId {
        let entry = self.nodes.vacant_entry();
        let key = entry.key();
        entry.insert(metadata);
        CellId::new(key as u32)
    }

    /// Remove a node and detach every edge that mentions it
    pub(crate) fn remove(&mut self, id: CellId) -> Option<NodeMetadata> {
        if !self.nodes.contains(id.index()) {
            return None;
        }
        let metadata = self.nodes.remove(id.index());
        for source in &metadata.sources {
            if let Some(node) = self.nodes.get_mut(source.index()) {
                node.subscribers.shift_remove(&id);
            }
        }
        for subscriber in &metadata.subscribers {
            if let Some(node) = self.nodes.get_mut(subscriber.index()) {
                node.sources.shift_remove(&id);
            }
        }
        Some(metadata)
    }

    pub(crate) fn get(&self, id: CellId) -> Option<&NodeMetadata> {
        self.nodes.get(id.index())
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Current state of a node.
    ///
    /// Returns `Current` for stale ids; there is nothing left to recompute.
    pub(crate) fn state(&self, id: CellId) -> CellState {
        self.get(id).map_or(CellState::Current, |node| node.state)
    }

    pub(crate) fn set_state(&mut self, id: CellId, state: CellState) {
        if let Some(node) = self.nodes.get_mut(id.index()) {
            node.state = state;
        }
    }

    /// Record that `reader` read `source`, in both directions.
    ///
    /// Returns true if the edge is new.
    pub(crate) fn add_edge(&mut self, reader: CellId, source: CellId) -> bool {
        if !self.nodes.contains(reader.index()) || !self.nodes.contains(source.index()) {
            return false;
        }
        let added = self.nodes[reader.index()].sources.insert(source);
        self.nodes[source.index()].subscribers.insert(reader);
        added
    }

    /// Drop every dependency edge of `reader` and unsubscribe it from its sources.
    ///
    /// Returns the number of edges dropped.
    pub(crate) fn clear_sources(&mut self, reader: CellId) -> usize {
        let Some(node) = self.nodes.get_mut(reader.index()) else {
            return 0;
        };
        let sources = std::mem::take(&mut node.sources);
        for source in &sources {
            if let Some(node) = self.nodes.get_mut(source.index()) {
                node.subscribers.shift_remove(&reader);
            }
        }
        sources.len()
    }

    pub(crate) fn sources(&self, id: CellId) -> Vec<CellId> {
        self.get(id)
            .map(|node| node.sources.iter().copied().collect())
            .unwrap_or_default()
    }

    pub(crate) fn subscribers(&self, id: CellId) -> Vec<CellId> {
        self.get(id)
            .map(|node| node.subscribers.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Mark every transitive dependent of `origin` as Dirty.
    ///
    /// A dependent that is already Dirty stops the walk: everything below it
    /// was dirtied when it went stale. A dependent that is Updating is reading
    /// fresh values right now and is left alone. Each cell is therefore
    /// dirtied at most once per call, and the call never recomputes anything.
    ///
    /// Returns the number of cells that went from Current to Dirty.
    pub(crate) fn mark_subscribers_dirty(&mut self, origin: CellId) -> usize {
        let mut worklist: Vec<CellId> = match self.get(origin) {
            Some(node) => node.subscribers.iter().copied().collect(),
            None => return 0,
        };
        let mut dirtied = 0;

        while let Some(id) = worklist.pop() {
            let Some(node) = self.nodes.get_mut(id.index()) else {
                continue;
            };
            match node.state {
                CellState::Current => {
                    cov_mark::hit!(dependent_marked_dirty);
                    node.state = CellState::Dirty;
                    dirtied += 1;
                    trace!(cell = %id, %origin, "marked dirty");
                    worklist.extend(node.subscribers.iter().copied());
                }
                CellState::Dirty => {
                    cov_mark::hit!(dependent_already_dirty);
                }
                CellState::Updating => {
                    cov_mark::hit!(dependent_updating_skipped);
                }
            }
        }

        dirtied
    }
}
