// Dependency tracking - attributes reads to the recomputation that made them
//
// Each engine keeps a stack of frames. A derived cell pushes a tracking frame
// for the duration of its computation; `Engine::untracked` pushes a barrier.
// Any cell read consults the top frame only: nested recomputations push their
// own frame and pop it before control returns to the outer computation, so the
// top of the stack is always the computation that issued the read.
//
// Frames are popped by RAII guards so the stack unwinds on `?` returns and on
// panics alike.

use super::node_arena::{CellId, CellState, NodeArena};
use crate::engine::EngineGuard;
use crate::error::{Error, Result};
use tracing::trace;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Frame {
    /// A derived cell is recomputing; reads become its dependencies.
    Tracking {
        cell: CellId,
        /// A read inside this frame failed and the computation carried on
        tainted: bool,
    },
    /// Reads are not attributed to anyone.
    Untracked,
}

/// Stack of active computations for one engine.
#[derive(Debug, Default)]
pub(crate) struct ActiveStack {
    frames: Vec<Frame>,
}

impl ActiveStack {
    /// The derived cell whose computation is issuing reads right now, if any.
    pub(crate) fn current(&self) -> Option<CellId> {
        match self.frames.last() {
            Some(Frame::Tracking { cell, .. }) => Some(*cell),
            _ => None,
        }
    }

    /// Number of recomputations currently in flight.
    pub(crate) fn depth(&self) -> usize {
        self.frames
            .iter()
            .filter(|frame| matches!(frame, Frame::Tracking { .. }))
            .count()
    }

    pub(crate) fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    pub(crate) fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    fn taint_current(&mut self) {
        if let Some(Frame::Tracking { tainted, .. }) = self.frames.last_mut() {
            *tainted = true;
        }
    }
}

/// Attribute a read of `source` to the active computation, if there is one.
///
/// The reader is subscribed silently: becoming a dependent does not count as
/// a change of either cell. `succeeded` is false when the read returned an
/// error or left `source` dirty; a computation that swallows such a read must
/// not be trusted as Current afterwards.
pub(crate) fn record_read(
    active: &mut ActiveStack,
    nodes: &mut NodeArena,
    source: CellId,
    succeeded: bool,
) {
    let Some(reader) = active.current() else {
        return;
    };
    if reader == source {
        return;
    }
    if nodes.add_edge(reader, source) {
        trace!(%reader, %source, "dependency recorded");
    }
    if !succeeded {
        cov_mark::hit!(read_failed_inside_computation);
        active.taint_current();
    }
}

/// Keeps a tracking frame on the stack for the length of one recomputation.
///
/// Entering drops the cell's previous edges, pushes the frame and marks the
/// cell Updating. [`finish`](Self::finish) pops it on the normal path; if the
/// guard is dropped instead (error return or panic) the cell reverts to Dirty
/// and the edges recorded by the failed attempt are discarded.
pub(crate) struct FrameGuard<'g, 'e> {
    guard: &'g EngineGuard<'e>,
    cell: CellId,
    armed: bool,
}

impl<'g, 'e> FrameGuard<'g, 'e> {
    pub(crate) fn enter(guard: &'g EngineGuard<'e>, cell: CellId) -> Result<Self> {
        let limit = guard.config().max_depth;
        guard.with(|state| {
            if state.active.depth() >= limit {
                cov_mark::hit!(depth_limit_reached);
                return Err(Error::DepthExceeded { limit });
            }
            let dropped = state.nodes.clear_sources(cell);
            if dropped > 0 {
                trace!(%cell, dropped, "stale dependencies dropped");
            }
            state.active.push(Frame::Tracking {
                cell,
                tainted: false,
            });
            state.nodes.set_state(cell, CellState::Updating);
            Ok(())
        })?;
        Ok(Self {
            guard,
            cell,
            armed: true,
        })
    }

    /// Pop the frame after the computation returned.
    ///
    /// Returns the state the cell settled in: Current, or Dirty when the
    /// computation failed or read a cell that failed.
    pub(crate) fn finish(mut self, succeeded: bool) -> CellState {
        self.armed = false;
        self.exit(succeeded)
    }

    fn exit(&self, succeeded: bool) -> CellState {
        self.guard.with(|state| {
            let tainted = match state.active.pop() {
                Some(Frame::Tracking { cell, tainted }) => {
                    debug_assert_eq!(cell, self.cell, "recomputation frames out of order");
                    tainted
                }
                other => {
                    debug_assert!(false, "expected tracking frame, found {other:?}");
                    false
                }
            };

            if !succeeded {
                state.nodes.clear_sources(self.cell);
            }
            let settled = if succeeded && !tainted {
                CellState::Current
            } else {
                CellState::Dirty
            };
            state.nodes.set_state(self.cell, settled);

            // A Current cell never reads from a Dirty one. Readers recorded
            // before this run (e.g. around a manual invalidation) must follow.
            if settled == CellState::Dirty {
                let dirtied = state.nodes.mark_subscribers_dirty(self.cell);
                if dirtied > 0 {
                    cov_mark::hit!(unsettled_cell_dirtied_dependents);
                    trace!(cell = %self.cell, dirtied, "dependents of unsettled cell dirtied");
                }
            }
            settled
        })
    }
}

impl Drop for FrameGuard<'_, '_> {
    fn drop(&mut self) {
        if self.armed {
            cov_mark::hit!(frame_unwound);
            self.exit(false);
        }
    }
}

/// Keeps an untracked barrier on the stack until dropped.
pub(crate) struct UntrackedGuard<'g, 'e> {
    guard: &'g EngineGuard<'e>,
}

impl<'g, 'e> UntrackedGuard<'g, 'e> {
    pub(crate) fn new(guard: &'g EngineGuard<'e>) -> Self {
        guard.with(|state| state.active.push(Frame::Untracked));
        Self { guard }
    }
}

impl Drop for UntrackedGuard<'_, '_> {
    fn drop(&mut self) {
        self.guard.with(|state| {
            let frame = state.active.pop();
            debug_assert_eq!(frame, Some(Frame::Untracked));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::NodeMetadata;

    #[test]
    fn reads_are_attributed_to_the_top_frame() {
        let mut nodes = NodeArena::default();
        let leaf = nodes.insert(NodeMetadata::leaf());
        let outer = nodes.insert(NodeMetadata::derived());
        let inner = nodes.insert(NodeMetadata::derived());
        let mut active = ActiveStack::default();

        active.push(Frame::Tracking {
            cell: outer,
            tainted: false,
        });
        active.push(Frame::Tracking {
            cell: inner,
            tainted: false,
        });
        record_read(&mut active, &mut nodes, leaf, true);
        active.pop();
        record_read(&mut active, &mut nodes, inner, true);

        assert_eq!(nodes.sources(inner), vec![leaf]);
        assert_eq!(nodes.sources(outer), vec![inner]);
        assert_eq!(active.depth(), 1);
    }

    #[test]
    fn untracked_barrier_hides_the_reader() {
        let mut nodes = NodeArena::default();
        let leaf = nodes.insert(NodeMetadata::leaf());
        let reader = nodes.insert(NodeMetadata::derived());
        let mut active = ActiveStack::default();

        active.push(Frame::Tracking {
            cell: reader,
            tainted: false,
        });
        active.push(Frame::Untracked);
        assert_eq!(active.current(), None);
        record_read(&mut active, &mut nodes, leaf, true);

        assert!(nodes.sources(reader).is_empty());
        assert_eq!(active.depth(), 1);
    }

    #[test]
    fn failed_read_taints_the_reader() {
        cov_mark::check!(read_failed_inside_computation);
        let mut nodes = NodeArena::default();
        let source = nodes.insert(NodeMetadata::derived());
        let reader = nodes.insert(NodeMetadata::derived());
        let mut active = ActiveStack::default();

        active.push(Frame::Tracking {
            cell: reader,
            tainted: false,
        });
        record_read(&mut active, &mut nodes, source, false);

        assert_eq!(
            active.pop(),
            Some(Frame::Tracking {
                cell: reader,
                tainted: true
            })
        );
    }
}
