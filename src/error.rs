//! Error types surfaced by reads, invalidations and definitions.

use crate::arena::CellId;
use std::sync::Arc;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised while reading or recomputing cells.
///
/// `Error` is cheap to clone so one failure can be handed to every caller in a
/// chain of nested recomputations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    /// A recomputation transitively re-entered a cell that is still updating.
    ///
    /// `cell` is the cell whose read closed the cycle.
    #[error("cyclic dependency detected while recomputing {cell}")]
    CyclicDependency {
        /// Cell that was found already updating
        cell: CellId,
    },

    /// The API was used in a way that can never succeed.
    #[error(transparent)]
    Misuse(#[from] Misuse),

    /// Nested recomputations went deeper than the engine allows.
    #[error("recomputation nested deeper than {limit} frames")]
    DepthExceeded {
        /// Configured maximum depth
        limit: usize,
    },

    /// The client computation failed.
    #[error("computation failed: {0}")]
    Computation(Arc<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wrap a client error so it can be returned from a computation.
    ///
    /// ```
    /// use recalc::{Engine, Computed, Error};
    ///
    /// let engine = Engine::new();
    /// let parsed = Computed::new(&engine, || {
    ///     "42".parse::<i32>().map_err(Error::computation)
    /// })
    /// .unwrap();
    /// assert_eq!(parsed.get().unwrap(), 42);
    /// ```
    pub fn computation<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Error::Computation(Arc::from(error.into()))
    }

    /// Returns the cell that closed the cycle, if this is a cycle error.
    pub fn cycle_cell(&self) -> Option<CellId> {
        match self {
            Error::CyclicDependency { cell } => Some(*cell),
            _ => None,
        }
    }
}

/// Incorrect use of the API, never retried.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Misuse {
    /// A deferred cell was read before its computation was supplied.
    #[error("{0} was read before its computation was defined")]
    Undefined(CellId),
    /// A computation was supplied for a cell that already has one.
    #[error("{0} already has a computation")]
    AlreadyDefined(CellId),
}
