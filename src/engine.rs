//! The engine: one lock domain and one active-computation stack.
//!
//! Every cell belongs to exactly one [`Engine`]. All state transitions of all
//! cells in an engine, and the stack of recomputations in flight, are
//! serialized through a single reentrant lock. Recomputation touches state
//! shared across cells (the reader's edges and the edges of every cell it
//! reads), so per-cell locks would not be enough.
//!
//! The lock is reentrant because recomputations nest on the calling thread: a
//! computation reading another derived cell re-enters the engine while the
//! outer read still holds it. Other threads block until the outermost call
//! returns. A computation that never returns therefore blocks every thread
//! using the same engine.

use crate::arena::{ActiveStack, CellId, NodeArena, NodeMetadata, UntrackedGuard};
use crate::transaction::PendingDeliveries;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Default limit for nested recomputations, see [`EngineConfig::max_depth`].
pub const DEFAULT_MAX_DEPTH: usize = 256;

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

/// Tunables for an [`Engine`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    /// Maximum number of recomputations that may be nested inside each other.
    ///
    /// A chain of derived cells deeper than this fails with
    /// [`Error::DepthExceeded`](crate::Error::DepthExceeded) instead of
    /// overflowing the thread stack.
    pub max_depth: usize,
}

impl EngineConfig {
    /// Set the nesting limit
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

/// Shared state guarded by the engine lock.
#[derive(Default)]
pub(crate) struct EngineState {
    pub(crate) nodes: NodeArena,
    pub(crate) active: ActiveStack,
    pub(crate) transaction: PendingDeliveries,
}

struct EngineShared {
    id: u64,
    config: EngineConfig,
    state: ReentrantMutex<RefCell<EngineState>>,
}

/// Context owning the lock and dependency tracking for a universe of cells.
///
/// `Engine` is a cheap handle; clones refer to the same engine. Cells created
/// on different engines never see each other's reads.
///
/// # Example
/// ```
/// use recalc::{Computed, Engine, Signal};
///
/// let engine = Engine::new();
/// let x = Signal::new(&engine, 2);
/// let y = Computed::new(&engine, {
///     let x = x.clone();
///     move || Ok(x.get() * 10)
/// })
/// .unwrap();
///
/// assert_eq!(y.get().unwrap(), 20);
/// x.set(5);
/// assert_eq!(y.get().unwrap(), 50);
/// ```
#[derive(Clone)]
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl Engine {
    /// Create an engine with the default configuration
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Create an engine with the given configuration
    pub fn with_config(config: EngineConfig) -> Self {
        let id = NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed);
        debug!(engine = id, max_depth = config.max_depth, "engine created");
        Self {
            shared: Arc::new(EngineShared {
                id,
                config,
                state: ReentrantMutex::new(RefCell::new(EngineState::default())),
            }),
        }
    }

    /// Process-unique number identifying this engine in logs
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// The configuration this engine was created with
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Whether both handles refer to the same engine
    pub fn ptr_eq(&self, other: &Engine) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Acquire the engine lock (reentrant on the owning thread).
    pub(crate) fn lock(&self) -> EngineGuard<'_> {
        EngineGuard {
            engine: self,
            lock: self.shared.state.lock(),
        }
    }

    /// Run `f` without attributing its reads to the active computation.
    ///
    /// Useful inside a computation that wants to peek at a cell without
    /// depending on it.
    pub fn untracked<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let guard = self.lock();
        let _barrier = UntrackedGuard::new(&guard);
        f()
    }

    /// Number of recomputations in flight.
    ///
    /// Non-zero only when called from inside a computation.
    pub fn depth(&self) -> usize {
        self.lock().with(|state| state.active.depth())
    }

    /// Whether reads made right now are being recorded as dependencies
    pub fn is_tracking(&self) -> bool {
        self.lock().with(|state| state.active.current().is_some())
    }

    /// Number of live cells owned by this engine
    pub fn cell_count(&self) -> usize {
        self.lock().with(|state| state.nodes.len())
    }

    /// Allocate a node for a new cell
    pub(crate) fn register(&self, metadata: NodeMetadata) -> CellId {
        self.lock().with(|state| state.nodes.insert(metadata))
    }

    /// Release a dropped cell's node and every edge and delivery naming it
    pub(crate) fn unregister(&self, id: CellId) {
        let stale = self.lock().with(|state| {
            state.nodes.remove(id);
            state.transaction.forget(id)
        });
        drop(stale);
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.shared.id)
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

/// Held lock on an engine's state.
///
/// The state itself is only borrowed for the length of a [`with`](Self::with)
/// closure. Client code (computations, listeners) always runs outside those
/// closures, while the lock itself stays held.
pub(crate) struct EngineGuard<'a> {
    engine: &'a Engine,
    lock: ReentrantMutexGuard<'a, RefCell<EngineState>>,
}

impl EngineGuard<'_> {
    /// Access the engine state with a closure
    pub(crate) fn with<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut EngineState) -> R,
    {
        let mut state = self.lock.borrow_mut();
        f(&mut state)
    }

    pub(crate) fn config(&self) -> &EngineConfig {
        self.engine.config()
    }

    pub(crate) fn engine_id(&self) -> u64 {
        self.engine.id()
    }
}
