use crate::arena::{CellId, CellState, FrameGuard, NodeMetadata, record_read};
use crate::engine::{Engine, EngineGuard};
use crate::error::{Error, Misuse, Result};
use crate::listeners::{Listeners, SubscriptionId, deliver};
use crate::observable::Observable;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

type Computation<T> = Box<dyn FnMut() -> Result<T> + Send>;

/// Where a cell's computation currently is.
enum Slot<T> {
    /// `Computed::deferred` cell still waiting for `define`
    Undefined,
    Ready(Computation<T>),
    /// Taken out while it runs, so no lock is held across client code
    Running,
}

/// Memoized derived value that recomputes lazily when its inputs change
///
/// A Computed caches the result of a computation. Every cell the computation
/// reads becomes a dependency; when one of them changes the Computed is only
/// marked dirty, and the computation runs again on the next read. The set of
/// dependencies is rediscovered on every run, so branches that were not taken
/// do not keep the cell subscribed.
///
/// # How it works
/// A read of a Computed, under the engine lock:
/// 1. Current: return the cached value
/// 2. Updating: the computation re-entered itself, fail with
///    [`Error::CyclicDependency`]
/// 3. Dirty: drop the old edges, push a tracking frame, mark Updating, run the
///    computation, mark Current, pop the frame, then store the result and, if
///    it differs from the cached one, announce it to dependents and listeners
///
/// If the computation fails or panics, the frame is still popped and the cell
/// goes back to Dirty, so the next read retries.
///
/// # Example
/// ```
/// use recalc::{Computed, Engine, Signal};
///
/// let engine = Engine::new();
/// let flag = Signal::new(&engine, true);
/// let x = Signal::new(&engine, 1);
/// let y = Signal::new(&engine, 2);
///
/// let pick = Computed::new(&engine, {
///     let (flag, x, y) = (flag.clone(), x.clone(), y.clone());
///     move || Ok(if flag.get() { x.get() } else { y.get() })
/// })
/// .unwrap();
///
/// assert_eq!(pick.get().unwrap(), 1);
/// y.set(99);                       // not a dependency right now
/// assert!(pick.is_current());
/// flag.set(false);
/// assert_eq!(pick.get().unwrap(), 99);
/// ```
pub struct Computed<T> {
    engine: Engine,
    id: CellId,
    value: RwLock<Option<T>>,
    computation: Mutex<Slot<T>>,
    listeners: Arc<Listeners<T>>,
}

impl<T: Clone + PartialEq + Send + Sync + 'static> Computed<T> {
    /// Create a computed value and run its first computation right away
    ///
    /// Fails with whatever the first computation fails with.
    pub fn new<F>(engine: &Engine, f: F) -> Result<Arc<Self>>
    where
        F: FnMut() -> Result<T> + Send + 'static,
    {
        let computed = Self::with_slot(engine, Slot::Ready(Box::new(f)));
        computed.refresh(&engine.lock())?;
        Ok(computed)
    }

    /// Create a computed value that defers its first computation to the first read
    pub fn lazy<F>(engine: &Engine, f: F) -> Arc<Self>
    where
        F: FnMut() -> Result<T> + Send + 'static,
    {
        Self::with_slot(engine, Slot::Ready(Box::new(f)))
    }

    /// Create a computed value whose computation is supplied later with
    /// [`define`](Self::define)
    ///
    /// Needed when the computation has to refer to cells that can only be
    /// created once this one exists. Reading it before `define` fails with
    /// [`Misuse::Undefined`].
    pub fn deferred(engine: &Engine) -> Arc<Self> {
        Self::with_slot(engine, Slot::Undefined)
    }

    fn with_slot(engine: &Engine, slot: Slot<T>) -> Arc<Self> {
        let id = engine.register(NodeMetadata::derived());
        trace!(engine = engine.id(), cell = %id, "computed created");
        Arc::new(Computed {
            engine: engine.clone(),
            id,
            value: RwLock::new(None),
            computation: Mutex::new(slot),
            listeners: Arc::new(Listeners::new()),
        })
    }

    /// Supply the computation of a [`deferred`](Self::deferred) cell and run it
    ///
    /// Fails with [`Misuse::AlreadyDefined`] if the cell already has a
    /// computation. If the first run fails, the computation stays installed
    /// and the cell stays Dirty.
    pub fn define<F>(&self, f: F) -> Result<()>
    where
        F: FnMut() -> Result<T> + Send + 'static,
    {
        let guard = self.engine.lock();
        {
            let mut slot = self.computation.lock();
            if !matches!(*slot, Slot::Undefined) {
                return Err(Misuse::AlreadyDefined(self.id).into());
            }
            *slot = Slot::Ready(Box::new(f));
        }
        self.refresh(&guard)
    }

    /// Identity of this cell within its engine
    pub fn id(&self) -> CellId {
        self.id
    }

    /// The engine this cell belongs to
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Get the memoized value
    ///
    /// Recomputes first if the cell is dirty. The read is recorded as a
    /// dependency of the active computation (if any), even when it fails.
    /// A reader of a cell that is still dirty after this call (its own
    /// computation swallowed a failed read) settles dirty as well.
    ///
    /// Recomputations nest once per level of a chain of dirty cells. A chain
    /// deeper than [`EngineConfig::max_depth`](crate::EngineConfig::max_depth)
    /// fails with [`Error::DepthExceeded`] instead of overflowing the thread
    /// stack, and every cell on it stays dirty. Raise the limit for deeper
    /// graphs, or read the chain from the bottom up so each read stays shallow.
    pub fn get(&self) -> Result<T> {
        let guard = self.engine.lock();
        let result = self.refresh(&guard).and_then(|()| self.cached());
        guard.with(|state| {
            let fresh = result.is_ok() && state.nodes.state(self.id) == CellState::Current;
            record_read(&mut state.active, &mut state.nodes, self.id, fresh);
        });
        result
    }

    /// Get the value without becoming a dependency of the active computation
    pub fn get_untracked(&self) -> Result<T> {
        self.engine.untracked(|| self.get())
    }

    /// Force a recomputation now
    ///
    /// For computations that also depend on state the engine cannot observe.
    /// The cell is marked dirty and recomputed before this returns; dependents
    /// are only dirtied if the new value differs from the cached one, or if
    /// the recomputation fails and leaves the cell dirty. Calling it from the
    /// cell's own computation is a cycle.
    pub fn invalidate(&self) -> Result<()> {
        let guard = self.engine.lock();
        let was = guard.with(|state| {
            let was = state.nodes.state(self.id);
            if was != CellState::Updating {
                state.nodes.set_state(self.id, CellState::Dirty);
            }
            was
        });
        if was == CellState::Updating {
            return Err(self.cycle_detected(&guard));
        }
        debug!(engine = guard.engine_id(), cell = %self.id, "manual invalidation");
        self.recompute(&guard)
    }

    /// Currency of the cached value
    pub fn state(&self) -> CellState {
        self.engine.lock().with(|state| state.nodes.state(self.id))
    }

    /// Whether the cached value is fresh
    pub fn is_current(&self) -> bool {
        self.state() == CellState::Current
    }

    /// Cells the last recomputation read, in the order it first read them
    pub fn dependencies(&self) -> Vec<CellId> {
        self.engine.lock().with(|state| state.nodes.sources(self.id))
    }

    /// Derived cells whose last recomputation read this one
    pub fn dependents(&self) -> Vec<CellId> {
        self.engine.lock().with(|state| state.nodes.subscribers(self.id))
    }

    /// Add a listener and call it right away with the current value
    ///
    /// The listener then runs whenever a recomputation produces a different
    /// value. A dirty cell is not recomputed just because it has listeners.
    pub fn subscribe<F>(&self, listener: F) -> Result<SubscriptionId>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        Observable::subscribe(self, listener)
    }

    /// Add a listener without calling it for the current value
    pub fn subscribe_silent<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.listeners.add(Arc::new(listener))
    }

    /// Remove a listener; returns whether it was subscribed
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.remove(id)
    }

    fn cached(&self) -> Result<T> {
        self.value
            .read()
            .clone()
            .ok_or_else(|| Misuse::Undefined(self.id).into())
    }

    fn cycle_detected(&self, guard: &EngineGuard<'_>) -> Error {
        cov_mark::hit!(cycle_detected);
        debug!(engine = guard.engine_id(), cell = %self.id, "cyclic dependency");
        Error::CyclicDependency { cell: self.id }
    }

    /// Bring the cached value up to date if it is dirty
    fn refresh(&self, guard: &EngineGuard<'_>) -> Result<()> {
        match guard.with(|state| state.nodes.state(self.id)) {
            CellState::Current => Ok(()),
            CellState::Updating => Err(self.cycle_detected(guard)),
            CellState::Dirty => self.recompute(guard),
        }
    }

    /// Run the computation and store its result. The cell must be Dirty.
    fn recompute(&self, guard: &EngineGuard<'_>) -> Result<()> {
        let mut running = RunningComputation::take(&self.computation, self.id)?;
        let frame = FrameGuard::enter(guard, self.id)?;
        debug!(engine = guard.engine_id(), cell = %self.id, "recomputing");

        let outcome = running.run();
        let settled = frame.finish(outcome.is_ok());
        drop(running);

        let value = outcome?;
        if settled == CellState::Dirty {
            cov_mark::hit!(settled_dirty_after_failed_read);
            debug!(
                engine = guard.engine_id(),
                cell = %self.id,
                "computation swallowed a failed read; staying dirty"
            );
        }
        self.store(guard, value);
        Ok(())
    }

    /// Write path: cache `value` and announce it if it changed
    fn store(&self, guard: &EngineGuard<'_>, value: T) {
        let delivery = {
            let mut slot = self.value.write();
            if slot.as_ref() == Some(&value) {
                cov_mark::hit!(recomputed_same_value);
                return;
            }
            let delivery = (!self.listeners.is_empty()).then(|| value.clone());
            let previous = slot.replace(value);
            drop(slot);
            drop(previous);
            delivery
        };

        let dirtied = guard.with(|state| state.nodes.mark_subscribers_dirty(self.id));
        trace!(engine = guard.engine_id(), cell = %self.id, dirtied, "computed changed");

        if let Some(value) = delivery {
            deliver(guard, self.id, &self.listeners, value);
        }
    }
}

/// A computation taken out of its slot for the length of one run.
///
/// Puts it back on drop, including when the run panics.
struct RunningComputation<'a, T> {
    slot: &'a Mutex<Slot<T>>,
    computation: Option<Computation<T>>,
}

impl<'a, T> RunningComputation<'a, T> {
    fn take(slot: &'a Mutex<Slot<T>>, id: CellId) -> Result<Self> {
        let mut guard = slot.lock();
        match std::mem::replace(&mut *guard, Slot::Running) {
            Slot::Ready(computation) => Ok(Self {
                slot,
                computation: Some(computation),
            }),
            Slot::Undefined => {
                *guard = Slot::Undefined;
                Err(Misuse::Undefined(id).into())
            }
            // The cell state guards against re-entry before we get here
            Slot::Running => Err(Error::CyclicDependency { cell: id }),
        }
    }

    fn run(&mut self) -> Result<T> {
        match self.computation.as_mut() {
            Some(computation) => computation(),
            None => unreachable!("computation is only taken by drop"),
        }
    }
}

impl<T> Drop for RunningComputation<'_, T> {
    fn drop(&mut self) {
        if let Some(computation) = self.computation.take() {
            *self.slot.lock() = Slot::Ready(computation);
        }
    }
}

impl<T: Clone + PartialEq + Send + Sync + 'static> Observable<T> for Computed<T> {
    fn id(&self) -> CellId {
        self.id
    }

    fn engine(&self) -> &Engine {
        &self.engine
    }

    fn read(&self) -> Result<T> {
        self.get()
    }

    fn subscribe_silent<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        Computed::subscribe_silent(self, listener)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        Computed::unsubscribe(self, id)
    }
}

impl<T> Drop for Computed<T> {
    fn drop(&mut self) {
        self.engine.unregister(self.id);
    }
}

impl<T: fmt::Debug> fmt::Debug for Computed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("id", &self.id)
            .field("value", &*self.value.read())
            .finish_non_exhaustive()
    }
}
