use crate::arena::{CellId, NodeMetadata, record_read};
use crate::engine::{Engine, EngineGuard};
use crate::error::Result;
use crate::listeners::{Listeners, SubscriptionId, deliver};
use crate::observable::Observable;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tracing::{trace, warn};

/// Observable leaf cell holding a value
///
/// Reading a Signal inside a computation makes that computation depend on it.
/// Writing a different value dirties every derived cell that (transitively)
/// read it and calls the Signal's listeners before returning.
///
/// # Usage
/// ```
/// use recalc::{Engine, Signal};
///
/// let engine = Engine::new();
/// let voltage = Signal::new(&engine, 12.0);
///
/// assert!(voltage.set(13.5));   // changed, subscribers notified
/// assert!(!voltage.set(13.5));  // same value, nothing announced
/// assert_eq!(voltage.get(), 13.5);
/// ```
pub struct Signal<T> {
    engine: Engine,
    id: CellId,
    value: RwLock<T>,
    listeners: Arc<Listeners<T>>,
}

impl<T: Clone + PartialEq + Send + Sync + 'static> Signal<T> {
    /// Create a new signal owned by `engine`
    pub fn new(engine: &Engine, value: T) -> Arc<Self> {
        let id = engine.register(NodeMetadata::leaf());
        trace!(engine = engine.id(), cell = %id, "signal created");
        Arc::new(Signal {
            engine: engine.clone(),
            id,
            value: RwLock::new(value),
            listeners: Arc::new(Listeners::new()),
        })
    }

    /// Identity of this cell within its engine
    pub fn id(&self) -> CellId {
        self.id
    }

    /// The engine this signal belongs to
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Get the value, recording the read for the active computation (if any)
    pub fn get(&self) -> T {
        self.with(T::clone)
    }

    /// Borrow the value, recording the read for the active computation (if any)
    ///
    /// `f` must not write this signal. The engine stays locked while `f` runs,
    /// so other threads using this engine wait for it.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = self.engine.lock();
        guard.with(|state| record_read(&mut state.active, &mut state.nodes, self.id, true));
        let value = self.value.read();
        f(&*value)
    }

    /// Get the value without becoming a dependency of the active computation
    pub fn get_untracked(&self) -> T {
        let _guard = self.engine.lock();
        self.value.read().clone()
    }

    /// Store a new value
    ///
    /// If it differs from the current one, every dependent is marked dirty and
    /// listeners are called with the new value before this returns.
    /// Returns whether the value changed.
    pub fn set(&self, value: T) -> bool {
        let guard = self.engine.lock();
        let previous = {
            let mut slot = self.value.write();
            if *slot == value {
                return false;
            }
            std::mem::replace(&mut *slot, value)
        };
        drop(previous);
        self.announce(&guard);
        true
    }

    /// Modify the value in place
    ///
    /// Announces like [`set`](Self::set) when the result differs from the
    /// previous value. Returns whether the value changed.
    pub fn update(&self, f: impl FnOnce(&mut T)) -> bool {
        let guard = self.engine.lock();
        let changed = {
            let mut slot = self.value.write();
            let before = slot.clone();
            f(&mut *slot);
            *slot != before
        };
        if changed {
            self.announce(&guard);
        }
        changed
    }

    /// Mark dependents dirty and hand the new value to listeners
    fn announce(&self, guard: &EngineGuard<'_>) {
        let dirtied = guard.with(|state| {
            if let Some(reader) = state.active.current() {
                warn!(
                    engine = guard.engine_id(),
                    cell = %self.id,
                    %reader,
                    "signal written while a computation is running; computations should only read"
                );
            }
            state.nodes.mark_subscribers_dirty(self.id)
        });
        trace!(
            engine = guard.engine_id(),
            cell = %self.id,
            dirtied,
            listeners = self.listeners.len(),
            "signal changed"
        );

        if !self.listeners.is_empty() {
            let value = self.value.read().clone();
            deliver(guard, self.id, &self.listeners, value);
        }
    }

    /// Add a listener and call it right away with the current value
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let _guard = self.engine.lock();
        let current = self.value.read().clone();
        listener(&current);
        self.subscribe_silent(listener)
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

    /// Derived cells whose last recomputation read this signal
    pub fn dependents(&self) -> Vec<CellId> {
        self.engine.lock().with(|state| state.nodes.subscribers(self.id))
    }
}

impl<T: Clone + PartialEq + Send + Sync + 'static> Observable<T> for Signal<T> {
    fn id(&self) -> CellId {
        self.id
    }

    fn engine(&self) -> &Engine {
        &self.engine
    }

    fn read(&self) -> Result<T> {
        Ok(self.get())
    }

    fn subscribe_silent<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        Signal::subscribe_silent(self, listener)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        Signal::unsubscribe(self, id)
    }
}

impl<T> Drop for Signal<T> {
    fn drop(&mut self) {
        // Dependents keep their cached values; they simply stop hearing from us
        self.engine.unregister(self.id);
    }
}

impl<T: fmt::Debug> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("id", &self.id)
            .field("value", &*self.value.read())
            .finish_non_exhaustive()
    }
}
