use crate::arena::CellId;
use crate::engine::Engine;
use crate::error::Result;
use crate::listeners::SubscriptionId;

/// Read and subscription surface shared by [`Signal`](crate::Signal) and
/// [`Computed`](crate::Computed).
///
/// Lets client code stay generic over leaf and derived cells:
///
/// ```
/// use recalc::{Computed, Engine, Observable, Result, Signal};
/// use std::sync::Arc;
///
/// fn total<C: Observable<i32>>(cells: &[Arc<C>]) -> Result<i32> {
///     cells.iter().map(|cell| cell.read()).sum()
/// }
///
/// let engine = Engine::new();
/// let parts = vec![Signal::new(&engine, 1), Signal::new(&engine, 2)];
/// let sum = Computed::new(&engine, move || total(&parts)).unwrap();
/// assert_eq!(sum.read().unwrap(), 3);
/// ```
pub trait Observable<T>: Send + Sync {
    /// Identity of the cell within its engine
    fn id(&self) -> CellId;

    /// The engine this cell belongs to
    fn engine(&self) -> &Engine;

    /// Read the value, recording the read for the active computation
    fn read(&self) -> Result<T>;

    /// Add a listener called with every new value, without an initial call
    fn subscribe_silent<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static;

    /// Remove a listener; returns whether it was subscribed
    fn unsubscribe(&self, id: SubscriptionId) -> bool;

    /// Add a listener and call it right away with the current value.
    ///
    /// The current value is read without being recorded as a dependency.
    /// Fails if producing the current value fails; the listener is not
    /// added in that case.
    fn subscribe<F>(&self, listener: F) -> Result<SubscriptionId>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let _lock = self.engine().lock();
        let current = self.engine().untracked(|| self.read())?;
        listener(&current);
        Ok(self.subscribe_silent(listener))
    }
}
