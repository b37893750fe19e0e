use crate::arena::CellId;
use crate::engine::Engine;
use crate::hash::FastHashBuilder;
use indexmap::IndexMap;
use tracing::trace;

/// A listener delivery held back until the outermost transaction ends.
pub(crate) type Delivery = Box<dyn FnOnce() + Send>;

/// Transaction depth and held-back deliveries for one engine.
///
/// At most one delivery is kept per cell. A later change of the same cell
/// replaces the earlier one, so listeners only see the final value.
#[derive(Default)]
pub(crate) struct PendingDeliveries {
    depth: usize,
    pending: IndexMap<CellId, Delivery, FastHashBuilder>,
}

impl PendingDeliveries {
    pub(crate) fn is_active(&self) -> bool {
        self.depth > 0
    }

    /// Queue a delivery, handing back the earlier one for the same cell.
    ///
    /// Replaced and forgotten deliveries are returned rather than dropped here:
    /// they own cell values, and dropping those may re-enter the engine.
    pub(crate) fn defer(&mut self, cell: CellId, delivery: Delivery) -> Option<Delivery> {
        let replaced = self.pending.insert(cell, delivery);
        if replaced.is_some() {
            cov_mark::hit!(delivery_replaced);
        }
        replaced
    }

    /// Take back the delivery of a cell that no longer exists
    pub(crate) fn forget(&mut self, cell: CellId) -> Option<Delivery> {
        self.pending.shift_remove(&cell)
    }

    fn enter(&mut self) {
        self.depth += 1;
    }

    /// Leave one level; returns the held-back deliveries when it was the outermost
    fn exit(&mut self) -> Vec<Delivery> {
        self.depth = self.depth.saturating_sub(1);
        if self.depth == 0 {
            self.pending.drain(..).map(|(_, delivery)| delivery).collect()
        } else {
            Vec::new()
        }
    }
}

/// RAII guard that ends a transaction even on panic.
///
/// Deliveries are only run on a normal exit; when unwinding they are dropped,
/// since a panicking listener would abort the process.
struct TransactionGuard<'a> {
    engine: &'a Engine,
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        let deliveries = self.engine.lock().with(|state| state.transaction.exit());
        if std::thread::panicking() {
            return;
        }
        if !deliveries.is_empty() {
            trace!(
                engine = self.engine.id(),
                count = deliveries.len(),
                "delivering held-back changes"
            );
        }
        for delivery in deliveries {
            delivery();
        }
    }
}

/// Group several writes into one atomic step.
///
/// While a transaction runs, the engine lock stays held, so other threads
/// observe either none or all of its writes. Dependents are still dirtied
/// immediately and reads inside the transaction see the new values, but
/// external listeners are only called once the outermost transaction exits,
/// with the latest value of each changed cell.
///
/// # Example
/// ```
/// use recalc::{Engine, Signal, Transaction};
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// let engine = Engine::new();
/// let voltage = Signal::new(&engine, 0);
/// let calls = Arc::new(AtomicUsize::new(0));
/// let calls_clone = calls.clone();
/// voltage.subscribe_silent(move |_| {
///     calls_clone.fetch_add(1, Ordering::Relaxed);
/// });
///
/// Transaction::run(&engine, || {
///     voltage.set(1);
///     voltage.set(2);
///     voltage.set(3);
/// });
/// assert_eq!(calls.load(Ordering::Relaxed), 1);
/// ```
pub struct Transaction;

impl Transaction {
    /// Run a function within a transaction on `engine`
    pub fn run<F, R>(engine: &Engine, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let lock = engine.lock();
        lock.with(|state| state.transaction.enter());

        // Declared after `lock` so it drops first: deliveries run while the
        // engine is still locked.
        let _guard = TransactionGuard { engine };
        f()
    }

    /// Check if a transaction is open on `engine`
    pub fn is_active(engine: &Engine) -> bool {
        engine.lock().with(|state| state.transaction.is_active())
    }
}
