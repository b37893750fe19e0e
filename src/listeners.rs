//! External change listeners attached to a cell.

use crate::arena::CellId;
use crate::engine::EngineGuard;
use crate::hash::FastHashBuilder;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::Arc;

/// Handle returned by `subscribe`, used to unsubscribe later.
///
/// Every subscription gets its own id, even when the same closure is
/// subscribed twice.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

pub(crate) type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Slots<T> {
    next: u64,
    entries: IndexMap<SubscriptionId, Listener<T>, FastHashBuilder>,
}

/// Listeners of one cell, called in subscription order.
pub(crate) struct Listeners<T> {
    slots: Mutex<Slots<T>>,
}

impl<T> Listeners<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Mutex::new(Slots {
                next: 0,
                entries: IndexMap::default(),
            }),
        }
    }

    pub(crate) fn add(&self, listener: Listener<T>) -> SubscriptionId {
        let mut slots = self.slots.lock();
        let id = SubscriptionId(slots.next);
        slots.next += 1;
        slots.entries.insert(id, listener);
        id
    }

    pub(crate) fn remove(&self, id: SubscriptionId) -> bool {
        self.slots.lock().entries.shift_remove(&id).is_some()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slots.lock().entries.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.lock().entries.len()
    }

    /// Call every listener with `value`.
    ///
    /// Works on a snapshot, so listeners may subscribe or unsubscribe while
    /// being notified; changes apply from the next notification.
    pub(crate) fn notify(&self, value: &T) {
        let snapshot: Vec<Listener<T>> = self.slots.lock().entries.values().cloned().collect();
        for listener in snapshot {
            listener(value);
        }
    }
}

/// Hand a changed value to the listeners of `cell`.
///
/// Inside a transaction the delivery is held back until the outermost
/// transaction exits; otherwise listeners run right away, on this thread,
/// with the engine still locked.
pub(crate) fn deliver<T>(
    guard: &EngineGuard<'_>,
    cell: CellId,
    listeners: &Arc<Listeners<T>>,
    value: T,
) where
    T: Send + Sync + 'static,
{
    if !guard.with(|state| state.transaction.is_active()) {
        listeners.notify(&value);
        return;
    }

    let weak = Arc::downgrade(listeners);
    let replaced = guard.with(|state| {
        state.transaction.defer(
            cell,
            Box::new(move || {
                if let Some(listeners) = weak.upgrade() {
                    listeners.notify(&value);
                }
            }),
        )
    });
    drop(replaced);
}
