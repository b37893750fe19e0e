#![deny(missing_docs)]

//! Memoized derived values with automatic dependency tracking.
//!
//! Values live in cells. A [`Signal`] holds a value set from outside; a
//! [`Computed`] caches the result of a computation over other cells. Every read
//! a computation makes is recorded, so when a signal changes exactly the
//! derived cells that (transitively) read it are marked dirty. Nothing is
//! recomputed until someone reads it again.
//!
//! # Quick Start
//!
//! ```
//! use recalc::{Computed, Engine, Signal};
//!
//! let engine = Engine::new();
//! let voltage = Signal::new(&engine, 12.0);
//! let current = Signal::new(&engine, 2.0);
//!
//! let power = Computed::new(&engine, {
//!     let (voltage, current) = (voltage.clone(), current.clone());
//!     move || Ok(voltage.get() * current.get())
//! })
//! .unwrap();
//!
//! assert_eq!(power.get().unwrap(), 24.0);
//! voltage.set(10.0);               // power is now dirty
//! assert_eq!(power.get().unwrap(), 20.0);
//! ```
//!
//! # Core Types
//!
//! - [`Engine`] - Lock domain and dependency tracker. Cells on different engines never interact.
//! - [`Signal<T>`] - Leaf cell. [`set`](Signal::set) announces changes to dependents.
//! - [`Computed<T>`] - Memoized value. Recomputes on read, only after an input changed.
//! - [`Transaction`] - Hold back listener calls until a batch of writes is done.
//! - [`Observable`] - Read and subscribe surface shared by both cell kinds.
//!
//! # Computed
//!
//! ```
//! # use recalc::{Computed, Engine, Error};
//! # let engine = Engine::new();
//! // Evaluates immediately, fails if the first run fails
//! let parsed = Computed::new(&engine, || "7".parse::<i32>().map_err(Error::computation)).unwrap();
//!
//! // Defers evaluation until the first get()
//! let lazy = Computed::lazy(&engine, move || Ok(parsed.get()? * 6));
//!
//! // For cells whose computation must refer to cells created after them
//! let later = Computed::<i32>::deferred(&engine);
//! later.define(move || lazy.get()).unwrap();
//! assert_eq!(later.get().unwrap(), 42);
//! ```
//!
//! # Listeners and transactions
//!
//! ```
//! # use recalc::{Engine, Signal, Transaction};
//! # use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//! # let engine = Engine::new();
//! let signal = Signal::new(&engine, 0);
//! let calls = Arc::new(AtomicUsize::new(0));
//! let seen = calls.clone();
//! signal.subscribe_silent(move |_| {
//!     seen.fetch_add(1, Ordering::Relaxed);
//! });
//!
//! Transaction::run(&engine, || {
//!     signal.set(1);
//!     signal.set(2);
//! });
//! assert_eq!(calls.load(Ordering::Relaxed), 1);
//! ```
//!
//! # Errors
//!
//! Reads of derived cells return [`Result`]. A computation can fail with its own
//! error ([`Error::Computation`]), and the engine reports cycles, reads of
//! undefined cells and runaway nesting. A failed or panicking recomputation
//! leaves the cell dirty, so the next read tries again.

// Internal modules
pub(crate) mod arena;
mod computed;
mod engine;
mod error;
mod hash;
mod listeners;
mod observable;
mod signal;
mod transaction;

// Core types
pub use arena::{CellId, CellState};
pub use computed::Computed;
pub use engine::{DEFAULT_MAX_DEPTH, Engine, EngineConfig};
pub use listeners::SubscriptionId;
pub use observable::Observable;
pub use signal::Signal;
pub use transaction::Transaction;

// Errors
pub use error::{Error, Misuse, Result};

#[cfg(test)]
mod tests;
