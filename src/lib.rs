#![deny(missing_docs)]

//! Fine-grained reactive runtime kernel
//!
//! Signals hold values, computeds derive them lazily with memoisation, and
//! effects react to them under a deterministic two-phase scheduler: within
//! one tick every stale computed recomputes before any effect runs, and
//! effects run in ascending priority with a stable tie-break. A second
//! layer lifts cancellable asynchronous operations into the same discipline.
//!
//! # Quick Start
//!
//! ```ignore
//! use reflow::{signal, computed, create_effect, batch};
//!
//! let price = signal(10.0);
//! let quantity = signal(2.0);
//!
//! let total = computed({
//!     let (price, quantity) = (price.clone(), quantity.clone());
//!     move || price.get() * quantity.get()
//! });
//!
//! let _logger = create_effect({
//!     let total = total.clone();
//!     move || println!("total: {}", total.get())
//! });
//!
//! // One tick, one effect run, no half-updated totals in between.
//! batch(|| {
//!     price.set(12.0);
//!     quantity.set(3.0);
//! });
//! ```
//!
//! # Core Types
//!
//! - [`Signal`] - leaf mutable cell; writes propagate only when the
//!   comparator says the value changed.
//! - [`Computed`] - lazily memoised derivation with automatic dependency
//!   re-collection and cycle detection.
//! - [`Effect`] - tracked side-effect with per-run cleanups and priorities.
//! - [`AsyncCell`] - a cancellable promise-bound cell over three signals,
//!   created by [`from_promise`].
//! - [`create_resource`] - a source-driven cell with switch-latest
//!   semantics.
//!
//! # Batching and atomicity
//!
//! ```ignore
//! use reflow::{signal, atomic};
//!
//! let balance = signal(100);
//! let result = std::panic::catch_unwind(|| atomic(|| {
//!     balance.set(0);
//!     panic!("validation failed");
//! }));
//! assert!(result.is_err());
//! assert_eq!(balance.peek(), 100);  // rolled back
//! ```
//!
//! # Async cells
//!
//! ```ignore
//! use reflow::{signal, create_resource, AsyncOptions, Promise};
//!
//! let user_id = signal(1_u32);
//! let (user, meta) = create_resource(
//!     { let user_id = user_id.clone(); move || user_id.get() },
//!     |id, ctx| fetch_user(*id, ctx.signal),   // -> Promise<User, FetchError>
//!     AsyncOptions::new(),
//! );
//!
//! user_id.set(2);  // cancels fetch #1 ("source-changed"), starts fetch #2
//! ```

// Internal modules
pub(crate) mod arena;
mod async_cell;
mod atomic;
mod computed;
mod effect;
mod error;
mod hash;
mod promise;
mod registry;
mod resource;
mod scheduler;
mod signal;

pub mod equality;

// Core types
pub use computed::{computed, computed_with_equals, Computed};
pub use effect::{create_effect, Effect};
pub use error::ReactiveError;
pub use signal::{signal, signal_with_equals, Signal, Subscription};

// Graph handles for external integrations
pub use arena::{untrack, NodeId, NodeKind};
pub use registry::{on_cleanup, Cleanup};

// Scheduling
pub use atomic::{atomic, atomic_async, atomic_depth, record_atomic_write, transaction};
pub use scheduler::{batch, flush_sync, is_batching, schedule_job, MAX_FLUSH_ITERATIONS};

// Async overlay
pub use async_cell::{
    from_promise, AsyncCell, AsyncEvent, AsyncOptions, AsyncStatus, RunContext, SUPERSEDED,
};
pub use promise::{AbortController, AbortSignal, Promise, Resolver, Settlement};
pub use resource::{async_signal, create_resource, AsyncMeta, AsyncValue, SOURCE_CHANGED};
