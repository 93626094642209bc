// Promise-backed reactive cells
//
// An AsyncCell lifts one cancellable asynchronous operation into the graph
// as three signals: value, status, error. Each run gets a fresh token and a
// fresh abort controller; settlement is gated first on the token (a
// superseded run can never touch state owned by a later one) and then on the
// controller (a cancelled run can never touch state at all). Abort-shaped
// rejections are dropped outright - cancellation is not an error.

use crate::promise::{AbortController, AbortSignal, Promise, Settlement};
use crate::scheduler::batch;
use crate::signal::Signal;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

/// Abort reason used when a newer run supersedes the one in flight.
pub const SUPERSEDED: &str = "superseded";

/// Lifecycle state of an [`AsyncCell`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AsyncStatus {
    /// Created lazily; no run started yet.
    Idle,
    /// A run is in flight.
    Pending,
    /// The latest run fulfilled; `value` holds its result.
    Success,
    /// The latest run rejected; `error` holds its failure.
    Error,
    /// Cancelled. Terminal until the next reload.
    Cancelled,
}

/// Lifecycle event delivered to the `on_event` hook.
///
/// Every event names the run it belongs to (`token`) and when it happened
/// (`at`, monotonic).
pub enum AsyncEvent<'a, E> {
    /// A run started.
    Start {
        /// Token of the starting run.
        token: u64,
        /// Monotonic timestamp.
        at: Instant,
    },
    /// The current run fulfilled.
    Success {
        /// Token of the fulfilled run.
        token: u64,
        /// Monotonic timestamp.
        at: Instant,
    },
    /// The current run rejected with a real failure.
    Error {
        /// Token of the failed run.
        token: u64,
        /// Monotonic timestamp.
        at: Instant,
        /// The rejection value.
        error: &'a E,
    },
    /// The current run was cancelled.
    Cancel {
        /// Token of the cancelled run.
        token: u64,
        /// Monotonic timestamp.
        at: Instant,
        /// Why it was cancelled.
        reason: &'a str,
    },
}

type SuccessHook<T> = Box<dyn Fn(&T) + Send + Sync>;
type ErrorHook<E> = Box<dyn Fn(&E) + Send + Sync>;
type CancelHook = Box<dyn Fn(&str) + Send + Sync>;
type EventHook<E> = Box<dyn for<'a> Fn(AsyncEvent<'a, E>) + Send + Sync>;

/// Options for [`from_promise`] and [`create_resource`].
///
/// Builder-style; the defaults are an eager first run that keeps the last
/// successful value visible across reloads.
///
/// ```ignore
/// let opts = AsyncOptions::new()
///     .lazy()
///     .drop_value_on_pending()
///     .on_success(|user: &User| println!("loaded {}", user.name));
/// ```
pub struct AsyncOptions<T, E> {
    pub(crate) eager: bool,
    pub(crate) keep_previous_value_on_pending: bool,
    pub(crate) on_success: Option<SuccessHook<T>>,
    pub(crate) on_error: Option<ErrorHook<E>>,
    pub(crate) on_cancel: Option<CancelHook>,
    pub(crate) on_event: Option<EventHook<E>>,
}

impl<T, E> Default for AsyncOptions<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> AsyncOptions<T, E> {
    /// Defaults: eager, keep previous value while pending, no hooks.
    pub fn new() -> Self {
        Self {
            eager: true,
            keep_previous_value_on_pending: true,
            on_success: None,
            on_error: None,
            on_cancel: None,
            on_event: None,
        }
    }

    /// Do not run at creation; the cell stays `Idle` until `reload`.
    pub fn lazy(mut self) -> Self {
        self.eager = false;
        self
    }

    /// Clear the value when a run starts instead of showing the last
    /// success.
    pub fn drop_value_on_pending(mut self) -> Self {
        self.keep_previous_value_on_pending = false;
        self
    }

    /// Called with the value after each successful run.
    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.on_success = Some(Box::new(f));
        self
    }

    /// Called with the failure after each genuinely failed run. Never called
    /// for aborts.
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Called with the reason after each cancellation.
    pub fn on_cancel<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_cancel = Some(Box::new(f));
        self
    }

    /// Called for every lifecycle event.
    pub fn on_event<F>(mut self, f: F) -> Self
    where
        F: for<'a> Fn(AsyncEvent<'a, E>) + Send + Sync + 'static,
    {
        self.on_event = Some(Box::new(f));
        self
    }
}

/// What a producer receives for one run.
pub struct RunContext {
    /// Observe this to stop early when the run is cancelled or superseded.
    pub signal: AbortSignal,
    /// The token of this run. Settlements for other tokens are dropped.
    pub token: u64,
}

type Producer<T, E> = Box<dyn Fn(RunContext) -> Promise<T, E> + Send + Sync>;

/// A cancellable promise-bound cell backed by three signals.
///
/// Reading [`value`](AsyncCell::value), [`status`](AsyncCell::status) or
/// [`error`](AsyncCell::error) inside an effect or computed tracks the
/// underlying signal, so the graph reacts to settlement like any other
/// write. All status transitions happen inside a batch: observers see each
/// settlement as one consistent step.
pub struct AsyncCell<T, E> {
    value: Arc<Signal<Option<T>>>,
    status: Arc<Signal<AsyncStatus>>,
    error: Arc<Signal<Option<E>>>,
    producer: Producer<T, E>,
    token: AtomicU64,
    controller: Mutex<Option<AbortController>>,
    keep_previous_value_on_pending: bool,
    on_success: Option<SuccessHook<T>>,
    on_error: Option<ErrorHook<E>>,
    on_cancel: Option<CancelHook>,
    on_event: Option<EventHook<E>>,
    weak_self: Weak<AsyncCell<T, E>>,
}

impl<T, E> AsyncCell<T, E>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    E: Clone + PartialEq + Send + Sync + 'static,
{
    /// Lift a promise-producing function into a reactive cell.
    ///
    /// With the default options the first run starts before this returns;
    /// with [`AsyncOptions::lazy`] the cell is `Idle` and no work starts.
    pub fn from_promise<P>(producer: P, opts: AsyncOptions<T, E>) -> Arc<Self>
    where
        P: Fn(RunContext) -> Promise<T, E> + Send + Sync + 'static,
    {
        let AsyncOptions {
            eager,
            keep_previous_value_on_pending,
            on_success,
            on_error,
            on_cancel,
            on_event,
        } = opts;
        let cell = Arc::new_cyclic(|weak| Self {
            value: Signal::new(None),
            status: Signal::new(AsyncStatus::Idle),
            error: Signal::new(None),
            producer: Box::new(producer),
            token: AtomicU64::new(0),
            controller: Mutex::new(None),
            keep_previous_value_on_pending,
            on_success,
            on_error,
            on_cancel,
            on_event,
            weak_self: weak.clone(),
        });
        if eager {
            cell.run();
        }
        cell
    }

    /// Start a run: supersede whatever is in flight, transition to
    /// `Pending`, and hand the producer a fresh abort signal and token.
    fn run(&self) {
        let token = self.token.fetch_add(1, Ordering::SeqCst) + 1;

        let abort_signal = {
            let mut slot = self.controller.lock();
            if let Some(prev) = slot.take() {
                prev.abort(SUPERSEDED);
            }
            let fresh = AbortController::new();
            let signal = fresh.signal();
            *slot = Some(fresh);
            signal
        };

        batch(|| {
            self.status.set(AsyncStatus::Pending);
            self.error.set(None);
            if !self.keep_previous_value_on_pending {
                self.value.set(None);
            }
        });
        self.emit(AsyncEvent::Start {
            token,
            at: Instant::now(),
        });

        let promise = (self.producer)(RunContext {
            signal: abort_signal,
            token,
        });

        let weak = self.weak_self.clone();
        promise.on_settle(move |settlement| {
            if let Some(cell) = weak.upgrade() {
                cell.settled(token, settlement);
            }
        });
    }

    /// Apply one settlement, gated on token and controller.
    fn settled(&self, token: u64, settlement: Settlement<T, E>) {
        if token != self.token.load(Ordering::SeqCst) {
            cov_mark::hit!(stale_token_dropped);
            return;
        }
        let aborted = self
            .controller
            .lock()
            .as_ref()
            .map_or(true, AbortController::is_aborted);
        if aborted {
            return;
        }
        match settlement {
            Settlement::Fulfilled(value) => {
                batch(|| {
                    self.value.set(Some(value.clone()));
                    self.status.set(AsyncStatus::Success);
                });
                self.emit(AsyncEvent::Success {
                    token,
                    at: Instant::now(),
                });
                if let Some(hook) = &self.on_success {
                    hook(&value);
                }
            }
            Settlement::Rejected(error) => {
                batch(|| {
                    self.error.set(Some(error.clone()));
                    self.status.set(AsyncStatus::Error);
                });
                self.emit(AsyncEvent::Error {
                    token,
                    at: Instant::now(),
                    error: &error,
                });
                if let Some(hook) = &self.on_error {
                    hook(&error);
                }
            }
            Settlement::Aborted(_) => {
                // The abort sentinel never becomes an error.
            }
        }
    }

    /// Re-run the producer. Transitions through `Pending` regardless of the
    /// current status, including `Cancelled`.
    pub fn reload(&self) {
        self.run();
    }

    /// Cancel the in-flight run.
    ///
    /// Aborts the controller the producer observes, marks the cell
    /// `Cancelled` (value and error stay as they were) and fires the cancel
    /// hooks. A no-op when nothing is in flight or the controller is already
    /// aborted.
    pub fn cancel(&self, reason: &str) {
        let token = self.token.load(Ordering::SeqCst);
        let did_abort = {
            let slot = self.controller.lock();
            match slot.as_ref() {
                Some(controller) if !controller.is_aborted() => controller.abort(reason),
                _ => false,
            }
        };
        if !did_abort {
            return;
        }
        batch(|| self.status.set(AsyncStatus::Cancelled));
        self.emit(AsyncEvent::Cancel {
            token,
            at: Instant::now(),
            reason,
        });
        if let Some(hook) = &self.on_cancel {
            hook(reason);
        }
    }

    /// The last successful value, tracked.
    pub fn value(&self) -> Option<T> {
        self.value.get()
    }

    /// The lifecycle status, tracked.
    pub fn status(&self) -> AsyncStatus {
        self.status.get()
    }

    /// The last failure, tracked.
    pub fn error(&self) -> Option<E> {
        self.error.get()
    }

    /// The signal behind [`value`](AsyncCell::value).
    pub fn value_signal(&self) -> &Arc<Signal<Option<T>>> {
        &self.value
    }

    /// The signal behind [`status`](AsyncCell::status).
    pub fn status_signal(&self) -> &Arc<Signal<AsyncStatus>> {
        &self.status
    }

    /// The signal behind [`error`](AsyncCell::error).
    pub fn error_signal(&self) -> &Arc<Signal<Option<E>>> {
        &self.error
    }

    /// Whether runs keep the previous success visible while pending.
    pub fn keep_previous_value_on_pending(&self) -> bool {
        self.keep_previous_value_on_pending
    }

    fn emit(&self, event: AsyncEvent<'_, E>) {
        if let Some(hook) = &self.on_event {
            hook(event);
        }
    }
}

/// Lift a promise-producing function into a reactive cell. See
/// [`AsyncCell::from_promise`].
pub fn from_promise<T, E, P>(producer: P, opts: AsyncOptions<T, E>) -> Arc<AsyncCell<T, E>>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    E: Clone + PartialEq + Send + Sync + 'static,
    P: Fn(RunContext) -> Promise<T, E> + Send + Sync + 'static,
{
    AsyncCell::from_promise(producer, opts)
}
