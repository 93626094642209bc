// One-shot settlement cells
//
// The runtime never suspends; the only asynchronous boundary is the
// settlement of a caller-supplied promise. A Promise here is exactly that
// boundary made concrete: a one-shot cell that is settled once by its
// Resolver and delivers the settlement to at most one continuation, on
// whichever side arrives second.
//
// Cancellation is a separate handle. An AbortController is given to the
// producer (through its signal) so it can stop work early; aborting is
// advisory - a producer that ignores it and settles anyway is suppressed by
// the consumer's token gating, not by us.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The outcome of a settled promise.
pub enum Settlement<T, E> {
    /// The producer finished with a value.
    Fulfilled(T),
    /// The producer failed.
    Rejected(E),
    /// The producer acknowledged cancellation. This is the abort sentinel:
    /// consumers treat it as "no outcome", never as a failure.
    Aborted(String),
}

type Continuation<T, E> = Box<dyn FnOnce(Settlement<T, E>) + Send>;

enum State<T, E> {
    /// Not settled; may hold the continuation waiting for settlement.
    Pending(Option<Continuation<T, E>>),
    /// Settled before a continuation attached; holds the outcome.
    Settled(Settlement<T, E>),
    /// Settlement delivered; nothing left to do.
    Consumed,
}

struct Inner<T, E> {
    state: Mutex<State<T, E>>,
}

/// One-shot promise: settled exactly once, observed exactly once.
///
/// Clonable so a producer can hand the same promise to the runtime and keep
/// a reference; only the first [`on_settle`](Promise::on_settle) observer
/// receives the settlement.
pub struct Promise<T, E> {
    inner: Arc<Inner<T, E>>,
}

impl<T, E> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, E> Promise<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Create an unsettled promise and the resolver that settles it.
    pub fn pending() -> (Self, Resolver<T, E>) {
        let inner = Arc::new(Inner {
            state: Mutex::new(State::Pending(None)),
        });
        (
            Self {
                inner: inner.clone(),
            },
            Resolver { inner },
        )
    }

    /// A promise that is already fulfilled. The synchronous-success path.
    pub fn fulfilled(value: T) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Settled(Settlement::Fulfilled(value))),
            }),
        }
    }

    /// A promise that is already rejected. The synchronous-failure path: a
    /// producer that fails before starting any work returns this.
    pub fn rejected(error: E) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Settled(Settlement::Rejected(error))),
            }),
        }
    }

    /// Attach the continuation.
    ///
    /// If the promise is already settled the continuation runs immediately
    /// on this thread; otherwise it runs on the thread that settles. A
    /// second continuation replaces an unfired first one (reported), and a
    /// continuation attached after delivery is dropped.
    pub fn on_settle<F>(&self, f: F)
    where
        F: FnOnce(Settlement<T, E>) + Send + 'static,
    {
        let mut cb: Option<Continuation<T, E>> = Some(Box::new(f));
        let ready = {
            let mut state = self.inner.state.lock();
            match std::mem::replace(&mut *state, State::Consumed) {
                State::Pending(previous) => {
                    if previous.is_some() {
                        tracing::warn!("promise continuation replaced before settlement");
                    }
                    *state = State::Pending(cb.take());
                    None
                }
                State::Settled(settlement) => Some(settlement),
                State::Consumed => {
                    tracing::warn!("promise settlement already consumed; continuation dropped");
                    None
                }
            }
        };
        if let Some(settlement) = ready {
            if let Some(cb) = cb.take() {
                cb(settlement);
            }
        }
    }

    /// Bridge a future into a promise by spawning it on the ambient tokio
    /// runtime. The promise settles when the future completes.
    ///
    /// # Panics
    ///
    /// If called outside a tokio runtime context.
    pub fn from_future<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        let (promise, resolver) = Self::pending();
        tokio::spawn(async move {
            match future.await {
                Ok(value) => resolver.resolve(value),
                Err(error) => resolver.reject(error),
            }
        });
        promise
    }
}

/// Settling half of a promise. First settlement wins; the rest are dropped.
pub struct Resolver<T, E> {
    inner: Arc<Inner<T, E>>,
}

impl<T, E> Clone for Resolver<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, E> Resolver<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Settle with a value.
    pub fn resolve(&self, value: T) {
        self.settle(Settlement::Fulfilled(value));
    }

    /// Settle with a failure.
    pub fn reject(&self, error: E) {
        self.settle(Settlement::Rejected(error));
    }

    /// Settle with the abort sentinel. A producer that observes its abort
    /// signal acknowledges cancellation this way.
    pub fn abort(&self, reason: impl Into<String>) {
        self.settle(Settlement::Aborted(reason.into()));
    }

    fn settle(&self, settlement: Settlement<T, E>) {
        let continuation = {
            let mut state = self.inner.state.lock();
            match std::mem::replace(&mut *state, State::Consumed) {
                State::Pending(Some(cb)) => Some(cb),
                State::Pending(None) => {
                    *state = State::Settled(settlement);
                    return;
                }
                prev @ State::Settled(_) => {
                    // First settlement wins.
                    *state = prev;
                    return;
                }
                State::Consumed => return,
            }
        };
        if let Some(cb) = continuation {
            cb(settlement);
        }
    }
}

struct AbortFlag {
    aborted: AtomicBool,
    reason: Mutex<Option<String>>,
}

/// Cancellation handle for one in-flight run.
///
/// The controller side aborts; the signal side is handed to the producer so
/// it can observe the abort and stop early. First abort wins; the reason is
/// kept for inspection.
pub struct AbortController {
    flag: Arc<AbortFlag>,
}

impl AbortController {
    /// A fresh, un-aborted controller.
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AbortFlag {
                aborted: AtomicBool::new(false),
                reason: Mutex::new(None),
            }),
        }
    }

    /// The observer half for the producer.
    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            flag: self.flag.clone(),
        }
    }

    /// Abort with a reason. Returns true if this call was the one that
    /// aborted; later calls change nothing.
    pub fn abort(&self, reason: impl Into<String>) -> bool {
        if self.flag.aborted.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self.flag.reason.lock() = Some(reason.into());
        true
    }

    /// Whether this controller has been aborted.
    pub fn is_aborted(&self) -> bool {
        self.flag.aborted.load(Ordering::Acquire)
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer half of an [`AbortController`].
#[derive(Clone)]
pub struct AbortSignal {
    flag: Arc<AbortFlag>,
}

impl AbortSignal {
    /// Whether the controller has been aborted.
    pub fn is_aborted(&self) -> bool {
        self.flag.aborted.load(Ordering::Acquire)
    }

    /// The abort reason, once aborted.
    pub fn reason(&self) -> Option<String> {
        self.flag.reason.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn settle_then_observe_delivers_inline() {
        let seen = Arc::new(Mutex::new(None));

        let promise: Promise<i32, String> = Promise::fulfilled(4);
        let seen_clone = seen.clone();
        promise.on_settle(move |s| {
            if let Settlement::Fulfilled(v) = s {
                *seen_clone.lock() = Some(v);
            }
        });

        assert_eq!(*seen.lock(), Some(4));
    }

    #[test]
    fn observe_then_settle_delivers_on_settle() {
        let seen = Arc::new(Mutex::new(None));

        let (promise, resolver) = Promise::<i32, String>::pending();
        let seen_clone = seen.clone();
        promise.on_settle(move |s| {
            if let Settlement::Fulfilled(v) = s {
                *seen_clone.lock() = Some(v);
            }
        });

        assert_eq!(*seen.lock(), None);
        resolver.resolve(9);
        assert_eq!(*seen.lock(), Some(9));
    }

    #[test]
    fn first_settlement_wins() {
        let hits = Arc::new(AtomicUsize::new(0));

        let (promise, resolver) = Promise::<i32, i32>::pending();
        let hits_clone = hits.clone();
        promise.on_settle(move |s| {
            assert!(matches!(s, Settlement::Fulfilled(1)));
            hits_clone.fetch_add(1, Ordering::Relaxed);
        });

        resolver.resolve(1);
        resolver.resolve(2);
        resolver.reject(3);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn abort_settlement_carries_reason() {
        let seen = Arc::new(Mutex::new(String::new()));

        let (promise, resolver) = Promise::<(), ()>::pending();
        let seen_clone = seen.clone();
        promise.on_settle(move |s| {
            if let Settlement::Aborted(reason) = s {
                *seen_clone.lock() = reason;
            }
        });

        resolver.abort("walked away");
        assert_eq!(*seen.lock(), "walked away");
    }

    #[test]
    fn controller_first_abort_wins() {
        let controller = AbortController::new();
        let signal = controller.signal();

        assert!(!signal.is_aborted());
        assert!(controller.abort("first"));
        assert!(!controller.abort("second"));
        assert!(signal.is_aborted());
        assert_eq!(signal.reason().as_deref(), Some("first"));
    }
}
