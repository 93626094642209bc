use crate::arena::{
    self, node_arena_insert, node_arena_remove, NodeId, NodeKind, NodeMetadata,
};
use crate::error::ReactiveError;
use crate::{atomic, scheduler};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

type EqualsFn<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

/// Leaf mutable cell of the reactive graph.
///
/// A signal owns its value and an equality comparator. Reading through
/// [`get`](Signal::get) registers a dependency on the active observer;
/// writing through [`set`](Signal::set) propagates synchronously to
/// subscribers, but only when the comparator says the value changed.
///
/// Signals never observe anything: they are permanent leaves, and the graph
/// refuses to put one on the left of a dependency edge.
///
/// # Usage
/// ```ignore
/// let count = signal(0);
/// let doubled = computed({
///     let count = count.clone();
///     move || count.get() * 2
/// });
///
/// count.set(3);
/// assert_eq!(doubled.get(), 6);
/// ```
pub struct Signal<T> {
    node: NodeId,
    value: Arc<RwLock<T>>,
    equals: EqualsFn<T>,
}

impl<T> Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a signal with the default `PartialEq` comparator.
    pub fn new(initial: T) -> Arc<Self>
    where
        T: PartialEq,
    {
        Self::with_equals(initial, crate::equality::equals)
    }

    /// Create a signal with a custom comparator.
    ///
    /// The comparator gates propagation: a write for which
    /// `equals(prev, next)` holds stores nothing and wakes nobody.
    pub fn with_equals<F>(initial: T, equals: F) -> Arc<Self>
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        let node = node_arena_insert(NodeMetadata::new(NodeKind::Signal, 0));
        Arc::new(Self {
            node,
            value: Arc::new(RwLock::new(initial)),
            equals: Arc::new(equals),
        })
    }

    /// Read the value, registering a dependency on the active observer.
    pub fn get(&self) -> T {
        arena::track(self.node);
        self.value.read().clone()
    }

    /// Read the value without tracking.
    pub fn peek(&self) -> T {
        self.value.read().clone()
    }

    /// Write a new value.
    ///
    /// If the comparator considers it equal to the current value, nothing
    /// happens. Otherwise the pre-write value is logged into an open atomic
    /// frame (first write per frame only), the value is stored, computed
    /// subscribers go stale and effect subscribers are enqueued. Outside a
    /// batch the tick drains before `set` returns.
    pub fn set(&self, next: T) {
        self.write(next);
    }

    /// Write through an updater called with the current value.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        let next = {
            let current = self.value.read();
            f(&current)
        };
        self.write(next);
    }

    fn write(&self, next: T) {
        let prev = self.value.read().clone();
        if (self.equals)(&prev, &next) {
            cov_mark::hit!(equal_write_skipped);
            return;
        }
        if atomic::atomic_depth() > 0 {
            let cell = self.value.clone();
            atomic::record_atomic_write(self.node, move || {
                *cell.write() = prev;
            });
        }
        *self.value.write() = next;
        scheduler::propagate_write(self.node);
        scheduler::flush_if_armed();
    }

    /// Create an explicit edge `observer -> this signal` for external
    /// integrations, returning a handle that detaches it.
    ///
    /// Fails with [`ReactiveError::InvalidTopology`] if the observer is
    /// itself a signal.
    pub fn subscribe(&self, observer: NodeId) -> Result<Subscription, ReactiveError> {
        arena::link(observer, self.node)?;
        Ok(Subscription {
            observer,
            dep: self.node,
            attached: AtomicBool::new(true),
        })
    }

    /// The graph node backing this signal.
    pub fn node_id(&self) -> NodeId {
        self.node
    }
}

impl<T> Drop for Signal<T> {
    fn drop(&mut self) {
        arena::sever(self.node);
        node_arena_remove(self.node);
    }
}

// NOTE: Signal intentionally does NOT implement Clone. The constructors
// return Arc<Signal<T>>; share the Arc.

/// Detach handle returned by [`Signal::subscribe`].
///
/// Detaches the edge on [`detach`](Subscription::detach) or on drop,
/// whichever comes first.
pub struct Subscription {
    observer: NodeId,
    dep: NodeId,
    attached: AtomicBool,
}

impl Subscription {
    /// Remove the subscription edge. Idempotent.
    pub fn detach(&self) {
        if self.attached.swap(false, Ordering::AcqRel) {
            arena::unlink(self.observer, self.dep);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Create a signal with the default `PartialEq` comparator.
pub fn signal<T>(initial: T) -> Arc<Signal<T>>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    Signal::new(initial)
}

/// Create a signal with a custom comparator.
pub fn signal_with_equals<T, F>(initial: T, equals: F) -> Arc<Signal<T>>
where
    T: Clone + Send + Sync + 'static,
    F: Fn(&T, &T) -> bool + Send + Sync + 'static,
{
    Signal::with_equals(initial, equals)
}
