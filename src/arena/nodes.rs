// Node arena - storage for the reactive graph
//
// Every vertex in the graph lives here, whatever its kind. A node owns two
// edge sets:
// - deps: the nodes this node observes
// - subs: the nodes observing it
//
// The two sets are duals: `b in a.deps` if and only if `a in b.subs`. All
// edge mutation goes through link/unlink so the invariant cannot drift.
//
// The arena uses global static storage with a parking_lot RwLock. NodeId is a
// lightweight newtype over the slab index; a stale NodeId (node removed)
// degrades to a no-op on every operation.

use crate::error::ReactiveError;
use crate::hash::FixedHashBuilder;
use indexmap::IndexSet;
use parking_lot::RwLock;
use slab::Slab;
use smallvec::SmallVec;
use std::cell::Cell;
use std::sync::atomic::{AtomicU8, Ordering};

/// The kind of a reactive node.
///
/// Signals are leaves: they may only appear on the right of a dependency
/// edge. Computeds sit in the middle with both deps and subs. Effects are
/// sinks with deps only.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// Leaf mutable cell. Never an observer.
    Signal,
    /// Lazily memoised derivation.
    Computed,
    /// Scheduled side-effect.
    Effect,
}

type EdgeSet = IndexSet<NodeId, FixedHashBuilder>;

// Flag bit positions (see NodeMetadata::flags)
const FLAG_STALE: u8 = 1 << 0;
const FLAG_COMPUTING: u8 = 1 << 1;
const FLAG_HAS_VALUE: u8 = 1 << 2;
const FLAG_DISPOSED: u8 = 1 << 3;

/// Global node arena - stores metadata for every live node.
static NODE_ARENA: RwLock<Slab<NodeMetadata>> = RwLock::new(Slab::new());

// Thread-local current observer: the node whose tracked function is running
// on this thread right now. Reads performed while an observer is installed
// register dependency edges onto it.
thread_local! {
    static CURRENT_OBSERVER: Cell<Option<NodeId>> = const { Cell::new(None) };
}

/// Get the node currently executing a tracked function on this thread.
pub fn current_observer() -> Option<NodeId> {
    CURRENT_OBSERVER.with(Cell::get)
}

/// Install a new current observer, returning the previous one.
pub fn set_current_observer(observer: Option<NodeId>) -> Option<NodeId> {
    CURRENT_OBSERVER.with(|c| c.replace(observer))
}

/// RAII guard that restores the previous observer when dropped.
///
/// This is what makes `withObserver` total: the previous observer comes back
/// on every exit path, including unwinding out of a user closure.
pub struct ObserverGuard {
    previous: Option<NodeId>,
}

impl ObserverGuard {
    /// Install `observer` and remember whatever was installed before.
    pub fn new(observer: Option<NodeId>) -> Self {
        let previous = set_current_observer(observer);
        Self { previous }
    }
}

impl Drop for ObserverGuard {
    fn drop(&mut self) {
        set_current_observer(self.previous);
    }
}

/// Run a closure with the observer stack cleared.
///
/// Reads inside the closure register no dependencies. Nesting is fine; the
/// previous observer is restored even if the closure panics.
pub fn untrack<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = ObserverGuard::new(None);
    f()
}

/// Unique identifier for a node in the arena.
///
/// Zero-cost wrapper around a slab index. When the owning handle is dropped
/// the node is removed from the arena and the id goes stale; stale access
/// returns `None` / defaults rather than panicking.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct NodeId(u32);

impl NodeId {
    /// Create a NodeId from a raw slab index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Convert to usize for slab indexing.
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Access the node metadata with a closure (read-only).
    ///
    /// Returns `None` if the node has been removed (stale access).
    pub fn with<F, R>(self, f: F) -> Option<R>
    where
        F: FnOnce(&NodeMetadata) -> R,
    {
        let arena = NODE_ARENA.read();
        arena.get(self.index()).map(f)
    }

    /// The kind of this node, or `None` if it is gone.
    pub fn kind(self) -> Option<NodeKind> {
        self.with(|meta| meta.kind)
    }

    /// Scheduling priority (effects only; lower runs first). Stale ids
    /// report the default priority.
    pub fn priority(self) -> i32 {
        self.with(|meta| meta.priority).unwrap_or(0)
    }

    /// Whether this node's cached value may be out of date.
    pub fn is_stale(self) -> bool {
        self.flag(FLAG_STALE)
    }

    /// Set or clear the stale flag.
    pub fn set_stale(self, stale: bool) {
        self.set_flag(FLAG_STALE, stale);
    }

    /// Atomically set the stale flag, returning true if it was clear.
    ///
    /// This is what makes a staleness cascade idempotent: a node already
    /// marked stale re-marks its subscribers at most once per cascade.
    pub fn mark_stale_if_clear(self) -> bool {
        self.with(|meta| meta.flags.fetch_or(FLAG_STALE, Ordering::AcqRel) & FLAG_STALE == 0)
            .unwrap_or(false)
    }

    /// Whether this node is mid-recompute (reentrancy guard).
    pub fn is_computing(self) -> bool {
        self.flag(FLAG_COMPUTING)
    }

    /// Set or clear the computing flag.
    pub fn set_computing(self, computing: bool) {
        self.set_flag(FLAG_COMPUTING, computing);
    }

    /// Whether this node holds an authoritative cached value.
    pub fn has_value(self) -> bool {
        self.flag(FLAG_HAS_VALUE)
    }

    /// Set or clear the has-value flag.
    pub fn set_has_value(self, has_value: bool) {
        self.set_flag(FLAG_HAS_VALUE, has_value);
    }

    /// Whether this node has been disposed. Stale ids count as disposed, so
    /// the scheduler drops jobs whose node has vanished outright.
    pub fn is_disposed(self) -> bool {
        self.with(|meta| meta.flags.load(Ordering::Acquire) & FLAG_DISPOSED != 0)
            .unwrap_or(true)
    }

    /// Mark this node disposed.
    pub fn set_disposed(self) {
        self.set_flag(FLAG_DISPOSED, true);
    }

    /// Snapshot of the nodes this node observes.
    pub fn deps_snapshot(self) -> SmallVec<[NodeId; 8]> {
        self.with(|meta| meta.deps.read().iter().copied().collect())
            .unwrap_or_default()
    }

    /// Snapshot of the nodes observing this node.
    pub fn subs_snapshot(self) -> SmallVec<[NodeId; 8]> {
        self.with(|meta| meta.subs.read().iter().copied().collect())
            .unwrap_or_default()
    }

    fn flag(self, bit: u8) -> bool {
        self.with(|meta| meta.flags.load(Ordering::Acquire) & bit != 0)
            .unwrap_or(false)
    }

    fn set_flag(self, bit: u8, on: bool) {
        self.with(|meta| {
            if on {
                meta.flags.fetch_or(bit, Ordering::AcqRel);
            } else {
                meta.flags.fetch_and(!bit, Ordering::AcqRel);
            }
        });
    }
}

/// Metadata for one node in the arena.
///
/// The typed value (if any) lives outside the arena in the owning handle;
/// the arena holds only topology and state bits. This keeps the arena
/// monomorphic and the hot propagation paths free of generics.
pub struct NodeMetadata {
    /// Node kind, fixed at creation.
    pub(crate) kind: NodeKind,

    /// State bits: stale / computing / has-value / disposed.
    pub(crate) flags: AtomicU8,

    /// Effect scheduling priority; lower runs first, ties keep insertion
    /// order. Unused for signals and computeds.
    pub(crate) priority: i32,

    /// Nodes this node observes.
    pub(crate) deps: RwLock<EdgeSet>,

    /// Nodes observing this node.
    pub(crate) subs: RwLock<EdgeSet>,
}

impl NodeMetadata {
    /// Create metadata for a node of the given kind.
    ///
    /// Computeds start stale with no value, so the first read computes.
    pub fn new(kind: NodeKind, priority: i32) -> Self {
        let flags = match kind {
            NodeKind::Computed => FLAG_STALE,
            NodeKind::Signal | NodeKind::Effect => 0,
        };
        Self {
            kind,
            flags: AtomicU8::new(flags),
            priority,
            deps: RwLock::new(IndexSet::default()),
            subs: RwLock::new(IndexSet::default()),
        }
    }
}

// Arena manipulation functions

/// Insert a node into the arena and return its id.
pub fn node_arena_insert(metadata: NodeMetadata) -> NodeId {
    let mut arena = NODE_ARENA.write();
    let entry = arena.vacant_entry();
    let key = entry.key();
    entry.insert(metadata);
    NodeId::new(key as u32)
}

/// Remove a node from the arena.
pub fn node_arena_remove(id: NodeId) -> Option<NodeMetadata> {
    let mut arena = NODE_ARENA.write();
    if arena.contains(id.index()) {
        Some(arena.remove(id.index()))
    } else {
        None
    }
}

// Edge maintenance

/// Create the edge `observer -> dep`, keeping both sides of the dual
/// invariant. Idempotent. Self-edges are ignored (a node re-reading itself
/// is handled by the recompute reentrancy guard, not the edge set).
///
/// Fails with `InvalidTopology` if the observer is a signal: signals are
/// leaves and must never observe anything.
pub fn link(observer: NodeId, dep: NodeId) -> Result<(), ReactiveError> {
    if observer == dep {
        return Ok(());
    }
    if observer.kind() == Some(NodeKind::Signal) {
        return Err(ReactiveError::InvalidTopology);
    }
    let arena = NODE_ARENA.read();
    let (Some(obs), Some(target)) = (arena.get(observer.index()), arena.get(dep.index())) else {
        return Ok(());
    };
    obs.deps.write().insert(dep);
    target.subs.write().insert(observer);
    Ok(())
}

/// Remove the edge `observer -> dep` from both sides.
pub fn unlink(observer: NodeId, dep: NodeId) {
    let arena = NODE_ARENA.read();
    if let Some(obs) = arena.get(observer.index()) {
        obs.deps.write().shift_remove(&dep);
    }
    if let Some(target) = arena.get(dep.index()) {
        target.subs.write().shift_remove(&observer);
    }
}

/// Drop every dependency edge of `node`. Used before a recompute or effect
/// re-run so the new run collects a fresh dependency set.
pub fn detach_deps(node: NodeId) {
    for dep in node.deps_snapshot() {
        unlink(node, dep);
    }
}

/// Drop every incident edge of `node`, deps and subs. A disposed node holds
/// no edges.
pub fn sever(node: NodeId) {
    detach_deps(node);
    for sub in node.subs_snapshot() {
        unlink(sub, node);
    }
}

/// Register a dependency on the active observer.
///
/// A no-op outside tracked sections. Inside one, creates the edge
/// `current observer -> dep` (idempotent).
///
/// # Panics
///
/// If the active observer is a signal. That topology is impossible through
/// the public handles and indicates a broken external integration.
pub fn track(dep: NodeId) {
    if let Some(observer) = current_observer() {
        if let Err(err) = link(observer, dep) {
            panic!("{err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_access_returns_none() {
        let id = node_arena_insert(NodeMetadata::new(NodeKind::Signal, 0));
        node_arena_remove(id);

        assert!(id.with(|_| ()).is_none());
        assert_eq!(id.kind(), None);
        // Stale nodes read as disposed so the scheduler drops them.
        assert!(id.is_disposed());
    }

    #[test]
    fn link_maintains_dual_edge_sets() {
        let sig = node_arena_insert(NodeMetadata::new(NodeKind::Signal, 0));
        let eff = node_arena_insert(NodeMetadata::new(NodeKind::Effect, 0));

        link(eff, sig).unwrap();
        assert!(eff.deps_snapshot().contains(&sig));
        assert!(sig.subs_snapshot().contains(&eff));

        // Idempotent
        link(eff, sig).unwrap();
        assert_eq!(eff.deps_snapshot().len(), 1);
        assert_eq!(sig.subs_snapshot().len(), 1);

        unlink(eff, sig);
        assert!(eff.deps_snapshot().is_empty());
        assert!(sig.subs_snapshot().is_empty());

        node_arena_remove(sig);
        node_arena_remove(eff);
    }

    #[test]
    fn signal_cannot_observe() {
        let a = node_arena_insert(NodeMetadata::new(NodeKind::Signal, 0));
        let b = node_arena_insert(NodeMetadata::new(NodeKind::Signal, 0));

        assert_eq!(link(a, b), Err(ReactiveError::InvalidTopology));
        assert!(a.deps_snapshot().is_empty());
        assert!(b.subs_snapshot().is_empty());

        node_arena_remove(a);
        node_arena_remove(b);
    }

    #[test]
    fn observer_guard_restores_on_panic() {
        let outer = NodeId::new(7001);
        let inner = NodeId::new(7002);

        set_current_observer(Some(outer));

        let result = std::panic::catch_unwind(|| {
            let _guard = ObserverGuard::new(Some(inner));
            assert_eq!(current_observer(), Some(inner));
            panic!("test panic");
        });

        assert!(result.is_err());
        assert_eq!(current_observer(), Some(outer));

        set_current_observer(None);
    }

    #[test]
    fn track_is_noop_without_observer() {
        let sig = node_arena_insert(NodeMetadata::new(NodeKind::Signal, 0));
        track(sig);
        assert!(sig.subs_snapshot().is_empty());
        node_arena_remove(sig);
    }

    #[test]
    fn sever_clears_both_directions() {
        let sig = node_arena_insert(NodeMetadata::new(NodeKind::Signal, 0));
        let comp = node_arena_insert(NodeMetadata::new(NodeKind::Computed, 0));
        let eff = node_arena_insert(NodeMetadata::new(NodeKind::Effect, 0));

        link(comp, sig).unwrap();
        link(eff, comp).unwrap();

        sever(comp);
        assert!(comp.deps_snapshot().is_empty());
        assert!(comp.subs_snapshot().is_empty());
        assert!(sig.subs_snapshot().is_empty());
        assert!(eff.deps_snapshot().is_empty());

        node_arena_remove(sig);
        node_arena_remove(comp);
        node_arena_remove(eff);
    }

    #[test]
    fn mark_stale_if_clear_is_single_shot() {
        let comp = node_arena_insert(NodeMetadata::new(NodeKind::Computed, 0));
        // Computeds are born stale.
        assert!(!comp.mark_stale_if_clear());
        comp.set_stale(false);
        assert!(comp.mark_stale_if_clear());
        assert!(!comp.mark_stale_if_clear());
        node_arena_remove(comp);
    }
}
