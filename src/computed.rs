use crate::arena::{
    self, node_arena_insert, node_arena_remove, NodeId, NodeKind, NodeMetadata, ObserverGuard,
};
use crate::error::ReactiveError;
use crate::registry;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

type EqualsFn<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;
type ComputeFn<T> = Arc<Mutex<Box<dyn FnMut() -> T + Send>>>;

/// Lazily memoised derivation.
///
/// A computed caches the result of its function and recomputes only when a
/// dependency marked it stale. The cached value is authoritative exactly
/// when the node has a value and is not stale; a read in any other state
/// recomputes first.
///
/// Recomputation drops the old dependency set and collects a fresh one by
/// installing the computed as the observer while its function runs, so
/// conditional reads narrow the subscription automatically.
///
/// # Memoisation
/// When a recompute produces a value the comparator considers equal, the
/// cache is left untouched. Effects enqueued by the originating signal write
/// still run, but any computed downstream re-derives to an identical result.
///
/// # Example
/// ```ignore
/// let a = signal(2);
/// let squared = computed({
///     let a = a.clone();
///     move || a.get() * a.get()
/// });
/// assert_eq!(squared.get(), 4);
/// ```
pub struct Computed<T> {
    node: NodeId,
    value: Arc<RwLock<Option<T>>>,
    f: ComputeFn<T>,
    equals: EqualsFn<T>,
}

impl<T> Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a computed with the default `PartialEq` comparator.
    pub fn new<F>(f: F) -> Arc<Self>
    where
        F: FnMut() -> T + Send + 'static,
        T: PartialEq,
    {
        Self::with_equals(f, crate::equality::equals)
    }

    /// Create a computed with a custom comparator.
    ///
    /// Nothing runs until the first read: computeds are born stale.
    pub fn with_equals<F, E>(f: F, equals: E) -> Arc<Self>
    where
        F: FnMut() -> T + Send + 'static,
        E: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        let node = node_arena_insert(NodeMetadata::new(NodeKind::Computed, 0));
        let value: Arc<RwLock<Option<T>>> = Arc::new(RwLock::new(None));
        let f: ComputeFn<T> = Arc::new(Mutex::new(Box::new(f)));
        let equals: EqualsFn<T> = Arc::new(equals);

        // The scheduler drives stale computeds through the registry during
        // Phase A, before any effect of the tick runs.
        {
            let value = value.clone();
            let f = f.clone();
            let equals = equals.clone();
            registry::register_job(
                node,
                Box::new(move || {
                    if node.is_stale() {
                        if let Err(err) = recompute(node, &value, &f, &equals) {
                            panic!("{err}");
                        }
                    }
                    None
                }),
            );
        }

        Arc::new(Self {
            node,
            value,
            f,
            equals,
        })
    }

    /// Read the value, recomputing if the cache is not authoritative.
    ///
    /// Registers a dependency on the active observer first, so even a cached
    /// read links the observer to this node.
    ///
    /// # Errors
    ///
    /// [`ReactiveError::CycleDetected`] if this computed is already mid-
    /// recompute on this call stack.
    pub fn try_get(&self) -> Result<T, ReactiveError> {
        arena::track(self.node);
        if self.node.is_stale() || !self.node.has_value() {
            recompute(self.node, &self.value, &self.f, &self.equals)?;
        }
        Ok(self.read_cache())
    }

    /// Read the value, recomputing if needed.
    ///
    /// # Panics
    ///
    /// On a dependency cycle. Use [`try_get`](Computed::try_get) to handle
    /// that case as a value.
    pub fn get(&self) -> T {
        match self.try_get() {
            Ok(value) => value,
            Err(err) => panic!("{err}"),
        }
    }

    /// Read the value without registering a dependency. Still recomputes if
    /// the cache is not authoritative.
    pub fn peek(&self) -> T {
        if self.node.is_stale() || !self.node.has_value() {
            if let Err(err) = recompute(self.node, &self.value, &self.f, &self.equals) {
                panic!("{err}");
            }
        }
        self.read_cache()
    }

    /// Detach this computed from the graph.
    ///
    /// All incident edges are severed and the cache is cleared; the
    /// scheduler ignores the node from here on. A later read still works and
    /// re-evaluates as if the computed were new.
    pub fn dispose(&self) {
        self.node.set_disposed();
        arena::sever(self.node);
        self.node.set_has_value(false);
        self.node.set_stale(true);
        *self.value.write() = None;
    }

    /// The graph node backing this computed.
    pub fn node_id(&self) -> NodeId {
        self.node
    }

    fn read_cache(&self) -> T {
        self.value
            .read()
            .clone()
            .expect("computed cache is populated after recompute")
    }
}

/// Recompute one node: detach its dependency set, run its function with the
/// node installed as observer, and store the result if it differs.
///
/// The `computing` flag is the reentrancy guard; on any failure path the
/// node is left not-computing and stale so a later read can retry.
fn recompute<T>(
    node: NodeId,
    value: &Arc<RwLock<Option<T>>>,
    f: &ComputeFn<T>,
    equals: &EqualsFn<T>,
) -> Result<(), ReactiveError>
where
    T: Clone + Send + Sync + 'static,
{
    if node.is_computing() {
        return Err(ReactiveError::CycleDetected);
    }
    node.set_computing(true);

    struct RecomputeGuard {
        node: NodeId,
        completed: bool,
    }
    impl Drop for RecomputeGuard {
        fn drop(&mut self) {
            if !self.completed {
                self.node.set_computing(false);
                self.node.set_stale(true);
            }
        }
    }
    let mut guard = RecomputeGuard {
        node,
        completed: false,
    };

    arena::detach_deps(node);

    let next = {
        let _observer = ObserverGuard::new(Some(node));
        let mut func = f.lock();
        (func)()
    };

    let changed = {
        let current = value.read();
        match &*current {
            Some(old) => !(equals)(old, &next),
            None => true,
        }
    };
    if changed {
        *value.write() = Some(next);
        node.set_has_value(true);
    } else {
        cov_mark::hit!(memoised_recompute);
    }

    node.set_stale(false);
    node.set_computing(false);
    guard.completed = true;
    Ok(())
}

impl<T> Drop for Computed<T> {
    fn drop(&mut self) {
        self.node.set_disposed();
        arena::sever(self.node);
        registry::remove_job(self.node);
        node_arena_remove(self.node);
    }
}

/// Create a computed with the default `PartialEq` comparator.
pub fn computed<T, F>(f: F) -> Arc<Computed<T>>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    F: FnMut() -> T + Send + 'static,
{
    Computed::new(f)
}

/// Create a computed with a custom comparator.
pub fn computed_with_equals<T, F, E>(f: F, equals: E) -> Arc<Computed<T>>
where
    T: Clone + Send + Sync + 'static,
    F: FnMut() -> T + Send + 'static,
    E: Fn(&T, &T) -> bool + Send + Sync + 'static,
{
    Computed::with_equals(f, equals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::Effect;
    use crate::signal::signal;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn first_read_computes_then_caches() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let c = computed(move || {
            calls_clone.fetch_add(1, Ordering::Relaxed);
            41
        });

        // Born stale, nothing ran yet.
        assert_eq!(calls.load(Ordering::Relaxed), 0);

        assert_eq!(c.get(), 41);
        assert_eq!(c.get(), 41);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn staleness_cascades_from_signal() {
        let s = signal(1);
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = calls.clone();
        let s_clone = s.clone();
        let c = computed(move || {
            calls_clone.fetch_add(1, Ordering::Relaxed);
            s_clone.get() * 10
        });

        assert_eq!(c.get(), 10);
        assert_eq!(calls.load(Ordering::Relaxed), 1);

        s.set(2);
        assert_eq!(c.get(), 20);
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn equal_recompute_keeps_cache_quiet() {
        cov_mark::check!(memoised_recompute);

        let s = signal(1);
        let derived_calls = Arc::new(AtomicUsize::new(0));

        // Maps every input to the same output.
        let s_clone = s.clone();
        let constant = computed(move || {
            let _ = s_clone.get();
            7
        });

        let dc = derived_calls.clone();
        let constant_clone = constant.clone();
        let derived = computed(move || {
            dc.fetch_add(1, Ordering::Relaxed);
            constant_clone.get() + 1
        });

        assert_eq!(derived.get(), 8);
        assert_eq!(derived_calls.load(Ordering::Relaxed), 1);

        // The write cascades staleness, but the constant's value does not
        // change, so the derived read re-derives to the identical result.
        s.set(2);
        assert_eq!(derived.get(), 8);
    }

    #[test]
    fn conditional_reads_narrow_dependencies() {
        let flag = signal(true);
        let a = signal(10);
        let b = signal(20);
        let runs = Arc::new(AtomicUsize::new(0));

        let (flag_c, a_c, b_c) = (flag.clone(), a.clone(), b.clone());
        let pick = computed(move || if flag_c.get() { a_c.get() } else { b_c.get() });

        let runs_clone = runs.clone();
        let pick_clone = pick.clone();
        let _effect = Effect::new(move || {
            let _ = pick_clone.get();
            runs_clone.fetch_add(1, Ordering::Relaxed);
        });

        assert_eq!(runs.load(Ordering::Relaxed), 1);

        // Tracked branch changes: re-run.
        a.set(11);
        assert_eq!(runs.load(Ordering::Relaxed), 2);

        // Switch branches, then the abandoned branch goes quiet.
        flag.set(false);
        let after_switch = runs.load(Ordering::Relaxed);
        a.set(12);
        assert_eq!(runs.load(Ordering::Relaxed), after_switch);

        b.set(21);
        assert_eq!(runs.load(Ordering::Relaxed), after_switch + 1);
    }

    #[test]
    fn dispose_detaches_and_revives_as_new() {
        let s = signal(1);
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = calls.clone();
        let s_clone = s.clone();
        let c = computed(move || {
            calls_clone.fetch_add(1, Ordering::Relaxed);
            s_clone.get() + 100
        });

        assert_eq!(c.get(), 101);
        c.dispose();
        assert!(c.node_id().deps_snapshot().is_empty());
        assert!(c.node_id().subs_snapshot().is_empty());

        // Still readable; evaluates afresh.
        assert_eq!(c.get(), 101);
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn direct_reentry_reports_cycle() {
        // try_get from inside the node's own recompute surfaces the cycle
        // as a value.
        let slot: Arc<Mutex<Option<Arc<Computed<i32>>>>> = Arc::new(Mutex::new(None));

        let slot_clone = slot.clone();
        let c = computed(move || {
            let inner = slot_clone.lock().clone();
            match inner {
                Some(c) => match c.try_get() {
                    Ok(v) => v + 1,
                    Err(ReactiveError::CycleDetected) => -1,
                    Err(err) => panic!("{err}"),
                },
                None => 0,
            }
        });
        *slot.lock() = Some(c.clone());

        // First read happens with the slot filled: the inner try_get hits
        // the computing guard and the closure maps it to -1.
        assert_eq!(c.get(), -1);
    }
}
