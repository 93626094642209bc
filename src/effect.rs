use crate::arena::{
    self, node_arena_insert, node_arena_remove, NodeId, NodeKind, NodeMetadata, ObserverGuard,
};
use crate::registry::{self, ActiveEffectGuard, Cleanup};

/// Tracked side-effect.
///
/// An effect runs once, synchronously, when created, collecting every signal
/// and computed it reads as a dependency. When any of those change, the
/// effect is enqueued and re-runs during the next tick's effect wave.
///
/// Each re-run first executes the cleanups collected during the previous run
/// (newest first), then drops the old dependency set and tracks afresh.
///
/// # Run order
/// Within one wave, effects run in ascending [`priority`] order; ties keep
/// insertion order. All stale computeds of the tick recompute before the
/// wave starts, so an effect never sees a half-updated derived layer.
///
/// [`priority`]: Effect::with_priority
///
/// # Example
/// ```ignore
/// let name = signal(String::from("world"));
/// let effect = Effect::new({
///     let name = name.clone();
///     move || println!("hello, {}", name.get())
/// });
///
/// name.set(String::from("reflow"));  // prints again
/// drop(effect);                      // detached, no further runs
/// ```
pub struct Effect {
    node: NodeId,
}

impl Effect {
    /// Create an effect and run it immediately.
    pub fn new<F>(f: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let mut f = f;
        Self::build(
            Box::new(move || {
                f();
                None
            }),
            0,
        )
    }

    /// Create an effect with a scheduling priority. Lower runs first within
    /// a wave; the default is 0.
    pub fn with_priority<F>(f: F, priority: i32) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let mut f = f;
        Self::build(
            Box::new(move || {
                f();
                None
            }),
            priority,
        )
    }

    /// Create an effect whose closure hands back a cleanup after every run.
    ///
    /// The cleanup runs before the next execution of the effect, and at
    /// dispose. Equivalent to calling [`on_cleanup`] as the last statement.
    pub fn with_cleanup<F>(f: F) -> Self
    where
        F: FnMut() -> Cleanup + Send + 'static,
    {
        let mut f = f;
        Self::build(Box::new(move || Some(f())), 0)
    }

    fn build(callback: registry::JobFn, priority: i32) -> Self {
        let node = node_arena_insert(NodeMetadata::new(NodeKind::Effect, priority));
        registry::register_job(node, callback);
        // First run happens synchronously at creation.
        run_effect(node);
        Effect { node }
    }

    /// Stop this effect: run pending cleanups, sever all edges, drop the
    /// closure. Idempotent; the scheduler skips anything already queued.
    pub fn dispose(&self) {
        if self.node.is_disposed() {
            return;
        }
        self.node.set_disposed();
        registry::run_cleanups(self.node);
        arena::sever(self.node);
        registry::remove_job(self.node);
    }

    /// The graph node backing this effect.
    pub fn node_id(&self) -> NodeId {
        self.node
    }
}

impl Drop for Effect {
    fn drop(&mut self) {
        self.dispose();
        node_arena_remove(self.node);
    }
}

/// Run one effect through its full lifecycle:
///
/// 1. bail if disposed,
/// 2. drain cleanups from the previous run (LIFO, failures reported),
/// 3. detach the old dependency set,
/// 4. install the effect as cleanup collector and observer,
/// 5. run the closure; a returned cleanup is kept for the next run.
///
/// Both guards restore their previous value on every exit path.
pub(crate) fn run_effect(node: NodeId) {
    if node.is_disposed() {
        return;
    }
    registry::run_cleanups(node);
    arena::detach_deps(node);

    let _active = ActiveEffectGuard::new(Some(node));
    let _observer = ObserverGuard::new(Some(node));
    registry::run_job(node);
}

/// Create an effect and run it immediately, returning its dispose handle.
pub fn create_effect<F>(f: F) -> Effect
where
    F: FnMut() + Send + 'static,
{
    Effect::new(f)
}
