// Job registry - associates a graph node with its closure and cleanups
//
// The arena holds only topology; the runnable part of a node lives here.
// Effects register their user closure, computeds register their recompute
// step. Cleanups collected during an effect run are stored alongside and
// drained in LIFO order before the next run or at dispose.
//
// The registry is a process-wide lock-free map so jobs can be created and
// removed from inside other running jobs without lock ordering concerns.

use crate::arena::NodeId;
use papaya::HashMap as PapayaHashMap;
use parking_lot::Mutex;
use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::LazyLock;

/// A cleanup callback collected during an effect run.
pub type Cleanup = Box<dyn FnOnce() + Send>;

/// A registered job closure. Effects may hand back a cleanup to run before
/// their next execution; computeds always return `None`.
pub type JobFn = Box<dyn FnMut() -> Option<Cleanup> + Send>;

/// One registry entry: the job closure plus its pending cleanups.
struct JobEntry {
    callback: Mutex<Option<JobFn>>,
    cleanups: Mutex<Vec<Cleanup>>,
}

/// Global registry: node id -> job entry.
static JOB_REGISTRY: LazyLock<PapayaHashMap<NodeId, JobEntry>> = LazyLock::new(PapayaHashMap::new);

// Thread-local reference to the effect whose run is collecting cleanups.
// Distinct from the observer stack: a computed recomputing inside an effect
// installs itself as observer, but cleanups still attach to the effect.
thread_local! {
    static ACTIVE_EFFECT: Cell<Option<NodeId>> = const { Cell::new(None) };
}

/// The effect currently collecting cleanups on this thread, if any.
pub fn active_effect() -> Option<NodeId> {
    ACTIVE_EFFECT.with(Cell::get)
}

/// RAII guard installing the active effect; restores the previous one on
/// drop, including during unwinding.
pub struct ActiveEffectGuard {
    previous: Option<NodeId>,
}

impl ActiveEffectGuard {
    /// Install `effect` as the cleanup collector.
    pub fn new(effect: Option<NodeId>) -> Self {
        let previous = ACTIVE_EFFECT.with(|c| c.replace(effect));
        Self { previous }
    }
}

impl Drop for ActiveEffectGuard {
    fn drop(&mut self) {
        ACTIVE_EFFECT.with(|c| c.set(self.previous));
    }
}

/// Register a cleanup on the effect currently running.
///
/// Outside an effect run this is a no-op: there is nothing to attach the
/// callback to, and dropping it silently is the contract.
pub fn on_cleanup<F>(cb: F)
where
    F: FnOnce() + Send + 'static,
{
    if let Some(effect) = active_effect() {
        push_cleanup(effect, Box::new(cb));
    }
}

/// Associate a job closure with a node.
pub fn register_job(node: NodeId, callback: JobFn) {
    let guard = JOB_REGISTRY.pin();
    guard.insert(
        node,
        JobEntry {
            callback: Mutex::new(Some(callback)),
            cleanups: Mutex::new(Vec::new()),
        },
    );
}

/// Remove a node's registry entry, dropping its closure and any cleanups
/// that were not drained (dispose runs them first).
pub fn remove_job(node: NodeId) {
    let guard = JOB_REGISTRY.pin();
    guard.remove(&node);
}

/// Append a cleanup to a node's pending list.
pub fn push_cleanup(node: NodeId, cleanup: Cleanup) {
    let guard = JOB_REGISTRY.pin();
    if let Some(entry) = guard.get(&node) {
        entry.cleanups.lock().push(cleanup);
    }
}

/// Drain and run a node's cleanups in LIFO order.
///
/// A panicking cleanup is caught and reported; the remaining cleanups still
/// run. Failures here must never take down the run that triggered them.
pub fn run_cleanups(node: NodeId) {
    let pending = {
        let guard = JOB_REGISTRY.pin();
        match guard.get(&node) {
            Some(entry) => std::mem::take(&mut *entry.cleanups.lock()),
            None => return,
        }
    };
    for cleanup in pending.into_iter().rev() {
        if catch_unwind(AssertUnwindSafe(cleanup)).is_err() {
            tracing::warn!(node = node.index(), "cleanup callback panicked; continuing");
        }
    }
}

/// Run the job closure registered for `node`.
///
/// The closure is taken out of the registry for the duration of the call so
/// the entry is never locked while user code runs; a drop guard puts it back
/// even if the closure panics. A cleanup returned by the closure is appended
/// to the node's pending list.
pub fn run_job(node: NodeId) {
    struct CallbackGuard {
        node: NodeId,
        callback: Option<JobFn>,
    }

    impl Drop for CallbackGuard {
        fn drop(&mut self) {
            if let Some(cb) = self.callback.take() {
                let guard = JOB_REGISTRY.pin();
                if let Some(entry) = guard.get(&self.node) {
                    *entry.callback.lock() = Some(cb);
                }
            }
        }
    }

    let callback = {
        let guard = JOB_REGISTRY.pin();
        match guard.get(&node) {
            Some(entry) => entry.callback.lock().take(),
            None => None,
        }
    };
    // Registry entry released - the job may register or remove other jobs.

    if let Some(cb) = callback {
        let mut guard = CallbackGuard {
            node,
            callback: Some(cb),
        };
        let cleanup = guard
            .callback
            .as_mut()
            .map(|cb| cb())
            .unwrap_or_default();
        if let Some(cleanup) = cleanup {
            push_cleanup(node, cleanup);
        }
        // Guard drops here, restoring the callback.
    }
}

/// Whether a node has a registered job.
pub fn has_job(node: NodeId) -> bool {
    let guard = JOB_REGISTRY.pin();
    guard.contains_key(&node)
}
