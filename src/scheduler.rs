// Two-phase scheduler
//
// A tick drains two insertion-ordered queues until both are empty:
//
//   Phase A: computeds, repeatedly snapshot-and-drained until the derived
//            layer is stable. Jobs scheduled mid-drain join the same phase.
//   Phase B: one wave of effects, sorted by ascending priority with a
//            stable tie-break on insertion order. Jobs enqueued during the
//            wave are picked up by the outer loop, which re-enters Phase A
//            first.
//
// The ordering contract this buys: within one tick every stale computed
// recomputes before any effect runs, so effects only ever observe a
// stabilised derived layer.
//
// The runtime is cooperative and single-threaded; all scheduler state is
// thread-local, making each thread an independent runtime over the shared
// graph. A write propagates on the thread it happens on and its tick drains
// there too.

use crate::arena::{NodeId, NodeKind};
use crate::error::ReactiveError;
use crate::hash::FixedHashBuilder;
use crate::{effect, registry};
use indexmap::IndexSet;
use std::cell::{Cell, RefCell};
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};

/// Iteration ceiling for one flush. Exceeding it raises
/// [`ReactiveError::InfiniteUpdateLoop`] and leaves the queues untouched for
/// inspection.
pub const MAX_FLUSH_ITERATIONS: u32 = 10_000;

type JobSet = IndexSet<NodeId, FixedHashBuilder>;

#[derive(Default)]
struct Queues {
    compute: JobSet,
    effects: JobSet,
    scheduled: bool,
}

thread_local! {
    static QUEUES: RefCell<Queues> = RefCell::new(Queues::default());
    static BATCH_DEPTH: Cell<u32> = const { Cell::new(0) };
    static IN_FLUSH: Cell<bool> = const { Cell::new(false) };
    static MUTED: Cell<u32> = const { Cell::new(0) };
}

/// Current batch nesting depth on this thread.
pub fn batch_depth() -> u32 {
    BATCH_DEPTH.with(Cell::get)
}

/// Whether a batch or atomic frame is open on this thread.
pub fn is_batching() -> bool {
    batch_depth() > 0
}

/// Whether a flush is armed but has not run yet.
pub fn is_scheduled() -> bool {
    QUEUES.with(|q| q.borrow().scheduled)
}

pub(crate) fn is_muted() -> bool {
    MUTED.with(Cell::get) > 0
}

pub(crate) fn mute() {
    MUTED.with(|m| m.set(m.get() + 1));
}

pub(crate) fn unmute() {
    MUTED.with(|m| m.set(m.get().saturating_sub(1)));
}

pub(crate) fn enter_batch() {
    BATCH_DEPTH.with(|d| d.set(d.get() + 1));
}

/// Leave a batch frame; the outermost exit drains synchronously unless a
/// flush on this thread is already absorbing the work.
pub(crate) fn exit_batch() {
    let depth = BATCH_DEPTH.with(|d| {
        let depth = d.get().saturating_sub(1);
        d.set(depth);
        depth
    });
    if depth == 0 && !IN_FLUSH.with(Cell::get) {
        flush();
    }
}

/// Leave a batch frame without draining. Rollback uses this: a rolled-back
/// frame must not publish anything.
pub(crate) fn exit_batch_no_flush() {
    BATCH_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
}

/// Enqueue a job for the next tick.
///
/// Disposed jobs are dropped here, and dropped again at flush time for jobs
/// disposed in between. While muted (rollback replay) everything is dropped.
/// The job lands in the queue matching its kind; unknown kinds queue as
/// effects.
pub fn schedule_job(job: NodeId) {
    if is_muted() {
        cov_mark::hit!(muted_schedule_dropped);
        return;
    }
    if job.is_disposed() {
        return;
    }
    let kind = job.kind().unwrap_or(NodeKind::Effect);
    QUEUES.with(|q| {
        let mut queues = q.borrow_mut();
        match kind {
            NodeKind::Computed => {
                queues.compute.insert(job);
            }
            NodeKind::Effect | NodeKind::Signal => {
                queues.effects.insert(job);
            }
        }
        // Arm a drain unless a batch frame will do it on exit or a running
        // flush will absorb the job in its outer loop.
        if !queues.scheduled && batch_depth() == 0 && !IN_FLUSH.with(Cell::get) {
            queues.scheduled = true;
        }
    });
}

/// Mark a computed stale and cascade to its subscribers.
///
/// Idempotent per cascade: a node already stale does not re-mark its own
/// subscribers. Transitively stale computeds join the compute queue so the
/// next tick stabilises the whole derived layer before effects run.
pub(crate) fn mark_stale(node: NodeId) {
    if !node.mark_stale_if_clear() {
        return;
    }
    schedule_job(node);
    for sub in node.subs_snapshot() {
        match sub.kind() {
            Some(NodeKind::Computed) => mark_stale(sub),
            Some(NodeKind::Effect) => schedule_job(sub),
            Some(NodeKind::Signal) | None => {}
        }
    }
}

/// Propagate a signal write: computed subscribers go stale, effect
/// subscribers are enqueued. Synchronous; the caller decides when to drain.
pub(crate) fn propagate_write(signal: NodeId) {
    for sub in signal.subs_snapshot() {
        match sub.kind() {
            Some(NodeKind::Computed) => mark_stale(sub),
            Some(NodeKind::Effect) => schedule_job(sub),
            Some(NodeKind::Signal) | None => {}
        }
    }
}

/// Drain now if a flush is armed and nothing on this thread defers it.
///
/// This is the microtask collapsed to its earliest legal point: the write
/// that armed the flush finishes its synchronous propagation, then the tick
/// runs before control returns to the caller.
pub(crate) fn flush_if_armed() {
    if batch_depth() == 0 && !IN_FLUSH.with(Cell::get) && is_scheduled() {
        flush();
    }
}

/// Clear both queues and the armed flag. Only rollback does this.
pub(crate) fn clear_queues() {
    QUEUES.with(|q| {
        let mut queues = q.borrow_mut();
        queues.compute.clear();
        queues.effects.clear();
        queues.scheduled = false;
    });
}

fn take_compute_batch() -> Vec<NodeId> {
    QUEUES.with(|q| q.borrow_mut().compute.drain(..).collect())
}

fn take_effect_wave() -> Vec<NodeId> {
    QUEUES.with(|q| q.borrow_mut().effects.drain(..).collect())
}

fn queues_idle() -> bool {
    QUEUES.with(|q| {
        let queues = q.borrow();
        queues.compute.is_empty() && queues.effects.is_empty()
    })
}

/// Run the scheduler until both queues are empty.
///
/// Effects that panic are caught so the rest of their wave still runs; the
/// first payload is re-raised when the flush ends. The iteration guard
/// panics with [`ReactiveError::InfiniteUpdateLoop`] and leaves the queues
/// as they were.
pub(crate) fn flush() {
    struct FlushGuard;
    impl Drop for FlushGuard {
        fn drop(&mut self) {
            IN_FLUSH.with(|f| f.set(false));
        }
    }

    IN_FLUSH.with(|f| f.set(true));
    let _guard = FlushGuard;

    QUEUES.with(|q| q.borrow_mut().scheduled = false);

    let mut iterations: u32 = 0;
    let mut pending_panic: Option<Box<dyn std::any::Any + Send>> = None;

    while !queues_idle() {
        iterations += 1;
        if iterations > MAX_FLUSH_ITERATIONS {
            panic!("{}", ReactiveError::InfiniteUpdateLoop);
        }

        // Phase A: computeds to stability. Jobs scheduled during a drain
        // join the phase through the next snapshot.
        loop {
            let batch = take_compute_batch();
            if batch.is_empty() {
                break;
            }
            iterations += 1;
            if iterations > MAX_FLUSH_ITERATIONS {
                panic!("{}", ReactiveError::InfiniteUpdateLoop);
            }
            for job in batch {
                if job.is_disposed() {
                    continue;
                }
                registry::run_job(job);
            }
        }

        // Phase B: one wave of effects in ascending priority, stable on
        // insertion order. Anything they schedule belongs to the next cycle.
        let mut wave = take_effect_wave();
        wave.sort_by_key(|job| job.priority());

        for job in wave {
            if job.is_disposed() {
                cov_mark::hit!(disposed_job_skipped);
                continue;
            }
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| effect::run_effect(job))) {
                if pending_panic.is_none() {
                    pending_panic = Some(payload);
                }
            }
        }

        if pending_panic.is_some() {
            break;
        }
    }

    drop(_guard);
    if let Some(payload) = pending_panic {
        resume_unwind(payload);
    }
}

/// Drain any pending work immediately.
///
/// Exists for tests and synchronous embedders that mutate the graph through
/// paths that do not drain on their own. A no-op while this thread is
/// already flushing.
pub fn flush_sync() {
    if !IN_FLUSH.with(Cell::get) {
        flush();
    }
}

/// Group several writes into one tick.
///
/// Effects and computed stabilisation are deferred until the outermost batch
/// exits, then a single flush runs synchronously. Returns the closure's
/// value; a panic still exits the frame and drains before propagating.
pub fn batch<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    struct BatchGuard;
    impl Drop for BatchGuard {
        fn drop(&mut self) {
            exit_batch();
        }
    }

    enter_batch();
    let _guard = BatchGuard;
    f()
}
