// Atomic frames - batches with rollback
//
// An atomic frame is a batch frame plus a write log: the first write to each
// signal inside the frame records a restore thunk capturing the pre-write
// value. Commit merges the log into the enclosing frame (the outer frame's
// own entries win, since they hold the older values); rollback replays the
// log into the signals and wipes the queues so nothing from the aborted
// frame is published.
//
// Frames are per-thread, like batch depth: the log stack lives in a
// thread-local and frames must close on the thread that opened them.

use crate::arena::{NodeId, NodeKind};
use crate::hash::FixedHashBuilder;
use crate::promise::{Promise, Settlement};
use crate::scheduler;
use indexmap::IndexMap;
use std::cell::RefCell;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};

type RestoreFn = Box<dyn FnOnce() + Send>;
type WriteLog = IndexMap<NodeId, RestoreFn, FixedHashBuilder>;

thread_local! {
    static ATOMIC_LOGS: RefCell<Vec<WriteLog>> = const { RefCell::new(Vec::new()) };
}

/// Nesting depth of atomic frames on this thread.
pub fn atomic_depth() -> usize {
    ATOMIC_LOGS.with(|logs| logs.borrow().len())
}

/// Record the pre-write state of a signal in the innermost open frame.
///
/// Only the first write to a node per frame is recorded; later writes keep
/// the oldest restore thunk so rollback lands on the value the frame saw on
/// entry. A no-op outside atomic frames.
pub fn record_atomic_write<F>(node: NodeId, restore: F)
where
    F: FnOnce() + Send + 'static,
{
    ATOMIC_LOGS.with(|logs| {
        if let Some(top) = logs.borrow_mut().last_mut() {
            top.entry(node).or_insert_with(|| Box::new(restore));
        }
    });
}

fn enter_frame() {
    scheduler::enter_batch();
    ATOMIC_LOGS.with(|logs| logs.borrow_mut().push(IndexMap::default()));
}

/// Commit the innermost frame: merge its log outward (outer wins) and leave
/// the batch frame, draining if this was the outermost.
fn commit_frame() {
    let log = ATOMIC_LOGS.with(|logs| logs.borrow_mut().pop());
    if let Some(log) = log {
        ATOMIC_LOGS.with(|logs| {
            if let Some(parent) = logs.borrow_mut().last_mut() {
                for (node, restore) in log {
                    parent.entry(node).or_insert(restore);
                }
            }
        });
    }
    scheduler::exit_batch();
}

/// Roll the innermost frame back: replay saved values, re-stale dependent
/// computeds, and drop everything the frame scheduled. No flush happens; the
/// next tick re-derives from the restored values.
fn rollback_frame() {
    cov_mark::hit!(rollback_replayed);
    let log = ATOMIC_LOGS.with(|logs| logs.borrow_mut().pop());
    scheduler::mute();
    if let Some(log) = log {
        for (node, restore) in log {
            restore();
            if node.kind() == Some(NodeKind::Signal) {
                for sub in node.subs_snapshot() {
                    if sub.kind() == Some(NodeKind::Computed) {
                        scheduler::mark_stale(sub);
                    }
                }
            }
        }
    }
    scheduler::clear_queues();
    scheduler::unmute();
    scheduler::exit_batch_no_flush();
}

/// Run a closure in an atomic frame.
///
/// On return the frame commits: writes stand, and the outermost frame exit
/// drains the scheduler. On panic the frame rolls back - every signal
/// written inside is restored to its pre-frame value - and the payload is
/// re-raised.
pub fn atomic<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    enter_frame();
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => {
            commit_frame();
            value
        }
        Err(payload) => {
            rollback_frame();
            resume_unwind(payload)
        }
    }
}

/// Alias for [`atomic`].
pub fn transaction<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    atomic(f)
}

/// Atomic frame over a settling value.
///
/// The closure returns a promise; the frame stays open until it settles on
/// this thread. Fulfilment commits, rejection or abort rolls back, and the
/// returned promise settles the same way after the frame has closed. A panic
/// in the closure itself rolls back immediately.
pub fn atomic_async<F, T, E>(f: F) -> Promise<T, E>
where
    F: FnOnce() -> Promise<T, E>,
    T: Send + 'static,
    E: Send + 'static,
{
    enter_frame();
    let inner = match catch_unwind(AssertUnwindSafe(f)) {
        Ok(promise) => promise,
        Err(payload) => {
            rollback_frame();
            resume_unwind(payload);
        }
    };

    let (outcome, resolver) = Promise::pending();
    inner.on_settle(move |settlement| match settlement {
        Settlement::Fulfilled(value) => {
            commit_frame();
            resolver.resolve(value);
        }
        Settlement::Rejected(error) => {
            rollback_frame();
            resolver.reject(error);
        }
        Settlement::Aborted(reason) => {
            rollback_frame();
            resolver.abort(reason);
        }
    });
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_tracks_frames() {
        assert_eq!(atomic_depth(), 0);
        atomic(|| {
            assert_eq!(atomic_depth(), 1);
            atomic(|| {
                assert_eq!(atomic_depth(), 2);
            });
            assert_eq!(atomic_depth(), 1);
        });
        assert_eq!(atomic_depth(), 0);
    }

    #[test]
    fn rollback_clears_frame_on_panic() {
        let result = std::panic::catch_unwind(|| {
            atomic(|| -> () {
                panic!("abort the frame");
            });
        });
        assert!(result.is_err());
        assert_eq!(atomic_depth(), 0);
        assert!(!scheduler::is_batching());
    }

    #[test]
    fn transaction_is_an_alias() {
        assert_eq!(transaction(|| 3), 3);
    }

    #[test]
    fn record_outside_frame_is_noop() {
        let node = crate::arena::node_arena_insert(crate::arena::NodeMetadata::new(
            crate::arena::NodeKind::Signal,
            0,
        ));
        record_atomic_write(node, || {});
        assert_eq!(atomic_depth(), 0);
        crate::arena::node_arena_remove(node);
    }
}
