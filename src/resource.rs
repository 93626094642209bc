// Source-driven async cells
//
// A resource composes a tracked source expression with a fetcher. The
// driving effect reads the source (establishing the dependency), stores it,
// and reloads the cell; every run after the first cancels the in-flight
// fetch before reloading. Cancel-then-reload plus the cell's token gating is
// what gives switch-latest: a late settlement from a fetch for an old source
// value can never clobber the fetch for the new one.

use crate::async_cell::{AsyncCell, AsyncOptions, RunContext};
use crate::effect::Effect;
use crate::promise::Promise;
use parking_lot::Mutex;
use std::sync::Arc;

/// Cancel reason used when the tracked source changes.
pub const SOURCE_CHANGED: &str = "source-changed";

/// Read half of an async cell: the value getter.
pub struct AsyncValue<T, E> {
    cell: Arc<AsyncCell<T, E>>,
}

impl<T, E> AsyncValue<T, E>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    E: Clone + PartialEq + Send + Sync + 'static,
{
    /// The last successful value, tracked.
    pub fn get(&self) -> Option<T> {
        self.cell.value()
    }

    /// The last successful value, untracked.
    pub fn peek(&self) -> Option<T> {
        self.cell.value_signal().peek()
    }
}

/// Control half of an async cell: status, error, reload, cancel.
///
/// For a resource this also owns the driving effect; dropping the meta stops
/// source tracking.
pub struct AsyncMeta<T, E> {
    cell: Arc<AsyncCell<T, E>>,
    _driver: Option<Effect>,
}

impl<T, E> AsyncMeta<T, E>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    E: Clone + PartialEq + Send + Sync + 'static,
{
    /// The lifecycle status, tracked.
    pub fn status(&self) -> crate::async_cell::AsyncStatus {
        self.cell.status()
    }

    /// The last failure, tracked.
    pub fn error(&self) -> Option<E> {
        self.cell.error()
    }

    /// Start a fresh run.
    pub fn reload(&self) {
        self.cell.reload();
    }

    /// Cancel the in-flight run.
    pub fn cancel(&self, reason: &str) {
        self.cell.cancel(reason);
    }

    /// Whether runs keep the previous success visible while pending.
    pub fn keep_previous_value_on_pending(&self) -> bool {
        self.cell.keep_previous_value_on_pending()
    }

    /// The cell itself, for integrations that want the signals.
    pub fn cell(&self) -> &Arc<AsyncCell<T, E>> {
        &self.cell
    }
}

/// Lift a producer into a cell and split it into getter and meta halves.
///
/// Same semantics as [`crate::from_promise`], packaged the way
/// [`create_resource`] packages its cell.
pub fn async_signal<T, E, P>(
    producer: P,
    opts: AsyncOptions<T, E>,
) -> (AsyncValue<T, E>, AsyncMeta<T, E>)
where
    T: Clone + PartialEq + Send + Sync + 'static,
    E: Clone + PartialEq + Send + Sync + 'static,
    P: Fn(RunContext) -> Promise<T, E> + Send + Sync + 'static,
{
    let cell = AsyncCell::from_promise(producer, opts);
    (
        AsyncValue { cell: cell.clone() },
        AsyncMeta {
            cell,
            _driver: None,
        },
    )
}

/// Create a source-driven async cell with switch-latest semantics.
///
/// `source` is read inside the driving effect, so any signal or computed it
/// touches becomes a dependency. On every source change the in-flight fetch
/// is cancelled with reason [`SOURCE_CHANGED`] and a new fetch starts with
/// the new source value. Whether the previous success stays visible across
/// that transition is [`AsyncOptions::drop_value_on_pending`]'s call.
pub fn create_resource<S, T, E, Src, F>(
    source: Src,
    fetcher: F,
    opts: AsyncOptions<T, E>,
) -> (AsyncValue<T, E>, AsyncMeta<T, E>)
where
    S: Send + 'static,
    T: Clone + PartialEq + Send + Sync + 'static,
    E: Clone + PartialEq + Send + Sync + 'static,
    Src: Fn() -> S + Send + 'static,
    F: Fn(&S, RunContext) -> Promise<T, E> + Send + Sync + 'static,
{
    let last_source: Arc<Mutex<Option<S>>> = Arc::new(Mutex::new(None));

    // The effect drives every run, so the cell itself must not start one.
    let opts = opts.lazy();

    let cell = {
        let last_source = last_source.clone();
        AsyncCell::from_promise(
            move |ctx| {
                let guard = last_source.lock();
                let current = guard
                    .as_ref()
                    .expect("resource reload only happens after the source is stored");
                fetcher(current, ctx)
            },
            opts,
        )
    };

    let driver = {
        let cell = cell.clone();
        let last_source = last_source.clone();
        let mut first_run = true;
        Effect::new(move || {
            let next = source();
            *last_source.lock() = Some(next);
            if first_run {
                first_run = false;
            } else {
                cell.cancel(SOURCE_CHANGED);
            }
            cell.reload();
        })
    };

    (
        AsyncValue { cell: cell.clone() },
        AsyncMeta {
            cell,
            _driver: Some(driver),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::async_cell::AsyncStatus;
    use crate::promise::Resolver;
    use crate::signal::signal;
    use std::collections::HashMap;

    type Resolvers = Arc<Mutex<HashMap<i32, Resolver<String, String>>>>;

    fn tracked_fetcher(resolvers: Resolvers) -> impl Fn(&i32, RunContext) -> Promise<String, String> + Send + Sync
    {
        move |id, _ctx| {
            let (promise, resolver) = Promise::pending();
            resolvers.lock().insert(*id, resolver);
            promise
        }
    }

    #[test]
    fn resource_fetches_eagerly_from_first_source() {
        let id = signal(1);
        let resolvers: Resolvers = Arc::new(Mutex::new(HashMap::new()));

        let id_clone = id.clone();
        let (value, meta) = create_resource(
            move || id_clone.get(),
            tracked_fetcher(resolvers.clone()),
            AsyncOptions::new(),
        );

        assert_eq!(meta.status(), AsyncStatus::Pending);
        assert_eq!(value.get(), None);

        let resolver = resolvers.lock().remove(&1).unwrap();
        resolver.resolve("one".into());
        assert_eq!(meta.status(), AsyncStatus::Success);
        assert_eq!(value.get(), Some("one".into()));
    }

    #[test]
    fn source_change_cancels_with_reason() {
        let id = signal(1);
        let resolvers: Resolvers = Arc::new(Mutex::new(HashMap::new()));
        let reasons: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let reasons_clone = reasons.clone();
        let id_clone = id.clone();
        let (_value, meta) = create_resource(
            move || id_clone.get(),
            tracked_fetcher(resolvers.clone()),
            AsyncOptions::new().on_cancel(move |reason| {
                reasons_clone.lock().push(reason.to_string());
            }),
        );

        id.set(2);
        assert_eq!(*reasons.lock(), vec![SOURCE_CHANGED.to_string()]);
        assert_eq!(meta.status(), AsyncStatus::Pending);
        assert!(resolvers.lock().contains_key(&2));
    }

    #[test]
    fn dropping_meta_stops_source_tracking() {
        let id = signal(1);
        let resolvers: Resolvers = Arc::new(Mutex::new(HashMap::new()));

        let id_clone = id.clone();
        let (_value, meta) = create_resource(
            move || id_clone.get(),
            tracked_fetcher(resolvers.clone()),
            AsyncOptions::new(),
        );
        drop(meta);

        resolvers.lock().clear();
        id.set(2);
        assert!(resolvers.lock().is_empty());
    }

    #[test]
    fn async_signal_has_no_driver() {
        let (value, meta) = async_signal(
            |_ctx| Promise::<String, String>::fulfilled("plain".into()),
            AsyncOptions::new(),
        );
        assert_eq!(meta.status(), AsyncStatus::Success);
        assert_eq!(value.get(), Some("plain".into()));
        meta.reload();
        assert_eq!(meta.status(), AsyncStatus::Success);
    }
}
