//! Memoized reactive computations bound to a selector.
//!
//! An [`Autorun`] watches the store through a selector and an optional
//! comparator: the wrapped function re-runs only when the comparator value
//! differs from the memoized one (or when memoization is disabled, or when
//! forced with [`Autorun::trigger`]). Reactive autoruns subscribe themselves
//! to the store and recompute eagerly; non-reactive ones (see
//! [`Store::view`](crate::store::Store)) recompute lazily at invocation.
//!
//! Async bodies come in two completion modes, encoded in the constructor:
//! `autorun_task` schedules the future through the store's task creator and
//! fills the value in when it completes, while `autorun_deferred` hands the
//! caller an [`AwaitOnce`] wrapper to await explicitly.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use parking_lot::Mutex;

use crate::store::{Store, StoreInner};
use crate::subscription::{Callback, CallbackRef, Unsubscribe};


/// Options controlling an autorun's lifecycle and memoization.
pub struct AutorunOptions<R> {
    /// Value reported before the first successful computation.
    pub default_value: Option<R>,
    /// Run once at construction when the store already has a state.
    pub initial_call: bool,
    /// Subscribe to the store and recompute eagerly on state change. With
    /// `false` the autorun only recomputes when invoked.
    pub reactive: bool,
    /// Return the cached value while the comparator is unchanged. With
    /// `false` every invocation recomputes.
    pub memoization: bool,
    /// Default for the `initial_run` of attached subscribers.
    pub subscribers_initial_run: bool,
    /// Default for the `keep_ref` of attached subscribers.
    pub subscribers_keep_ref: bool,
}

impl<R> Default for AutorunOptions<R> {
    fn default() -> Self {
        Self {
            default_value: None,
            initial_call: true,
            reactive: true,
            memoization: true,
            subscribers_initial_run: true,
            subscribers_keep_ref: true,
        }
    }
}

/// Options for [`Autorun::subscribe_with`]; `None` fields fall back to the
/// autorun's own defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutorunSubscribeOptions {
    /// Call the subscriber immediately when a computed value exists.
    pub initial_run: Option<bool>,
    /// Keep a strong reference to the subscriber.
    pub keep_ref: Option<bool>,
}

type TaskFuture<R> = Pin<Box<dyn Future<Output = R> + Send + 'static>>;

enum FuncRef<K, R> {
    Strong(Box<dyn Fn(&K, Option<&K>) -> R + Send + Sync>),
    /// Weakly held function; `None` means the referent died.
    Weak(Box<dyn Fn(&K, Option<&K>) -> Option<R> + Send + Sync>),
    /// Async body scheduled through the store's task creator.
    Task(Box<dyn Fn(&K, Option<&K>) -> TaskFuture<R> + Send + Sync>),
}

struct AutorunMemo<K, C, R> {
    /// Selector result from the latest check.
    last_selector: Option<K>,
    /// Selector result handed to the function at the latest computation.
    computed_selector: Option<K>,
    /// Comparator memo; `None` until the first check, so the first
    /// comparison always differs.
    last_comparator: Option<C>,
    value: Option<R>,
}

struct SubscriberEntry<R> {
    id: u64,
    callback: CallbackRef<R>,
}

pub(crate) struct AutorunInner<S, K, C, R> {
    store: Weak<StoreInner<S>>,
    selector: Box<dyn Fn(&S) -> Option<K> + Send + Sync>,
    comparator: Box<dyn Fn(&S, &K) -> Option<C> + Send + Sync>,
    func: FuncRef<K, R>,
    memo: Mutex<AutorunMemo<K, C, R>>,
    should_recompute: AtomicBool,
    subscribers: Mutex<Vec<SubscriberEntry<R>>>,
    subscriber_ids: AtomicU64,
    store_unsubscribe: Mutex<Option<Unsubscribe>>,
    memoization: bool,
    subscribers_initial_run: bool,
    subscribers_keep_ref: bool,
    /// Invoked with the outgoing value right before it is replaced; used by
    /// the deferred mode to close unawaited wrappers.
    replace_hook: Option<Box<dyn Fn(&R) + Send + Sync>>,
}

impl<S, K, C, R> AutorunInner<S, K, C, R>
where
    S: Clone + Send + Sync + 'static,
    K: Clone + Send + Sync + 'static,
    C: PartialEq + Send + Sync + 'static,
    R: Clone + PartialEq + Send + Sync + 'static,
{
    /// Refresh the memoized selector/comparator results against `state` and
    /// report whether a recomputation is due. A selector or comparator that
    /// cannot resolve on the current state shape returns `None` and is
    /// ignored silently.
    fn check(&self, state: &S) -> bool {
        let Some(selector_result) = (self.selector)(state) else {
            return false;
        };
        let Some(comparator_result) = (self.comparator)(state, &selector_result) else {
            return false;
        };

        let mut memo = self.memo.lock();
        if memo.last_comparator.as_ref() != Some(&comparator_result) {
            self.should_recompute.store(true, Ordering::SeqCst);
        }
        memo.last_selector = Some(selector_result);
        memo.last_comparator = Some(comparator_result);
        drop(memo);

        self.should_recompute.load(Ordering::SeqCst)
    }

    /// Invoke the wrapped function with the memoized selector result.
    fn call(this: &Arc<Self>) {
        let (selector_result, previous) = {
            let memo = this.memo.lock();
            (memo.last_selector.clone(), memo.computed_selector.clone())
        };
        let Some(selector_result) = selector_result else {
            return;
        };

        match &this.func {
            FuncRef::Strong(func) => {
                let value = func(&selector_result, previous.as_ref());
                this.should_recompute.store(false, Ordering::SeqCst);
                this.store_value(value, Some(selector_result));
            }
            FuncRef::Weak(func) => match func(&selector_result, previous.as_ref()) {
                Some(value) => {
                    this.should_recompute.store(false, Ordering::SeqCst);
                    this.store_value(value, Some(selector_result));
                }
                None => {
                    // The function died; detach from the store for good.
                    this.unsubscribe();
                }
            },
            FuncRef::Task(func) => {
                let future = func(&selector_result, previous.as_ref());
                this.should_recompute.store(false, Ordering::SeqCst);
                {
                    let mut memo = this.memo.lock();
                    if let (Some(hook), Some(old)) = (&this.replace_hook, memo.value.as_ref()) {
                        hook(old);
                    }
                    memo.value = None;
                    memo.computed_selector = Some(selector_result);
                }
                let Some(store) = this.store.upgrade() else {
                    return;
                };
                let Some(create_task) = store.task_creator.clone() else {
                    tracing::error!(
                        target: "eddy::autorun",
                        "async autorun cannot run without a task creator"
                    );
                    return;
                };
                let weak = Arc::downgrade(this);
                create_task(Box::pin(async move {
                    let value = future.await;
                    if let Some(inner) = weak.upgrade() {
                        inner.store_value(value, None);
                    }
                }));
            }
        }
    }

    fn store_value(&self, value: R, computed_selector: Option<K>) {
        let changed = {
            let mut memo = self.memo.lock();
            let changed = memo.value.as_ref() != Some(&value);
            if let (Some(hook), Some(old)) = (&self.replace_hook, memo.value.as_ref()) {
                hook(old);
            }
            memo.value = Some(value.clone());
            if let Some(selector_result) = computed_selector {
                memo.computed_selector = Some(selector_result);
            }
            changed
        };
        if changed {
            self.notify_subscribers(&value);
        }
    }

    fn notify_subscribers(&self, value: &R) {
        let entries: Vec<(u64, Option<Callback<R>>)> = self
            .subscribers
            .lock()
            .iter()
            .map(|entry| (entry.id, entry.callback.get()))
            .collect();

        let mut dead = Vec::new();
        for (id, callback) in entries {
            match callback {
                Some(callback) => callback.emit(value),
                None => dead.push(id),
            }
        }
        if !dead.is_empty() {
            self.subscribers
                .lock()
                .retain(|entry| !dead.contains(&entry.id));
        }
    }

    fn unsubscribe(&self) {
        if let Some(unsubscribe) = self.store_unsubscribe.lock().take() {
            unsubscribe.call();
        }
    }
}

/// A memoized reactive computation. Cloning shares the computation.
pub struct Autorun<S, K, C, R> {
    inner: Arc<AutorunInner<S, K, C, R>>,
}

impl<S, K, C, R> Clone for Autorun<S, K, C, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S, K, C, R> Autorun<S, K, C, R>
where
    S: Clone + Send + Sync + 'static,
    K: Clone + Send + Sync + 'static,
    C: PartialEq + Send + Sync + 'static,
    R: Clone + PartialEq + Send + Sync + 'static,
{
    fn create(
        store: &Store<S>,
        selector: Box<dyn Fn(&S) -> Option<K> + Send + Sync>,
        comparator: Box<dyn Fn(&S, &K) -> Option<C> + Send + Sync>,
        func: FuncRef<K, R>,
        options: AutorunOptions<R>,
        replace_hook: Option<Box<dyn Fn(&R) + Send + Sync>>,
    ) -> Self {
        let inner = Arc::new(AutorunInner {
            store: Arc::downgrade(&store.inner),
            selector,
            comparator,
            func,
            memo: Mutex::new(AutorunMemo {
                last_selector: None,
                computed_selector: None,
                last_comparator: None,
                value: options.default_value,
            }),
            should_recompute: AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
            subscriber_ids: AtomicU64::new(0),
            store_unsubscribe: Mutex::new(None),
            memoization: options.memoization,
            subscribers_initial_run: options.subscribers_initial_run,
            subscribers_keep_ref: options.subscribers_keep_ref,
            replace_hook,
        });

        if options.initial_call
            && let Some(state) = store.state()
            && inner.check(&state)
        {
            AutorunInner::call(&inner);
        }

        if options.reactive {
            let listener = inner.clone();
            let unsubscribe = store.subscribe(move |state: &S| {
                if listener.check(state) {
                    AutorunInner::call(&listener);
                }
            });
            *inner.store_unsubscribe.lock() = Some(unsubscribe);
        }

        Autorun { inner }
    }

    /// Recompute if due and return the (possibly cached) value.
    ///
    /// The function is invoked iff the comparator changed since the last
    /// computation or memoization is disabled.
    pub fn call(&self) -> Option<R> {
        if let Some(state) = self.current_state() {
            let due = self.inner.check(&state);
            if due || !self.inner.memoization {
                AutorunInner::call(&self.inner);
            }
        }
        self.value()
    }

    /// Recompute unconditionally and return the value.
    pub fn trigger(&self) -> Option<R> {
        if let Some(state) = self.current_state() {
            self.inner.check(&state);
        }
        AutorunInner::call(&self.inner);
        self.value()
    }

    /// The cached value, without checking the store.
    pub fn value(&self) -> Option<R> {
        self.inner.memo.lock().value.clone()
    }

    /// Attach a subscriber notified whenever the computed value changes.
    pub fn subscribe<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(&R) + Send + Sync + 'static,
    {
        self.subscribe_with(&Callback::new(callback), AutorunSubscribeOptions::default())
    }

    /// Attach a subscriber with explicit options.
    pub fn subscribe_with(
        &self,
        callback: &Callback<R>,
        options: AutorunSubscribeOptions,
    ) -> Unsubscribe {
        let initial_run = options
            .initial_run
            .unwrap_or(self.inner.subscribers_initial_run);
        let keep_ref = options.keep_ref.unwrap_or(self.inner.subscribers_keep_ref);

        let id = self.inner.subscriber_ids.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().push(SubscriberEntry {
            id,
            callback: CallbackRef::new(callback, keep_ref),
        });

        if initial_run && let Some(value) = self.value() {
            callback.emit(&value);
        }

        let weak = Arc::downgrade(&self.inner);
        Unsubscribe::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.subscribers.lock().retain(|entry| entry.id != id);
            }
        })
    }

    /// Detach from the store. The autorun keeps serving its cached value
    /// but never recomputes reactively again.
    pub fn unsubscribe(&self) {
        self.inner.unsubscribe();
    }

    fn current_state(&self) -> Option<S> {
        self.inner
            .store
            .upgrade()
            .and_then(|inner| inner.state.read().clone())
    }
}

enum AwaitOnceState<T> {
    Pending(Pin<Box<dyn Future<Output = T> + Send>>),
    Consumed,
    Closed,
}

/// A single-await wrapper around a deferred autorun result.
///
/// Awaiting yields the computed value exactly once; awaiting again panics.
/// When the producing autorun recomputes before the wrapper was awaited,
/// the wrapper is closed and the pending work is discarded.
pub struct AwaitOnce<T> {
    state: Arc<Mutex<AwaitOnceState<T>>>,
}

impl<T> AwaitOnce<T> {
    pub(crate) fn new(future: Pin<Box<dyn Future<Output = T> + Send>>) -> Self {
        Self {
            state: Arc::new(Mutex::new(AwaitOnceState::Pending(future))),
        }
    }

    /// Discard the pending computation. Consumed wrappers are unaffected.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if matches!(*state, AwaitOnceState::Pending(_)) {
            *state = AwaitOnceState::Closed;
        }
    }

    /// Whether the value was already taken by an await.
    pub fn is_consumed(&self) -> bool {
        matches!(*self.state.lock(), AwaitOnceState::Consumed)
    }

    /// Whether the wrapper was closed before being awaited.
    pub fn is_closed(&self) -> bool {
        matches!(*self.state.lock(), AwaitOnceState::Closed)
    }
}

impl<T> Clone for AwaitOnce<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T> PartialEq for AwaitOnce<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl<T> std::fmt::Debug for AwaitOnce<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match *self.state.lock() {
            AwaitOnceState::Pending(_) => "pending",
            AwaitOnceState::Consumed => "consumed",
            AwaitOnceState::Closed => "closed",
        };
        f.debug_struct("AwaitOnce").field("state", &state).finish()
    }
}

impl<T> Future for AwaitOnce<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = self.get_mut();
        let mut state = this.state.lock();
        match std::mem::replace(&mut *state, AwaitOnceState::Consumed) {
            AwaitOnceState::Pending(mut future) => match future.as_mut().poll(cx) {
                Poll::Ready(value) => Poll::Ready(value),
                Poll::Pending => {
                    *state = AwaitOnceState::Pending(future);
                    Poll::Pending
                }
            },
            AwaitOnceState::Consumed => {
                panic!("deferred autorun result has already been awaited")
            }
            AwaitOnceState::Closed => {
                *state = AwaitOnceState::Closed;
                panic!("deferred autorun result was closed before being awaited")
            }
        }
    }
}

impl<S> Store<S>
where
    S: Clone + Send + Sync + 'static,
{
    /// Create a reactive memoized computation over `selector`.
    ///
    /// The default comparator is the selector result itself: `func` re-runs
    /// whenever the selected value changes.
    ///
    /// ```rust
    /// # use eddy_core::error::StoreError;
    /// # use eddy_core::store::{Store, StoreOptions};
    /// # use eddy_core::types::{Action, InitAction, ReducerResult};
    /// # #[derive(Debug, Clone, PartialEq)]
    /// # struct CounterState { value: i64 }
    /// # #[derive(Debug)]
    /// # struct Increment;
    /// # impl Action for Increment {}
    /// # fn reducer(state: Option<&CounterState>, action: &dyn Action)
    /// #     -> Result<ReducerResult<CounterState>, StoreError> {
    /// #     let Some(state) = state else {
    /// #         if action.is::<InitAction>() { return Ok(CounterState { value: 0 }.into()); }
    /// #         return Err(StoreError::initialization(action));
    /// #     };
    /// #     if action.is::<Increment>() {
    /// #         return Ok(CounterState { value: state.value + 1 }.into());
    /// #     }
    /// #     Ok(state.clone().into())
    /// # }
    /// let store = Store::new(
    ///     reducer,
    ///     StoreOptions { auto_init: true, ..StoreOptions::default() },
    /// )?;
    /// let doubled = store.autorun(|state: &CounterState| state.value, |value| value * 2);
    /// store.dispatch(Increment)?;
    /// assert_eq!(doubled.value(), Some(2));
    /// # Ok::<(), StoreError>(())
    /// ```
    pub fn autorun<K, R, Sel, F>(&self, selector: Sel, func: F) -> Autorun<S, K, K, R>
    where
        Sel: Fn(&S) -> K + Send + Sync + 'static,
        F: Fn(&K) -> R + Send + Sync + 'static,
        K: Clone + PartialEq + Send + Sync + 'static,
        R: Clone + PartialEq + Send + Sync + 'static,
    {
        self.autorun_with_options(selector, func, AutorunOptions::default())
    }

    /// [`Store::autorun`] with explicit options.
    pub fn autorun_with_options<K, R, Sel, F>(
        &self,
        selector: Sel,
        func: F,
        options: AutorunOptions<R>,
    ) -> Autorun<S, K, K, R>
    where
        Sel: Fn(&S) -> K + Send + Sync + 'static,
        F: Fn(&K) -> R + Send + Sync + 'static,
        K: Clone + PartialEq + Send + Sync + 'static,
        R: Clone + PartialEq + Send + Sync + 'static,
    {
        self.autorun_opt(move |state| Some(selector(state)), func, options)
    }

    /// An autorun whose selector may not resolve yet.
    ///
    /// Returning `None` from the selector (a slice not registered yet, a
    /// shape still evolving) is a soft signal: the check is skipped
    /// silently and no recomputation happens.
    pub fn autorun_opt<K, R, Sel, F>(
        &self,
        selector: Sel,
        func: F,
        options: AutorunOptions<R>,
    ) -> Autorun<S, K, K, R>
    where
        Sel: Fn(&S) -> Option<K> + Send + Sync + 'static,
        F: Fn(&K) -> R + Send + Sync + 'static,
        K: Clone + PartialEq + Send + Sync + 'static,
        R: Clone + PartialEq + Send + Sync + 'static,
    {
        Autorun::create(
            self,
            Box::new(selector),
            Box::new(|_state: &S, key: &K| Some(key.clone())),
            FuncRef::Strong(Box::new(move |key: &K, _previous| func(key))),
            options,
            None,
        )
    }

    /// An autorun gated by a dedicated comparator instead of the selector
    /// result. `func` re-runs iff the comparator value differs from its
    /// previous one; like the selector, a `None` comparator result skips
    /// the check silently.
    pub fn autorun_with_comparator<K, C, R, Sel, Cmp, F>(
        &self,
        selector: Sel,
        comparator: Cmp,
        func: F,
        options: AutorunOptions<R>,
    ) -> Autorun<S, K, C, R>
    where
        Sel: Fn(&S) -> Option<K> + Send + Sync + 'static,
        Cmp: Fn(&S) -> Option<C> + Send + Sync + 'static,
        F: Fn(&K) -> R + Send + Sync + 'static,
        K: Clone + Send + Sync + 'static,
        C: PartialEq + Send + Sync + 'static,
        R: Clone + PartialEq + Send + Sync + 'static,
    {
        Autorun::create(
            self,
            Box::new(selector),
            Box::new(move |state: &S, _key: &K| comparator(state)),
            FuncRef::Strong(Box::new(move |key: &K, _previous| func(key))),
            options,
            None,
        )
    }

    /// An autorun whose function also receives the selector result of the
    /// previous computation, `None` on the first run.
    pub fn autorun_scan<K, R, Sel, F>(
        &self,
        selector: Sel,
        func: F,
        options: AutorunOptions<R>,
    ) -> Autorun<S, K, K, R>
    where
        Sel: Fn(&S) -> K + Send + Sync + 'static,
        F: Fn(&K, Option<&K>) -> R + Send + Sync + 'static,
        K: Clone + PartialEq + Send + Sync + 'static,
        R: Clone + PartialEq + Send + Sync + 'static,
    {
        Autorun::create(
            self,
            Box::new(move |state: &S| Some(selector(state))),
            Box::new(|_state: &S, key: &K| Some(key.clone())),
            FuncRef::Strong(Box::new(func)),
            options,
            None,
        )
    }

    /// An autorun holding its function weakly.
    ///
    /// Only the caller's `Arc` keeps the function alive; once it is
    /// dropped, the autorun unsubscribes itself from the store and never
    /// runs again.
    pub fn autorun_weak<K, R, Sel, F>(
        &self,
        selector: Sel,
        func: &Arc<F>,
        options: AutorunOptions<R>,
    ) -> Autorun<S, K, K, R>
    where
        Sel: Fn(&S) -> K + Send + Sync + 'static,
        F: Fn(&K) -> R + Send + Sync + 'static,
        K: Clone + PartialEq + Send + Sync + 'static,
        R: Clone + PartialEq + Send + Sync + 'static,
    {
        let weak = Arc::downgrade(func);
        Autorun::create(
            self,
            Box::new(move |state: &S| Some(selector(state))),
            Box::new(|_state: &S, key: &K| Some(key.clone())),
            FuncRef::Weak(Box::new(move |key: &K, _previous| {
                weak.upgrade().map(|func| func(key))
            })),
            options,
            None,
        )
    }

    /// An autorun with an async body, scheduled through the store's task
    /// creator.
    ///
    /// The value resets to `None` while a computation is in flight and
    /// subscribers are notified when the task completes. Requires a task
    /// creator on the store; without one the computation is skipped with an
    /// error log.
    pub fn autorun_task<K, R, Sel, F, Fut>(
        &self,
        selector: Sel,
        func: F,
        options: AutorunOptions<R>,
    ) -> Autorun<S, K, K, R>
    where
        Sel: Fn(&S) -> K + Send + Sync + 'static,
        F: Fn(&K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        K: Clone + PartialEq + Send + Sync + 'static,
        R: Clone + PartialEq + Send + Sync + 'static,
    {
        Autorun::create(
            self,
            Box::new(move |state: &S| Some(selector(state))),
            Box::new(|_state: &S, key: &K| Some(key.clone())),
            FuncRef::Task(Box::new(move |key: &K, _previous| {
                Box::pin(func(key)) as TaskFuture<R>
            })),
            options,
            None,
        )
    }

    /// An autorun with an async body whose value is an [`AwaitOnce`]
    /// wrapper the caller awaits explicitly.
    ///
    /// Each recomputation produces a fresh wrapper and closes the previous
    /// one if it was never awaited.
    pub fn autorun_deferred<K, R, Sel, F, Fut>(
        &self,
        selector: Sel,
        func: F,
        options: AutorunOptions<AwaitOnce<R>>,
    ) -> Autorun<S, K, K, AwaitOnce<R>>
    where
        Sel: Fn(&S) -> K + Send + Sync + 'static,
        F: Fn(&K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        K: Clone + PartialEq + Send + Sync + 'static,
        R: Send + 'static,
    {
        Autorun::create(
            self,
            Box::new(move |state: &S| Some(selector(state))),
            Box::new(|_state: &S, key: &K| Some(key.clone())),
            FuncRef::Strong(Box::new(move |key: &K, _previous| {
                AwaitOnce::new(Box::pin(func(key)))
            })),
            options,
            Some(Box::new(|previous: &AwaitOnce<R>| previous.close())),
        )
    }
}
