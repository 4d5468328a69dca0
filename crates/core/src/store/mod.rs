//! The store: state container, dispatch loop and lifecycle.
//!
//! A [`Store`] is a cloneable handle over the shared container that owns the
//! state, the pending action/event queues, the listener and handler tables
//! and the side-effect worker pool. Dispatching is cooperative and
//! single-threaded: whichever thread acquires the non-reentrant run lock
//! drains both queues to completion, and any dispatch made while the loop is
//! running (typically by a reducer cascading further actions) only enqueues.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::error::{SnapshotError, StoreError};
use crate::side_effect::{
    EventSubscription, EventSubscriptionOptions, HandlerEntry, HandlerRef, HandlerRegistry,
    IntoEventHandler, SideEffectQueue, SideEffectRunner,
};
use crate::snapshot::Snapshot;
use crate::subscription::{Callback, CallbackRef, SubscriptionOptions, Unsubscribe};
use crate::types::{
    Action, ActionMiddleware, DispatchItem, Event, EventMiddleware, FinishAction, FinishEvent,
    InitAction, Reducer, ReducerResult, Scheduler, TaskCreator,
};

#[cfg(test)]
mod tests;

/// Identifier of a registered middleware, used to unregister it.
pub type MiddlewareId = u64;

/// Construction options for a [`Store`].
///
/// ```rust
/// use std::time::Duration;
/// use eddy_core::store::StoreOptions;
///
/// let options = StoreOptions {
///     auto_init: true,
///     side_effect_threads: 2,
///     grace_time: Duration::from_millis(50),
///     ..StoreOptions::default()
/// };
/// ```
pub struct StoreOptions {
    /// Dispatch an [`InitAction`] at construction.
    pub auto_init: bool,
    /// Number of side-effect worker threads, at least one.
    pub side_effect_threads: usize,
    /// External driver for the run loop. When set, `dispatch` only
    /// enqueues.
    pub scheduler: Option<Scheduler>,
    /// Executor entry point for futures produced by async autoruns and
    /// async event handlers.
    pub task_creator: Option<TaskCreator>,
    /// Action middlewares, applied in order.
    pub action_middlewares: Vec<ActionMiddleware>,
    /// Event middlewares, applied in order.
    pub event_middlewares: Vec<EventMiddleware>,
    /// Invoked exactly once at the end of the shutdown procedure.
    pub on_finish: Option<Box<dyn FnOnce() + Send>>,
    /// How long the shutdown procedure waits after the queues drain before
    /// joining the workers.
    pub grace_time: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            auto_init: false,
            side_effect_threads: 1,
            scheduler: None,
            task_creator: None,
            action_middlewares: Vec::new(),
            event_middlewares: Vec::new(),
            on_finish: None,
            grace_time: Duration::from_secs(1),
        }
    }
}

pub(crate) struct ListenerEntry<S> {
    id: u64,
    callback: CallbackRef<S>,
}

pub(crate) struct StoreInner<S> {
    reducer: Reducer<S>,
    pub(crate) state: RwLock<Option<S>>,
    pending_actions: Mutex<VecDeque<Box<dyn Action>>>,
    pending_events: Mutex<VecDeque<Arc<dyn Event>>>,
    listeners: Mutex<Vec<ListenerEntry<S>>>,
    handlers: HandlerRegistry,
    action_middlewares: Mutex<Vec<(MiddlewareId, ActionMiddleware)>>,
    event_middlewares: Mutex<Vec<(MiddlewareId, EventMiddleware)>>,
    run_lock: Mutex<()>,
    queue: SideEffectQueue,
    workers: Mutex<Vec<SideEffectRunner>>,
    pub(crate) task_creator: Option<TaskCreator>,
    scheduler: Option<Scheduler>,
    on_finish: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    grace_time: Duration,
    next_id: AtomicU64,
    finishing: AtomicBool,
    finished: AtomicBool,
}

impl<S> StoreInner<S> {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl<S> Drop for StoreInner<S> {
    fn drop(&mut self) {
        // Unblock workers that never saw a `FinishEvent`.
        if !self.finished.load(Ordering::SeqCst) {
            for _ in 0..self.workers.get_mut().len() {
                self.queue.push_sentinel();
            }
        }
    }
}

/// A reactive, deterministic state store.
///
/// The store owns exactly one optional state value, replaced only by reducer
/// returns. Listeners observe each replacement in the order the reducers
/// produced them; events are fanned out to subscribed handlers on the worker
/// pool.
///
/// ```rust
/// use eddy_core::error::StoreError;
/// use eddy_core::store::{Store, StoreOptions};
/// use eddy_core::types::{Action, InitAction, ReducerResult};
///
/// #[derive(Debug, Clone, PartialEq)]
/// struct CounterState {
///     value: i64,
/// }
///
/// #[derive(Debug)]
/// struct Increment;
/// impl Action for Increment {}
///
/// fn reducer(
///     state: Option<&CounterState>,
///     action: &dyn Action,
/// ) -> Result<ReducerResult<CounterState>, StoreError> {
///     let Some(state) = state else {
///         if action.is::<InitAction>() {
///             return Ok(CounterState { value: 0 }.into());
///         }
///         return Err(StoreError::initialization(action));
///     };
///     if action.is::<Increment>() {
///         return Ok(CounterState {
///             value: state.value + 1,
///         }
///         .into());
///     }
///     Ok(state.clone().into())
/// }
///
/// let store = Store::new(
///     reducer,
///     StoreOptions {
///         auto_init: true,
///         ..StoreOptions::default()
///     },
/// )?;
/// store.dispatch(Increment)?;
/// assert_eq!(store.state(), Some(CounterState { value: 1 }));
/// # Ok::<(), StoreError>(())
/// ```
pub struct Store<S> {
    pub(crate) inner: Arc<StoreInner<S>>,
}

impl<S> Clone for Store<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S> Store<S>
where
    S: Clone + Send + Sync + 'static,
{
    /// Create a store from a reducer.
    ///
    /// With `auto_init` an [`InitAction`] is dispatched before this returns
    /// (or handed to the scheduler when one is configured); a reducer that
    /// rejects it surfaces the error here.
    pub fn new<F>(reducer: F, options: StoreOptions) -> Result<Self, StoreError>
    where
        F: Fn(Option<&S>, &dyn Action) -> Result<ReducerResult<S>, StoreError>
            + Send
            + Sync
            + 'static,
    {
        let queue = SideEffectQueue::new();
        let workers = (0..options.side_effect_threads.max(1))
            .map(|index| {
                SideEffectRunner::spawn(
                    index,
                    queue.receiver(),
                    queue.outstanding_counter(),
                    options.task_creator.clone(),
                )
            })
            .collect();

        let inner = Arc::new(StoreInner {
            reducer: Box::new(reducer),
            state: RwLock::new(None),
            pending_actions: Mutex::new(VecDeque::new()),
            pending_events: Mutex::new(VecDeque::new()),
            listeners: Mutex::new(Vec::new()),
            handlers: HandlerRegistry::new(),
            action_middlewares: Mutex::new(
                options
                    .action_middlewares
                    .into_iter()
                    .enumerate()
                    .map(|(index, middleware)| (index as MiddlewareId, middleware))
                    .collect(),
            ),
            event_middlewares: Mutex::new(
                options
                    .event_middlewares
                    .into_iter()
                    .enumerate()
                    .map(|(index, middleware)| (index as MiddlewareId, middleware))
                    .collect(),
            ),
            run_lock: Mutex::new(()),
            queue,
            workers: Mutex::new(workers),
            task_creator: options.task_creator,
            scheduler: options.scheduler,
            on_finish: Mutex::new(options.on_finish),
            grace_time: options.grace_time,
            next_id: AtomicU64::new(1024),
            finishing: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        });
        let store = Store { inner };

        if options.auto_init {
            match &store.inner.scheduler {
                Some(scheduler) => {
                    let init_store = store.clone();
                    scheduler(
                        Box::new(move || {
                            if let Err(error) = init_store.dispatch(InitAction) {
                                tracing::error!(target: "eddy::store", %error, "auto init failed");
                            }
                        }),
                        false,
                    );
                }
                None => store.dispatch(InitAction)?,
            }
        }

        if let Some(scheduler) = &store.inner.scheduler {
            let weak = Arc::downgrade(&store.inner);
            scheduler(Box::new(move || run_scheduled(&weak)), true);
        }

        Ok(store)
    }

    /// The current state, `None` until the first successful reduction.
    pub fn state(&self) -> Option<S> {
        self.inner.state.read().clone()
    }

    /// Dispatch a single action.
    pub fn dispatch(&self, action: impl Action) -> Result<(), StoreError> {
        self.dispatch_all(vec![DispatchItem::action(action)])
    }

    /// Dispatch a single event.
    pub fn dispatch_event(&self, event: impl Event) -> Result<(), StoreError> {
        self.dispatch_all(vec![DispatchItem::event(event)])
    }

    /// Dispatch any mix of actions and events, in order.
    ///
    /// If the run loop is already draining (on this or another thread) the
    /// items are enqueued and picked up by that drain; otherwise the loop
    /// runs to completion before this returns. Reducer errors raised during
    /// the drain this call performs are returned here.
    pub fn dispatch_all(&self, items: Vec<DispatchItem>) -> Result<(), StoreError> {
        if self.inner.finished.load(Ordering::SeqCst) {
            return Err(StoreError::Finished);
        }
        self.enqueue_items(items);
        if self.inner.scheduler.is_none() {
            self.run()?;
        }
        Ok(())
    }

    /// Compute dispatch items from the current state and dispatch them.
    ///
    /// The closure is evaluated immediately, atomically with respect to the
    /// calling thread.
    pub fn dispatch_with<F>(&self, with_state: F) -> Result<(), StoreError>
    where
        F: FnOnce(Option<&S>) -> Vec<DispatchItem>,
    {
        let state = self.inner.state.read().clone();
        let items = with_state(state.as_ref());
        self.dispatch_all(items)
    }

    /// Drain the pending queues if no other drain is in progress.
    ///
    /// Called internally by `dispatch` unless a scheduler owns the loop;
    /// schedulers call this at intervals.
    pub fn run(&self) -> Result<(), StoreError> {
        let Some(_guard) = self.inner.run_lock.try_lock() else {
            return Ok(());
        };
        self.drain()
    }

    /// Subscribe a state listener; it observes every state replacement, in
    /// order.
    pub fn subscribe<F>(&self, listener: F) -> Unsubscribe
    where
        F: Fn(&S) + Send + Sync + 'static,
    {
        self.subscribe_with(&Callback::new(listener), SubscriptionOptions::default())
    }

    /// Subscribe a state listener with explicit options.
    ///
    /// With `keep_ref = false` only a weak reference is stored; keep the
    /// callback alive by holding a clone of it.
    pub fn subscribe_with(
        &self,
        listener: &Callback<S>,
        options: SubscriptionOptions,
    ) -> Unsubscribe {
        let id = self.inner.next_id();
        self.inner.listeners.lock().push(ListenerEntry {
            id,
            callback: CallbackRef::new(listener, options.keep_ref),
        });

        let weak = Arc::downgrade(&self.inner);
        Unsubscribe::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.listeners.lock().retain(|entry| entry.id != id);
            }
        })
    }

    /// Subscribe a handler for events of type `E`.
    ///
    /// The handler may take the event by reference or nothing at all, and
    /// may be async; the shape is captured here. Handlers run on the
    /// side-effect worker pool, never on the dispatch thread.
    pub fn subscribe_event<E, M, H>(&self, handler: H) -> EventSubscription
    where
        E: Event,
        H: IntoEventHandler<E, M>,
    {
        self.subscribe_event_with(handler, EventSubscriptionOptions::default())
    }

    /// Subscribe an event handler with explicit options.
    pub fn subscribe_event_with<E, M, H>(
        &self,
        handler: H,
        options: EventSubscriptionOptions,
    ) -> EventSubscription
    where
        E: Event,
        H: IntoEventHandler<E, M>,
    {
        let handler = handler.into_event_handler();
        let id = self.inner.next_id();
        let reference = if options.keep_ref {
            HandlerRef::Strong(handler.clone())
        } else {
            HandlerRef::Weak(handler.downgrade())
        };
        self.inner
            .handlers
            .entry(std::any::TypeId::of::<E>())
            .or_default()
            .push(HandlerEntry {
                id,
                handler: reference,
            });

        let weak = Arc::downgrade(&self.inner);
        let type_id = std::any::TypeId::of::<E>();
        let unsubscribe = Unsubscribe::new(move || {
            if let Some(inner) = weak.upgrade()
                && let Some(mut entries) = inner.handlers.get_mut(&type_id)
            {
                entries.retain(|entry| entry.id != id);
            }
        });
        EventSubscription::new(handler, unsubscribe)
    }

    /// Append an action middleware; it runs after the ones already
    /// registered.
    pub fn register_action_middleware<F>(&self, middleware: F) -> MiddlewareId
    where
        F: Fn(Box<dyn Action>) -> Option<Box<dyn Action>> + Send + Sync + 'static,
    {
        let id = self.inner.next_id();
        self.inner
            .action_middlewares
            .lock()
            .push((id, Arc::new(middleware)));
        id
    }

    /// Remove an action middleware. Takes effect on subsequent dispatches.
    pub fn unregister_action_middleware(&self, id: MiddlewareId) -> bool {
        let mut middlewares = self.inner.action_middlewares.lock();
        let before = middlewares.len();
        middlewares.retain(|(middleware_id, _)| *middleware_id != id);
        middlewares.len() != before
    }

    /// Append an event middleware; it runs after the ones already
    /// registered.
    pub fn register_event_middleware<F>(&self, middleware: F) -> MiddlewareId
    where
        F: Fn(Arc<dyn Event>) -> Option<Arc<dyn Event>> + Send + Sync + 'static,
    {
        let id = self.inner.next_id();
        self.inner
            .event_middlewares
            .lock()
            .push((id, Arc::new(middleware)));
        id
    }

    /// Remove an event middleware. Takes effect on subsequent dispatches.
    pub fn unregister_event_middleware(&self, id: MiddlewareId) -> bool {
        let mut middlewares = self.inner.event_middlewares.lock();
        let before = middlewares.len();
        middlewares.retain(|(middleware_id, _)| *middleware_id != id);
        middlewares.len() != before
    }

    /// Serialize the current state into a snapshot atom tree; `Null` while
    /// the state is unset.
    pub fn snapshot(&self) -> Result<Value, SnapshotError>
    where
        S: Snapshot,
    {
        match &*self.inner.state.read() {
            Some(state) => state.snapshot(),
            None => Ok(Value::Null),
        }
    }

    fn enqueue_items(&self, items: Vec<DispatchItem>) {
        for item in items {
            match item {
                DispatchItem::Action(action) => {
                    if let Some(action) = self.apply_action_middlewares(action) {
                        self.inner.pending_actions.lock().push_back(action);
                    }
                }
                DispatchItem::Event(event) => {
                    if let Some(event) = self.apply_event_middlewares(event) {
                        self.inner.pending_events.lock().push_back(event);
                    }
                }
            }
        }
    }

    fn apply_action_middlewares(&self, mut action: Box<dyn Action>) -> Option<Box<dyn Action>> {
        let middlewares: Vec<ActionMiddleware> = self
            .inner
            .action_middlewares
            .lock()
            .iter()
            .map(|(_, middleware)| middleware.clone())
            .collect();
        for middleware in middlewares {
            match middleware(action) {
                Some(next) => action = next,
                None => {
                    tracing::debug!(target: "eddy::store", "action dropped by middleware");
                    return None;
                }
            }
        }
        Some(action)
    }

    fn apply_event_middlewares(&self, mut event: Arc<dyn Event>) -> Option<Arc<dyn Event>> {
        let middlewares: Vec<EventMiddleware> = self
            .inner
            .event_middlewares
            .lock()
            .iter()
            .map(|(_, middleware)| middleware.clone())
            .collect();
        for middleware in middlewares {
            match middleware(event) {
                Some(next) => event = next,
                None => {
                    tracing::debug!(target: "eddy::store", "event dropped by middleware");
                    return None;
                }
            }
        }
        Some(event)
    }

    /// The drain alternates with action priority: events are only taken
    /// when the action queue is empty, and the action queue is rechecked
    /// after every event.
    fn drain(&self) -> Result<(), StoreError> {
        loop {
            let action = self.inner.pending_actions.lock().pop_front();
            if let Some(action) = action {
                self.process_action(action)?;
                continue;
            }
            let event = self.inner.pending_events.lock().pop_front();
            if let Some(event) = event {
                self.process_event(event);
                continue;
            }
            break;
        }
        Ok(())
    }

    fn process_action(&self, action: Box<dyn Action>) -> Result<(), StoreError> {
        tracing::trace!(target: "eddy::store", action = ?action, "reducing");
        let current = self.inner.state.read().clone();
        let result = (self.inner.reducer)(current.as_ref(), action.as_ref())?;
        let (new_state, actions, events) = match result {
            ReducerResult::State(state) => (state, Vec::new(), Vec::new()),
            ReducerResult::Complete(complete) => (complete.state, complete.actions, complete.events),
        };

        *self.inner.state.write() = Some(new_state.clone());
        self.notify_listeners(&new_state);

        let mut items: Vec<DispatchItem> =
            actions.into_iter().map(DispatchItem::Action).collect();
        items.extend(events.into_iter().map(DispatchItem::Event));
        self.enqueue_items(items);

        if action.is::<FinishAction>() {
            self.enqueue_items(vec![DispatchItem::event(FinishEvent)]);
        }
        Ok(())
    }

    fn process_event(&self, event: Arc<dyn Event>) {
        let type_id = event.as_ref().event_type();
        let mut pairs: Vec<HandlerRef> = Vec::new();
        if let Some(mut entries) = self.inner.handlers.get_mut(&type_id) {
            entries.retain(|entry| entry.handler.is_alive());
            pairs.extend(entries.iter().map(|entry| entry.handler.clone()));
        }
        for handler in pairs {
            self.inner.queue.push((handler, event.clone()));
        }

        if event.as_ref().is::<FinishEvent>() {
            self.begin_shutdown();
        }
    }

    fn notify_listeners(&self, state: &S) {
        // Snapshot before iterating so listeners may subscribe or
        // unsubscribe without deadlocking.
        let entries: Vec<(u64, Option<Callback<S>>)> = self
            .inner
            .listeners
            .lock()
            .iter()
            .map(|entry| (entry.id, entry.callback.get()))
            .collect();

        let mut dead = Vec::new();
        for (id, callback) in entries {
            match callback {
                Some(callback) => callback.emit(state),
                None => dead.push(id),
            }
        }
        if !dead.is_empty() {
            self.inner
                .listeners
                .lock()
                .retain(|entry| !dead.contains(&entry.id));
        }
    }

    /// Spawn the detached shutdown waiter, once.
    fn begin_shutdown(&self) {
        if self.inner.finishing.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(target: "eddy::store", "shutdown initiated");

        let inner = Arc::clone(&self.inner);
        thread::Builder::new()
            .name("eddy-shutdown".to_owned())
            .spawn(move || {
                loop {
                    let idle = inner.pending_actions.lock().is_empty()
                        && inner.pending_events.lock().is_empty()
                        && inner.queue.is_quiescent();
                    if idle {
                        break;
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                thread::sleep(inner.grace_time);

                let workers: Vec<SideEffectRunner> = inner.workers.lock().drain(..).collect();
                for _ in 0..workers.len() {
                    inner.queue.push_sentinel();
                }
                for worker in workers {
                    worker.join();
                }

                inner.listeners.lock().clear();
                inner.handlers.clear();
                inner.action_middlewares.lock().clear();
                inner.event_middlewares.lock().clear();
                inner.finished.store(true, Ordering::SeqCst);

                if let Some(on_finish) = inner.on_finish.lock().take() {
                    on_finish();
                }
                tracing::debug!(target: "eddy::store", "shutdown complete");
            })
            .expect("failed to spawn shutdown waiter thread");
    }
}

fn run_scheduled<S>(inner: &Weak<StoreInner<S>>)
where
    S: Clone + Send + Sync + 'static,
{
    if let Some(inner) = inner.upgrade() {
        let store = Store { inner };
        if let Err(error) = store.run() {
            tracing::error!(target: "eddy::store", %error, "scheduled run failed");
        }
    }
}
