//! The side-effect runner pool.
//!
//! Event handlers never run on the dispatch thread. The dispatch loop pushes
//! `(handler, event)` pairs onto one shared channel and a fixed pool of
//! worker threads drains it, isolating user effect code from the loop's
//! timing guarantees. A `None` message is the shutdown sentinel; one is sent
//! per worker for a clean drain.

use std::any::TypeId;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};
use dashmap::DashMap;

use crate::subscription::Unsubscribe;
use crate::types::{BoxFuture, Event, TaskCreator};


type HandlerFn = dyn Fn(&Arc<dyn Event>) -> Option<BoxFuture> + Send + Sync;

/// A type-erased event handler.
///
/// Built from plain functions through [`IntoEventHandler`]; the handler's
/// shape (whether it receives the event, and whether it is async) is
/// captured at the subscription call.
pub struct EventHandler {
    inner: Arc<HandlerFn>,
}

impl EventHandler {
    fn new<F>(func: F) -> Self
    where
        F: Fn(&Arc<dyn Event>) -> Option<BoxFuture> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(func),
        }
    }

    /// Invoke the handler; an async handler returns its future instead of
    /// running it.
    pub(crate) fn call(&self, event: &Arc<dyn Event>) -> Option<BoxFuture> {
        (self.inner)(event)
    }

    pub(crate) fn downgrade(&self) -> WeakEventHandler {
        WeakEventHandler {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl Clone for EventHandler {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl std::fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandler")
            .field("handler", &"<function>")
            .finish()
    }
}

/// A weak handle to an [`EventHandler`].
pub(crate) struct WeakEventHandler {
    inner: Weak<HandlerFn>,
}

impl WeakEventHandler {
    fn upgrade(&self) -> Option<EventHandler> {
        self.inner.upgrade().map(|inner| EventHandler { inner })
    }
}

impl Clone for WeakEventHandler {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Strong-or-weak storage for a subscribed handler.
pub(crate) enum HandlerRef {
    Strong(EventHandler),
    Weak(WeakEventHandler),
}

impl HandlerRef {
    pub(crate) fn get(&self) -> Option<EventHandler> {
        match self {
            HandlerRef::Strong(handler) => Some(handler.clone()),
            HandlerRef::Weak(weak) => weak.upgrade(),
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        match self {
            HandlerRef::Strong(_) => true,
            HandlerRef::Weak(weak) => weak.inner.strong_count() > 0,
        }
    }
}

impl Clone for HandlerRef {
    fn clone(&self) -> Self {
        match self {
            HandlerRef::Strong(handler) => HandlerRef::Strong(handler.clone()),
            HandlerRef::Weak(weak) => HandlerRef::Weak(weak.clone()),
        }
    }
}

/// Marker types that let [`IntoEventHandler`] distinguish the accepted
/// handler shapes without overlapping impls.
pub mod markers {
    use std::marker::PhantomData;

    /// `Fn(&E)`.
    pub struct ByRef;
    /// `Fn()`.
    pub struct NoArgs;
    /// `Fn(&E) -> impl Future<Output = ()>`.
    pub struct AsyncByRef<Fut>(PhantomData<Fut>);
    /// `Fn() -> impl Future<Output = ()>`.
    pub struct AsyncNoArgs<Fut>(PhantomData<Fut>);
}

/// Conversion of a plain function into a type-erased [`EventHandler`].
///
/// Four shapes are accepted: taking the event or nothing, each either
/// synchronous or returning a future. Futures are handed to the store's
/// task creator by the worker that picks the handler up.
pub trait IntoEventHandler<E: Event, Marker> {
    /// Perform the conversion.
    fn into_event_handler(self) -> EventHandler;
}

impl<E, F> IntoEventHandler<E, markers::ByRef> for F
where
    E: Event,
    F: Fn(&E) + Send + Sync + 'static,
{
    fn into_event_handler(self) -> EventHandler {
        EventHandler::new(move |event| {
            if let Some(event) = event.as_ref().downcast_ref::<E>() {
                self(event);
            }
            None
        })
    }
}

impl<E, F> IntoEventHandler<E, markers::NoArgs> for F
where
    E: Event,
    F: Fn() + Send + Sync + 'static,
{
    fn into_event_handler(self) -> EventHandler {
        EventHandler::new(move |_event| {
            self();
            None
        })
    }
}

impl<E, F, Fut> IntoEventHandler<E, markers::AsyncByRef<Fut>> for F
where
    E: Event,
    F: Fn(&E) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn into_event_handler(self) -> EventHandler {
        EventHandler::new(move |event| {
            event
                .as_ref()
                .downcast_ref::<E>()
                .map(|event| Box::pin(self(event)) as BoxFuture)
        })
    }
}

impl<E, F, Fut> IntoEventHandler<E, markers::AsyncNoArgs<Fut>> for F
where
    E: Event,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn into_event_handler(self) -> EventHandler {
        EventHandler::new(move |_event| Some(Box::pin(self()) as BoxFuture))
    }
}

/// Options for an event-handler subscription.
#[derive(Debug, Clone, Copy)]
pub struct EventSubscriptionOptions {
    /// Keep a strong reference to the handler. With `false` the handler
    /// lives only as long as the returned [`EventSubscription`] (or another
    /// clone of the handler) does.
    pub keep_ref: bool,
}

impl Default for EventSubscriptionOptions {
    fn default() -> Self {
        Self { keep_ref: true }
    }
}

/// Handle to an event-handler subscription.
///
/// Carries the erased handler itself, so a weakly registered handler cannot
/// die before unsubscription completes.
#[derive(Debug)]
pub struct EventSubscription {
    handler: EventHandler,
    unsubscribe: Unsubscribe,
}

impl EventSubscription {
    pub(crate) fn new(handler: EventHandler, unsubscribe: Unsubscribe) -> Self {
        Self {
            handler,
            unsubscribe,
        }
    }

    /// Remove the handler from the store. Idempotent.
    pub fn unsubscribe(&self) {
        self.unsubscribe.call();
    }

    /// The handler this subscription keeps alive.
    pub fn handler(&self) -> &EventHandler {
        &self.handler
    }
}

pub(crate) struct HandlerEntry {
    pub(crate) id: u64,
    pub(crate) handler: HandlerRef,
}

/// Event-type-keyed handler registry. Concurrent so that unsubscription and
/// dead-handler pruning never contend for the dispatch lock.
pub(crate) type HandlerRegistry = DashMap<TypeId, Vec<HandlerEntry>>;

pub(crate) type SideEffectTask = (HandlerRef, Arc<dyn Event>);

/// The shared channel between the dispatch loop and the worker pool.
///
/// `outstanding` counts pushed-but-unfinished tasks, so quiescence means
/// "nothing queued and nothing executing" - the worker decrements it at the
/// end of every iteration, even when the handler panicked.
pub(crate) struct SideEffectQueue {
    sender: Sender<Option<SideEffectTask>>,
    receiver: Receiver<Option<SideEffectTask>>,
    outstanding: Arc<AtomicUsize>,
}

impl SideEffectQueue {
    pub(crate) fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self {
            sender,
            receiver,
            outstanding: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn push(&self, task: SideEffectTask) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        // The channel is unbounded and the receiver lives as long as the
        // queue, so send only fails after the store is torn down.
        if self.sender.send(Some(task)).is_err() {
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
        }
    }

    pub(crate) fn push_sentinel(&self) {
        let _ = self.sender.send(None);
    }

    pub(crate) fn receiver(&self) -> Receiver<Option<SideEffectTask>> {
        self.receiver.clone()
    }

    pub(crate) fn outstanding_counter(&self) -> Arc<AtomicUsize> {
        self.outstanding.clone()
    }

    pub(crate) fn is_quiescent(&self) -> bool {
        self.outstanding.load(Ordering::SeqCst) == 0
    }
}

/// One worker thread of the side-effect pool.
pub(crate) struct SideEffectRunner {
    handle: JoinHandle<()>,
}

impl SideEffectRunner {
    pub(crate) fn spawn(
        index: usize,
        receiver: Receiver<Option<SideEffectTask>>,
        outstanding: Arc<AtomicUsize>,
        create_task: Option<TaskCreator>,
    ) -> Self {
        let handle = thread::Builder::new()
            .name(format!("eddy-side-effect-{index}"))
            .spawn(move || {
                loop {
                    let Ok(message) = receiver.recv() else { break };
                    let Some((handler, event)) = message else { break };
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                        Self::run_task(&handler, &event, create_task.as_ref());
                    }));
                    if outcome.is_err() {
                        tracing::error!(
                            target: "eddy::side_effect",
                            event = ?event,
                            "event handler panicked"
                        );
                    }
                    outstanding.fetch_sub(1, Ordering::SeqCst);
                }
                tracing::trace!(target: "eddy::side_effect", index, "worker exited");
            })
            .expect("failed to spawn side-effect worker thread");
        Self { handle }
    }

    fn run_task(handler: &HandlerRef, event: &Arc<dyn Event>, create_task: Option<&TaskCreator>) {
        // A weakly stored handler whose referent died is skipped silently.
        let Some(handler) = handler.get() else {
            return;
        };
        if let Some(future) = handler.call(event) {
            match create_task {
                Some(create) => create(future),
                None => tracing::warn!(
                    target: "eddy::side_effect",
                    event = ?event,
                    "async event handler result dropped, no task creator is configured"
                ),
            }
        }
    }

    pub(crate) fn join(self) {
        if self.handle.join().is_err() {
            tracing::error!(target: "eddy::side_effect", "worker thread terminated abnormally");
        }
    }
}
