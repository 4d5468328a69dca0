//! Action, event and reducer primitives.
//!
//! Actions describe an intent to change state, events describe a fact
//! produced by a reducer for asynchronous side effects. Both are plain
//! structs implementing a marker trait; the kind of a dispatched item is
//! discriminated by its runtime type identity, so reducers and handlers
//! match on concrete types via [`downcast_ref`](trait@Action).

use std::any::{Any, TypeId};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::StoreError;

#[cfg(test)]
mod tests;

/// An immutable description of an intent to change state.
///
/// Implement this for every action struct dispatched to a store:
///
/// ```rust
/// use eddy_core::types::Action;
///
/// #[derive(Debug, Clone)]
/// struct Increment;
///
/// impl Action for Increment {}
/// ```
pub trait Action: Any + Send + Sync + fmt::Debug {}

impl dyn Action {
    /// View this action as [`Any`] for downcasting.
    pub fn as_any(&self) -> &dyn Any {
        self
    }

    /// Returns true if the action is of type `T`.
    pub fn is<T: Action>(&self) -> bool {
        self.as_any().is::<T>()
    }

    /// Downcast the action to a concrete type.
    pub fn downcast_ref<T: Action>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

/// An immutable fact produced by a reducer, consumed by event handlers on
/// the side-effect worker pool.
pub trait Event: Any + Send + Sync + fmt::Debug {}

impl dyn Event {
    /// View this event as [`Any`] for downcasting.
    pub fn as_any(&self) -> &dyn Any {
        self
    }

    /// Returns true if the event is of type `T`.
    pub fn is<T: Event>(&self) -> bool {
        self.as_any().is::<T>()
    }

    /// Downcast the event to a concrete type.
    pub fn downcast_ref<T: Event>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Runtime type identity of the concrete event, used to key handler
    /// subscriptions.
    pub fn event_type(&self) -> TypeId {
        self.as_any().type_id()
    }
}

/// The only action accepted by a reducer while the state is unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InitAction;

impl Action for InitAction {}

/// Lifecycle terminator: dispatching this makes the store emit a
/// [`FinishEvent`] once the action queue drains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FinishAction;

impl Action for FinishAction {}

/// Emitted in response to [`FinishAction`]; triggers the graceful shutdown
/// of the side-effect worker pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FinishEvent;

impl Event for FinishEvent {}

/// A reducer result carrying a replacement state together with follow-up
/// actions and events to enqueue, in order.
pub struct CompleteReducerResult<S> {
    /// The replacement state.
    pub state: S,
    /// Actions to enqueue after the state is replaced.
    pub actions: Vec<Box<dyn Action>>,
    /// Events to enqueue after the produced actions.
    pub events: Vec<Arc<dyn Event>>,
}

impl<S> CompleteReducerResult<S> {
    /// A result with no follow-up items.
    pub fn new(state: S) -> Self {
        Self {
            state,
            actions: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Append a follow-up action.
    pub fn with_action(mut self, action: impl Action) -> Self {
        self.actions.push(Box::new(action));
        self
    }

    /// Append a follow-up event.
    pub fn with_event(mut self, event: impl Event) -> Self {
        self.events.push(Arc::new(event));
        self
    }
}

impl<S: fmt::Debug> fmt::Debug for CompleteReducerResult<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompleteReducerResult")
            .field("state", &self.state)
            .field("actions", &self.actions)
            .field("events", &self.events)
            .finish()
    }
}

/// What a reducer returns: either a bare replacement state or a
/// [`CompleteReducerResult`] that also cascades actions and events.
pub enum ReducerResult<S> {
    /// Replace the state, nothing else.
    State(S),
    /// Replace the state and enqueue follow-up items.
    Complete(CompleteReducerResult<S>),
}

impl<S> From<S> for ReducerResult<S> {
    fn from(state: S) -> Self {
        ReducerResult::State(state)
    }
}

impl<S> From<CompleteReducerResult<S>> for ReducerResult<S> {
    fn from(result: CompleteReducerResult<S>) -> Self {
        ReducerResult::Complete(result)
    }
}

/// A pure state transition: `(state | None, action) -> state | complete result`.
///
/// A reducer given `None` state must return
/// [`StoreError::Initialization`] for anything but an init action.
pub type Reducer<S> =
    Box<dyn Fn(Option<&S>, &dyn Action) -> Result<ReducerResult<S>, StoreError> + Send + Sync>;

/// One dispatchable item: an action or an event.
pub enum DispatchItem {
    /// An action for the reducer.
    Action(Box<dyn Action>),
    /// An event for the subscribed handlers.
    Event(Arc<dyn Event>),
}

impl DispatchItem {
    /// Wrap an action.
    pub fn action(action: impl Action) -> Self {
        DispatchItem::Action(Box::new(action))
    }

    /// Wrap an event.
    pub fn event(event: impl Event) -> Self {
        DispatchItem::Event(Arc::new(event))
    }
}

impl fmt::Debug for DispatchItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchItem::Action(action) => f.debug_tuple("Action").field(action).finish(),
            DispatchItem::Event(event) => f.debug_tuple("Event").field(event).finish(),
        }
    }
}

/// A boxed unit future handed to the store's task creator.
pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Creates tasks for futures produced by async autoruns and async event
/// handlers. Typically wraps `tokio::spawn` or an equivalent executor entry
/// point owned by the embedding application.
pub type TaskCreator = Arc<dyn Fn(BoxFuture) + Send + Sync>;

/// Callback handed to a [`Scheduler`].
pub type RunCallback = Box<dyn Fn() + Send + Sync>;

/// External driver for the dispatch loop. Called with the run callback and
/// a flag telling whether the callback should be invoked at intervals
/// (`true`) or once (`false`). When a scheduler is configured the store
/// never drives its own loop from `dispatch`.
pub type Scheduler = Box<dyn Fn(RunCallback, bool) + Send + Sync>;

/// An ordered transform over dispatched actions; returning `None` drops the
/// action and short-circuits the rest of the chain.
pub type ActionMiddleware = Arc<dyn Fn(Box<dyn Action>) -> Option<Box<dyn Action>> + Send + Sync>;

/// An ordered transform over dispatched events; returning `None` drops the
/// event and short-circuits the rest of the chain.
pub type EventMiddleware = Arc<dyn Fn(Arc<dyn Event>) -> Option<Arc<dyn Event>> + Send + Sync>;
