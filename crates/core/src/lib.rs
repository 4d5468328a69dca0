pub mod autorun;
pub mod combine;
pub mod error;
pub mod side_effect;
pub mod snapshot;
pub mod store;
pub mod subscription;
pub mod types;
pub mod view;

// Re-export the items that make up the everyday API surface.
pub use autorun::{Autorun, AutorunOptions, AutorunSubscribeOptions, AwaitOnce};
pub use combine::{
    CombineReducerInitAction, CombineReducerRegisterAction, CombineReducerUnregisterAction,
    CombinedState, SliceReducer, SliceReducerResult, StateSlice, combine_reducers, slice_reducer,
};
pub use error::{SnapshotError, StoreError};
pub use side_effect::{
    EventHandler, EventSubscription, EventSubscriptionOptions, IntoEventHandler,
};
pub use snapshot::Snapshot;
pub use store::{MiddlewareId, Store, StoreOptions};
pub use subscription::{Callback, SubscriptionOptions, Unsubscribe, WeakCallback};
pub use types::{
    Action, ActionMiddleware, BoxFuture, CompleteReducerResult, DispatchItem, Event,
    EventMiddleware, FinishAction, FinishEvent, InitAction, Reducer, ReducerResult, RunCallback,
    Scheduler, TaskCreator,
};
pub use view::{ViewOptions, WithState};
