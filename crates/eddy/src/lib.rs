pub use eddy_core::*;

pub mod prelude {
    pub use eddy_core::{
        Action, Autorun, AutorunOptions, Callback, CombineReducerRegisterAction,
        CombineReducerUnregisterAction, CombinedState, CompleteReducerResult, DispatchItem, Event,
        FinishAction, FinishEvent, InitAction, ReducerResult, Snapshot, Store, StoreError,
        StoreOptions, ViewOptions, combine_reducers, slice_reducer,
    };
}
