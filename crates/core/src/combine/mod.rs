//! Dynamic composition of child reducers.
//!
//! [`combine_reducers`] builds a reducer over a [`CombinedState`]: an
//! ordered `key -> slice` mapping tagged with a stable, process-unique id.
//! The child set can be mutated at runtime by dispatching
//! [`CombineReducerRegisterAction`] / [`CombineReducerUnregisterAction`]
//! carrying that id, so several combinators can coexist in one store.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{SnapshotError, StoreError};
use crate::snapshot::{self, Snapshot};
use crate::types::{Action, CompleteReducerResult, Event, InitAction, Reducer, ReducerResult};

#[cfg(test)]
mod tests;

/// A child state stored inside a [`CombinedState`].
///
/// Implemented automatically for every `Clone + PartialEq + Debug +
/// Snapshot` type, including `CombinedState` itself, so combinators nest.
pub trait StateSlice: Any + Send + Sync + fmt::Debug {
    /// Clone behind the trait object.
    fn clone_slice(&self) -> Box<dyn StateSlice>;

    /// Structural equality behind the trait object.
    fn slice_eq(&self, other: &dyn StateSlice) -> bool;

    /// Serialize behind the trait object.
    fn snapshot_slice(&self) -> Result<Value, SnapshotError>;
}

impl dyn StateSlice {
    /// View this slice as [`Any`] for downcasting.
    pub fn as_any(&self) -> &dyn Any {
        self
    }

    /// Downcast the slice to a concrete type.
    pub fn downcast_ref<T: StateSlice + Sized>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

impl<T> StateSlice for T
where
    T: Any + Clone + PartialEq + fmt::Debug + Snapshot + Send + Sync,
{
    fn clone_slice(&self) -> Box<dyn StateSlice> {
        Box::new(self.clone())
    }

    fn slice_eq(&self, other: &dyn StateSlice) -> bool {
        other.as_any().downcast_ref::<T>() == Some(self)
    }

    fn snapshot_slice(&self) -> Result<Value, SnapshotError> {
        self.snapshot()
    }
}

/// The state of a combining reducer: a stable identity tag plus an ordered
/// `key -> slice` mapping. The key set always equals the registered child
/// set.
pub struct CombinedState {
    combine_reducers_id: String,
    slices: Vec<(String, Box<dyn StateSlice>)>,
}

impl CombinedState {
    /// The id tying register/unregister actions to this combinator.
    pub fn id(&self) -> &str {
        &self.combine_reducers_id
    }

    /// Child keys in registration order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.slices.iter().map(|(key, _)| key.as_str())
    }

    /// The slice stored under `key`.
    pub fn slice(&self, key: &str) -> Option<&dyn StateSlice> {
        self.slices
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, slice)| slice.as_ref())
    }

    /// Typed read view over a slice.
    pub fn get<T: StateSlice + Sized>(&self, key: &str) -> Option<&T> {
        self.slice(key).and_then(|slice| slice.downcast_ref::<T>())
    }

    /// Number of registered children.
    pub fn len(&self) -> usize {
        self.slices.len()
    }

    /// Whether no children are registered.
    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }
}

impl Clone for CombinedState {
    fn clone(&self) -> Self {
        Self {
            combine_reducers_id: self.combine_reducers_id.clone(),
            slices: self
                .slices
                .iter()
                .map(|(key, slice)| (key.clone(), slice.clone_slice()))
                .collect(),
        }
    }
}

impl PartialEq for CombinedState {
    fn eq(&self, other: &Self) -> bool {
        self.combine_reducers_id == other.combine_reducers_id
            && self.slices.len() == other.slices.len()
            && self
                .slices
                .iter()
                .zip(other.slices.iter())
                .all(|((key, slice), (other_key, other_slice))| {
                    key == other_key && slice.slice_eq(other_slice.as_ref())
                })
    }
}

impl fmt::Debug for CombinedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        map.entry(&"combine_reducers_id", &self.combine_reducers_id);
        for (key, slice) in &self.slices {
            map.entry(key, slice);
        }
        map.finish()
    }
}

impl Snapshot for CombinedState {
    fn snapshot(&self) -> Result<Value, SnapshotError> {
        let mut fields = Vec::with_capacity(self.slices.len() + 1);
        fields.push((
            "combine_reducers_id",
            Value::String(self.combine_reducers_id.clone()),
        ));
        for (key, slice) in &self.slices {
            fields.push((key.as_str(), slice.snapshot_slice()?));
        }
        Ok(snapshot::record("CombinedState", fields))
    }
}

/// Result of one child reducer call, with the slice behind a trait object.
pub struct SliceReducerResult {
    /// The replacement slice.
    pub state: Box<dyn StateSlice>,
    /// Actions produced by the child.
    pub actions: Vec<Box<dyn Action>>,
    /// Events produced by the child.
    pub events: Vec<Arc<dyn Event>>,
}

/// A child reducer operating on an erased slice.
pub type SliceReducer = Arc<
    dyn Fn(Option<&dyn StateSlice>, &dyn Action) -> Result<SliceReducerResult, StoreError>
        + Send
        + Sync,
>;

/// Adapt a typed reducer over `T` into a [`SliceReducer`].
pub fn slice_reducer<T, F>(reducer: F) -> SliceReducer
where
    T: StateSlice + Sized,
    F: Fn(Option<&T>, &dyn Action) -> Result<ReducerResult<T>, StoreError> + Send + Sync + 'static,
{
    Arc::new(move |slice, action| {
        let typed = slice.map(|slice| {
            slice
                .downcast_ref::<T>()
                .expect("combined slice type mismatch")
        });
        let result = reducer(typed, action)?;
        Ok(match result {
            ReducerResult::State(state) => SliceReducerResult {
                state: Box::new(state),
                actions: Vec::new(),
                events: Vec::new(),
            },
            ReducerResult::Complete(complete) => SliceReducerResult {
                state: Box::new(complete.state),
                actions: complete.actions,
                events: complete.events,
            },
        })
    })
}

type CombinePayload = Option<Arc<dyn Any + Send + Sync>>;

/// The init action a combinator hands to each child in place of a plain
/// [`InitAction`], so children can tell which key (and with which payload)
/// they are being initialized under.
#[derive(Clone)]
pub struct CombineReducerInitAction {
    /// Id of the combinator performing the initialization.
    pub combine_reducers_id: String,
    /// Key the child is registered under.
    pub key: String,
    /// Payload forwarded from a register action, if any.
    pub payload: CombinePayload,
}

impl fmt::Debug for CombineReducerInitAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CombineReducerInitAction")
            .field("combine_reducers_id", &self.combine_reducers_id)
            .field("key", &self.key)
            .field("payload", &self.payload.as_ref().map(|_| "<payload>"))
            .finish()
    }
}

impl Action for CombineReducerInitAction {}

/// Register a new child reducer under `key` on the combinator identified by
/// `combine_reducers_id`. The new slice is initialized by calling the child
/// with no state and a [`CombineReducerInitAction`] carrying `payload`; all
/// other slices are left untouched.
#[derive(Clone)]
pub struct CombineReducerRegisterAction {
    /// Id of the target combinator.
    pub combine_reducers_id: String,
    /// Key to register the child under.
    pub key: String,
    /// The child reducer.
    pub reducer: SliceReducer,
    /// Payload made available to the child's init call.
    pub payload: CombinePayload,
}

impl fmt::Debug for CombineReducerRegisterAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CombineReducerRegisterAction")
            .field("combine_reducers_id", &self.combine_reducers_id)
            .field("key", &self.key)
            .finish()
    }
}

impl Action for CombineReducerRegisterAction {}

/// Remove the child registered under `key` from the combinator identified
/// by `combine_reducers_id`; all other slices are left untouched.
#[derive(Debug, Clone)]
pub struct CombineReducerUnregisterAction {
    /// Id of the target combinator.
    pub combine_reducers_id: String,
    /// Key to remove.
    pub key: String,
}

impl Action for CombineReducerUnregisterAction {}

fn is_init_action(action: &dyn Action) -> bool {
    action.is::<InitAction>() || action.is::<CombineReducerInitAction>()
}

/// Build a combining reducer from an ordered child set.
///
/// Returns the reducer together with its process-unique id; dispatch
/// register/unregister actions carrying that id to mutate the child set at
/// runtime.
///
/// ```rust
/// use eddy_core::combine::{combine_reducers, slice_reducer};
/// # use eddy_core::error::StoreError;
/// # use eddy_core::snapshot::{self, Snapshot};
/// # use eddy_core::types::{Action, InitAction, ReducerResult};
/// # #[derive(Debug, Clone, PartialEq)]
/// # struct Counter { count: i64 }
/// # impl Snapshot for Counter {
/// #     fn snapshot(&self) -> Result<serde_json::Value, eddy_core::error::SnapshotError> {
/// #         Ok(snapshot::record("Counter", [("count", self.count.snapshot()?)]))
/// #     }
/// # }
/// # fn counter(state: Option<&Counter>, _action: &dyn Action) -> Result<ReducerResult<Counter>, StoreError> {
/// #     Ok(ReducerResult::State(state.cloned().unwrap_or(Counter { count: 0 })))
/// # }
/// let (reducer, id) = combine_reducers(vec![
///     ("a".to_owned(), slice_reducer(counter)),
///     ("b".to_owned(), slice_reducer(counter)),
/// ]);
/// let state = match reducer(None, &InitAction)? {
///     ReducerResult::Complete(complete) => complete.state,
///     ReducerResult::State(state) => state,
/// };
/// assert_eq!(state.keys().collect::<Vec<_>>(), ["a", "b"]);
/// assert_eq!(state.id(), id);
/// # Ok::<(), StoreError>(())
/// ```
pub fn combine_reducers(children: Vec<(String, SliceReducer)>) -> (Reducer<CombinedState>, String) {
    let id = Uuid::new_v4().simple().to_string();
    let reducer_id = id.clone();
    let children = Mutex::new(children);

    let reducer: Reducer<CombinedState> = Box::new(move |state: Option<&CombinedState>,
                                                         action: &dyn Action| {
        if let Some(register) = action.downcast_ref::<CombineReducerRegisterAction>()
            && register.combine_reducers_id == reducer_id
        {
            let init = CombineReducerInitAction {
                combine_reducers_id: reducer_id.clone(),
                key: register.key.clone(),
                payload: register.payload.clone(),
            };
            let result = (register.reducer)(None, &init)?;

            let mut slices = state.map(clone_slices).unwrap_or_default();
            replace_or_push(&mut slices, &register.key, result.state);
            let mut children = children.lock();
            children.retain(|(key, _)| key != &register.key);
            children.push((register.key.clone(), register.reducer.clone()));
            drop(children);

            return Ok(ReducerResult::Complete(CompleteReducerResult {
                state: CombinedState {
                    combine_reducers_id: reducer_id.clone(),
                    slices,
                },
                actions: result.actions,
                events: result.events,
            }));
        }

        if let Some(unregister) = action.downcast_ref::<CombineReducerUnregisterAction>()
            && unregister.combine_reducers_id == reducer_id
        {
            children.lock().retain(|(key, _)| key != &unregister.key);
            let mut slices = state.map(clone_slices).unwrap_or_default();
            slices.retain(|(key, _)| key != &unregister.key);

            return Ok(ReducerResult::Complete(CompleteReducerResult::new(
                CombinedState {
                    combine_reducers_id: reducer_id.clone(),
                    slices,
                },
            )));
        }

        // Snapshot the child set so a child reducer can never observe the
        // combinator's lock held.
        let children: Vec<(String, SliceReducer)> = children.lock().clone();
        let mut slices = Vec::with_capacity(children.len());
        let mut actions = Vec::new();
        let mut events = Vec::new();

        for (key, child) in &children {
            let slice = state.and_then(|state| state.slice(key));
            let result = if is_init_action(action) {
                let init = CombineReducerInitAction {
                    combine_reducers_id: reducer_id.clone(),
                    key: key.clone(),
                    payload: None,
                };
                child(slice, &init)?
            } else {
                child(slice, action)?
            };
            slices.push((key.clone(), result.state));
            actions.extend(result.actions);
            events.extend(result.events);
        }

        Ok(ReducerResult::Complete(CompleteReducerResult {
            state: CombinedState {
                combine_reducers_id: reducer_id.clone(),
                slices,
            },
            actions,
            events,
        }))
    });

    (reducer, id)
}

fn clone_slices(state: &CombinedState) -> Vec<(String, Box<dyn StateSlice>)> {
    state
        .slices
        .iter()
        .map(|(key, slice)| (key.clone(), slice.clone_slice()))
        .collect()
}

fn replace_or_push(
    slices: &mut Vec<(String, Box<dyn StateSlice>)>,
    key: &str,
    slice: Box<dyn StateSlice>,
) {
    match slices.iter_mut().find(|(name, _)| name == key) {
        Some((_, existing)) => *existing = slice,
        None => slices.push((key.to_owned(), slice)),
    }
}
