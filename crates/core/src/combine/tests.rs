use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use super::*;
use crate::store::{Store, StoreOptions};
use crate::types::{Action, FinishAction, InitAction};

#[derive(Debug, Clone, PartialEq)]
struct Counter {
    count: i64,
}

impl Snapshot for Counter {
    fn snapshot(&self) -> Result<Value, SnapshotError> {
        Ok(snapshot::record(
            "Counter",
            [("count", self.count.snapshot()?)],
        ))
    }
}

#[derive(Debug)]
struct Bump;

impl Action for Bump {}

#[derive(Debug, Clone, PartialEq)]
struct Bumped;

impl Event for Bumped {}

fn counter(state: Option<&Counter>, action: &dyn Action) -> Result<ReducerResult<Counter>, StoreError> {
    let Some(state) = state else {
        let initial = action
            .downcast_ref::<CombineReducerInitAction>()
            .and_then(|init| init.payload.as_ref())
            .and_then(|payload| payload.downcast_ref::<i64>())
            .copied()
            .unwrap_or(0);
        return Ok(Counter { count: initial }.into());
    };
    if action.is::<Bump>() {
        return Ok(Counter {
            count: state.count + 1,
        }
        .into());
    }
    Ok(state.clone().into())
}

fn chatty_counter(
    state: Option<&Counter>,
    action: &dyn Action,
) -> Result<ReducerResult<Counter>, StoreError> {
    let Some(state) = state else {
        return Ok(Counter { count: 0 }.into());
    };
    if action.is::<Bump>() {
        return Ok(CompleteReducerResult::new(Counter {
            count: state.count + 1,
        })
        .with_event(Bumped)
        .into());
    }
    Ok(state.clone().into())
}

fn initial_state(reducer: &Reducer<CombinedState>) -> CombinedState {
    match reducer(None, &InitAction).unwrap() {
        ReducerResult::Complete(complete) => complete.state,
        ReducerResult::State(state) => state,
    }
}

fn reduce(reducer: &Reducer<CombinedState>, state: &CombinedState, action: &dyn Action) -> CombinedState {
    match reducer(Some(state), action).unwrap() {
        ReducerResult::Complete(complete) => complete.state,
        ReducerResult::State(state) => state,
    }
}

#[test]
fn init_translates_to_per_child_init_actions() {
    let (reducer, id) = combine_reducers(vec![
        ("a".to_owned(), slice_reducer(counter)),
        ("b".to_owned(), slice_reducer(counter)),
    ]);

    let state = initial_state(&reducer);
    assert_eq!(state.id(), id);
    assert_eq!(state.keys().collect::<Vec<_>>(), ["a", "b"]);
    assert_eq!(state.get::<Counter>("a"), Some(&Counter { count: 0 }));
    assert_eq!(state.get::<Counter>("b"), Some(&Counter { count: 0 }));
}

#[test]
fn actions_reach_every_child() {
    let (reducer, _id) = combine_reducers(vec![
        ("a".to_owned(), slice_reducer(counter)),
        ("b".to_owned(), slice_reducer(counter)),
    ]);

    let state = initial_state(&reducer);
    let state = reduce(&reducer, &state, &Bump);
    assert_eq!(state.get::<Counter>("a"), Some(&Counter { count: 1 }));
    assert_eq!(state.get::<Counter>("b"), Some(&Counter { count: 1 }));
}

#[test]
fn register_initializes_only_the_new_child() {
    let (reducer, id) = combine_reducers(vec![("a".to_owned(), slice_reducer(counter))]);

    let state = initial_state(&reducer);
    let state = reduce(&reducer, &state, &Bump);
    assert_eq!(state.get::<Counter>("a"), Some(&Counter { count: 1 }));

    let register = CombineReducerRegisterAction {
        combine_reducers_id: id.clone(),
        key: "c".to_owned(),
        reducer: slice_reducer(counter),
        payload: Some(Arc::new(5_i64)),
    };
    let state = reduce(&reducer, &state, &register);

    assert_eq!(state.keys().collect::<Vec<_>>(), ["a", "c"]);
    // Payload flows into the init action of the new child; `a` is untouched.
    assert_eq!(state.get::<Counter>("c"), Some(&Counter { count: 5 }));
    assert_eq!(state.get::<Counter>("a"), Some(&Counter { count: 1 }));

    // The freshly registered child now receives ordinary actions.
    let state = reduce(&reducer, &state, &Bump);
    assert_eq!(state.get::<Counter>("c"), Some(&Counter { count: 6 }));
}

#[test]
fn unregister_reverts_the_field_set() {
    let (reducer, id) = combine_reducers(vec![
        ("a".to_owned(), slice_reducer(counter)),
        ("b".to_owned(), slice_reducer(counter)),
    ]);

    let state = initial_state(&reducer);
    let state = reduce(&reducer, &state, &Bump);
    let before_keys: Vec<String> = state.keys().map(str::to_owned).collect();

    let register = CombineReducerRegisterAction {
        combine_reducers_id: id.clone(),
        key: "c".to_owned(),
        reducer: slice_reducer(counter),
        payload: None,
    };
    let state = reduce(&reducer, &state, &register);
    assert_eq!(state.len(), 3);

    let unregister = CombineReducerUnregisterAction {
        combine_reducers_id: id.clone(),
        key: "c".to_owned(),
    };
    let state = reduce(&reducer, &state, &unregister);

    assert_eq!(state.keys().map(str::to_owned).collect::<Vec<_>>(), before_keys);
    assert_eq!(state.get::<Counter>("a"), Some(&Counter { count: 1 }));
    assert_eq!(state.get::<Counter>("b"), Some(&Counter { count: 1 }));
}

#[test]
fn actions_for_other_combinators_pass_through() {
    let (reducer, _id) = combine_reducers(vec![("a".to_owned(), slice_reducer(counter))]);

    let state = initial_state(&reducer);
    let register = CombineReducerRegisterAction {
        combine_reducers_id: "someone-else".to_owned(),
        key: "c".to_owned(),
        reducer: slice_reducer(counter),
        payload: None,
    };
    let state = reduce(&reducer, &state, &register);

    assert_eq!(state.keys().collect::<Vec<_>>(), ["a"]);
}

#[test]
fn child_events_are_concatenated_in_child_order() {
    let (reducer, _id) = combine_reducers(vec![
        ("a".to_owned(), slice_reducer(chatty_counter)),
        ("b".to_owned(), slice_reducer(chatty_counter)),
    ]);

    let state = initial_state(&reducer);
    let ReducerResult::Complete(complete) = reducer(Some(&state), &Bump).unwrap() else {
        panic!("combined reducers always return a complete result");
    };

    assert_eq!(complete.events.len(), 2);
    assert!(complete.events.iter().all(|event| event.as_ref().is::<Bumped>()));
}

#[test]
fn combinators_nest() {
    let (inner, _inner_id) = combine_reducers(vec![("x".to_owned(), slice_reducer(counter))]);
    let inner = Arc::new(inner);
    let (outer, _outer_id) = combine_reducers(vec![
        ("plain".to_owned(), slice_reducer(counter)),
        (
            "nested".to_owned(),
            slice_reducer(move |state: Option<&CombinedState>, action: &dyn Action| {
                inner(state, action)
            }),
        ),
    ]);

    let state = initial_state(&outer);
    let nested = state.get::<CombinedState>("nested").unwrap();
    assert_eq!(nested.get::<Counter>("x"), Some(&Counter { count: 0 }));

    let state = reduce(&outer, &state, &Bump);
    let nested = state.get::<CombinedState>("nested").unwrap();
    assert_eq!(nested.get::<Counter>("x"), Some(&Counter { count: 1 }));
}

#[test]
fn combined_state_snapshot_lists_id_then_slices() {
    let (reducer, id) = combine_reducers(vec![
        ("a".to_owned(), slice_reducer(counter)),
        ("b".to_owned(), slice_reducer(counter)),
    ]);

    let state = initial_state(&reducer);
    let value = state.snapshot().unwrap();
    let Value::Object(map) = &value else {
        panic!("expected an object, got {value:?}");
    };

    let keys: Vec<&str> = map.keys().map(String::as_str).collect();
    assert_eq!(keys, ["_type", "combine_reducers_id", "a", "b"]);
    assert_eq!(map["_type"], Value::String("CombinedState".to_owned()));
    assert_eq!(map["combine_reducers_id"], Value::String(id));
    assert_eq!(map["a"]["_type"], Value::String("Counter".to_owned()));
}

#[test]
fn combined_reducer_drives_a_store() {
    let (reducer, id) = combine_reducers(vec![
        ("a".to_owned(), slice_reducer(counter)),
        ("b".to_owned(), slice_reducer(counter)),
    ]);

    let store = Store::new(
        reducer,
        StoreOptions {
            auto_init: true,
            grace_time: Duration::from_millis(10),
            ..StoreOptions::default()
        },
    )
    .unwrap();

    store.dispatch(Bump).unwrap();
    store
        .dispatch(CombineReducerRegisterAction {
            combine_reducers_id: id,
            key: "c".to_owned(),
            reducer: slice_reducer(counter),
            payload: Some(Arc::new(40_i64)),
        })
        .unwrap();
    store.dispatch(Bump).unwrap();

    let state = store.state().unwrap();
    assert_eq!(state.get::<Counter>("a"), Some(&Counter { count: 2 }));
    assert_eq!(state.get::<Counter>("c"), Some(&Counter { count: 41 }));

    store.dispatch(FinishAction).unwrap();
}
