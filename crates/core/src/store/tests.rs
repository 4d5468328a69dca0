use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::json;

use super::*;
use crate::error::SnapshotError;
use crate::snapshot;
use crate::types::{CompleteReducerResult, RunCallback};

#[derive(Debug, Clone, PartialEq)]
struct CounterState {
    value: i64,
}

impl Snapshot for CounterState {
    fn snapshot(&self) -> Result<serde_json::Value, SnapshotError> {
        Ok(snapshot::record(
            "CounterState",
            [("value", self.value.snapshot()?)],
        ))
    }
}

#[derive(Debug)]
struct Increment;
impl Action for Increment {}

#[derive(Debug)]
struct IncrementByTwo;
impl Action for IncrementByTwo {}

#[derive(Debug)]
struct SetValue(i64);
impl Action for SetValue {}

#[derive(Debug)]
struct Cascade;
impl Action for Cascade {}

#[derive(Debug)]
struct EmitValue;
impl Action for EmitValue {}

#[derive(Debug, Clone, PartialEq)]
struct ValueEvent {
    value: i64,
}
impl Event for ValueEvent {}

fn reducer(
    state: Option<&CounterState>,
    action: &dyn Action,
) -> Result<ReducerResult<CounterState>, StoreError> {
    let Some(state) = state else {
        if action.is::<InitAction>() {
            return Ok(CounterState { value: 0 }.into());
        }
        return Err(StoreError::initialization(action));
    };
    if action.is::<Increment>() {
        return Ok(CounterState {
            value: state.value + 1,
        }
        .into());
    }
    if action.is::<IncrementByTwo>() {
        return Ok(CounterState {
            value: state.value + 2,
        }
        .into());
    }
    if let Some(SetValue(value)) = action.downcast_ref::<SetValue>() {
        return Ok(CounterState { value: *value }.into());
    }
    if action.is::<Cascade>() {
        return Ok(CompleteReducerResult::new(state.clone())
            .with_action(Increment)
            .with_action(Increment)
            .into());
    }
    if action.is::<EmitValue>() {
        return Ok(CompleteReducerResult::new(state.clone())
            .with_event(ValueEvent { value: state.value })
            .into());
    }
    Ok(state.clone().into())
}

fn options() -> StoreOptions {
    StoreOptions {
        auto_init: true,
        grace_time: Duration::from_millis(10),
        ..StoreOptions::default()
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn test_store() -> Store<CounterState> {
    init_tracing();
    Store::new(reducer, options()).unwrap()
}

/// Dispatch a `FinishAction` and block until `on_finish` would have fired.
fn finish(store: &Store<CounterState>) {
    let (sender, receiver) = mpsc::channel();
    let _subscription = store.subscribe_event::<FinishEvent, _, _>(move || {
        let _ = sender.send(());
    });
    store.dispatch(FinishAction).unwrap();
    receiver
        .recv_timeout(Duration::from_secs(5))
        .expect("finish event never reached its handler");
    while !store.inner.finished.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn dispatch_applies_the_reducer() {
    let store = test_store();

    store.dispatch(Increment).unwrap();
    store.dispatch(IncrementByTwo).unwrap();
    assert_eq!(store.state(), Some(CounterState { value: 3 }));

    finish(&store);
}

#[test]
fn non_init_action_against_unset_state_is_rejected() {
    let store: Store<CounterState> = Store::new(reducer, StoreOptions::default()).unwrap();

    assert!(store.state().is_none());
    assert!(matches!(
        store.dispatch(Increment),
        Err(StoreError::Initialization { .. })
    ));
}

#[test]
fn listeners_observe_every_state_replacement_in_order() {
    let store = test_store();
    let seen = Arc::new(StdMutex::new(Vec::new()));
    let seen_clone = seen.clone();
    let _unsubscribe = store.subscribe(move |state: &CounterState| {
        seen_clone.lock().unwrap().push(state.value);
    });

    store.dispatch(Increment).unwrap();
    store.dispatch(Increment).unwrap();
    store.dispatch(Increment).unwrap();
    assert_eq!(*seen.lock().unwrap(), [1, 2, 3]);

    finish(&store);
}

#[test]
fn cascaded_actions_run_after_already_queued_ones() {
    let store = test_store();
    let seen = Arc::new(StdMutex::new(Vec::new()));
    let seen_clone = seen.clone();
    let _unsubscribe = store.subscribe(move |state: &CounterState| {
        seen_clone.lock().unwrap().push(state.value);
    });

    store
        .dispatch_all(vec![
            DispatchItem::action(Cascade),
            DispatchItem::action(Increment),
        ])
        .unwrap();

    // Cascade leaves the state untouched, then the queued increment runs,
    // then the two increments the cascade produced.
    assert_eq!(*seen.lock().unwrap(), [0, 1, 2, 3]);
    assert_eq!(store.state(), Some(CounterState { value: 3 }));

    finish(&store);
}

#[test]
fn dispatch_from_a_listener_enqueues_instead_of_recursing() {
    let store = test_store();
    let nested = store.clone();
    let seen = Arc::new(StdMutex::new(Vec::new()));
    let seen_clone = seen.clone();
    let _unsubscribe = store.subscribe(move |state: &CounterState| {
        seen_clone.lock().unwrap().push(state.value);
        if state.value == 1 {
            nested.dispatch(IncrementByTwo).unwrap();
        }
    });

    store.dispatch(Increment).unwrap();
    assert_eq!(*seen.lock().unwrap(), [1, 3]);

    finish(&store);
}

#[test]
fn dispatch_with_reads_the_current_state() {
    let store = test_store();

    store
        .dispatch_with(|state| {
            let value = state.map_or(0, |state| state.value);
            vec![DispatchItem::action(SetValue(value + 10))]
        })
        .unwrap();
    assert_eq!(store.state(), Some(CounterState { value: 10 }));

    finish(&store);
}

#[test]
fn action_middlewares_compose_in_registration_order() {
    let store = test_store();

    store.register_action_middleware(|action| -> Option<Box<dyn Action>> {
        match action.downcast_ref::<SetValue>() {
            Some(SetValue(value)) => Some(Box::new(SetValue(value * 2))),
            None => Some(action),
        }
    });
    store.register_action_middleware(|action| -> Option<Box<dyn Action>> {
        match action.downcast_ref::<SetValue>() {
            Some(SetValue(value)) => Some(Box::new(SetValue(value + 1))),
            None => Some(action),
        }
    });
    store.register_action_middleware(|action| -> Option<Box<dyn Action>> {
        match action.downcast_ref::<SetValue>() {
            Some(SetValue(value)) => Some(Box::new(SetValue(value * 10))),
            None => Some(action),
        }
    });

    store.dispatch(SetValue(1)).unwrap();
    assert_eq!(store.state(), Some(CounterState { value: 30 }));

    finish(&store);
}

#[test]
fn middleware_returning_none_drops_the_action() {
    let store = test_store();
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = calls.clone();

    store.register_action_middleware(move |action| {
        if action.is::<Increment>() && calls_clone.fetch_add(1, Ordering::SeqCst) == 0 {
            return None;
        }
        Some(action)
    });

    store.dispatch(Increment).unwrap();
    store.dispatch(Increment).unwrap();
    assert_eq!(store.state(), Some(CounterState { value: 1 }));

    finish(&store);
}

#[test]
fn unregistered_middleware_no_longer_runs() {
    let store = test_store();

    let id = store.register_action_middleware(|action| -> Option<Box<dyn Action>> {
        if action.is::<Increment>() {
            Some(Box::new(IncrementByTwo))
        } else {
            Some(action)
        }
    });

    store.dispatch(Increment).unwrap();
    assert_eq!(store.state(), Some(CounterState { value: 2 }));

    assert!(store.unregister_action_middleware(id));
    assert!(!store.unregister_action_middleware(id));

    store.dispatch(Increment).unwrap();
    assert_eq!(store.state(), Some(CounterState { value: 3 }));

    finish(&store);
}

#[test]
fn event_middleware_can_drop_events() {
    let store = test_store();
    let handled = Arc::new(AtomicUsize::new(0));
    let handled_clone = handled.clone();
    let _subscription = store.subscribe_event(move |_event: &ValueEvent| {
        handled_clone.fetch_add(1, Ordering::SeqCst);
    });

    store.register_event_middleware(|event| {
        if event.as_ref().is::<ValueEvent>() {
            None
        } else {
            Some(event)
        }
    });

    store.dispatch(EmitValue).unwrap();
    finish(&store);
    assert_eq!(handled.load(Ordering::SeqCst), 0);
}

#[test]
fn events_reach_handlers_in_production_order() {
    let store = test_store();
    let seen = Arc::new(StdMutex::new(Vec::new()));
    let seen_clone = seen.clone();
    let _subscription = store.subscribe_event(move |event: &ValueEvent| {
        seen_clone.lock().unwrap().push(event.value);
    });

    store
        .dispatch_all(vec![
            DispatchItem::action(Increment),
            DispatchItem::action(EmitValue),
            DispatchItem::action(Increment),
            DispatchItem::action(EmitValue),
        ])
        .unwrap();

    finish(&store);
    assert_eq!(*seen.lock().unwrap(), [1, 2]);
}

#[test]
fn zero_parameter_handlers_are_supported() {
    let store = test_store();
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = calls.clone();
    let _subscription = store.subscribe_event::<ValueEvent, _, _>(move || {
        calls_clone.fetch_add(1, Ordering::SeqCst);
    });

    store.dispatch(EmitValue).unwrap();
    finish(&store);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn weak_listener_is_pruned_after_it_dies() {
    let store = test_store();
    let seen = Arc::new(StdMutex::new(Vec::new()));
    let seen_clone = seen.clone();
    let callback = Callback::new(move |state: &CounterState| {
        seen_clone.lock().unwrap().push(state.value);
    });
    let _unsubscribe = store.subscribe_with(&callback, SubscriptionOptions { keep_ref: false });

    store.dispatch(Increment).unwrap();
    assert_eq!(*seen.lock().unwrap(), [1]);

    drop(callback);
    store.dispatch(Increment).unwrap();
    assert_eq!(*seen.lock().unwrap(), [1]);
    assert!(store.inner.listeners.lock().is_empty());

    finish(&store);
}

#[test]
fn unsubscribed_listener_stops_observing() {
    let store = test_store();
    let seen = Arc::new(StdMutex::new(Vec::new()));
    let seen_clone = seen.clone();
    let unsubscribe = store.subscribe(move |state: &CounterState| {
        seen_clone.lock().unwrap().push(state.value);
    });

    store.dispatch(Increment).unwrap();
    unsubscribe.call();
    store.dispatch(Increment).unwrap();
    assert_eq!(*seen.lock().unwrap(), [1]);

    finish(&store);
}

#[test]
fn finish_quiesces_the_store_exactly_once() {
    let (finish_sender, finish_receiver) = mpsc::channel();
    let handled = Arc::new(AtomicUsize::new(0));
    let handled_clone = handled.clone();

    let store = Store::new(
        reducer,
        StoreOptions {
            auto_init: true,
            side_effect_threads: 2,
            grace_time: Duration::from_millis(10),
            on_finish: Some(Box::new(move || {
                let _ = finish_sender.send(());
            })),
            ..StoreOptions::default()
        },
    )
    .unwrap();

    let _subscription = store.subscribe_event::<FinishEvent, _, _>(move || {
        handled_clone.fetch_add(1, Ordering::SeqCst);
    });
    let _listener = store.subscribe(|_state: &CounterState| {});

    store.dispatch(FinishAction).unwrap();

    finish_receiver
        .recv_timeout(Duration::from_secs(5))
        .expect("on_finish never fired");
    assert!(
        finish_receiver
            .recv_timeout(Duration::from_millis(100))
            .is_err(),
        "on_finish fired more than once"
    );

    assert_eq!(handled.load(Ordering::SeqCst), 1);
    assert!(store.inner.listeners.lock().is_empty());
    assert!(store.inner.handlers.is_empty());
    assert!(store.inner.workers.lock().is_empty());
    assert!(matches!(store.dispatch(Increment), Err(StoreError::Finished)));
}

#[test]
fn scheduler_owns_the_run_loop() {
    let callbacks: Arc<StdMutex<Vec<RunCallback>>> = Arc::new(StdMutex::new(Vec::new()));
    let callbacks_clone = callbacks.clone();
    let scheduler: Scheduler = Box::new(move |callback, _interval| {
        callbacks_clone.lock().unwrap().push(callback);
    });

    let store: Store<CounterState> = Store::new(
        reducer,
        StoreOptions {
            auto_init: true,
            scheduler: Some(scheduler),
            grace_time: Duration::from_millis(10),
            ..StoreOptions::default()
        },
    )
    .unwrap();

    // One callback for the auto init, one for the interval run loop.
    assert_eq!(callbacks.lock().unwrap().len(), 2);
    assert!(store.state().is_none());

    callbacks.lock().unwrap()[0]();
    assert!(store.state().is_none(), "dispatch must only enqueue");

    callbacks.lock().unwrap()[1]();
    assert_eq!(store.state(), Some(CounterState { value: 0 }));

    store.dispatch(Increment).unwrap();
    assert_eq!(store.state(), Some(CounterState { value: 0 }));

    callbacks.lock().unwrap()[1]();
    assert_eq!(store.state(), Some(CounterState { value: 1 }));
}

#[test]
fn snapshot_serializes_the_current_state() {
    let store = test_store();

    store.dispatch(Increment).unwrap();
    assert_eq!(
        store.snapshot().unwrap(),
        json!({"_type": "CounterState", "value": 1})
    );

    finish(&store);
}

#[test]
fn snapshot_of_an_uninitialized_store_is_null() {
    let store: Store<CounterState> = Store::new(reducer, StoreOptions::default()).unwrap();
    assert_eq!(store.snapshot().unwrap(), serde_json::Value::Null);
}
