use std::sync::Arc;

use super::*;

#[derive(Debug, Clone, PartialEq)]
struct Login {
    user: String,
}

impl Action for Login {}

#[derive(Debug, Clone, PartialEq)]
struct LoggedIn {
    user: String,
}

impl Event for LoggedIn {}

#[test]
fn actions_are_discriminated_by_type() {
    let action: Box<dyn Action> = Box::new(Login {
        user: "ada".to_owned(),
    });

    assert!(action.is::<Login>());
    assert!(!action.is::<InitAction>());
    assert_eq!(
        action.downcast_ref::<Login>(),
        Some(&Login {
            user: "ada".to_owned()
        })
    );
    assert!(action.downcast_ref::<FinishAction>().is_none());
}

#[test]
fn events_expose_their_type_identity() {
    let event: Arc<dyn Event> = Arc::new(LoggedIn {
        user: "ada".to_owned(),
    });
    let finish: Arc<dyn Event> = Arc::new(FinishEvent);

    assert_eq!(
        event.as_ref().event_type(),
        std::any::TypeId::of::<LoggedIn>()
    );
    assert_ne!(event.as_ref().event_type(), finish.as_ref().event_type());
    assert!(finish.as_ref().is::<FinishEvent>());
}

#[test]
fn complete_result_collects_items_in_order() {
    let result = CompleteReducerResult::new(1_i64)
        .with_action(InitAction)
        .with_action(FinishAction)
        .with_event(FinishEvent);

    assert_eq!(result.state, 1);
    assert_eq!(result.actions.len(), 2);
    assert!(result.actions[0].is::<InitAction>());
    assert!(result.actions[1].is::<FinishAction>());
    assert_eq!(result.events.len(), 1);
    assert!(result.events[0].as_ref().is::<FinishEvent>());
}

#[test]
fn reducer_result_converts_from_state() {
    let result: ReducerResult<i64> = 7.into();
    assert!(matches!(result, ReducerResult::State(7)));

    let result: ReducerResult<i64> = CompleteReducerResult::new(7).into();
    assert!(matches!(result, ReducerResult::Complete(_)));
}

#[test]
fn dispatch_items_wrap_both_kinds() {
    let action = DispatchItem::action(Login {
        user: "ada".to_owned(),
    });
    let event = DispatchItem::event(LoggedIn {
        user: "ada".to_owned(),
    });

    assert!(matches!(action, DispatchItem::Action(_)));
    assert!(matches!(event, DispatchItem::Event(_)));
}
