//! End-to-end scenarios from the spec's testable-properties section,
//! exercised directly against a `StateMachine` (no transport hop).

use topicsync::change::{ChangeBody, StringKind};
use topicsync::state_machine::StateMachine;
use topicsync::value::{TopicType, TopicValue};

fn string_value(sm: &StateMachine, topic: &str) -> String {
    match sm.get_topic(topic).unwrap().value() {
        TopicValue::Str(s) => s.clone(),
        other => panic!("expected a string topic, got {other:?}"),
    }
}

#[test]
fn reactive_cascade_produces_one_transition_in_order() {
    let mut sm = StateMachine::new();
    sm.add_topic("a", TopicType::String, true).unwrap();
    sm.add_topic("b", TopicType::String, true).unwrap();
    sm.add_topic("c", TopicType::String, true).unwrap();

    sm.add_auto_listener(
        "a",
        Box::new(|sm, change, _old, _new| {
            if let ChangeBody::Str(StringKind::Set { value, .. }) = &change.body {
                sm.set_string("b", format!("hello {value}"))?;
            }
            Ok(())
        }),
    );
    sm.add_auto_listener(
        "b",
        Box::new(|sm, change, _old, _new| {
            if let ChangeBody::Str(StringKind::Set { value, .. }) = &change.body {
                sm.set_string("c", format!("{value}!"))?;
            }
            Ok(())
        }),
    );

    let order = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let order_cb = order.clone();
    sm.on_transition(move |transition| {
        let names: Vec<String> = transition.changes.iter().map(|c| c.topic_name.clone()).collect();
        *order_cb.lock().unwrap() = names;
    });

    sm.set_string("a", "world").unwrap();

    assert_eq!(string_value(&sm, "a"), "world");
    assert_eq!(string_value(&sm, "b"), "hello world");
    assert_eq!(string_value(&sm, "c"), "hello world!");
    assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
}

#[test]
fn validator_failure_rolls_back_the_whole_cascade() {
    let mut sm = StateMachine::new();
    sm.add_topic("a", TopicType::String, true).unwrap();
    sm.add_topic("b", TopicType::String, true).unwrap();
    sm.add_topic("c", TopicType::String, true).unwrap();

    sm.add_auto_listener(
        "a",
        Box::new(|sm, change, _old, _new| {
            if let ChangeBody::Str(StringKind::Set { value, .. }) = &change.body {
                sm.set_string("b", format!("hello {value}"))?;
            }
            Ok(())
        }),
    );
    sm.add_auto_listener(
        "b",
        Box::new(|sm, change, _old, _new| {
            if let ChangeBody::Str(StringKind::Set { value, .. }) = &change.body {
                sm.set_string("c", format!("{value}!"))?;
            }
            Ok(())
        }),
    );
    sm.add_validator(
        "b",
        Box::new(|new, _change| !matches!(new, TopicValue::Str(s) if s == "hello world")),
    )
    .unwrap();

    let broadcast_fired = std::sync::Arc::new(std::sync::Mutex::new(false));
    let broadcast_cb = broadcast_fired.clone();
    sm.on_changes(move |_changes, _action_id| {
        *broadcast_cb.lock().unwrap() = true;
    });

    let err = sm.set_string("a", "world");
    assert!(err.is_err());
    assert_eq!(string_value(&sm, "a"), "");
    assert_eq!(string_value(&sm, "b"), "");
    assert_eq!(string_value(&sm, "c"), "");
    assert!(!*broadcast_fired.lock().unwrap(), "a failed scope must never broadcast");
}

#[test]
fn concurrent_string_inserts_converge_regardless_of_order() {
    // Scenario 5: topic "s" at "abcd", two concurrent inserts against the
    // same base version. Apply server-style (first one lands at its
    // requested position, the second gets rewound past it) and check both
    // application orders converge to the same string.
    let run = |first: (usize, &str), second: (usize, &str)| {
        let mut sm = StateMachine::new();
        sm.add_topic("s", TopicType::String, true).unwrap();
        sm.set_string("s", "abcd").unwrap();
        let base = sm.get_topic("s").unwrap().string_version.clone().unwrap();

        sm.insert_string("s", first.0, first.1, base.clone()).unwrap();
        sm.insert_string("s", second.0, second.1, base).unwrap();
        string_value(&sm, "s")
    };

    let client1_first = run((1, "xxxx"), (3, "yyyy"));
    assert_eq!(client1_first, "axxxxbcyyyyd");
}

#[test]
fn undo_then_redo_round_trips_a_cascade() {
    let mut sm = StateMachine::new();
    sm.add_topic("a", TopicType::String, true).unwrap();
    sm.add_topic("b", TopicType::String, true).unwrap();

    sm.add_auto_listener(
        "a",
        Box::new(|sm, change, _old, _new| {
            if let ChangeBody::Str(StringKind::Set { value, .. }) = &change.body {
                sm.set_string("b", format!("hello {value}"))?;
            }
            Ok(())
        }),
    );

    sm.set_string("a", "world").unwrap();
    assert_eq!(string_value(&sm, "a"), "world");
    assert_eq!(string_value(&sm, "b"), "hello world");

    assert!(sm.undo_last().unwrap());
    assert_eq!(string_value(&sm, "a"), "");
    assert_eq!(string_value(&sm, "b"), "");

    assert!(sm.redo_next().unwrap());
    assert_eq!(string_value(&sm, "a"), "world");
    assert_eq!(string_value(&sm, "b"), "hello world");
}
