//! The page reducer driven directly, without a store.

#![allow(clippy::unwrap_used, clippy::panic)]

use proptest::prelude::*;
use raxm_core::action::Action;
use raxm_core::component::ComponentId;
use raxm_core::dom::Document;
use raxm_core::effect::Effect;
use raxm_core::hooks::HookBus;
use raxm_core::message::MessageId;
use raxm_core::reducer::Reducer;
use raxm_runtime::queue::CommitQueue;
use raxm_runtime::{
    Connection, ConnectionOutcome, DomEvent, InMemorySessionStorage, PageAction, PageEnvironment, PageReducer,
    PageState, RuntimeConfig, SnapshotStore, Timing,
};
use raxm_testing::fixtures::{component_html, page_html};
use raxm_testing::reducer_test::assertions;
use raxm_testing::{MockTransport, RecordingUi, ReducerTest, properties, test_clock};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn environment() -> PageEnvironment {
    let connection = Connection::new(Arc::new(MockTransport::new()), "", "token");
    let snapshots = SnapshotStore::new(Arc::new(InMemorySessionStorage::default()), Arc::new(test_clock()));
    PageEnvironment::new(connection, Arc::new(RecordingUi::new()), snapshots, RuntimeConfig::default())
}

fn search_page() -> PageState {
    let body = component_html(
        "c1",
        "search",
        &json!({"q": ""}),
        r#"<input type="text" raxm:model="q"><button raxm:click="go">Go</button>"#,
    );
    PageState::new(Document::parse(&page_html(&body)), HookBus::new()).unwrap()
}

#[test]
fn test_text_input_starts_debounce_window() {
    let state = search_page();
    let input = state.query("raxm:model", "q").unwrap();
    let id = ComponentId::new("c1");

    ReducerTest::new(PageReducer)
        .with_env(environment())
        .given_state(state)
        .given_actions(vec![PageAction::Initialize])
        .when_action(PageAction::Dispatch {
            target: input,
            event: DomEvent::input("r"),
        })
        .then_state(move |s| {
            assert_eq!(s.pending(&id).len(), 1);
            assert!(s.in_flight(&id).is_none());
            assert_eq!(s.component(&id).unwrap().current_value("q"), Some(&json!("r")));
        })
        .then_effects(|effects| {
            assertions::assert_effects_count(effects, 1);
            assertions::assert_has_delay(effects, Duration::from_millis(150));
        })
        .run();
}

#[test]
fn test_flush_puts_message_in_flight() {
    let id = ComponentId::new("c1");

    ReducerTest::new(PageReducer)
        .with_env(environment())
        .given_state(search_page())
        .given_actions(vec![
            PageAction::Initialize,
            PageAction::Enqueue {
                component: id.clone(),
                action: Action::call_method("go", vec![]),
                timing: Timing::Immediate,
            },
        ])
        .when_action(PageAction::Flush { component: id.clone() })
        .then_state(move |s| {
            let message = s.in_flight(&id).unwrap();
            assert_eq!(message.methods().collect::<Vec<_>>(), ["go"]);
            assert!(s.pending(&id).is_empty());
        })
        .then_effects(assertions::assert_has_future_effect)
        .run();
}

#[test]
fn test_flush_effect_resolves_to_response() {
    let env = environment();
    let mut state = search_page();
    let id = ComponentId::new("c1");
    let _ = PageReducer.reduce(&mut state, PageAction::Initialize, &env);
    let _ = PageReducer.reduce(
        &mut state,
        PageAction::Enqueue {
            component: id.clone(),
            action: Action::call_method("go", vec![]),
            timing: Timing::Immediate,
        },
        &env,
    );

    let mut effects = PageReducer.reduce(&mut state, PageAction::Flush { component: id.clone() }, &env);
    let Some(Effect::Future(request)) = effects.pop() else {
        panic!("expected the request effect");
    };
    let action = tokio_test::block_on(request);

    let sent = state.in_flight(&id).unwrap().id;
    assert!(matches!(
        action,
        Some(PageAction::ResponseArrived { message, outcome: ConnectionOutcome::Success(_), .. }) if message == sent
    ));
}

#[test]
fn test_stale_debounce_window_does_nothing() {
    let id = ComponentId::new("c1");
    let update = |value: &str| PageAction::Enqueue {
        component: ComponentId::new("c1"),
        action: Action::sync_input("q", json!(value)),
        timing: Timing::Debounce(Duration::from_millis(150)),
    };

    ReducerTest::new(PageReducer)
        .with_env(environment())
        .given_state(search_page())
        .given_actions(vec![PageAction::Initialize, update("a"), update("ab")])
        .when_action(PageAction::DebounceElapsed {
            component: id.clone(),
            generation: 1,
        })
        .then_state(move |s| {
            assert!(s.in_flight(&id).is_none());
            assert_eq!(s.pending(&id)[0].model_value(), Some(&json!("ab")));
        })
        .then_effects(assertions::assert_no_effects)
        .run();
}

#[test]
fn test_response_for_unknown_message_is_ignored() {
    let id = ComponentId::new("c1");

    ReducerTest::new(PageReducer)
        .with_env(environment())
        .given_state(search_page())
        .given_actions(vec![PageAction::Initialize])
        .when_action(PageAction::ResponseArrived {
            component: id.clone(),
            message: MessageId(42),
            outcome: ConnectionOutcome::SessionExpired,
        })
        .then_state(|s| assert!(!s.is_session_expired()))
        .then_effects(assertions::assert_no_effects)
        .run();
}

#[test]
fn test_removing_root_destroys_component() {
    let state = search_page();
    let root = state.query("raxm:id", "c1").unwrap();

    ReducerTest::new(PageReducer)
        .with_env(environment())
        .given_state(state)
        .given_actions(vec![PageAction::Initialize])
        .when_action(PageAction::RemoveElement(root))
        .then_state(|s| assert!(s.component_ids().is_empty()))
        .then_effects(assertions::assert_no_effects)
        .run();
}

proptest! {
    #[test]
    fn prop_debounced_keystrokes_keep_only_the_last(strokes in properties::keystrokes()) {
        let mut queue = CommitQueue::new();
        let mut generation = 0;
        for stroke in &strokes {
            generation = queue.push_debounced(Action::sync_input("q", json!(stroke)));
        }
        prop_assert!(queue.is_current_debounce(generation));

        let batch = queue.take_batch().unwrap();
        prop_assert_eq!(batch.len(), 1);
        prop_assert_eq!(batch[0].model_value(), Some(&json!(strokes.last().unwrap())));
    }

    #[test]
    fn prop_deferred_properties_keep_first_deferral_order(
        names in prop::collection::vec(properties::property_name(), 1..12)
    ) {
        let mut queue = CommitQueue::new();
        for (i, name) in names.iter().enumerate() {
            queue.defer(Action::deferred_sync_input(name.as_str(), json!(i)));
        }
        queue.push(Action::call_method("save", vec![]));

        let mut expected: Vec<&str> = Vec::new();
        for name in &names {
            if !expected.contains(&name.as_str()) {
                expected.push(name);
            }
        }
        let batch = queue.take_batch().unwrap();
        let sent: Vec<&str> = batch.iter().filter_map(Action::property).collect();
        prop_assert_eq!(sent, expected);
        prop_assert_eq!(batch.last().and_then(Action::method), Some("save"));
    }
}
