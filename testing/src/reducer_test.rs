//! Driving the page reducer one action at a time.
//!
//! A page test boots a [`PageState`](raxm_runtime::PageState), replays the
//! actions that bring it to the interesting point (usually
//! `PageAction::Initialize` plus a few enqueues), then checks what a single
//! action does to the queue and which effects (debounce `Delay`, tick or
//! request `Future`) it asks the store to run.

#![allow(clippy::module_name_repetitions)] // ReducerTest is the natural name

use raxm_core::{effect::Effect, reducer::Reducer};

type StateAssertion<S> = Box<dyn FnOnce(&S)>;
type EffectAssertion<A> = Box<dyn FnOnce(&[Effect<A>])>;

/// Given a page state and the actions that led up to it, when one more
/// action is reduced, then its state and effects look like this.
///
/// Effects of the `given` actions are discarded; nothing is executed.
///
/// # Example
///
/// ```ignore
/// use raxm_testing::ReducerTest;
///
/// ReducerTest::new(PageReducer)
///     .with_env(environment)
///     .given_state(state)
///     .given_actions(vec![PageAction::Initialize])
///     .when_action(PageAction::Flush { component })
///     .then_state(|state| assert!(state.in_flight(&id).is_some()))
///     .then_effects(assertions::assert_has_future_effect)
///     .run();
/// ```
pub struct ReducerTest<R, S, A, E>
where
    R: Reducer<State = S, Action = A, Environment = E>,
{
    reducer: R,
    environment: Option<E>,
    initial_state: Option<S>,
    setup: Vec<A>,
    action: Option<A>,
    state_assertions: Vec<StateAssertion<S>>,
    effect_assertions: Vec<EffectAssertion<A>>,
}

impl<R, S, A, E> ReducerTest<R, S, A, E>
where
    R: Reducer<State = S, Action = A, Environment = E>,
{
    #[must_use]
    pub const fn new(reducer: R) -> Self {
        Self {
            reducer,
            environment: None,
            initial_state: None,
            setup: Vec::new(),
            action: None,
            state_assertions: Vec::new(),
            effect_assertions: Vec::new(),
        }
    }

    /// Environment the reducer reads hosts and config from
    #[must_use]
    pub fn with_env(mut self, env: E) -> Self {
        self.environment = Some(env);
        self
    }

    /// Page state before any action (Given)
    #[must_use]
    pub fn given_state(mut self, state: S) -> Self {
        self.initial_state = Some(state);
        self
    }

    /// Actions reduced before the one under test (Given)
    #[must_use]
    pub fn given_actions(mut self, actions: Vec<A>) -> Self {
        self.setup = actions;
        self
    }

    /// The action under test (When)
    #[must_use]
    pub fn when_action(mut self, action: A) -> Self {
        self.action = Some(action);
        self
    }

    /// Check queues, components or the document afterwards (Then)
    #[must_use]
    pub fn then_state<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&S) + 'static,
    {
        self.state_assertions.push(Box::new(assertion));
        self
    }

    /// Check the effects the action returned (Then)
    #[must_use]
    pub fn then_effects<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&[Effect<A>]) + 'static,
    {
        self.effect_assertions.push(Box::new(assertion));
        self
    }

    /// Reduce the given actions, then the one under test, and check it.
    ///
    /// # Panics
    ///
    /// Panics when state, action or environment is missing, or an
    /// assertion fails.
    #[allow(clippy::panic, clippy::expect_used)]
    pub fn run(self) {
        let mut state = self
            .initial_state
            .expect("Initial state must be set with given_state()");

        let action = self.action.expect("Action must be set with when_action()");

        let env = self
            .environment
            .expect("Environment must be set with with_env()");

        for given in self.setup {
            let _ = self.reducer.reduce(&mut state, given, &env);
        }

        let effects = self.reducer.reduce(&mut state, action, &env);
        for assertion in self.state_assertions {
            assertion(&state);
        }
        for assertion in self.effect_assertions {
            assertion(&effects);
        }
    }
}

/// Checks on the effects a page action returns.
#[allow(clippy::panic)]
pub mod assertions {
    use raxm_core::effect::Effect;
    use std::time::Duration;

    /// Nothing to run: no timer, no request
    ///
    /// # Panics
    ///
    /// Panics otherwise.
    pub fn assert_no_effects<A: std::fmt::Debug>(effects: &[Effect<A>]) {
        assert!(
            effects.is_empty() || matches!(effects, [Effect::None]),
            "expected no effects, got {effects:?}"
        );
    }

    /// # Panics
    ///
    /// Panics unless exactly `expected` effects were returned.
    pub fn assert_effects_count<A>(effects: &[Effect<A>], expected: usize) {
        assert_eq!(effects.len(), expected, "effect count");
    }

    /// A tick flush or request went out
    ///
    /// # Panics
    ///
    /// Panics when no `Future` effect is present.
    pub fn assert_has_future_effect<A>(effects: &[Effect<A>]) {
        assert!(
            effects.iter().any(|e| matches!(e, Effect::Future(_))),
            "no Future effect"
        );
    }

    /// A debounce window of exactly `duration` was opened
    ///
    /// # Panics
    ///
    /// Panics when no such `Delay` is present.
    pub fn assert_has_delay<A>(effects: &[Effect<A>], duration: Duration) {
        assert!(
            effects
                .iter()
                .any(|e| matches!(e, Effect::Delay { duration: d, .. } if *d == duration)),
            "no Delay of {duration:?}"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raxm_core::effect::Effect;
    use raxm_core::reducer::Reducer;
    use std::time::Duration;

    #[derive(Clone, Debug)]
    struct TestState {
        count: i32,
    }

    #[derive(Clone, Debug)]
    enum TestAction {
        Increment,
        Decrement,
        Later,
    }

    struct TestReducer;

    struct TestEnv;

    impl Reducer for TestReducer {
        type State = TestState;
        type Action = TestAction;
        type Environment = TestEnv;

        fn reduce(
            &self,
            state: &mut Self::State,
            action: Self::Action,
            _env: &Self::Environment,
        ) -> smallvec::SmallVec<[Effect<Self::Action>; 4]> {
            match action {
                TestAction::Increment => {
                    state.count += 1;
                    smallvec::smallvec![Effect::None]
                },
                TestAction::Decrement => {
                    state.count -= 1;
                    smallvec::smallvec![Effect::None]
                },
                TestAction::Later => smallvec::smallvec![Effect::Delay {
                    duration: Duration::from_millis(150),
                    action: Box::new(TestAction::Increment),
                }],
            }
        }
    }

    #[test]
    fn test_reducer_test_increment() {
        ReducerTest::new(TestReducer)
            .with_env(TestEnv)
            .given_state(TestState { count: 0 })
            .when_action(TestAction::Increment)
            .then_state(|state| {
                assert_eq!(state.count, 1);
            })
            .then_effects(|effects| {
                assertions::assert_no_effects(effects);
            })
            .run();
    }

    #[test]
    fn test_given_actions_run_first() {
        ReducerTest::new(TestReducer)
            .with_env(TestEnv)
            .given_state(TestState { count: 5 })
            .given_actions(vec![TestAction::Increment, TestAction::Increment])
            .when_action(TestAction::Decrement)
            .then_state(|state| {
                assert_eq!(state.count, 6);
            })
            .run();
    }

    #[test]
    fn test_delay_assertion() {
        ReducerTest::new(TestReducer)
            .with_env(TestEnv)
            .given_state(TestState { count: 0 })
            .when_action(TestAction::Later)
            .then_effects(|effects| {
                assertions::assert_effects_count(effects, 1);
                assertions::assert_has_delay(effects, Duration::from_millis(150));
            })
            .run();
    }
}
