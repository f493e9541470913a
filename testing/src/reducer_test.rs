//! Given-When-Then harness for reducers, plus a store-less effect driver.

#![allow(clippy::module_name_repetitions)]

use std::future::Future;
use std::pin::Pin;
use venue_core::{effect::Effect, reducer::Reducer};

type StateAssertion<S> = Box<dyn FnOnce(&S)>;
type EffectAssertion<A> = Box<dyn FnOnce(&[Effect<A>])>;

/// Fluent API for testing reducers
///
/// Several actions may be queued with repeated [`ReducerTest::when_action`]
/// calls; they are reduced in order and the effect assertions see the effects
/// of the last one.
///
/// # Example
///
/// ```ignore
/// ReducerTest::new(CheckoutReducer::new())
///     .with_env(env)
///     .given_state(CheckoutState::default())
///     .when_action(start)
///     .then_state(|state| assert_eq!(state.in_flight_count(), 1))
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
    actions: Vec<A>,
    state_assertions: Vec<StateAssertion<S>>,
    effect_assertions: Vec<EffectAssertion<A>>,
}

impl<R, S, A, E> ReducerTest<R, S, A, E>
where
    R: Reducer<State = S, Action = A, Environment = E>,
{
    /// Create a new reducer test with the given reducer
    #[must_use]
    pub const fn new(reducer: R) -> Self {
        Self {
            reducer,
            environment: None,
            initial_state: None,
            actions: Vec::new(),
            state_assertions: Vec::new(),
            effect_assertions: Vec::new(),
        }
    }

    /// Set the environment for the test
    #[must_use]
    pub fn with_env(mut self, env: E) -> Self {
        self.environment = Some(env);
        self
    }

    /// Set the initial state (Given)
    #[must_use]
    pub fn given_state(mut self, state: S) -> Self {
        self.initial_state = Some(state);
        self
    }

    /// Queue an action (When)
    #[must_use]
    pub fn when_action(mut self, action: A) -> Self {
        self.actions.push(action);
        self
    }

    /// Add an assertion about the resulting state (Then)
    #[must_use]
    pub fn then_state<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&S) + 'static,
    {
        self.state_assertions.push(Box::new(assertion));
        self
    }

    /// Add an assertion about the effects of the last action (Then)
    #[must_use]
    pub fn then_effects<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&[Effect<A>]) + 'static,
    {
        self.effect_assertions.push(Box::new(assertion));
        self
    }

    /// Run the test and execute all assertions
    ///
    /// # Panics
    ///
    /// Panics if the initial state, environment or at least one action is
    /// missing, or if any assertion fails.
    #[allow(clippy::panic)]
    #[allow(clippy::expect_used)]
    pub fn run(self) {
        let mut state = self
            .initial_state
            .expect("Initial state must be set with given_state()");
        let env = self
            .environment
            .expect("Environment must be set with with_env()");
        assert!(!self.actions.is_empty(), "At least one action must be set with when_action()");

        let mut effects = Vec::new();
        for action in self.actions {
            effects = self.reducer.reduce(&mut state, action, &env).into_vec();
        }

        for assertion in self.state_assertions {
            assertion(&state);
        }

        for assertion in self.effect_assertions {
            assertion(&effects);
        }
    }
}

/// Execute effects without a store and collect the actions they produce
///
/// Futures are awaited, delays are slept, parallel and sequential groups are
/// flattened in declaration order. Produced actions are *not* fed back into
/// any reducer, which lets a test step through a saga one hop at a time.
pub async fn run_effects<A, I>(effects: I) -> Vec<A>
where
    A: Send + 'static,
    I: IntoIterator<Item = Effect<A>>,
{
    let mut produced = Vec::new();
    for effect in effects {
        drive(effect, &mut produced).await;
    }
    produced
}

fn drive<'a, A>(effect: Effect<A>, produced: &'a mut Vec<A>) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>
where
    A: Send + 'static,
{
    Box::pin(async move {
        match effect {
            Effect::None => {},
            Effect::Future(fut) => {
                if let Some(action) = fut.await {
                    produced.push(action);
                }
            },
            Effect::Delay { duration, action } => {
                tokio::time::sleep(duration).await;
                produced.push(*action);
            },
            Effect::Parallel(effects) | Effect::Sequential(effects) => {
                for effect in effects {
                    drive(effect, produced).await;
                }
            },
        }
    })
}

/// Helper assertions for effects
pub mod assertions {
    use venue_core::effect::Effect;

    /// Assert that there are no effects
    ///
    /// # Panics
    ///
    /// Panics if any effect would do work.
    #[allow(clippy::panic)]
    pub fn assert_no_effects<A: std::fmt::Debug>(effects: &[Effect<A>]) {
        assert!(
            effects.iter().all(Effect::is_none),
            "Expected no effects, but found {}: {:?}",
            effects.len(),
            effects
        );
    }

    /// Assert the number of effects
    ///
    /// # Panics
    ///
    /// Panics if the number of effects doesn't match expected.
    #[allow(clippy::panic)]
    pub fn assert_effects_count<A>(effects: &[Effect<A>], expected: usize) {
        assert_eq!(
            effects.len(),
            expected,
            "Expected {} effects, but found {}",
            expected,
            effects.len()
        );
    }

    /// Assert that effects contain at least one Future effect, at any depth
    ///
    /// # Panics
    ///
    /// Panics if no Future effect is found.
    #[allow(clippy::panic)]
    pub fn assert_has_future_effect<A>(effects: &[Effect<A>]) {
        fn contains_future<A>(effect: &Effect<A>) -> bool {
            match effect {
                Effect::Future(_) => true,
                Effect::Parallel(inner) | Effect::Sequential(inner) => inner.iter().any(contains_future),
                Effect::None | Effect::Delay { .. } => false,
            }
        }

        assert!(
            effects.iter().any(contains_future),
            "Expected at least one Future effect, but none found"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use venue_core::{async_effect, smallvec, SmallVec};

    #[derive(Clone, Debug, Default)]
    struct DoorState {
        inside: u32,
    }

    #[derive(Clone, Debug, PartialEq)]
    enum DoorAction {
        Enter,
        Leave,
        Ping,
        Pong(u8),
    }

    struct DoorReducer;

    impl Reducer for DoorReducer {
        type State = DoorState;
        type Action = DoorAction;
        type Environment = ();

        fn reduce(&self, state: &mut DoorState, action: DoorAction, _env: &()) -> SmallVec<[Effect<DoorAction>; 4]> {
            match action {
                DoorAction::Enter => {
                    state.inside += 1;
                    smallvec![Effect::None]
                },
                DoorAction::Leave => {
                    state.inside = state.inside.saturating_sub(1);
                    smallvec![Effect::None]
                },
                DoorAction::Ping => smallvec![Effect::chain(vec![
                    async_effect! { Some(DoorAction::Pong(1)) },
                    Effect::merge(vec![async_effect! { Some(DoorAction::Pong(2)) }, Effect::None]),
                ])],
                DoorAction::Pong(_) => smallvec![],
            }
        }
    }

    #[test]
    fn test_actions_reduce_in_order() {
        ReducerTest::new(DoorReducer)
            .with_env(())
            .given_state(DoorState::default())
            .when_action(DoorAction::Enter)
            .when_action(DoorAction::Enter)
            .when_action(DoorAction::Leave)
            .then_state(|state| assert_eq!(state.inside, 1))
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[test]
    fn test_effect_assertions_see_last_action() {
        ReducerTest::new(DoorReducer)
            .with_env(())
            .given_state(DoorState::default())
            .when_action(DoorAction::Enter)
            .when_action(DoorAction::Ping)
            .then_effects(|effects| {
                assertions::assert_effects_count(effects, 1);
                assertions::assert_has_future_effect(effects);
            })
            .run();
    }

    #[tokio::test]
    async fn test_run_effects_collects_nested_actions() {
        let mut state = DoorState::default();
        let effects = DoorReducer.reduce(&mut state, DoorAction::Ping, &());

        let produced = run_effects(effects).await;

        assert_eq!(produced, vec![DoorAction::Pong(1), DoorAction::Pong(2)]);
    }
}
