//! # Venue Runtime
//!
//! Hosts reducers from the booking domain and executes the effects they
//! describe.
//!
//! The [`Store`] owns one reducer's state behind a lock. Sending an action
//! runs the reducer synchronously, then spawns every returned effect. Actions
//! produced by effects are fed back into the reducer and, once reduced, are
//! broadcast to observers. Request/response callers use
//! [`Store::send_and_wait_for`] to suspend until the terminal action of
//! their own request arrives.
//!
//! ```text
//!   send(action) ──► reducer ──► effects ──► tokio tasks
//!        ▲                                        │
//!        └────── feedback action (reduced, then broadcast) ◄┘
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use venue_core::effect::Effect;
use venue_core::reducer::Reducer;

/// Retry with exponential backoff
pub mod retry;

pub use error::StoreError;
pub use store::Store;

/// Error types for the Store runtime
pub mod error {
    use thiserror::Error;

    /// Errors that can occur during Store operations
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum StoreError {
        /// Store is shutting down and not accepting new actions
        #[error("Store is shutting down")]
        ShutdownInProgress,

        /// Shutdown timed out waiting for effects to complete
        #[error("Shutdown timed out with {0} effects still running")]
        ShutdownTimeout(usize),

        /// Timeout waiting for a terminal action
        #[error("Timeout waiting for action")]
        Timeout,

        /// Action broadcast channel closed
        #[error("Action broadcast channel closed")]
        ChannelClosed,
    }
}

/// Decrements the in-flight effect counter when a spawned effect finishes,
/// including when its task panics.
struct PendingGuard(Arc<AtomicUsize>);

impl PendingGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Store module - the runtime coordinator for a reducer
pub mod store {
    use super::{Arc, AtomicBool, AtomicUsize, Duration, Effect, Ordering, PendingGuard, Reducer};
    use crate::error::StoreError;
    use std::future::Future;
    use std::pin::Pin;
    use tokio::sync::{broadcast, RwLock};

    /// Default capacity of the action broadcast channel
    const DEFAULT_BROADCAST_CAPACITY: usize = 256;

    /// The Store - runtime coordinator for a reducer
    ///
    /// The Store manages:
    /// 1. State (behind `RwLock` for concurrent access)
    /// 2. Reducer (business logic)
    /// 3. Environment (injected dependencies)
    /// 4. Effect execution (with feedback loop)
    ///
    /// Cloning a store is cheap; clones share state and the broadcast channel.
    pub struct Store<S, A, E, R>
    where
        R: Reducer<State = S, Action = A, Environment = E>,
    {
        state: Arc<RwLock<S>>,
        reducer: Arc<R>,
        environment: Arc<E>,
        shutdown: Arc<AtomicBool>,
        pending_effects: Arc<AtomicUsize>,
        /// Carries every action produced by an effect, after it has been reduced.
        action_broadcast: broadcast::Sender<A>,
    }

    impl<S, A, E, R> Store<S, A, E, R>
    where
        R: Reducer<State = S, Action = A, Environment = E> + Send + Sync + 'static,
        A: Send + Clone + 'static,
        S: Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        /// Create a new store with initial state, reducer, and environment
        #[must_use]
        pub fn new(initial_state: S, reducer: R, environment: E) -> Self {
            Self::with_broadcast_capacity(initial_state, reducer, environment, DEFAULT_BROADCAST_CAPACITY)
        }

        /// Create a store with an explicit action broadcast capacity
        ///
        /// Observers that fall more than `capacity` actions behind lose the
        /// oldest ones.
        #[must_use]
        pub fn with_broadcast_capacity(
            initial_state: S,
            reducer: R,
            environment: E,
            capacity: usize,
        ) -> Self {
            let (action_broadcast, _) = broadcast::channel(capacity.max(1));

            Self {
                state: Arc::new(RwLock::new(initial_state)),
                reducer: Arc::new(reducer),
                environment: Arc::new(environment),
                shutdown: Arc::new(AtomicBool::new(false)),
                pending_effects: Arc::new(AtomicUsize::new(0)),
                action_broadcast,
            }
        }

        /// Send an action to the store
        ///
        /// The reducer runs while the state write lock is held, so concurrent
        /// sends are serialized at the reducer. Effects are spawned and this
        /// method returns without waiting for them.
        ///
        /// # Errors
        ///
        /// Returns [`StoreError::ShutdownInProgress`] if the store is shutting down.
        pub async fn send(&self, action: A) -> Result<(), StoreError> {
            if self.shutdown.load(Ordering::Acquire) {
                tracing::warn!("Rejected action: store is shutting down");
                return Err(StoreError::ShutdownInProgress);
            }

            metrics::counter!("store.commands.total").increment(1);
            self.dispatch(action).await;
            Ok(())
        }

        /// Reduce an action and spawn its effects, shutdown or not
        async fn dispatch(&self, action: A) {
            let effects = {
                let mut state = self.state.write().await;
                self.reducer.reduce(&mut state, action, self.environment.as_ref())
            };

            tracing::trace!(effects = effects.len(), "Reducer completed");
            for effect in effects {
                self.execute_effect(effect);
            }
        }

        /// Send an action and wait for a matching result action
        ///
        /// Subscribes to the action broadcast before sending so the terminal
        /// action cannot be missed, then returns the first broadcast action for
        /// which `predicate` holds. Because feedback actions are broadcast only
        /// after they have been reduced, the store state already reflects the
        /// returned action.
        ///
        /// # Errors
        ///
        /// - [`StoreError::Timeout`]: no matching action within `timeout`
        /// - [`StoreError::ChannelClosed`]: the broadcast channel closed
        /// - [`StoreError::ShutdownInProgress`]: the store is shutting down
        pub async fn send_and_wait_for<F>(
            &self,
            action: A,
            predicate: F,
            timeout: Duration,
        ) -> Result<A, StoreError>
        where
            F: Fn(&A) -> bool,
        {
            let mut rx = self.action_broadcast.subscribe();

            self.send(action).await?;

            tokio::time::timeout(timeout, async {
                loop {
                    match rx.recv().await {
                        Ok(action) if predicate(&action) => return Ok(action),
                        Ok(_) => {},
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Action observer lagged");
                        },
                        Err(broadcast::error::RecvError::Closed) => {
                            return Err(StoreError::ChannelClosed);
                        },
                    }
                }
            })
            .await
            .map_err(|_| StoreError::Timeout)?
        }

        /// Subscribe to every action produced by effects
        #[must_use]
        pub fn subscribe_actions(&self) -> broadcast::Receiver<A> {
            self.action_broadcast.subscribe()
        }

        /// Read current state via a closure
        ///
        /// ```ignore
        /// let in_flight = store.state(|s| s.in_flight_count()).await;
        /// ```
        pub async fn state<F, T>(&self, f: F) -> T
        where
            F: FnOnce(&S) -> T,
        {
            let state = self.state.read().await;
            f(&state)
        }

        /// Number of spawned effects that have not finished yet
        #[must_use]
        pub fn pending_effects(&self) -> usize {
            self.pending_effects.load(Ordering::SeqCst)
        }

        /// Stop accepting actions and wait for running effects to drain
        ///
        /// Only external sends are refused. Actions produced by effects that
        /// were already running are still reduced, and any follow-up effects
        /// they spawn are drained too.
        ///
        /// # Errors
        ///
        /// Returns [`StoreError::ShutdownTimeout`] with the number of effects
        /// still running when `timeout` elapses.
        pub async fn shutdown(&self, timeout: Duration) -> Result<(), StoreError> {
            self.shutdown.store(true, Ordering::Release);
            tracing::info!(pending = self.pending_effects(), "Store shutting down");

            let drained = tokio::time::timeout(timeout, async {
                while self.pending_effects.load(Ordering::SeqCst) > 0 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await;

            match drained {
                Ok(()) => Ok(()),
                Err(_) => Err(StoreError::ShutdownTimeout(self.pending_effects())),
            }
        }

        /// Spawn an effect. Parallel effects fan out into one task each.
        fn execute_effect(&self, effect: Effect<A>) {
            match effect {
                Effect::None => {},
                Effect::Parallel(effects) => {
                    for effect in effects {
                        self.execute_effect(effect);
                    }
                },
                effect => {
                    let guard = PendingGuard::enter(&self.pending_effects);
                    let store = self.clone();
                    tokio::spawn(async move {
                        let _guard = guard;
                        store.run_to_completion(effect).await;
                    });
                },
            }
        }

        /// Drive an effect tree inside the current task, feeding back every
        /// produced action before returning.
        fn run_to_completion(&self, effect: Effect<A>) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            Box::pin(async move {
                match effect {
                    Effect::None => {},
                    Effect::Future(fut) => {
                        if let Some(action) = fut.await {
                            self.feed_back(action).await;
                        }
                    },
                    Effect::Delay { duration, action } => {
                        tokio::time::sleep(duration).await;
                        self.feed_back(*action).await;
                    },
                    Effect::Parallel(effects) => {
                        futures::future::join_all(
                            effects.into_iter().map(|effect| self.run_to_completion(effect)),
                        )
                        .await;
                    },
                    Effect::Sequential(effects) => {
                        for effect in effects {
                            self.run_to_completion(effect).await;
                        }
                    },
                }
            })
        }

        async fn feed_back(&self, action: A) {
            if self.shutdown.load(Ordering::Acquire) {
                tracing::debug!("Reducing feedback action during shutdown");
            }
            self.dispatch(action.clone()).await;
            // No receivers is fine; nobody is waiting.
            let _ = self.action_broadcast.send(action);
        }
    }

    impl<S, A, E, R> Clone for Store<S, A, E, R>
    where
        R: Reducer<State = S, Action = A, Environment = E>,
    {
        fn clone(&self) -> Self {
            Self {
                state: Arc::clone(&self.state),
                reducer: Arc::clone(&self.reducer),
                environment: Arc::clone(&self.environment),
                shutdown: Arc::clone(&self.shutdown),
                pending_effects: Arc::clone(&self.pending_effects),
                action_broadcast: self.action_broadcast.clone(),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use venue_core::{async_effect, delay, smallvec, SmallVec};

    #[derive(Debug, Default)]
    struct GateState {
        admitted: u32,
        log: Vec<&'static str>,
    }

    #[derive(Clone, Debug, PartialEq)]
    enum GateAction {
        Scan,
        Admitted,
        Reminder,
        Pair,
        Step(&'static str),
    }

    struct GateReducer;

    impl Reducer for GateReducer {
        type State = GateState;
        type Action = GateAction;
        type Environment = ();

        fn reduce(
            &self,
            state: &mut GateState,
            action: GateAction,
            _env: &(),
        ) -> SmallVec<[Effect<GateAction>; 4]> {
            match action {
                GateAction::Scan => smallvec![async_effect! { Some(GateAction::Admitted) }],
                GateAction::Admitted => {
                    state.admitted += 1;
                    smallvec![Effect::None]
                },
                GateAction::Reminder => smallvec![delay! {
                    duration: Duration::from_millis(5),
                    action: GateAction::Admitted
                }],
                GateAction::Pair => smallvec![Effect::chain(vec![
                    async_effect! { Some(GateAction::Step("first")) },
                    async_effect! { Some(GateAction::Step("second")) },
                ])],
                GateAction::Step(name) => {
                    state.log.push(name);
                    smallvec![Effect::None]
                },
            }
        }
    }

    #[tokio::test]
    async fn test_feedback_is_reduced_before_broadcast() {
        let store = Store::new(GateState::default(), GateReducer, ());

        let result = store
            .send_and_wait_for(
                GateAction::Scan,
                |a| matches!(a, GateAction::Admitted),
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        assert_eq!(result, GateAction::Admitted);
        assert_eq!(store.state(|s| s.admitted).await, 1);
    }

    #[tokio::test]
    async fn test_delay_effect_dispatches_later() {
        let store = Store::new(GateState::default(), GateReducer, ());

        store
            .send_and_wait_for(
                GateAction::Reminder,
                |a| matches!(a, GateAction::Admitted),
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        assert_eq!(store.state(|s| s.admitted).await, 1);
    }

    #[tokio::test]
    async fn test_sequential_effects_keep_order() {
        let store = Store::new(GateState::default(), GateReducer, ());

        store
            .send_and_wait_for(
                GateAction::Pair,
                |a| matches!(a, GateAction::Step("second")),
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        assert_eq!(store.state(|s| s.log.clone()).await, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_wait_times_out_without_matching_action() {
        let store = Store::new(GateState::default(), GateReducer, ());

        let result = store
            .send_and_wait_for(
                GateAction::Admitted,
                |a| matches!(a, GateAction::Scan),
                Duration::from_millis(20),
            )
            .await;

        assert_eq!(result.unwrap_err(), StoreError::Timeout);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_actions() {
        let store = Store::new(GateState::default(), GateReducer, ());

        store.shutdown(Duration::from_secs(1)).await.unwrap();

        assert_eq!(
            store.send(GateAction::Scan).await.unwrap_err(),
            StoreError::ShutdownInProgress
        );
        assert_eq!(store.pending_effects(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_drains_feedback_from_running_effects() {
        let store = Store::new(GateState::default(), GateReducer, ());
        let mut observed = store.subscribe_actions();

        store.send(GateAction::Reminder).await.unwrap();
        store.shutdown(Duration::from_secs(1)).await.unwrap();

        assert_eq!(store.state(|s| s.admitted).await, 1);
        assert_eq!(observed.try_recv().unwrap(), GateAction::Admitted);
        assert_eq!(store.pending_effects(), 0);
    }
}
