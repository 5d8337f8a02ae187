//! # Raxm Runtime
//!
//! Page runtime for the Raxm reactive component protocol.
//!
//! This crate provides the Store that coordinates reducer execution and effect
//! handling, and the page reducer built on it: the per-component commit
//! queue, the connection to the server, built-in directive behaviors, and
//! navigation snapshots.
//!
//! ## Core Components
//!
//! - **Store**: manages state and executes effects on tokio
//! - **Page**: boots a document, routes DOM events, applies responses
//! - **Connection**: request contract and response classification
//! - **`SnapshotStore`**: session-storage snapshots for back/forward navigation
//!
//! ## Example
//!
//! ```ignore
//! use raxm_runtime::{HostServices, Page, RuntimeConfig};
//!
//! let page = Page::boot(&html, RuntimeConfig::from_env()?, services).await?;
//! page.dispatch(button, DomEvent::click()).await?;
//! page.settle().await?;
//! ```

use raxm_core::{effect::Effect, reducer::Reducer};
use std::sync::Arc;
use tokio::sync::RwLock;

pub mod config;
pub mod connection;
pub mod directives;
pub mod metrics;
pub mod page;
pub mod queue;
pub mod snapshot;
pub mod telemetry;

pub use config::{ConfigError, RuntimeConfig};
pub use connection::{Connection, ConnectionError, ConnectionOutcome, ReqwestTransport, Transport};
pub use page::{DomEvent, HostServices, Page, PageAction, PageEnvironment, PageError, PageReducer, PageState, UiHost};
pub use queue::Timing;
pub use snapshot::{InMemorySessionStorage, SessionStorage, SnapshotStore, StorageError};

/// Error types for the Store runtime
pub mod error {
    use thiserror::Error;

    /// Errors that can occur during Store operations
    #[derive(Error, Debug)]
    pub enum StoreError {
        /// Store is shutting down and not accepting new actions
        ///
        /// This error is returned when `send()` is called after shutdown initiated.
        #[error("Store is shutting down")]
        ShutdownInProgress,

        /// Shutdown timed out waiting for effects to complete
        ///
        /// Some effects were still running when the timeout elapsed.
        #[error("Shutdown timed out with {0} effects still running")]
        ShutdownTimeout(usize),

        /// Timeout waiting for effects to settle
        #[error("Timeout waiting for effects to settle")]
        Timeout,

        /// Effect bookkeeping channel closed
        #[error("Effect tracking channel closed")]
        ChannelClosed,
    }
}

pub use error::StoreError;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;

/// Guard that decrements the pending-effect count on drop, even if the
/// effect panics.
struct PendingGuard(watch::Sender<usize>);

impl PendingGuard {
    fn start(pending: &watch::Sender<usize>) -> Self {
        pending.send_modify(|n| *n += 1);
        Self(pending.clone())
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Store runtime for coordinating reducer execution and effect handling.
pub mod store {
    use super::{
        Arc, AtomicBool, Duration, Effect, Ordering, PendingGuard, Reducer, RwLock, StoreError,
    };
    use tokio::sync::{broadcast, watch};

    /// The Store - runtime coordinator for a reducer
    ///
    /// The Store manages:
    /// 1. State (behind `RwLock` for concurrent access)
    /// 2. Reducer (page logic)
    /// 3. Environment (injected dependencies)
    /// 4. Effect execution (with feedback loop)
    ///
    /// # Type Parameters
    ///
    /// - `S`: State type
    /// - `A`: Action type
    /// - `E`: Environment type
    /// - `R`: Reducer implementation
    pub struct Store<S, A, E, R>
    where
        R: Reducer<State = S, Action = A, Environment = E>,
    {
        state: Arc<RwLock<S>>,
        reducer: R,
        environment: E,
        shutdown: Arc<AtomicBool>,
        pending: watch::Sender<usize>,
        /// Actions produced by effects, for observers.
        action_broadcast: broadcast::Sender<A>,
    }

    impl<S, A, E, R> Store<S, A, E, R>
    where
        R: Reducer<State = S, Action = A, Environment = E> + Clone + Send + Sync + 'static,
        A: Send + Clone + 'static,
        S: Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
    {
        /// Create a new store with initial state, reducer, and environment
        #[must_use]
        pub fn new(initial_state: S, reducer: R, environment: E) -> Self {
            let (action_broadcast, _) = broadcast::channel(64);
            let (pending, _) = watch::channel(0);

            Self {
                state: Arc::new(RwLock::new(initial_state)),
                reducer,
                environment,
                shutdown: Arc::new(AtomicBool::new(false)),
                pending,
                action_broadcast,
            }
        }

        /// Send an action to the store
        ///
        /// 1. Acquires write lock on state
        /// 2. Calls reducer with (state, action, environment)
        /// 3. Starts the returned effects
        ///
        /// Returns once the effects are started, not completed; see
        /// [`Store::settle`].
        ///
        /// # Errors
        ///
        /// Returns [`StoreError::ShutdownInProgress`] if the store is shutting down.
        #[tracing::instrument(skip(self, action), name = "store_send")]
        pub async fn send(&self, action: A) -> Result<(), StoreError> {
            if self.shutdown.load(Ordering::Acquire) {
                tracing::warn!("Rejected action: store is shutting down");
                return Err(StoreError::ShutdownInProgress);
            }

            let effects = {
                let mut state = self.state.write().await;
                let span = tracing::trace_span!("reducer_execution");
                let _enter = span.enter();
                self.reducer.reduce(&mut *state, action, &self.environment)
            };

            tracing::trace!("Executing {} effects", effects.len());
            for effect in effects {
                self.execute_effect(effect);
            }
            Ok(())
        }

        /// Read current state via a closure
        ///
        /// ```ignore
        /// let count = store.state(|s| s.components.len()).await;
        /// ```
        pub async fn state<F, T>(&self, f: F) -> T
        where
            F: FnOnce(&S) -> T,
        {
            let state = self.state.read().await;
            f(&*state)
        }

        /// Mutate state outside the reducer (host-side setup only)
        pub async fn state_mut<F, T>(&self, f: F) -> T
        where
            F: FnOnce(&mut S) -> T,
        {
            let mut state = self.state.write().await;
            f(&mut *state)
        }

        /// Number of effects currently running (timers included)
        #[must_use]
        pub fn pending_effects(&self) -> usize {
            *self.pending.borrow()
        }

        /// Wait until no effect is running, including effects started by
        /// actions that effects fed back.
        ///
        /// # Errors
        ///
        /// Returns [`StoreError::ChannelClosed`] if the tracking channel closes.
        pub async fn settle(&self) -> Result<(), StoreError> {
            let mut rx = self.pending.subscribe();
            rx.wait_for(|n| *n == 0)
                .await
                .map(|_| ())
                .map_err(|_| StoreError::ChannelClosed)
        }

        /// [`Store::settle`] with a deadline
        ///
        /// # Errors
        ///
        /// Returns [`StoreError::Timeout`] when effects are still running at the deadline.
        pub async fn settle_within(&self, timeout: Duration) -> Result<(), StoreError> {
            tokio::time::timeout(timeout, self.settle())
                .await
                .map_err(|_| StoreError::Timeout)?
        }

        /// Subscribe to actions produced by effects
        #[must_use]
        pub fn subscribe_actions(&self) -> broadcast::Receiver<A> {
            self.action_broadcast.subscribe()
        }

        /// Stop accepting actions and wait for running effects.
        ///
        /// # Errors
        ///
        /// Returns [`StoreError::ShutdownTimeout`] if effects are still
        /// running when `timeout` expires.
        pub async fn shutdown(&self, timeout: Duration) -> Result<(), StoreError> {
            tracing::info!("Initiating graceful shutdown");
            self.shutdown.store(true, Ordering::Release);
            match self.settle_within(timeout).await {
                Ok(()) => {
                    tracing::info!("All effects completed, shutdown successful");
                    Ok(())
                },
                Err(StoreError::Timeout) => {
                    let pending = self.pending_effects();
                    tracing::error!(pending_effects = pending, "Shutdown timeout");
                    Err(StoreError::ShutdownTimeout(pending))
                },
                Err(other) => Err(other),
            }
        }

        /// Execute an effect
        ///
        /// - `None`: No-op
        /// - `Future`: Executes async computation, sends resulting action if `Some`
        /// - `Delay`: Waits for duration, then sends action
        /// - `Parallel`: Executes effects concurrently
        /// - `Sequential`: Executes effects in order, waiting for each to complete
        ///
        /// Effects feeding actions back after shutdown began are dropped with
        /// a debug log.
        fn execute_effect(&self, effect: Effect<A>) {
            match effect {
                Effect::None => {},
                Effect::Future(fut) => {
                    let guard = PendingGuard::start(&self.pending);
                    let store = self.clone();
                    tokio::spawn(async move {
                        let _guard = guard;
                        if let Some(action) = fut.await {
                            store.feed_back(action).await;
                        }
                    });
                },
                Effect::Delay { duration, action } => {
                    let guard = PendingGuard::start(&self.pending);
                    let store = self.clone();
                    tokio::spawn(async move {
                        let _guard = guard;
                        tokio::time::sleep(duration).await;
                        store.feed_back(*action).await;
                    });
                },
                Effect::Parallel(effects) => {
                    for effect in effects {
                        self.execute_effect(effect);
                    }
                },
                Effect::Sequential(effects) => {
                    let guard = PendingGuard::start(&self.pending);
                    let store = self.clone();
                    tokio::spawn(async move {
                        let _guard = guard;
                        for effect in effects {
                            store.run_to_completion(effect).await;
                        }
                    });
                },
            }
        }

        /// Run one effect inline, awaiting it and its direct feedback.
        fn run_to_completion(&self, effect: Effect<A>) -> futures::future::BoxFuture<'_, ()> {
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
                        futures::future::join_all(effects.into_iter().map(|e| self.run_to_completion(e))).await;
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
            let _ = self.action_broadcast.send(action.clone());
            if let Err(error) = self.send(action).await {
                tracing::debug!(%error, "Dropped effect feedback");
            }
        }
    }

    impl<S, A, E, R> Clone for Store<S, A, E, R>
    where
        R: Reducer<State = S, Action = A, Environment = E> + Clone,
        E: Clone,
    {
        fn clone(&self) -> Self {
            Self {
                state: Arc::clone(&self.state),
                reducer: self.reducer.clone(),
                environment: self.environment.clone(),
                shutdown: Arc::clone(&self.shutdown),
                pending: self.pending.clone(),
                action_broadcast: self.action_broadcast.clone(),
            }
        }
    }
}

pub use store::Store;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use raxm_core::{SmallVec, smallvec};

    #[derive(Debug, Clone)]
    struct TestState {
        value: i32,
    }

    #[derive(Debug, Clone)]
    enum TestAction {
        Increment,
        Decrement,
        ProduceEffect,
        ProduceDelayedAction,
        ProduceParallelEffects,
        ProduceSequentialEffects,
        ProducePanickingEffect,
    }

    #[derive(Debug, Clone)]
    struct TestEnv;

    #[derive(Debug, Clone)]
    struct TestReducer;

    impl Reducer for TestReducer {
        type State = TestState;
        type Action = TestAction;
        type Environment = TestEnv;

        fn reduce(
            &self,
            state: &mut Self::State,
            action: Self::Action,
            _env: &Self::Environment,
        ) -> SmallVec<[Effect<Self::Action>; 4]> {
            match action {
                TestAction::Increment => {
                    state.value += 1;
                    smallvec![Effect::None]
                },
                TestAction::Decrement => {
                    state.value -= 1;
                    smallvec![Effect::None]
                },
                TestAction::ProduceEffect => {
                    smallvec![Effect::Future(Box::pin(async { Some(TestAction::Increment) }))]
                },
                TestAction::ProduceDelayedAction => smallvec![Effect::Delay {
                    duration: Duration::from_millis(150),
                    action: Box::new(TestAction::Increment),
                }],
                TestAction::ProduceParallelEffects => smallvec![Effect::Parallel(vec![
                    Effect::Future(Box::pin(async { Some(TestAction::Increment) })),
                    Effect::Future(Box::pin(async { Some(TestAction::Increment) })),
                    Effect::Future(Box::pin(async { Some(TestAction::Increment) })),
                ])],
                TestAction::ProduceSequentialEffects => smallvec![Effect::Sequential(vec![
                    Effect::Future(Box::pin(async { Some(TestAction::Increment) })),
                    Effect::Future(Box::pin(async { Some(TestAction::Increment) })),
                    Effect::Future(Box::pin(async { Some(TestAction::Decrement) })),
                ])],
                #[allow(clippy::panic)] // Intentional panic for testing error handling
                TestAction::ProducePanickingEffect => smallvec![Effect::Future(Box::pin(async {
                    panic!("Intentional panic in effect for testing");
                }))],
            }
        }
    }

    fn store() -> Store<TestState, TestAction, TestEnv, TestReducer> {
        Store::new(TestState { value: 0 }, TestReducer, TestEnv)
    }

    #[tokio::test]
    async fn test_send_runs_reducer() {
        let store = store();
        store.send(TestAction::Increment).await.unwrap();
        store.send(TestAction::Increment).await.unwrap();
        assert_eq!(store.state(|s| s.value).await, 2);
    }

    #[tokio::test]
    async fn test_future_feedback_settles() {
        let store = store();
        store.send(TestAction::ProduceEffect).await.unwrap();
        store.settle().await.unwrap();
        assert_eq!(store.state(|s| s.value).await, 1);
        assert_eq!(store.pending_effects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_counts_as_pending_until_fired() {
        let store = store();
        store.send(TestAction::ProduceDelayedAction).await.unwrap();
        assert_eq!(store.pending_effects(), 1);
        store.settle().await.unwrap();
        assert_eq!(store.state(|s| s.value).await, 1);
    }

    #[tokio::test]
    async fn test_parallel_and_sequential() {
        let store = store();
        store.send(TestAction::ProduceParallelEffects).await.unwrap();
        store.settle().await.unwrap();
        assert_eq!(store.state(|s| s.value).await, 3);

        store.send(TestAction::ProduceSequentialEffects).await.unwrap();
        store.settle().await.unwrap();
        assert_eq!(store.state(|s| s.value).await, 4);
    }

    #[tokio::test]
    async fn test_panicking_effect_does_not_leak_pending_count() {
        let store = store();
        store.send(TestAction::ProducePanickingEffect).await.unwrap();
        store.settle_within(Duration::from_secs(1)).await.unwrap();
        store.send(TestAction::Increment).await.unwrap();
        assert_eq!(store.state(|s| s.value).await, 1);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_actions() {
        let store = store();
        store.shutdown(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(
            store.send(TestAction::Increment).await,
            Err(StoreError::ShutdownInProgress)
        ));
    }

    #[tokio::test]
    async fn test_effect_actions_are_broadcast() {
        let store = store();
        let mut rx = store.subscribe_actions();
        store.send(TestAction::ProduceEffect).await.unwrap();
        assert!(matches!(rx.recv().await.unwrap(), TestAction::Increment));
    }
}
