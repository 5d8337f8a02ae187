//! # Raxm Core
//!
//! Core traits and types for the Raxm reactive component runtime.
//!
//! Raxm keeps a server-owned component's data in sync with a fragment of the
//! browser document without full page reloads. This crate holds everything
//! that is pure data and pure logic; the runtime crate owns I/O.
//!
//! ## Core Concepts
//!
//! - **Document**: an arena of DOM nodes addressed by generational [`dom::NodeId`] handles
//! - **Directive**: a parsed `raxm:*` attribute (`raxm:model.lazy="name"`)
//! - **Action**: one pending server call (`callMethod`, `syncInput`, `fireEvent`)
//! - **Component**: fingerprint, data and server memo for one component root
//! - **Message**: the batch of actions sent in a single round trip
//! - **Hooks**: lifecycle publish/subscribe owned by a page
//! - **Morph**: reconciling a live subtree against freshly rendered HTML
//!
//! ## Architecture
//!
//! ```text
//! DOM event ──► directive ──► action ──► commit queue ──► connection
//!                                                            │
//!  hooks ◄── morph ◄── response (html + serverMemo) ◄────────┘
//! ```
//!
//! The page runtime is expressed as a [`reducer::Reducer`]: state changes are
//! synchronous, and the only asynchronous boundaries (debounce timers and the
//! network round trip) are described as [`effect::Effect`] values.

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
pub use smallvec::{SmallVec, smallvec};

pub mod action;
pub mod component;
pub mod directive;
pub mod dom;
pub mod hooks;
pub mod html;
pub mod message;
pub mod morph;

/// Reducer module - The core trait for state transitions
///
/// Reducers are pure functions: `(State, Action, Environment) → (State, Effects)`
pub mod reducer {
    use super::SmallVec;
    use super::effect::Effect;

    /// The Reducer trait - core abstraction for runtime logic
    ///
    /// # Type Parameters
    ///
    /// - `State`: The state this reducer operates on
    /// - `Action`: The action type this reducer processes
    /// - `Environment`: The injected dependencies this reducer needs
    ///
    /// # Example
    ///
    /// ```ignore
    /// impl Reducer for PageReducer {
    ///     type State = PageState;
    ///     type Action = PageAction;
    ///     type Environment = PageEnvironment;
    ///
    ///     fn reduce(
    ///         &self,
    ///         state: &mut PageState,
    ///         action: PageAction,
    ///         env: &PageEnvironment,
    ///     ) -> SmallVec<[Effect<PageAction>; 4]> {
    ///         match action {
    ///             PageAction::Flush { component } => { /* ... */ smallvec![Effect::None] }
    ///             _ => smallvec![Effect::None],
    ///         }
    ///     }
    /// }
    /// ```
    pub trait Reducer {
        /// The state type this reducer operates on
        type State;

        /// The action type this reducer processes
        type Action;

        /// The environment type with injected dependencies
        type Environment;

        /// Reduce an action into state changes and effects
        ///
        /// Updates state in place and returns effect descriptions to be
        /// executed by the runtime.
        fn reduce(
            &self,
            state: &mut Self::State,
            action: Self::Action,
            env: &Self::Environment,
        ) -> SmallVec<[Effect<Self::Action>; 4]>;
    }
}

/// Effect module - Side effect descriptions
///
/// Effects describe side effects to be performed by the runtime.
/// They are values (not execution).
pub mod effect {
    use std::future::Future;
    use std::pin::Pin;
    use std::time::Duration;

    /// Effect type - describes a side effect to be executed
    ///
    /// Effects are NOT executed immediately. They are descriptions of what should happen,
    /// returned from reducers and executed by the Store runtime.
    pub enum Effect<Action> {
        /// No-op effect
        None,

        /// Run effects in parallel
        Parallel(Vec<Effect<Action>>),

        /// Run effects sequentially
        Sequential(Vec<Effect<Action>>),

        /// Delayed action (debounce windows)
        Delay {
            /// How long to wait
            duration: Duration,
            /// Action to dispatch after delay
            action: Box<Action>,
        },

        /// Arbitrary async computation
        ///
        /// Returns `Option<Action>` - if Some, the action is fed back into the reducer
        Future(Pin<Box<dyn Future<Output = Option<Action>> + Send>>),
    }

    // Manual Debug implementation since Future doesn't implement Debug
    impl<Action> std::fmt::Debug for Effect<Action>
    where
        Action: std::fmt::Debug,
    {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Effect::None => write!(f, "Effect::None"),
                Effect::Parallel(effects) => {
                    f.debug_tuple("Effect::Parallel").field(effects).finish()
                },
                Effect::Sequential(effects) => {
                    f.debug_tuple("Effect::Sequential").field(effects).finish()
                },
                Effect::Delay { duration, action } => f
                    .debug_struct("Effect::Delay")
                    .field("duration", duration)
                    .field("action", action)
                    .finish(),
                Effect::Future(_) => write!(f, "Effect::Future(<future>)"),
            }
        }
    }

    impl<Action> Effect<Action> {
        /// Combine effects to run in parallel
        #[must_use]
        pub const fn merge(effects: Vec<Effect<Action>>) -> Effect<Action> {
            Effect::Parallel(effects)
        }

        /// Chain effects to run sequentially
        #[must_use]
        pub const fn chain(effects: Vec<Effect<Action>>) -> Effect<Action> {
            Effect::Sequential(effects)
        }

        /// Whether this effect does nothing
        #[must_use]
        pub const fn is_none(&self) -> bool {
            matches!(self, Effect::None)
        }
    }
}

/// Environment module - Dependency injection traits
///
/// All external dependencies are abstracted behind traits and injected
/// via the Environment parameter.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// Snapshot keys are derived from the clock, so tests use a fixed clock
    /// to get predictable keys.
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall clock backed by [`Utc::now`]
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
