//! Lifecycle hooks: an owned, per-page publish/subscribe bus.
//!
//! Subscribers run synchronously, in registration order, on the same call
//! stack as the event that triggered them. A subscriber that returns an error
//! or panics is logged and counted; the remaining subscribers still run.
//!
//! # Example
//!
//! ```
//! use raxm_core::hooks::{Hook, HookBus, HookContext};
//! use raxm_core::dom::Document;
//!
//! let mut bus = HookBus::new();
//! let id = bus.register(Hook::MessageSent, |ctx: &mut HookContext<'_>| {
//!     tracing::debug!(hook = %ctx.hook, "message on its way");
//!     Ok(())
//! });
//!
//! let mut document = Document::new();
//! let report = bus.call(&mut HookContext::new(Hook::MessageSent, &mut document));
//! assert_eq!(report.invoked, 1);
//! assert!(bus.unregister(id));
//! ```

use crate::component::Component;
use crate::dom::{Document, NodeId};
use crate::message::Message;
use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::str::FromStr;
use thiserror::Error;

/// Errors raised by hook registration or by subscribers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HookError {
    /// Hook name not recognised
    #[error("Unknown hook: {0}")]
    UnknownHook(String),

    /// A subscriber reported a failure
    #[error("Hook subscriber failed: {0}")]
    Failed(String),
}

/// Lifecycle points subscribers can attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    /// A component root was found and booted
    ComponentInitialized,
    /// An element inside a component had its directives bound
    ElementInitialized,
    /// A message left for the server
    MessageSent,
    /// A successful response arrived (after the patch is applied)
    MessageReceived,
    /// A message finished processing, successful or not
    MessageProcessed,
    /// A message failed (transport, server error, debug dump)
    MessageFailed,
    /// An element was removed from the document
    ElementRemoved,
}

impl Hook {
    /// Every hook, in lifecycle order
    pub const ALL: [Self; 7] = [
        Self::ComponentInitialized,
        Self::ElementInitialized,
        Self::MessageSent,
        Self::MessageReceived,
        Self::MessageProcessed,
        Self::MessageFailed,
        Self::ElementRemoved,
    ];

    /// Dotted hook name
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::ComponentInitialized => "component.initialized",
            Self::ElementInitialized => "element.initialized",
            Self::MessageSent => "message.sent",
            Self::MessageReceived => "message.received",
            Self::MessageProcessed => "message.processed",
            Self::MessageFailed => "message.failed",
            Self::ElementRemoved => "element.removed",
        }
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Hook {
    type Err = HookError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|hook| hook.name() == s)
            .ok_or_else(|| HookError::UnknownHook(s.to_string()))
    }
}

/// What a subscriber sees.
pub struct HookContext<'a> {
    /// The hook being called
    pub hook: Hook,
    /// The page document
    pub document: &'a mut Document,
    /// Component concerned, if any
    pub component: Option<&'a Component>,
    /// Message concerned, if any
    pub message: Option<&'a Message>,
    /// Element concerned, if any (may already be stale for `element.removed`)
    pub element: Option<NodeId>,
    /// Failure description for `message.failed`
    pub failure: Option<&'a str>,
}

impl<'a> HookContext<'a> {
    /// Context with only the document set
    pub fn new(hook: Hook, document: &'a mut Document) -> Self {
        Self {
            hook,
            document,
            component: None,
            message: None,
            element: None,
            failure: None,
        }
    }

    /// Attach a component
    #[must_use]
    pub const fn with_component(mut self, component: &'a Component) -> Self {
        self.component = Some(component);
        self
    }

    /// Attach a message
    #[must_use]
    pub const fn with_message(mut self, message: &'a Message) -> Self {
        self.message = Some(message);
        self
    }

    /// Attach an element
    #[must_use]
    pub const fn with_element(mut self, element: NodeId) -> Self {
        self.element = Some(element);
        self
    }

    /// Attach a failure description
    #[must_use]
    pub const fn with_failure(mut self, failure: &'a str) -> Self {
        self.failure = Some(failure);
        self
    }
}

/// Subscriber callback
pub type HookCallback = Box<dyn Fn(&mut HookContext<'_>) -> Result<(), HookError> + Send + Sync>;

/// Handle returned by [`HookBus::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Outcome of one [`HookBus::call`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HookReport {
    /// Subscribers invoked
    pub invoked: usize,
    /// Subscribers that returned an error or panicked
    pub failed: usize,
}

/// Per-page hook bus.
#[derive(Default)]
pub struct HookBus {
    subscribers: HashMap<Hook, Vec<(SubscriptionId, HookCallback)>>,
    next_id: u64,
}

impl fmt::Debug for HookBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<&str, usize> = self
            .subscribers
            .iter()
            .map(|(hook, subs)| (hook.name(), subs.len()))
            .collect();
        f.debug_struct("HookBus")
            .field("subscribers", &counts)
            .finish()
    }
}

impl HookBus {
    /// An empty bus
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to `hook`
    pub fn register<F>(&mut self, hook: Hook, callback: F) -> SubscriptionId
    where
        F: Fn(&mut HookContext<'_>) -> Result<(), HookError> + Send + Sync + 'static,
    {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.subscribers
            .entry(hook)
            .or_default()
            .push((id, Box::new(callback)));
        id
    }

    /// Subscribe by dotted name (`"message.sent"`)
    ///
    /// # Errors
    ///
    /// Returns [`HookError::UnknownHook`] for unrecognised names.
    pub fn register_named<F>(&mut self, name: &str, callback: F) -> Result<SubscriptionId, HookError>
    where
        F: Fn(&mut HookContext<'_>) -> Result<(), HookError> + Send + Sync + 'static,
    {
        let hook = name.parse()?;
        Ok(self.register(hook, callback))
    }

    /// Drop one subscription; returns whether it existed
    pub fn unregister(&mut self, id: SubscriptionId) -> bool {
        for subs in self.subscribers.values_mut() {
            if let Some(pos) = subs.iter().position(|(sid, _)| *sid == id) {
                drop(subs.remove(pos));
                return true;
            }
        }
        false
    }

    /// Drop every subscription
    pub fn clear(&mut self) {
        self.subscribers.clear();
    }

    /// Subscribers currently attached to `hook`
    #[must_use]
    pub fn subscriber_count(&self, hook: Hook) -> usize {
        self.subscribers.get(&hook).map_or(0, Vec::len)
    }

    /// Invoke every subscriber of `ctx.hook`, in registration order.
    pub fn call(&self, ctx: &mut HookContext<'_>) -> HookReport {
        let mut report = HookReport::default();
        let Some(subs) = self.subscribers.get(&ctx.hook) else {
            return report;
        };
        for (id, callback) in subs {
            report.invoked += 1;
            match catch_unwind(AssertUnwindSafe(|| callback(ctx))) {
                Ok(Ok(())) => {},
                Ok(Err(error)) => {
                    report.failed += 1;
                    tracing::warn!(hook = %ctx.hook, subscription = ?id, %error, "Hook subscriber failed");
                },
                Err(_) => {
                    report.failed += 1;
                    tracing::error!(hook = %ctx.hook, subscription = ?id, "Hook subscriber panicked");
                },
            }
        }
        report
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder(bus: &mut HookBus, hook: Hook, log: &Arc<Mutex<Vec<&'static str>>>, tag: &'static str) {
        let log = Arc::clone(log);
        bus.register(hook, move |_ctx| {
            log.lock().unwrap().push(tag);
            Ok(())
        });
    }

    #[test]
    fn test_subscribers_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bus = HookBus::new();
        recorder(&mut bus, Hook::MessageSent, &log, "a");
        recorder(&mut bus, Hook::MessageSent, &log, "b");
        recorder(&mut bus, Hook::MessageFailed, &log, "other");

        let mut doc = Document::new();
        let report = bus.call(&mut HookContext::new(Hook::MessageSent, &mut doc));
        assert_eq!(report, HookReport { invoked: 2, failed: 0 });
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_failures_are_isolated() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bus = HookBus::new();
        bus.register(Hook::MessageReceived, |_| Err(HookError::Failed("boom".into())));
        bus.register(Hook::MessageReceived, |_| panic!("subscriber bug"));
        recorder(&mut bus, Hook::MessageReceived, &log, "survivor");

        let mut doc = Document::new();
        let report = bus.call(&mut HookContext::new(Hook::MessageReceived, &mut doc));
        assert_eq!(report, HookReport { invoked: 3, failed: 2 });
        assert_eq!(*log.lock().unwrap(), vec!["survivor"]);
    }

    #[test]
    fn test_subscribers_can_mutate_the_document() {
        let mut bus = HookBus::new();
        bus.register(Hook::ElementRemoved, |ctx| {
            let root = ctx.document.root();
            let marker = ctx.document.create_comment("removed");
            ctx.document
                .append_child(root, marker)
                .map_err(|e| HookError::Failed(e.to_string()))
        });
        let mut doc = Document::new();
        bus.call(&mut HookContext::new(Hook::ElementRemoved, &mut doc));
        assert_eq!(doc.children(doc.root()).len(), 1);
    }

    #[test]
    fn test_named_registration_and_disposal() {
        let mut bus = HookBus::new();
        let id = bus.register_named("element.removed", |_| Ok(())).unwrap();
        assert_eq!(bus.subscriber_count(Hook::ElementRemoved), 1);
        assert_eq!(
            bus.register_named("element.exploded", |_| Ok(())),
            Err(HookError::UnknownHook("element.exploded".into()))
        );
        assert!(bus.unregister(id));
        assert!(!bus.unregister(id));
        bus.register(Hook::MessageSent, |_| Ok(()));
        bus.clear();
        assert_eq!(bus.subscriber_count(Hook::MessageSent), 0);
    }

    #[test]
    fn test_hook_names_round_trip() {
        for hook in Hook::ALL {
            assert_eq!(hook.name().parse::<Hook>().unwrap(), hook);
        }
    }
}
