//! Per-component commit queue.
//!
//! Actions wait here until a flush turns them into one [`Message`]. A
//! component never has more than one message in flight: a flush requested
//! while one is outstanding is remembered and replayed when the response
//! lands.
//!
//! Batch order: deferred actions first, in the order they were deferred,
//! then the pending actions in the order they were enqueued. Re-deferring or
//! re-debouncing the same property replaces the earlier entry in place, so
//! only the last value is sent and it keeps its original position.

use raxm_core::action::{Action, ActionKind};
use raxm_core::message::{Message, MessageId};
use std::time::{Duration, Instant};

/// When an enqueued action should go out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timing {
    /// On the next tick, batched with anything else raised before it
    Immediate,
    /// After the window passes without another action for the same target
    Debounce(Duration),
    /// With the next non-deferred flush of the component
    Defer,
}

/// A message waiting for its response.
#[derive(Debug, Clone)]
pub struct InFlight {
    /// What was sent
    pub message: Message,
    /// When it was sent
    pub sent_at: Instant,
}

/// Actions buffered for one component.
#[derive(Debug, Default)]
pub struct CommitQueue {
    deferred: Vec<Action>,
    pending: Vec<Action>,
    debounce_generation: u64,
    in_flight: Option<InFlight>,
    flush_requested: bool,
    tick_scheduled: bool,
}

/// The slot an action occupies for replacement purposes.
fn slot_of(action: &Action) -> Option<(&'static str, &str)> {
    match &action.kind {
        ActionKind::SyncInput { name, .. } | ActionKind::DeferredSyncInput { name, .. } => {
            Some(("property", name))
        },
        ActionKind::CallMethod { method, .. } => Some(("method", method)),
        ActionKind::FireEvent { .. } => None,
    }
}

fn replace_or_push(list: &mut Vec<Action>, action: Action, replace_calls: bool) {
    let slot = slot_of(&action).filter(|(kind, _)| replace_calls || *kind == "property");
    if let Some(slot) = slot {
        if let Some(existing) = list.iter_mut().find(|a| slot_of(a) == Some(slot)) {
            *existing = action;
            return;
        }
    }
    list.push(action);
}

impl CommitQueue {
    /// An empty queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold an action until the next non-deferred flush
    pub fn defer(&mut self, action: Action) {
        replace_or_push(&mut self.deferred, action, false);
    }

    /// Queue an action for the next flush; a model update replaces a queued
    /// update of the same property
    pub fn push(&mut self, action: Action) {
        replace_or_push(&mut self.pending, action, false);
    }

    /// Queue a debounced action and start a new debounce window.
    ///
    /// Replaces a queued action with the same property or method. Returns
    /// the generation the window's timer must present to flush.
    pub fn push_debounced(&mut self, action: Action) -> u64 {
        replace_or_push(&mut self.pending, action, true);
        self.debounce_generation += 1;
        self.debounce_generation
    }

    /// Whether a debounce timer is still the latest one
    #[must_use]
    pub const fn is_current_debounce(&self, generation: u64) -> bool {
        self.debounce_generation == generation
    }

    /// Mark a tick flush as scheduled; `false` if one already is
    pub fn schedule_tick(&mut self) -> bool {
        !std::mem::replace(&mut self.tick_scheduled, true)
    }

    /// Take the next batch, if one may be sent now.
    ///
    /// Returns `None` when nothing non-deferred is pending, or when a message
    /// is in flight (the flush is then replayed by [`CommitQueue::complete`]).
    pub fn take_batch(&mut self) -> Option<Vec<Action>> {
        self.tick_scheduled = false;
        if self.in_flight.is_some() {
            if !self.pending.is_empty() {
                self.flush_requested = true;
            }
            return None;
        }
        if self.pending.is_empty() {
            return None;
        }
        // Any debounce timer still running now has nothing to flush.
        self.debounce_generation += 1;
        let mut batch = std::mem::take(&mut self.deferred);
        batch.append(&mut self.pending);
        Some(batch)
    }

    /// Record a message as sent
    pub fn begin(&mut self, message: Message) {
        self.in_flight = Some(InFlight {
            message,
            sent_at: Instant::now(),
        });
    }

    /// Close the in-flight message `id`.
    ///
    /// Returns the message and whether a flush was requested meanwhile, or
    /// `None` when `id` isn't the message in flight.
    pub fn complete(&mut self, id: MessageId) -> Option<(InFlight, bool)> {
        if self.in_flight.as_ref().map(|f| f.message.id) != Some(id) {
            return None;
        }
        let in_flight = self.in_flight.take()?;
        let replay = std::mem::take(&mut self.flush_requested);
        Some((in_flight, replay))
    }

    /// Drop everything queued (the page is navigating away)
    pub fn abandon(&mut self) {
        self.deferred.clear();
        self.pending.clear();
        self.flush_requested = false;
        self.debounce_generation += 1;
    }

    /// Message in flight
    #[must_use]
    pub fn in_flight(&self) -> Option<&Message> {
        self.in_flight.as_ref().map(|f| &f.message)
    }

    /// Actions waiting for the next flush
    #[must_use]
    pub fn pending(&self) -> &[Action] {
        &self.pending
    }

    /// Actions waiting for a non-deferred flush
    #[must_use]
    pub fn deferred(&self) -> &[Action] {
        &self.deferred
    }

    /// Whether an unsent update for `property` is queued
    #[must_use]
    pub fn has_unsent(&self, property: &str) -> bool {
        self.pending
            .iter()
            .chain(&self.deferred)
            .any(|a| a.property() == Some(property))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use raxm_core::component::ComponentId;
    use serde_json::json;

    fn message(id: u64, actions: Vec<Action>) -> Message {
        Message {
            id: MessageId(id),
            component: ComponentId::new("c1"),
            actions,
        }
    }

    #[test]
    fn test_same_property_replaces_in_place() {
        let mut queue = CommitQueue::new();
        queue.push(Action::sync_input("q", json!("a")));
        queue.push(Action::call_method("search", vec![]));
        queue.push(Action::sync_input("q", json!("abc")));
        let batch = queue.take_batch().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].model_value(), Some(&json!("abc")));
        assert_eq!(batch[1].method(), Some("search"));
    }

    #[test]
    fn test_method_calls_stack_unless_debounced() {
        let mut queue = CommitQueue::new();
        queue.push(Action::call_method("inc", vec![]));
        queue.push(Action::call_method("inc", vec![]));
        assert_eq!(queue.pending().len(), 2);

        let mut queue = CommitQueue::new();
        queue.push_debounced(Action::call_method("search", vec![json!(1)]));
        queue.push_debounced(Action::call_method("search", vec![json!(2)]));
        assert_eq!(queue.pending().len(), 1);
    }

    #[test]
    fn test_deferred_alone_never_flushes() {
        let mut queue = CommitQueue::new();
        queue.defer(Action::deferred_sync_input("title", json!("a")));
        assert!(queue.take_batch().is_none());
        assert_eq!(queue.deferred().len(), 1);
    }

    #[test]
    fn test_deferred_go_first_in_deferral_order() {
        let mut queue = CommitQueue::new();
        queue.defer(Action::deferred_sync_input("title", json!("a")));
        queue.defer(Action::deferred_sync_input("body", json!("b")));
        queue.defer(Action::deferred_sync_input("title", json!("c")));
        queue.push(Action::call_method("save", vec![]));

        let batch = queue.take_batch().unwrap();
        let order: Vec<_> = batch
            .iter()
            .map(|a| a.property().or(a.method()).unwrap())
            .collect();
        assert_eq!(order, ["title", "body", "save"]);
        assert_eq!(batch[0].model_value(), Some(&json!("c")));
        assert!(queue.deferred().is_empty());
    }

    #[test]
    fn test_flush_while_in_flight_is_replayed() {
        let mut queue = CommitQueue::new();
        queue.push(Action::call_method("one", vec![]));
        let first = queue.take_batch().unwrap();
        queue.begin(message(1, first));

        queue.push(Action::call_method("two", vec![]));
        assert!(queue.take_batch().is_none());

        assert!(queue.complete(MessageId(99)).is_none());
        let (done, replay) = queue.complete(MessageId(1)).unwrap();
        assert_eq!(done.message.id, MessageId(1));
        assert!(replay);
        assert_eq!(queue.take_batch().unwrap()[0].method(), Some("two"));
    }

    #[test]
    fn test_debounce_generations() {
        let mut queue = CommitQueue::new();
        let first = queue.push_debounced(Action::sync_input("q", json!("a")));
        let second = queue.push_debounced(Action::sync_input("q", json!("ab")));
        assert!(!queue.is_current_debounce(first));
        assert!(queue.is_current_debounce(second));
        queue.take_batch().unwrap();
        assert!(!queue.is_current_debounce(second));
    }

    #[test]
    fn test_tick_scheduled_once_until_flush() {
        let mut queue = CommitQueue::new();
        assert!(queue.schedule_tick());
        assert!(!queue.schedule_tick());
        let _ = queue.take_batch();
        assert!(queue.schedule_tick());
    }

    #[test]
    fn test_abandon_clears_everything_queued() {
        let mut queue = CommitQueue::new();
        queue.defer(Action::deferred_sync_input("a", json!(1)));
        queue.push(Action::sync_input("b", json!(2)));
        assert!(queue.has_unsent("a"));
        queue.abandon();
        assert!(!queue.has_unsent("a"));
        assert!(!queue.has_unsent("b"));
        assert!(queue.take_batch().is_none());
    }
}
