//! The page: one document, its components, and the reducer that drives them.
//!
//! [`Page`] wraps a [`Store`] running [`PageReducer`]. Every DOM event, timer
//! and response is a [`PageAction`]; state changes happen synchronously in
//! the reducer, and the only asynchronous work (debounce timers, tick
//! flushes, the network round trip) is returned as effects.
//!
//! Per component, at most one message is in flight. A flush requested while
//! one is outstanding is replayed when its response has been applied.

use crate::config::{ConfigError, RuntimeConfig};
use crate::connection::{Connection, ConnectionError, ConnectionOutcome, ReqwestTransport, Transport};
use crate::directives::{self, DEFAULT_CONFIRM, Invocation};
use crate::metrics::MessageMetrics;
use crate::queue::{CommitQueue, Timing};
use crate::snapshot::{InMemorySessionStorage, SessionStorage, SnapshotStore, StorageError};
use crate::{Store, StoreError};
use raxm_core::action::Action;
use raxm_core::component::{Component, ComponentError, ComponentId, ID_ATTRIBUTE};
use raxm_core::directive::{DirectiveKind, DirectiveRegistry, Directives};
use raxm_core::dom::{Document, DomError, NodeId};
use raxm_core::effect::Effect;
use raxm_core::environment::{Clock, SystemClock};
use raxm_core::hooks::{Hook, HookBus, HookContext, HookError, SubscriptionId};
use raxm_core::message::{Emit, Message, MessageId, ResponsePayload};
use raxm_core::morph::{MorphOptions, MorphReport, morph};
use raxm_core::reducer::Reducer;
use raxm_core::{SmallVec, smallvec};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use crate::directives::DomEvent;

/// Prompt shown on the first 419 of a page's lifetime
pub const SESSION_EXPIRED_PROMPT: &str = "This page has expired.\nWould you like to refresh the page?";

/// Browser-side effects the page cannot perform itself.
///
/// Calls are made synchronously from the reducer.
pub trait UiHost: Send + Sync {
    /// Ask the user to confirm `message`
    fn confirm(&self, message: &str) -> bool;

    /// Leave the page for `url`
    fn navigate(&self, url: &str);

    /// Show a response body (error page, debug dump) in a modal
    fn show_error_modal(&self, body: &str);

    /// Reload the page
    fn reload(&self);

    /// The session or CSRF token expired. Called once per page.
    fn session_expired(&self) {
        if self.confirm(SESSION_EXPIRED_PROMPT) {
            self.reload();
        }
    }
}

/// Errors surfaced to the host.
#[derive(Error, Debug)]
pub enum PageError {
    /// Invalid configuration or missing CSRF token
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Structural DOM problem (stale handle, directive outside a component)
    #[error(transparent)]
    Dom(#[from] DomError),

    /// A component root could not be booted
    #[error(transparent)]
    Component(#[from] ComponentError),

    /// The store rejected the action
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Snapshot storage failed
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The HTTP transport could not be built
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// No component with this id is on the page
    #[error("Unknown component {0}")]
    UnknownComponent(ComponentId),
}

/// Host-provided services a page runs against.
pub struct HostServices {
    /// Sends requests
    pub transport: Arc<dyn Transport>,
    /// Prompts, modals, navigation
    pub ui: Arc<dyn UiHost>,
    /// Clock for snapshot keys
    pub clock: Arc<dyn Clock>,
    /// Session storage for snapshots
    pub storage: Arc<dyn SessionStorage>,
    /// Hooks registered before boot (they see the boot itself)
    pub hooks: HookBus,
}

impl HostServices {
    /// Services with a system clock, in-memory storage and no hooks
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, ui: Arc<dyn UiHost>) -> Self {
        Self {
            transport,
            ui,
            clock: Arc::new(SystemClock),
            storage: Arc::new(InMemorySessionStorage::default()),
            hooks: HookBus::new(),
        }
    }

    /// Replace the clock
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the session storage
    #[must_use]
    pub fn with_storage(mut self, storage: Arc<dyn SessionStorage>) -> Self {
        self.storage = storage;
        self
    }

    /// Use `hooks` from boot on
    #[must_use]
    pub fn with_hooks(mut self, hooks: HookBus) -> Self {
        self.hooks = hooks;
        self
    }
}

/// Dependencies of the page reducer.
#[derive(Clone)]
pub struct PageEnvironment {
    connection: Arc<Connection>,
    ui: Arc<dyn UiHost>,
    snapshots: SnapshotStore,
    config: Arc<RuntimeConfig>,
}

impl PageEnvironment {
    /// Bundle the reducer's dependencies
    #[must_use]
    pub fn new(connection: Connection, ui: Arc<dyn UiHost>, snapshots: SnapshotStore, config: RuntimeConfig) -> Self {
        Self {
            connection: Arc::new(connection),
            ui,
            snapshots,
            config: Arc::new(config),
        }
    }

    /// Snapshot store
    #[must_use]
    pub const fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }
}

/// Everything that happens to a page.
#[derive(Debug, Clone)]
pub enum PageAction {
    /// Bind every component and directive in the document
    Initialize,
    /// The host saw a DOM event on `target`
    Dispatch {
        /// Event target
        target: NodeId,
        /// The event
        event: DomEvent,
    },
    /// Queue an action on a component
    Enqueue {
        /// Target component
        component: ComponentId,
        /// The action
        action: Action,
        /// When it should go out
        timing: Timing,
    },
    /// A debounce window closed
    DebounceElapsed {
        /// Component whose window it was
        component: ComponentId,
        /// Window generation; stale windows do nothing
        generation: u64,
    },
    /// Send whatever the component has queued
    Flush {
        /// Component to flush
        component: ComponentId,
    },
    /// A round trip finished
    ResponseArrived {
        /// Component the message was for
        component: ComponentId,
        /// Which message
        message: MessageId,
        /// What came back
        outcome: ConnectionOutcome,
    },
    /// The host removed an element (and its subtree)
    RemoveElement(NodeId),
}

#[derive(Debug)]
struct ComponentSlot {
    component: Component,
    queue: CommitQueue,
    initialized: bool,
}

impl ComponentSlot {
    fn new(component: Component) -> Self {
        Self {
            component,
            queue: CommitQueue::new(),
            initialized: false,
        }
    }
}

/// Page state owned by the store.
#[derive(Debug)]
pub struct PageState {
    document: Document,
    registry: DirectiveRegistry,
    components: BTreeMap<ComponentId, ComponentSlot>,
    directives: HashMap<NodeId, Directives>,
    bind_counts: HashMap<NodeId, usize>,
    hooks: HookBus,
    session_expired: bool,
    next_message: u64,
}

/// Directives that only make sense inside a component root
fn needs_component(directives: &Directives) -> bool {
    directives.iter().any(|d| {
        !matches!(
            d.kind,
            DirectiveKind::Navigate | DirectiveKind::Ignore | DirectiveKind::Key | DirectiveKind::Id | DirectiveKind::InitialData
        )
    })
}

/// Nearest enclosing component root, inclusive
fn owner_root(document: &Document, node: NodeId) -> Option<NodeId> {
    document.closest(node, |_, el| el.attribute(ID_ATTRIBUTE).is_some())
}

impl PageState {
    /// Build page state from a parsed document.
    ///
    /// # Errors
    ///
    /// Returns [`PageError::Component`] when a component root doesn't boot,
    /// and [`DomError::MissingComponent`] for a directive element outside
    /// every component root.
    pub fn new(document: Document, hooks: HookBus) -> Result<Self, PageError> {
        let registry = DirectiveRegistry::with_defaults();
        let mut components = BTreeMap::new();
        for root in document.find_by_attribute(document.root(), ID_ATTRIBUTE) {
            let component = Component::from_root(&document, root)?;
            if components.contains_key(component.id()) {
                tracing::warn!(component = %component.id(), "Duplicate component id; the later root wins");
            }
            components.insert(component.id().clone(), ComponentSlot::new(component));
        }
        for node in document.descendants(document.root()) {
            if needs_component(&registry.resolve(&document, node)) && owner_root(&document, node).is_none() {
                return Err(DomError::MissingComponent {
                    element: document.describe(node),
                }
                .into());
            }
        }
        Ok(Self {
            document,
            registry,
            components,
            directives: HashMap::new(),
            bind_counts: HashMap::new(),
            hooks,
            session_expired: false,
            next_message: 0,
        })
    }

    /// The live document
    #[must_use]
    pub const fn document(&self) -> &Document {
        &self.document
    }

    /// Component by id
    #[must_use]
    pub fn component(&self, id: &ComponentId) -> Option<&Component> {
        self.components.get(id).map(|s| &s.component)
    }

    /// Ids of all live components
    #[must_use]
    pub fn component_ids(&self) -> Vec<ComponentId> {
        self.components.keys().cloned().collect()
    }

    /// Component owning `node`
    #[must_use]
    pub fn owner(&self, node: NodeId) -> Option<ComponentId> {
        let root = owner_root(&self.document, node)?;
        let id = ComponentId::new(self.document.attribute(root, ID_ATTRIBUTE)?);
        self.components
            .get(&id)
            .is_some_and(|s| s.component.root() == root)
            .then_some(id)
    }

    /// How many times listeners were bound to `node`
    #[must_use]
    pub fn binding_count(&self, node: NodeId) -> usize {
        self.bind_counts.get(&node).copied().unwrap_or(0)
    }

    /// Directives bound on `node`
    #[must_use]
    pub fn directives(&self, node: NodeId) -> Option<&Directives> {
        self.directives.get(&node)
    }

    /// Whether a 419 has been seen
    #[must_use]
    pub const fn is_session_expired(&self) -> bool {
        self.session_expired
    }

    /// Message in flight for a component
    #[must_use]
    pub fn in_flight(&self, id: &ComponentId) -> Option<&Message> {
        self.components.get(id).and_then(|s| s.queue.in_flight())
    }

    /// Actions waiting for a component's next flush
    #[must_use]
    pub fn pending(&self, id: &ComponentId) -> &[Action] {
        self.components.get(id).map_or(&[], |s| s.queue.pending())
    }

    /// Deferred actions of a component
    #[must_use]
    pub fn deferred(&self, id: &ComponentId) -> &[Action] {
        self.components.get(id).map_or(&[], |s| s.queue.deferred())
    }

    /// First element whose attribute `name` equals `value`
    #[must_use]
    pub fn query(&self, name: &str, value: &str) -> Option<NodeId> {
        self.document
            .find_by_attribute(self.document.root(), name)
            .into_iter()
            .find(|&n| self.document.attribute(n, name) == Some(value))
    }

    /// Serialized page body
    #[must_use]
    pub fn html(&self) -> String {
        self.document.inner_html(self.document.root())
    }

    fn check_target(&self, target: NodeId) -> Result<(), PageError> {
        if !self.document.contains(target) {
            return Err(DomError::Stale(target).into());
        }
        let navigates = self.document.closest(target, |n, _| {
            self.directives.get(&n).is_some_and(|d| d.has(DirectiveKind::Navigate))
        });
        if self.owner(target).is_none() && navigates.is_none() {
            return Err(DomError::MissingComponent {
                element: self.document.describe(target),
            }
            .into());
        }
        Ok(())
    }
}

fn fire(
    hooks: &HookBus,
    document: &mut Document,
    hook: Hook,
    component: Option<&Component>,
    message: Option<&Message>,
    element: Option<NodeId>,
    failure: Option<&str>,
) {
    let mut ctx = HookContext::new(hook, document);
    if let Some(component) = component {
        ctx = ctx.with_component(component);
    }
    if let Some(message) = message {
        ctx = ctx.with_message(message);
    }
    if let Some(element) = element {
        ctx = ctx.with_element(element);
    }
    if let Some(failure) = failure {
        ctx = ctx.with_failure(failure);
    }
    let report = hooks.call(&mut ctx);
    if report.failed > 0 {
        tracing::debug!(hook = %hook, failed = report.failed, "Hook subscribers failed");
    }
}

fn tick_flush(component: ComponentId) -> Effect<PageAction> {
    Effect::Future(Box::pin(async move {
        tokio::task::yield_now().await;
        Some(PageAction::Flush { component })
    }))
}

type Effects = SmallVec<[Effect<PageAction>; 4]>;

/// The page reducer.
#[derive(Debug, Clone, Copy, Default)]
pub struct PageReducer;

impl PageReducer {
    /// Bind components and directives found among `nodes`.
    fn bind_nodes(state: &mut PageState, nodes: &[NodeId], effects: &mut Effects) {
        let mut touched: Vec<ComponentId> = Vec::new();

        for &node in nodes {
            let Some(id) = state.document.attribute(node, ID_ATTRIBUTE).map(ComponentId::new) else {
                continue;
            };
            let known = state.components.get(&id).is_some_and(|s| s.component.root() == node);
            if !known {
                match Component::from_root(&state.document, node) {
                    Ok(component) => {
                        state.components.insert(id.clone(), ComponentSlot::new(component));
                    },
                    Err(error) => {
                        tracing::warn!(%error, "Skipping component that failed to boot");
                        continue;
                    },
                }
            }
            if let Some(slot) = state.components.get_mut(&id) {
                if !slot.initialized {
                    slot.initialized = true;
                    tracing::debug!(component = %id, name = slot.component.name(), "Component initialized");
                    fire(
                        &state.hooks,
                        &mut state.document,
                        Hook::ComponentInitialized,
                        Some(&slot.component),
                        None,
                        Some(node),
                        None,
                    );
                }
            }
        }

        for &node in nodes {
            if !state.document.is_element(node) || state.directives.contains_key(&node) {
                continue;
            }
            let found = state.registry.resolve(&state.document, node);
            if found.is_empty() {
                continue;
            }
            let owner = state.owner(node);
            if owner.is_none() && needs_component(&found) {
                let error = DomError::MissingComponent {
                    element: state.document.describe(node),
                };
                tracing::warn!(%error, "Skipping element");
                continue;
            }
            let init = found.get(DirectiveKind::Init).cloned();
            let model = found.get(DirectiveKind::Model).map(|m| m.value.clone());
            *state.bind_counts.entry(node).or_insert(0) += 1;
            state.directives.insert(node, found);

            let Some(owner) = owner else { continue };
            if let Some(path) = model {
                Self::sync_control(state, &owner, node, &path);
            }
            let component = state.components.get(&owner).map(|s| &s.component);
            fire(
                &state.hooks,
                &mut state.document,
                Hook::ElementInitialized,
                component,
                None,
                Some(node),
                None,
            );
            if let Some(init) = init.filter(|i| !i.value.is_empty()) {
                let action = Action::call_method(init.value, init.params).from_element(node);
                Self::enqueue(state, &owner, action, Timing::Immediate, effects);
            }
            if !touched.contains(&owner) {
                touched.push(owner);
            }
        }

        for id in &touched {
            Self::refresh_states(state, id);
        }
    }

    /// Show the component's value in a model control the user isn't editing.
    fn sync_control(state: &mut PageState, id: &ComponentId, node: NodeId, path: &str) {
        if state.document.focused() == Some(node) {
            return;
        }
        let Some(slot) = state.components.get(id) else { return };
        if let Err(error) = directives::sync_model_control(&mut state.document, node, &slot.component, path) {
            tracing::warn!(%error, "Could not sync model control");
        }
    }

    /// Re-sync every model control of a component except `skip`.
    fn sync_models(state: &mut PageState, id: &ComponentId, skip: &HashSet<NodeId>) {
        let Some(root) = state.components.get(id).map(|s| s.component.root()) else {
            return;
        };
        let document = &state.document;
        let models: Vec<(NodeId, String)> = state
            .directives
            .iter()
            .filter(|(node, _)| !skip.contains(*node) && owner_root(document, **node) == Some(root))
            .filter_map(|(node, found)| Some((*node, found.get(DirectiveKind::Model)?.value.clone())))
            .collect();
        for (node, path) in models {
            Self::sync_control(state, id, node, &path);
        }
    }

    /// Forget freed handles and components whose root went with them.
    fn forget_removed(state: &mut PageState, removed: &[NodeId]) {
        for &node in removed {
            state.bind_counts.remove(&node);
            if state.directives.remove(&node).is_some() {
                fire(
                    &state.hooks,
                    &mut state.document,
                    Hook::ElementRemoved,
                    None,
                    None,
                    Some(node),
                    None,
                );
            }
        }
        let document = &state.document;
        state.components.retain(|id, slot| {
            let alive = document.contains(slot.component.root());
            if !alive {
                tracing::debug!(component = %id, "Component destroyed");
            }
            alive
        });
    }

    /// Re-apply `raxm:loading` and `raxm:dirty` for a component.
    fn refresh_states(state: &mut PageState, id: &ComponentId) {
        let Some(slot) = state.components.get(id) else {
            return;
        };
        let root = slot.component.root();
        let document = &state.document;
        let owned: Vec<NodeId> = state
            .directives
            .keys()
            .copied()
            .filter(|&n| owner_root(document, n) == Some(root))
            .collect();
        let models: Vec<(NodeId, String)> = owned
            .iter()
            .filter_map(|&n| {
                let model = state.directives.get(&n)?.get(DirectiveKind::Model)?;
                Some((n, model.value.clone()))
            })
            .collect();

        for node in owned {
            let Some(found) = state.directives.get(&node) else { continue };
            if found.has(DirectiveKind::Loading) {
                if let Err(error) = directives::apply_loading(&mut state.document, node, found, slot.queue.in_flight()) {
                    tracing::warn!(%error, "Could not apply loading state");
                }
            }
            if found.has(DirectiveKind::Dirty) {
                let component = &slot.component;
                let document = &state.document;
                let dirty = directives::dirty_properties(found).iter().any(|property| {
                    models.iter().filter(|(_, p)| p == property).any(|&(model, _)| {
                        directives::model_value(document, model, component, property)
                            .is_some_and(|v| !directives::same_value(&v, component.get(property)))
                    })
                });
                if let Err(error) = directives::apply_dirty(&mut state.document, node, found, dirty) {
                    tracing::warn!(%error, "Could not apply dirty state");
                }
            }
        }
    }

    fn enqueue(
        state: &mut PageState,
        id: &ComponentId,
        action: Action,
        timing: Timing,
        effects: &mut Effects,
    ) {
        let Some(slot) = state.components.get_mut(id) else {
            tracing::warn!(component = %id, "Dropping action for unknown component");
            return;
        };
        if let (Some(property), Some(value)) = (action.property(), action.model_value()) {
            slot.component.set_deferred(property.to_string(), value.clone());
        }
        tracing::trace!(component = %id, ?timing, "Action queued");
        match timing {
            Timing::Defer => slot.queue.defer(action),
            Timing::Immediate => {
                slot.queue.push(action);
                if slot.queue.schedule_tick() {
                    effects.push(tick_flush(id.clone()));
                }
            },
            Timing::Debounce(duration) => {
                let generation = slot.queue.push_debounced(action);
                effects.push(Effect::Delay {
                    duration,
                    action: Box::new(PageAction::DebounceElapsed {
                        component: id.clone(),
                        generation,
                    }),
                });
            },
        }
        Self::refresh_states(state, id);
    }

    fn flush(state: &mut PageState, env: &PageEnvironment, id: &ComponentId, effects: &mut Effects) {
        let Some(slot) = state.components.get_mut(id) else {
            return;
        };
        let Some(actions) = slot.queue.take_batch() else {
            tracing::trace!(component = %id, "Nothing to flush");
            return;
        };
        state.next_message += 1;
        let message = Message {
            id: MessageId(state.next_message),
            component: id.clone(),
            actions,
        };
        let payload = message.payload(&slot.component);
        let name = slot.component.name().to_string();
        slot.queue.begin(message.clone());

        MessageMetrics::record_sent(&name);
        tracing::debug!(
            component = %id,
            message = %message.id,
            updates = message.actions.len(),
            "Message sent"
        );
        fire(
            &state.hooks,
            &mut state.document,
            Hook::MessageSent,
            Some(&slot.component),
            Some(&message),
            None,
            None,
        );
        Self::refresh_states(state, id);

        let connection = Arc::clone(&env.connection);
        let component = id.clone();
        let message_id = message.id;
        effects.push(Effect::Future(Box::pin(async move {
            let outcome = connection.send(&name, &payload).await;
            Some(PageAction::ResponseArrived {
                component,
                message: message_id,
                outcome,
            })
        })));
    }

    fn receive(
        state: &mut PageState,
        env: &PageEnvironment,
        id: &ComponentId,
        message_id: MessageId,
        outcome: ConnectionOutcome,
        effects: &mut Effects,
    ) {
        let live = state
            .components
            .get(id)
            .is_some_and(|s| state.document.is_connected(s.component.root()));
        if !live {
            MessageMetrics::record_discarded();
            tracing::debug!(component = %id, message = %message_id, "Discarding response for removed component");
            return;
        }
        let Some(slot) = state.components.get_mut(id) else {
            return;
        };
        let Some((in_flight, replay)) = slot.queue.complete(message_id) else {
            tracing::warn!(component = %id, message = %message_id, "Response for a message that is not in flight");
            return;
        };
        let name = slot.component.name().to_string();
        let message = in_flight.message;
        MessageMetrics::record_completed(&name, in_flight.sent_at.elapsed());
        tracing::debug!(component = %id, message = %message.id, outcome = outcome.label(), "Response arrived");

        for property in message.properties() {
            if !slot.queue.has_unsent(property) {
                slot.component.clear_deferred(property);
            }
        }

        let failure = match outcome {
            ConnectionOutcome::Success(payload) => {
                match Self::apply_success(state, env, id, &message, *payload, effects) {
                    Ok(true) => None,
                    Ok(false) => return,
                    Err(failure) => Some(("patch", failure)),
                }
            },
            ConnectionOutcome::Redirect(url) => {
                Self::abandon(state, id);
                tracing::info!(component = %id, %url, "Redirecting");
                env.ui.navigate(&url);
                return;
            },
            ConnectionOutcome::Dump(body) => Some(("dump", body)),
            ConnectionOutcome::SessionExpired => {
                MessageMetrics::record_session_expired();
                if state.session_expired {
                    tracing::debug!(component = %id, "Session already expired; prompt suppressed");
                } else {
                    state.session_expired = true;
                    tracing::warn!(component = %id, "Session expired");
                    env.ui.session_expired();
                }
                fire(
                    &state.hooks,
                    &mut state.document,
                    Hook::MessageFailed,
                    state.components.get(id).map(|s| &s.component),
                    Some(&message),
                    None,
                    Some("session expired"),
                );
                None
            },
            ConnectionOutcome::Failed { status, body } => {
                tracing::warn!(component = %id, ?status, "Message failed");
                Some((if status.is_some() { "http" } else { "transport" }, body))
            },
        };

        if let Some((reason, body)) = failure {
            MessageMetrics::record_failed(&name, reason);
            fire(
                &state.hooks,
                &mut state.document,
                Hook::MessageFailed,
                state.components.get(id).map(|s| &s.component),
                Some(&message),
                None,
                Some(&body),
            );
            env.ui.show_error_modal(&body);
        }

        fire(
            &state.hooks,
            &mut state.document,
            Hook::MessageProcessed,
            state.components.get(id).map(|s| &s.component),
            Some(&message),
            None,
            None,
        );
        Self::refresh_states(state, id);
        if replay {
            Self::flush(state, env, id, effects);
        }
    }

    /// Apply a 2xx response. `Ok(false)` when the page navigated away;
    /// `Err` with a description when the patch was rejected.
    fn apply_success(
        state: &mut PageState,
        env: &PageEnvironment,
        id: &ComponentId,
        message: &Message,
        payload: ResponsePayload,
        effects: &mut Effects,
    ) -> Result<bool, String> {
        let ResponsePayload { effects: response, server_memo } = payload;
        if let Some(url) = response.redirect {
            Self::abandon(state, id);
            tracing::info!(component = %id, %url, "Redirect effect");
            env.ui.navigate(&url);
            return Ok(false);
        }

        let mut patched = None;
        if let Some(html) = response.html {
            let Some(slot) = state.components.get(id) else {
                return Ok(false);
            };
            let root = slot.component.root();
            let document = &state.document;
            let preserve_values: HashSet<NodeId> = state
                .directives
                .iter()
                .filter(|(node, found)| {
                    found
                        .get(DirectiveKind::Model)
                        .is_some_and(|m| slot.queue.has_unsent(&m.value))
                        && owner_root(document, **node) == Some(root)
                })
                .map(|(node, _)| *node)
                .collect();

            let options = MorphOptions { preserve_values };
            let report = morph(&mut state.document, root, &html, &options).map_err(|error| {
                tracing::warn!(component = %id, %error, "Rejected patch");
                error.to_string()
            })?;
            MessageMetrics::record_morph(report.mutations);
            Self::after_patch(state, report, effects);
            patched = Some(options.preserve_values);
        }

        if let Some(slot) = state.components.get_mut(id) {
            slot.component.merge_server_memo(server_memo);
            for property in &response.dirty {
                if !slot.queue.has_unsent(property) {
                    slot.component.clear_deferred(property);
                }
            }
        }
        if let Some(preserved) = patched {
            Self::sync_models(state, id, &preserved);
        }

        fire(
            &state.hooks,
            &mut state.document,
            Hook::MessageReceived,
            state.components.get(id).map(|s| &s.component),
            Some(message),
            None,
            None,
        );
        for emit in &response.emits {
            Self::emit(state, id, emit, effects);
        }
        Ok(true)
    }

    fn after_patch(state: &mut PageState, report: MorphReport, effects: &mut Effects) {
        Self::forget_removed(state, &report.removed);

        let mut fresh = report.inserted;
        for node in report.updated {
            let found = state.registry.resolve(&state.document, node);
            if state.directives.contains_key(&node) {
                tracing::trace!(element = %state.document.describe(node), "Directives re-resolved");
                state.directives.insert(node, found);
            } else if !found.is_empty() {
                // Gained its first directive in this patch.
                fresh.push(node);
            }
        }
        let unbound: Vec<NodeId> = state
            .directives
            .keys()
            .copied()
            .filter(|n| !state.document.contains(*n))
            .collect();
        for node in unbound {
            state.directives.remove(&node);
        }

        Self::bind_nodes(state, &fresh, effects);
    }

    /// Deliver a server- or `$emit`-raised event to listening components
    fn emit(state: &mut PageState, source: &ComponentId, emit: &Emit, effects: &mut Effects) {
        let targets: Vec<ComponentId> = state
            .components
            .iter()
            .filter(|(id, slot)| {
                slot.component.listens_to(&emit.event)
                    && if emit.self_only {
                        *id == source
                    } else {
                        emit.to.as_deref().is_none_or(|to| slot.component.name() == to)
                    }
            })
            .map(|(id, _)| id.clone())
            .collect();
        tracing::debug!(event = %emit.event, listeners = targets.len(), "Emitting event");
        for target in targets {
            let action = Action::fire_event(emit.event.clone(), emit.params.clone());
            Self::enqueue(state, &target, action, Timing::Immediate, effects);
        }
    }

    fn abandon(state: &mut PageState, id: &ComponentId) {
        if let Some(slot) = state.components.get_mut(id) {
            slot.queue.abandon();
        }
    }

    /// Mirror the event's effect on the control before handlers read it.
    fn apply_live_state(document: &mut Document, target: NodeId, event: &DomEvent) -> Result<(), DomError> {
        if let Some(value) = &event.value {
            document.set_value(target, value)?;
        }
        if let Some(checked) = event.checked {
            document.set_checked(target, checked)?;
            let radio = document.element(target).and_then(|el| el.input_type()).as_deref() == Some("radio");
            if checked && radio {
                if let Some(group) = document.attribute(target, "name").map(str::to_string) {
                    let others: Vec<NodeId> = document
                        .find_by_attribute(document.root(), "name")
                        .into_iter()
                        .filter(|&n| n != target && document.attribute(n, "name") == Some(group.as_str()))
                        .collect();
                    for other in others {
                        document.set_checked(other, false)?;
                    }
                }
            }
        }
        match event.name.as_str() {
            "focus" | "input" => document.focus(target)?,
            "blur" if document.focused() == Some(target) => document.blur(),
            _ => {},
        }
        Ok(())
    }

    fn navigate(state: &PageState, env: &PageEnvironment, node: NodeId) {
        let Some(found) = state.directives.get(&node) else { return };
        let href = state
            .document
            .attribute(node, "href")
            .map(str::to_string)
            .or_else(|| found.get(DirectiveKind::Navigate).map(|d| d.value.clone()))
            .filter(|h| !h.is_empty());
        let Some(href) = href else {
            tracing::warn!(element = %state.document.describe(node), "raxm:navigate without a destination");
            return;
        };
        match env.snapshots.save(&state.html()) {
            Ok(key) => tracing::debug!(%key, "Page snapshot saved"),
            Err(error) => tracing::warn!(%error, "Could not save page snapshot"),
        }
        env.ui.navigate(&href);
    }

    fn dispatch(state: &mut PageState, env: &PageEnvironment, target: NodeId, event: &DomEvent, effects: &mut Effects) {
        if let Err(error) = Self::apply_live_state(&mut state.document, target, event) {
            tracing::warn!(%error, "Ignoring event on stale element");
            return;
        }

        if event.name == "click" {
            let link = state.document.closest(target, |n, _| {
                state.directives.get(&n).is_some_and(|d| d.has(DirectiveKind::Navigate))
            });
            if let Some(link) = link {
                Self::navigate(state, env, link);
                return;
            }
        }

        let Some(id) = state.owner(target) else {
            tracing::warn!(element = %state.document.describe(target), "Event outside any component");
            return;
        };
        let Some(root) = state.components.get(&id).map(|s| s.component.root()) else {
            return;
        };
        let debounce = env.config.model_debounce();

        let model = state
            .directives
            .get(&target)
            .and_then(|d| d.get(DirectiveKind::Model))
            .cloned();
        if let Some(model) = model {
            let update = state.components.get(&id).and_then(|slot| {
                directives::model_update(&state.document, target, &model, &slot.component, event, debounce)
            });
            if let Some((action, timing)) = update {
                Self::enqueue(state, &id, action, timing, effects);
            }
        }

        let handler = state
            .document
            .closest(target, |n, _| {
                state.directives.get(&n).is_some_and(|d| d.event(&event.name).is_some())
            })
            .filter(|&n| state.document.is_inclusive_ancestor(root, n));
        let Some(handler) = handler else { return };
        let Some(found) = state.directives.get(&handler).cloned() else { return };
        let Some(directive) = found.event(&event.name) else { return };

        if matches!(event.name.as_str(), "keydown" | "keyup") && !directives::key_matches(directive, event.key.as_deref()) {
            return;
        }
        if let Some(confirm) = found.get(DirectiveKind::Confirm) {
            let prompt = if confirm.value.is_empty() { DEFAULT_CONFIRM } else { confirm.value.as_str() };
            if !env.ui.confirm(prompt) {
                tracing::debug!(element = %state.document.describe(handler), "Action cancelled by user");
                return;
            }
        }

        let invocation = state
            .components
            .get(&id)
            .and_then(|slot| directives::event_invocation(directive, &slot.component, handler, debounce));
        match invocation {
            Some(Invocation::Action(action, timing)) => Self::enqueue(state, &id, action, timing, effects),
            Some(Invocation::Emit { event, params }) => {
                let emit = Emit {
                    event,
                    params,
                    to: None,
                    self_only: false,
                };
                Self::emit(state, &id, &emit, effects);
            },
            None => {},
        }
    }

    fn remove_element(state: &mut PageState, node: NodeId) {
        match state.document.remove(node) {
            Ok(removed) => Self::forget_removed(state, &removed),
            Err(error) => tracing::debug!(%error, "Element already gone"),
        }
    }
}

impl Reducer for PageReducer {
    type State = PageState;
    type Action = PageAction;
    type Environment = PageEnvironment;

    fn reduce(&self, state: &mut PageState, action: PageAction, env: &PageEnvironment) -> Effects {
        let mut effects: Effects = smallvec![];
        match action {
            PageAction::Initialize => {
                let nodes = state.document.subtree(state.document.root());
                Self::bind_nodes(state, &nodes, &mut effects);
            },
            PageAction::Dispatch { target, event } => {
                Self::dispatch(state, env, target, &event, &mut effects);
            },
            PageAction::Enqueue {
                component,
                action,
                timing,
            } => Self::enqueue(state, &component, action, timing, &mut effects),
            PageAction::DebounceElapsed { component, generation } => {
                let current = state
                    .components
                    .get(&component)
                    .is_some_and(|s| s.queue.is_current_debounce(generation));
                if current {
                    Self::flush(state, env, &component, &mut effects);
                }
            },
            PageAction::Flush { component } => Self::flush(state, env, &component, &mut effects),
            PageAction::ResponseArrived {
                component,
                message,
                outcome,
            } => Self::receive(state, env, &component, message, outcome, &mut effects),
            PageAction::RemoveElement(node) => Self::remove_element(state, node),
        }
        effects
    }
}

/// A booted page.
///
/// ```ignore
/// let page = Page::boot(&html, RuntimeConfig::from_env()?, services).await?;
/// let search = page.state(|s| s.query("raxm:model", "q")).await.unwrap();
/// page.dispatch(search, DomEvent::input("rust")).await?;
/// page.settle().await?;
/// ```
pub struct Page {
    store: Store<PageState, PageAction, PageEnvironment, PageReducer>,
}

impl Page {
    /// Parse `html`, resolve the CSRF token, boot every component and bind
    /// every directive. `raxm:init` calls are queued.
    ///
    /// # Errors
    ///
    /// - [`PageError::Config`]: invalid config or no CSRF token on the page
    /// - [`PageError::Component`]: a component root doesn't boot
    /// - [`PageError::Dom`]: a directive element outside every component
    pub async fn boot(html: &str, config: RuntimeConfig, services: HostServices) -> Result<Self, PageError> {
        config.validate()?;
        let document = Document::parse(html);
        let connection = Connection::from_document(&document, &config, services.transport)?;
        let state = PageState::new(document, services.hooks)?;
        let components = state.components.len();
        let snapshots = SnapshotStore::new(services.storage, services.clock);
        let env = PageEnvironment::new(connection, services.ui, snapshots, config);

        let store = Store::new(state, PageReducer, env);
        store.send(PageAction::Initialize).await?;
        tracing::info!(components, "Page booted");
        Ok(Self { store })
    }

    /// [`Page::boot`] over HTTP with the request timeout from `config`.
    ///
    /// # Errors
    ///
    /// As [`Page::boot`], plus [`PageError::Connection`] when the HTTP client
    /// cannot be built.
    pub async fn connect(html: &str, config: RuntimeConfig, ui: Arc<dyn UiHost>) -> Result<Self, PageError> {
        let transport = ReqwestTransport::new(config.request_timeout())?;
        Self::boot(html, config, HostServices::new(Arc::new(transport), ui)).await
    }

    /// Route a DOM event.
    ///
    /// # Errors
    ///
    /// Returns [`DomError::Stale`] for a removed element and
    /// [`DomError::MissingComponent`] for an element outside every component.
    pub async fn dispatch(&self, target: NodeId, event: DomEvent) -> Result<(), PageError> {
        self.store.state(|s| s.check_target(target)).await?;
        self.store.send(PageAction::Dispatch { target, event }).await?;
        Ok(())
    }

    /// Queue an action on a component.
    ///
    /// # Errors
    ///
    /// Returns [`PageError::UnknownComponent`] when no such component exists.
    pub async fn enqueue(&self, component: &ComponentId, action: Action, timing: Timing) -> Result<(), PageError> {
        let known = self.store.state(|s| s.components.contains_key(component)).await;
        if !known {
            return Err(PageError::UnknownComponent(component.clone()));
        }
        self.store
            .send(PageAction::Enqueue {
                component: component.clone(),
                action,
                timing,
            })
            .await?;
        Ok(())
    }

    /// Call a component method.
    ///
    /// # Errors
    ///
    /// See [`Page::enqueue`].
    pub async fn call(&self, component: &ComponentId, method: &str, params: Vec<Value>) -> Result<(), PageError> {
        self.enqueue(component, Action::call_method(method, params), Timing::Immediate)
            .await
    }

    /// Send whatever a component has queued, now.
    ///
    /// # Errors
    ///
    /// Returns [`PageError::Store`] when the page is shutting down.
    pub async fn flush(&self, component: &ComponentId) -> Result<(), PageError> {
        self.store
            .send(PageAction::Flush {
                component: component.clone(),
            })
            .await?;
        Ok(())
    }

    /// Remove an element and its subtree. Removing a component root destroys
    /// the component; its late responses are discarded.
    ///
    /// # Errors
    ///
    /// Returns [`DomError::Stale`] when the element is already gone.
    pub async fn remove_element(&self, node: NodeId) -> Result<(), PageError> {
        let present = self.store.state(|s| s.document.contains(node)).await;
        if !present {
            return Err(DomError::Stale(node).into());
        }
        self.store.send(PageAction::RemoveElement(node)).await?;
        Ok(())
    }

    /// Wait until every timer, request and follow-up has finished.
    ///
    /// # Errors
    ///
    /// Returns [`PageError::Store`] if effect tracking is gone.
    pub async fn settle(&self) -> Result<(), PageError> {
        self.store.settle().await?;
        Ok(())
    }

    /// Read page state
    pub async fn state<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&PageState) -> T,
    {
        self.store.state(f).await
    }

    /// Subscribe to a lifecycle hook
    pub async fn register_hook<F>(&self, hook: Hook, callback: F) -> SubscriptionId
    where
        F: Fn(&mut HookContext<'_>) -> Result<(), HookError> + Send + Sync + 'static,
    {
        self.store.state_mut(|s| s.hooks.register(hook, callback)).await
    }

    /// Drop a hook subscription
    pub async fn unregister_hook(&self, id: SubscriptionId) -> bool {
        self.store.state_mut(|s| s.hooks.unregister(id)).await
    }

    /// Stop accepting events and wait for outstanding work
    ///
    /// # Errors
    ///
    /// Returns [`PageError::Store`] when work is still running at the deadline.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), PageError> {
        self.store.shutdown(timeout).await?;
        Ok(())
    }
}
