use parking_lot::{RwLock, RwLockWriteGuard};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::HookError;
use crate::dispatcher::Invoker;
use crate::session::{SessionContext, SessionSnapshot};
use scriptd_api::{Callable, HostObject, ScriptError, ScriptValue};
use scriptd_events::{ActionState, ActionStateEntry, Broadcaster};

struct ActionEntry {
    display_name: String,
    handler: Callable,
    state: ActionState,
}

/// The state table plus where to publish it
struct ActionTable {
    project_id: String,
    actions: RwLock<BTreeMap<String, ActionEntry>>,
    broadcaster: Option<Arc<dyn Broadcaster>>,
}

impl ActionTable {
    fn states(&self) -> Vec<ActionStateEntry> {
        collect_states(&self.actions.read())
    }

    /// Snapshot the table under `actions` and publish it before any other
    /// writer gets in, so broadcasts go out in mutation order
    fn publish(&self, actions: RwLockWriteGuard<'_, BTreeMap<String, ActionEntry>>) {
        let actions = RwLockWriteGuard::downgrade(actions);
        let states = collect_states(&actions);
        if let Some(broadcaster) = &self.broadcaster {
            broadcaster.broadcast_action_states(&self.project_id, &states);
        }
    }

    fn set_state(&self, slug: &str, state: ActionState) {
        let mut actions = self.actions.write();
        let Some(entry) = actions.get_mut(slug) else {
            return;
        };
        entry.state = state;
        debug!(target: "hooks", "Action '{}' is now {}", slug, state);
        self.publish(actions);
    }
}

fn collect_states(actions: &BTreeMap<String, ActionEntry>) -> Vec<ActionStateEntry> {
    actions
        .iter()
        .map(|(slug, entry)| ActionStateEntry::new(slug.clone(), entry.state))
        .collect()
}

/// Registered action buttons
pub struct ActionRegistry {
    table: Arc<ActionTable>,
    invoker: Arc<dyn Invoker>,
    session: Arc<SessionContext>,
}

impl ActionRegistry {
    pub fn new(
        project_id: impl Into<String>,
        broadcaster: Option<Arc<dyn Broadcaster>>,
        invoker: Arc<dyn Invoker>,
        session: Arc<SessionContext>,
    ) -> Self {
        Self {
            table: Arc::new(ActionTable {
                project_id: project_id.into(),
                actions: RwLock::new(BTreeMap::new()),
                broadcaster,
            }),
            invoker,
            session,
        }
    }

    /// Register (or replace) an action; it starts enabled
    pub fn register(&self, slug: &str, display_name: Option<&str>, handler: Callable) {
        let display_name = display_name.unwrap_or(slug).to_string();
        let mut actions = self.table.actions.write();
        actions.insert(
            slug.to_string(),
            ActionEntry {
                display_name,
                handler,
                state: ActionState::Enabled,
            },
        );
        info!(target: "hooks", "Registered action '{}'", slug);
        self.table.publish(actions);
    }

    /// Run an action's handler with a fresh [`ActionContext`]
    pub async fn trigger(&self, slug: &str) -> Result<ScriptValue, HookError> {
        let (display_name, handler) = {
            let actions = self.table.actions.read();
            let entry = actions
                .get(slug)
                .ok_or_else(|| HookError::ActionNotRegistered(slug.to_string()))?;
            (entry.display_name.clone(), entry.handler)
        };

        let snapshot = self.session.snapshot();
        let binding = self.session.bind(snapshot.clone());
        let context = ActionContext {
            slug: slug.to_string(),
            name: display_name,
            session: snapshot,
            table: self.table.clone(),
        };

        debug!(target: "hooks", "Triggering action '{}'", slug);
        self.invoker
            .invoke_in_session(binding, handler, vec![ScriptValue::Object(Arc::new(context))])
            .await
            .map_err(|source| HookError::Action {
                slug: slug.to_string(),
                source,
            })
    }

    /// Put every action back to enabled with a single broadcast
    pub fn reset_states(&self) {
        let mut actions = self.table.actions.write();
        for entry in actions.values_mut() {
            entry.state = ActionState::Enabled;
        }
        self.table.publish(actions);
    }

    /// The state table, sorted by slug
    pub fn action_states(&self) -> Vec<ActionStateEntry> {
        self.table.states()
    }

    pub fn state(&self, slug: &str) -> Option<ActionState> {
        self.table.actions.read().get(slug).map(|entry| entry.state)
    }

    pub fn len(&self) -> usize {
        self.table.actions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handed to an action handler as its only argument
pub struct ActionContext {
    slug: String,
    name: String,
    session: SessionSnapshot,
    table: Arc<ActionTable>,
}

impl ActionContext {
    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.session_id.as_deref()
    }

    pub fn disable(&self) {
        self.table.set_state(&self.slug, ActionState::Disabled);
    }

    pub fn enable(&self) {
        self.table.set_state(&self.slug, ActionState::Enabled);
    }

    pub fn loader(&self) {
        self.table.set_state(&self.slug, ActionState::Loading);
    }
}

impl HostObject for ActionContext {
    fn type_name(&self) -> &'static str {
        "ActionContext"
    }

    fn get(&self, key: &str) -> Option<ScriptValue> {
        match key {
            "name" => Some(self.name.clone().into()),
            "slug" => Some(self.slug.clone().into()),
            "sessionId" => Some(
                self.session
                    .session_id
                    .clone()
                    .map(ScriptValue::from)
                    .unwrap_or_else(ScriptValue::null),
            ),
            _ => None,
        }
    }

    fn call_method(&self, method: &str, _args: Vec<ScriptValue>) -> Result<ScriptValue, ScriptError> {
        match method {
            "disable" => self.disable(),
            "enable" => self.enable(),
            "loader" => self.loader(),
            other => return Err(ScriptError::unknown_method("ActionContext", other)),
        }
        Ok(ScriptValue::null())
    }
}
