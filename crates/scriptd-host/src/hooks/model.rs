use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use super::HookError;
use super::normalize::normalize_payload;
use crate::dispatcher::Invoker;
use scriptd_api::Callable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookType {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for HookType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookType::Insert => write!(f, "insert"),
            HookType::Update => write!(f, "update"),
            HookType::Delete => write!(f, "delete"),
        }
    }
}

impl FromStr for HookType {
    type Err = HookError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "insert" => Ok(HookType::Insert),
            "update" => Ok(HookType::Update),
            "delete" => Ok(HookType::Delete),
            _ => Err(HookError::UnknownHookType(s.to_string())),
        }
    }
}

/// Script handlers keyed by model name and event
pub struct ModelHookRegistry {
    hooks: RwLock<HashMap<(String, HookType), Vec<Callable>>>,
    invoker: Arc<dyn Invoker>,
}

impl ModelHookRegistry {
    pub fn new(invoker: Arc<dyn Invoker>) -> Self {
        Self {
            hooks: RwLock::new(HashMap::new()),
            invoker,
        }
    }

    pub fn on(&self, model: &str, hook_type: HookType, handler: Callable) {
        self.hooks
            .write()
            .entry((model.to_string(), hook_type))
            .or_default()
            .push(handler);
        debug!(target: "hooks", "Registered {} hook for model '{}'", hook_type, model);
    }

    /// Run every handler for `(model, hook_type)` in registration order.
    ///
    /// The payload is normalized once and each handler gets its own copy. The
    /// first failing handler stops the rest.
    pub async fn trigger(&self, model: &str, hook_type: HookType, payload: Value) -> Result<(), HookError> {
        let handlers = self
            .hooks
            .read()
            .get(&(model.to_string(), hook_type))
            .cloned()
            .unwrap_or_default();
        if handlers.is_empty() {
            return Ok(());
        }

        let payload = normalize_payload(payload);
        debug!(target: "hooks", "Running {} {} hook(s) for '{}'", handlers.len(), hook_type, model);

        for (index, handler) in handlers.into_iter().enumerate() {
            self.invoker
                .invoke(handler, vec![payload.clone().into()])
                .await
                .map_err(|source| HookError::ModelHook {
                    model: model.to_string(),
                    hook_type,
                    index,
                    source,
                })?;
        }
        Ok(())
    }

    pub fn handler_count(&self, model: &str, hook_type: HookType) -> usize {
        self.hooks
            .read()
            .get(&(model.to_string(), hook_type))
            .map_or(0, Vec::len)
    }
}
