//! Action buttons and model event hooks.
//!
//! Actions are named buttons with a handler and a visible state. Every state
//! change is pushed to observers as the full table. Model hooks run script
//! handlers when the model service inserts, updates or deletes a document.

mod actions;
mod model;
mod normalize;

pub use actions::{ActionContext, ActionRegistry};
pub use model::{HookType, ModelHookRegistry};
pub use normalize::normalize_payload;

use scriptd_api::ScriptError;

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("action '{0}' is not registered")]
    ActionNotRegistered(String),

    #[error("action '{slug}' failed: {source}")]
    Action {
        slug: String,
        #[source]
        source: ScriptError,
    },

    #[error("{hook_type} hook #{index} for model '{model}' failed: {source}")]
    ModelHook {
        model: String,
        hook_type: HookType,
        index: usize,
        #[source]
        source: ScriptError,
    },

    #[error("unknown hook type '{0}'")]
    UnknownHookType(String),
}
