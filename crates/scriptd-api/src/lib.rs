/// Script engine contract for scriptd
///
/// This crate provides the minimal surface shared by the orchestration core and
/// whatever interpreter backs a session. Engines implement [`ScriptEngine`];
/// host-side components implement [`HostObject`] to become script globals.
pub mod args;
pub mod native;
mod value;

pub use native::NativeEngine;
pub use value::{Callable, ExportCollector, ModuleExports, ModuleFile, ScriptValue};

use std::sync::Arc;

/// Errors crossing the host/script boundary
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScriptError {
    /// The script threw while running a callable or module body
    #[error("script error: {0}")]
    Thrown(String),

    /// The engine panicked while running a callable
    #[error("script engine panicked: {0}")]
    Panicked(String),

    /// A host function was called with the wrong number or shape of arguments
    #[error("invalid arguments to {function}: {reason}")]
    InvalidArguments { function: String, reason: String },

    /// A host object was asked for a method it does not have
    #[error("{type_name} has no method '{method}'")]
    UnknownMethod {
        type_name: &'static str,
        method: String,
    },

    /// The callable handle does not resolve in this engine
    #[error("unknown callable {0}")]
    UnknownCallable(Callable),

    /// The engine is gone (dispatcher stopped or failed to start)
    #[error("script engine unavailable: {0}")]
    EngineUnavailable(String),

    /// A host function failed; surfaced to the script as a thrown error
    #[error("{0}")]
    Host(String),
}

impl ScriptError {
    pub fn invalid_arguments(function: impl Into<String>, reason: impl Into<String>) -> Self {
        ScriptError::InvalidArguments {
            function: function.into(),
            reason: reason.into(),
        }
    }

    pub fn unknown_method(type_name: &'static str, method: impl Into<String>) -> Self {
        ScriptError::UnknownMethod {
            type_name,
            method: method.into(),
        }
    }
}

/// An interpreter instance.
///
/// Invocations are synchronous. Implementations are not required to be `Send`
/// or `Sync`: the host owns each engine on a single thread and serializes all
/// calls into it. Methods take `&self` so that a host function running inside
/// an invocation may re-enter the engine (nested `require`, synchronous dialog
/// fallbacks).
pub trait ScriptEngine {
    /// Human-readable engine name, used in logs
    fn name(&self) -> &str;

    /// Invoke a script function with the given arguments
    fn invoke(&self, callable: Callable, args: Vec<ScriptValue>) -> Result<ScriptValue, ScriptError>;

    /// Execute a module body in an isolated scope.
    ///
    /// The body sees `collector` as its local export function and may call it
    /// any number of times.
    fn eval_module(&self, file: &ModuleFile, collector: ExportCollector) -> Result<(), ScriptError>;

    /// Bind a host object to a global name visible to every script
    fn set_global(&self, name: &str, object: Arc<dyn HostObject>) -> Result<(), ScriptError>;
}

impl<E: ScriptEngine + ?Sized> ScriptEngine for Arc<E> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn invoke(&self, callable: Callable, args: Vec<ScriptValue>) -> Result<ScriptValue, ScriptError> {
        (**self).invoke(callable, args)
    }

    fn eval_module(&self, file: &ModuleFile, collector: ExportCollector) -> Result<(), ScriptError> {
        (**self).eval_module(file, collector)
    }

    fn set_global(&self, name: &str, object: Arc<dyn HostObject>) -> Result<(), ScriptError> {
        (**self).set_global(name, object)
    }
}

impl<E: ScriptEngine + ?Sized> ScriptEngine for Box<E> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn invoke(&self, callable: Callable, args: Vec<ScriptValue>) -> Result<ScriptValue, ScriptError> {
        (**self).invoke(callable, args)
    }

    fn eval_module(&self, file: &ModuleFile, collector: ExportCollector) -> Result<(), ScriptError> {
        (**self).eval_module(file, collector)
    }

    fn set_global(&self, name: &str, object: Arc<dyn HostObject>) -> Result<(), ScriptError> {
        (**self).set_global(name, object)
    }
}

/// A host-side object exposed to scripts.
///
/// The engine binding layer turns a host object into a script object whose
/// properties come from [`HostObject::get`] and whose methods dispatch to
/// [`HostObject::call_method`].
pub trait HostObject: Send + Sync {
    /// Name shown in error messages (e.g. "router", "ActionContext")
    fn type_name(&self) -> &'static str;

    /// Read a property
    fn get(&self, _key: &str) -> Option<ScriptValue> {
        None
    }

    /// Call a method
    fn call_method(&self, method: &str, args: Vec<ScriptValue>) -> Result<ScriptValue, ScriptError>;
}
