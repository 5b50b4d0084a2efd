use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::{HostObject, ScriptError};

/// Opaque handle to a script function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Callable(u64);

impl Callable {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "callable#{}", self.0)
    }
}

/// A source file available to `require`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleFile {
    pub name: String,
    pub source: String,
}

impl ModuleFile {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }
}

/// A value passed between host and script
#[derive(Clone)]
pub enum ScriptValue {
    /// Plain data
    Json(Value),
    /// A script function
    Function(Callable),
    /// A host object (request context, action context, form controller, ...)
    Object(Arc<dyn HostObject>),
    /// A module's exports object
    Module(Arc<ModuleExports>),
}

impl ScriptValue {
    pub fn null() -> Self {
        ScriptValue::Json(Value::Null)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ScriptValue::Json(Value::Null))
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ScriptValue::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_json(self) -> Option<Value> {
        match self {
            ScriptValue::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_json().and_then(Value::as_str)
    }

    pub fn as_callable(&self) -> Option<Callable> {
        match self {
            ScriptValue::Function(callable) => Some(*callable),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Arc<dyn HostObject>> {
        match self {
            ScriptValue::Object(object) => Some(object),
            _ => None,
        }
    }

    pub fn as_module(&self) -> Option<&Arc<ModuleExports>> {
        match self {
            ScriptValue::Module(exports) => Some(exports),
            _ => None,
        }
    }

    /// Short description of the value's kind, used in argument errors
    pub fn kind(&self) -> &'static str {
        match self {
            ScriptValue::Json(Value::Null) => "null",
            ScriptValue::Json(Value::Bool(_)) => "boolean",
            ScriptValue::Json(Value::Number(_)) => "number",
            ScriptValue::Json(Value::String(_)) => "string",
            ScriptValue::Json(Value::Array(_)) => "array",
            ScriptValue::Json(Value::Object(_)) => "object",
            ScriptValue::Function(_) => "function",
            ScriptValue::Object(_) => "host object",
            ScriptValue::Module(_) => "module",
        }
    }
}

impl fmt::Debug for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptValue::Json(value) => write!(f, "Json({})", value),
            ScriptValue::Function(callable) => write!(f, "Function({})", callable),
            ScriptValue::Object(object) => write!(f, "Object({})", object.type_name()),
            ScriptValue::Module(exports) => write!(f, "Module({})", exports.name()),
        }
    }
}

impl From<Value> for ScriptValue {
    fn from(value: Value) -> Self {
        ScriptValue::Json(value)
    }
}

impl From<Callable> for ScriptValue {
    fn from(callable: Callable) -> Self {
        ScriptValue::Function(callable)
    }
}

impl From<bool> for ScriptValue {
    fn from(value: bool) -> Self {
        ScriptValue::Json(Value::Bool(value))
    }
}

impl From<&str> for ScriptValue {
    fn from(value: &str) -> Self {
        ScriptValue::Json(Value::String(value.to_string()))
    }
}

impl From<String> for ScriptValue {
    fn from(value: String) -> Self {
        ScriptValue::Json(Value::String(value))
    }
}

/// The single exports object a module produces.
///
/// Shared by `Arc`; requiring a module twice hands out the same allocation.
pub struct ModuleExports {
    name: String,
    values: RwLock<BTreeMap<String, ScriptValue>>,
}

impl ModuleExports {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &str) -> Option<ScriptValue> {
        self.values.read().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.values.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }

    fn insert(&self, key: String, value: ScriptValue) {
        self.values.write().insert(key, value);
    }
}

impl fmt::Debug for ModuleExports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleExports")
            .field("name", &self.name)
            .field("keys", &self.keys())
            .finish()
    }
}

impl HostObject for ModuleExports {
    fn type_name(&self) -> &'static str {
        "module"
    }

    fn get(&self, key: &str) -> Option<ScriptValue> {
        ModuleExports::get(self, key)
    }

    fn call_method(&self, method: &str, _args: Vec<ScriptValue>) -> Result<ScriptValue, ScriptError> {
        Err(ScriptError::unknown_method("module", method))
    }
}

/// The local export function handed to a module body.
///
/// Every call merges into the same exports object; later keys overwrite
/// earlier ones.
#[derive(Clone)]
pub struct ExportCollector {
    exports: Arc<ModuleExports>,
}

impl ExportCollector {
    pub fn new(exports: Arc<ModuleExports>) -> Self {
        Self { exports }
    }

    pub fn export(&self, key: impl Into<String>, value: impl Into<ScriptValue>) {
        self.exports.insert(key.into(), value.into());
    }

    /// Merge every entry of a plain object
    pub fn export_all(&self, object: Map<String, Value>) {
        for (key, value) in object {
            self.exports.insert(key, ScriptValue::Json(value));
        }
    }

    pub fn exports(&self) -> &Arc<ModuleExports> {
        &self.exports
    }
}

impl HostObject for ExportCollector {
    fn type_name(&self) -> &'static str {
        "exports"
    }

    /// `exports(key, value)` or `exports({key: value, ...})`
    fn call_method(&self, method: &str, args: Vec<ScriptValue>) -> Result<ScriptValue, ScriptError> {
        if method != "call" && method != "export" {
            return Err(ScriptError::unknown_method("exports", method));
        }

        let mut args = args.into_iter();
        match (args.next(), args.next(), args.next()) {
            (Some(ScriptValue::Json(Value::Object(object))), None, None) => {
                self.export_all(object);
                Ok(ScriptValue::null())
            }
            (Some(ScriptValue::Json(Value::String(key))), Some(value), None) => {
                self.export(key, value);
                Ok(ScriptValue::null())
            }
            _ => Err(ScriptError::invalid_arguments(
                "exports",
                "expected (key, value) or a single object",
            )),
        }
    }
}
