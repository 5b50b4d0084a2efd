use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::{Callable, ExportCollector, HostObject, ModuleFile, ScriptEngine, ScriptError, ScriptValue};

type NativeFn = Arc<dyn Fn(Vec<ScriptValue>) -> Result<ScriptValue, ScriptError> + Send + Sync>;
type ModuleBody = Arc<dyn Fn(&ExportCollector) -> Result<(), ScriptError> + Send + Sync>;

/// Engine whose callables are Rust closures.
///
/// Used for native handlers that sit next to interpreted ones and as the
/// engine in tests. Module bodies are looked up by the file's source text,
/// which names a body registered with [`NativeEngine::define_module`].
pub struct NativeEngine {
    name: String,
    next_id: AtomicU64,
    functions: RwLock<HashMap<Callable, NativeFn>>,
    modules: RwLock<HashMap<String, ModuleBody>>,
    globals: RwLock<HashMap<String, Arc<dyn HostObject>>>,
}

impl NativeEngine {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            next_id: AtomicU64::new(1),
            functions: RwLock::new(HashMap::new()),
            modules: RwLock::new(HashMap::new()),
            globals: RwLock::new(HashMap::new()),
        }
    }

    /// Register a closure and return its handle
    pub fn register<F>(&self, f: F) -> Callable
    where
        F: Fn(Vec<ScriptValue>) -> Result<ScriptValue, ScriptError> + Send + Sync + 'static,
    {
        let callable = Callable::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.functions.write().insert(callable, Arc::new(f));
        callable
    }

    /// Register a module body under a source key
    pub fn define_module<F>(&self, source_key: impl Into<String>, body: F)
    where
        F: Fn(&ExportCollector) -> Result<(), ScriptError> + Send + Sync + 'static,
    {
        self.modules.write().insert(source_key.into(), Arc::new(body));
    }

    pub fn function_count(&self) -> usize {
        self.functions.read().len()
    }

    /// A global installed with [`ScriptEngine::set_global`]
    pub fn global(&self, name: &str) -> Option<Arc<dyn HostObject>> {
        self.globals.read().get(name).cloned()
    }

    /// Call a method on a global, as script code would
    pub fn call_global(&self, name: &str, method: &str, args: Vec<ScriptValue>) -> Result<ScriptValue, ScriptError> {
        let object = self
            .global(name)
            .ok_or_else(|| ScriptError::Thrown(format!("{} is not defined", name)))?;
        object.call_method(method, args)
    }
}

impl ScriptEngine for NativeEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, callable: Callable, args: Vec<ScriptValue>) -> Result<ScriptValue, ScriptError> {
        // Clone out of the lock so the closure can register or invoke further
        let f = self
            .functions
            .read()
            .get(&callable)
            .cloned()
            .ok_or(ScriptError::UnknownCallable(callable))?;
        f(args)
    }

    fn eval_module(&self, file: &ModuleFile, collector: ExportCollector) -> Result<(), ScriptError> {
        let body = self
            .modules
            .read()
            .get(&file.source)
            .cloned()
            .ok_or_else(|| {
                ScriptError::Thrown(format!("no native module body for '{}'", file.name))
            })?;
        body(&collector)
    }

    fn set_global(&self, name: &str, object: Arc<dyn HostObject>) -> Result<(), ScriptError> {
        self.globals.write().insert(name.to_string(), object);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ModuleExports;
    use serde_json::json;

    #[test]
    fn test_register_and_invoke() {
        let engine = NativeEngine::new("native");
        let add = engine.register(|args| {
            let sum: i64 = args
                .iter()
                .filter_map(|a| a.as_json().and_then(|v| v.as_i64()))
                .sum();
            Ok(json!(sum).into())
        });

        let result = engine
            .invoke(add, vec![json!(2).into(), json!(3).into()])
            .unwrap();
        assert_eq!(result.as_json(), Some(&json!(5)));
    }

    #[test]
    fn test_unknown_callable() {
        let engine = NativeEngine::new("native");
        let err = engine.invoke(Callable::new(99), vec![]).unwrap_err();
        assert_eq!(err, ScriptError::UnknownCallable(Callable::new(99)));
    }

    #[test]
    fn test_globals() {
        let engine = NativeEngine::new("native");
        let exports = Arc::new(ModuleExports::new("shared"));
        engine
            .set_global("shared", Arc::new(ExportCollector::new(exports.clone())))
            .unwrap();

        engine
            .call_global("shared", "export", vec!["answer".into(), json!(42).into()])
            .unwrap();
        assert_eq!(exports.get("answer").unwrap().as_json(), Some(&json!(42)));
        assert!(engine.call_global("missing", "x", vec![]).is_err());
    }

    #[test]
    fn test_eval_module_by_source_key() {
        let engine = NativeEngine::new("native");
        engine.define_module("body:greet", |exports| {
            exports.export("greeting", json!("hello"));
            Ok(())
        });

        let exports = Arc::new(ModuleExports::new("greet"));
        engine
            .eval_module(
                &ModuleFile::new("greet", "body:greet"),
                ExportCollector::new(exports.clone()),
            )
            .unwrap();
        assert_eq!(exports.get("greeting").unwrap().as_str(), Some("hello"));
    }
}
