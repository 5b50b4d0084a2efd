//! In-process invoker for unit tests.
//!
//! Runs native closures directly on the calling task, optionally after an
//! async delay, and counts calls per callable.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

use crate::dispatcher::{Invoker, guarded};
use crate::session::SessionBinding;
use scriptd_api::{
    Callable, ExportCollector, HostObject, ModuleFile, NativeEngine, ScriptEngine, ScriptError, ScriptValue,
};
use std::sync::Arc;

pub(crate) struct TestInvoker {
    engine: NativeEngine,
    delays: Mutex<HashMap<Callable, Duration>>,
    calls: Mutex<HashMap<Callable, usize>>,
}

impl TestInvoker {
    pub(crate) fn new() -> Self {
        Self {
            engine: NativeEngine::new("test"),
            delays: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn register<F>(&self, f: F) -> Callable
    where
        F: Fn(Vec<ScriptValue>) -> Result<ScriptValue, ScriptError> + Send + Sync + 'static,
    {
        self.engine.register(f)
    }

    /// Register a closure that only runs after `delay` of (tokio) time
    pub(crate) fn register_slow<F>(&self, delay: Duration, f: F) -> Callable
    where
        F: Fn(Vec<ScriptValue>) -> Result<ScriptValue, ScriptError> + Send + Sync + 'static,
    {
        let callable = self.engine.register(f);
        self.delays.lock().insert(callable, delay);
        callable
    }

    pub(crate) fn noop(&self) -> Callable {
        self.register(|_| Ok(ScriptValue::null()))
    }

    pub(crate) fn engine(&self) -> &NativeEngine {
        &self.engine
    }

    pub(crate) fn calls(&self, callable: Callable) -> usize {
        self.calls.lock().get(&callable).copied().unwrap_or(0)
    }

    fn record(&self, callable: Callable) {
        *self.calls.lock().entry(callable).or_insert(0) += 1;
    }
}

#[async_trait]
impl Invoker for TestInvoker {
    async fn invoke(&self, callable: Callable, args: Vec<ScriptValue>) -> Result<ScriptValue, ScriptError> {
        self.record(callable);
        let delay = self.delays.lock().get(&callable).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        guarded(|| self.engine.invoke(callable, args))
    }

    async fn invoke_in_session(
        &self,
        session: SessionBinding,
        callable: Callable,
        args: Vec<ScriptValue>,
    ) -> Result<ScriptValue, ScriptError> {
        self.record(callable);
        let delay = self.delays.lock().get(&callable).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let _scope = session.enter();
        guarded(|| self.engine.invoke(callable, args))
    }

    fn invoke_blocking(&self, callable: Callable, args: Vec<ScriptValue>) -> Result<ScriptValue, ScriptError> {
        self.record(callable);
        guarded(|| self.engine.invoke(callable, args))
    }

    fn eval_module(&self, file: &ModuleFile, collector: ExportCollector) -> Result<(), ScriptError> {
        guarded(|| self.engine.eval_module(file, collector))
    }

    fn set_global(&self, name: &str, object: Arc<dyn HostObject>) -> Result<(), ScriptError> {
        self.engine.set_global(name, object)
    }
}
