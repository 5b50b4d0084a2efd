// Shared fixtures for scriptd-host integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use scriptd_api::{
    Callable, ExportCollector, HostObject, ModuleFile, NativeEngine, ScriptEngine, ScriptError, ScriptValue,
};
use scriptd_events::{BroadcastEvent, ChannelBroadcaster};
use scriptd_host::{Invoker, Runtime, RuntimeConfig, SessionBinding};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::UnboundedReceiver;

/// A runtime backed by a `NativeEngine` on a real dispatcher thread
pub struct Harness {
    pub engine: Arc<NativeEngine>,
    pub runtime: Runtime,
    pub events: UnboundedReceiver<BroadcastEvent>,
}

impl Harness {
    pub fn new(config: RuntimeConfig, files: Vec<ModuleFile>) -> Self {
        Self::with_engine(Arc::new(NativeEngine::new("native")), config, files)
    }

    /// Build around an engine that already has module bodies defined
    pub fn with_engine(engine: Arc<NativeEngine>, config: RuntimeConfig, files: Vec<ModuleFile>) -> Self {
        let (broadcaster, events) = ChannelBroadcaster::new();
        let for_thread = engine.clone();
        let runtime = Runtime::builder("test-project")
            .with_config(config)
            .with_files(files)
            .with_broadcaster(Arc::new(broadcaster))
            .with_engine("native", move || Ok(for_thread))
            .build()
            .expect("runtime should build");

        Self {
            engine,
            runtime,
            events,
        }
    }

    pub fn drain_events(&mut self) -> Vec<BroadcastEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

/// Call `global.method(args)` the way a script would
pub fn call_global(
    engine: &Weak<NativeEngine>,
    global: &str,
    method: &str,
    args: Vec<ScriptValue>,
) -> Result<ScriptValue, ScriptError> {
    let engine = engine
        .upgrade()
        .ok_or_else(|| ScriptError::EngineUnavailable("engine dropped".to_string()))?;
    engine.call_global(global, method, args)
}

/// Runs every invocation on the blocking pool so handlers truly overlap.
///
/// Only valid for engines that tolerate concurrent calls, such as
/// `NativeEngine` with thread-safe closures.
pub struct ParallelInvoker {
    pub engine: Arc<NativeEngine>,
}

impl ParallelInvoker {
    pub fn new() -> Self {
        Self {
            engine: Arc::new(NativeEngine::new("parallel")),
        }
    }
}

#[async_trait]
impl Invoker for ParallelInvoker {
    async fn invoke(&self, callable: Callable, args: Vec<ScriptValue>) -> Result<ScriptValue, ScriptError> {
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || engine.invoke(callable, args))
            .await
            .map_err(|e| ScriptError::Panicked(e.to_string()))?
    }

    async fn invoke_in_session(
        &self,
        session: SessionBinding,
        callable: Callable,
        args: Vec<ScriptValue>,
    ) -> Result<ScriptValue, ScriptError> {
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || {
            let _scope = session.enter();
            engine.invoke(callable, args)
        })
        .await
        .map_err(|e| ScriptError::Panicked(e.to_string()))?
    }

    fn invoke_blocking(&self, callable: Callable, args: Vec<ScriptValue>) -> Result<ScriptValue, ScriptError> {
        self.engine.invoke(callable, args)
    }

    fn eval_module(&self, file: &ModuleFile, collector: ExportCollector) -> Result<(), ScriptError> {
        self.engine.eval_module(file, collector)
    }

    fn set_global(&self, name: &str, object: Arc<dyn HostObject>) -> Result<(), ScriptError> {
        self.engine.set_global(name, object)
    }
}
