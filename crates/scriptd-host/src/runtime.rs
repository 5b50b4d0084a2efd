use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::bindings::{
    DelayedBinding, HooksBinding, ModulesBinding, RouterBinding, SchedulerBinding, ServiceBinding, UiBinding,
};
use crate::config::RuntimeConfig;
use crate::dispatcher::{EngineDispatcher, Invoker};
use crate::hooks::{ActionRegistry, ModelHookRegistry};
use crate::lifecycle::ServiceLifecycle;
use crate::modules::{ModuleError, ModuleLoader};
use crate::pool::WorkerPool;
use crate::router::Router;
use crate::scheduler::Scheduler;
use crate::session::SessionContext;
use crate::ui::UiCorrelator;
use scriptd_api::{HostObject, ModuleExports, ModuleFile, ScriptEngine, ScriptError};
use scriptd_events::Broadcaster;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("no script engine configured")]
    MissingEngine,

    #[error("a tokio runtime is required: {0}")]
    NoTokioRuntime(String),

    #[error("script engine failed to start: {0}")]
    Engine(#[from] ScriptError),

    #[error("entry module failed: {0}")]
    Entry(#[from] ModuleError),
}

type DispatcherFactory = Box<dyn FnOnce() -> Result<EngineDispatcher, ScriptError> + Send>;

enum EngineSource {
    Spawn(DispatcherFactory),
    Invoker(Arc<dyn Invoker>),
}

pub struct RuntimeBuilder {
    project_id: String,
    config: RuntimeConfig,
    files: Vec<ModuleFile>,
    broadcaster: Option<Arc<dyn Broadcaster>>,
    engine: Option<EngineSource>,
    handle: Option<Handle>,
}

impl RuntimeBuilder {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            config: RuntimeConfig::default(),
            files: Vec::new(),
            broadcaster: None,
            engine: None,
            handle: None,
        }
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_files(mut self, files: impl IntoIterator<Item = ModuleFile>) -> Self {
        self.files.extend(files);
        self
    }

    pub fn with_file(mut self, file: ModuleFile) -> Self {
        self.files.push(file);
        self
    }

    pub fn with_broadcaster(mut self, broadcaster: Arc<dyn Broadcaster>) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    /// Build the engine on its own dispatcher thread
    pub fn with_engine<E, F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        E: ScriptEngine + 'static,
        F: FnOnce() -> Result<E, ScriptError> + Send + 'static,
    {
        let name = name.into();
        self.engine = Some(EngineSource::Spawn(Box::new(move || {
            EngineDispatcher::spawn(name, factory)
        })));
        self
    }

    /// Use an existing invoker instead of spawning an engine
    pub fn with_invoker(mut self, invoker: Arc<dyn Invoker>) -> Self {
        self.engine = Some(EngineSource::Invoker(invoker));
        self
    }

    /// Spawn tasks on this runtime instead of the current one
    pub fn with_handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn build(self) -> Result<Runtime, RuntimeError> {
        let handle = match self.handle {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|e| RuntimeError::NoTokioRuntime(e.to_string()))?,
        };

        let (invoker, dispatcher): (Arc<dyn Invoker>, Option<Arc<EngineDispatcher>>) =
            match self.engine.ok_or(RuntimeError::MissingEngine)? {
                EngineSource::Spawn(factory) => {
                    let dispatcher = Arc::new(factory()?);
                    (dispatcher.clone(), Some(dispatcher))
                }
                EngineSource::Invoker(invoker) => (invoker, None),
            };

        let config = self.config;
        let session = Arc::new(SessionContext::new());

        let runtime = Runtime {
            router: Arc::new(Router::new(invoker.clone())),
            modules: Arc::new(ModuleLoader::new(self.files, invoker.clone())),
            pool: Arc::new(WorkerPool::new(
                config.pool_size,
                config.task_history,
                invoker.clone(),
                session.clone(),
                handle.clone(),
            )),
            scheduler: Arc::new(Scheduler::new(config.overlap, invoker.clone(), handle.clone())),
            lifecycle: Arc::new(ServiceLifecycle::new(
                config.shutdown_timeout(),
                invoker.clone(),
                handle.clone(),
            )),
            actions: Arc::new(ActionRegistry::new(
                self.project_id.clone(),
                self.broadcaster.clone(),
                invoker.clone(),
                session.clone(),
            )),
            model_hooks: Arc::new(ModelHookRegistry::new(invoker.clone())),
            ui: Arc::new(UiCorrelator::new(
                self.project_id.clone(),
                self.broadcaster,
                session.clone(),
                invoker.clone(),
                config.form_ttl(),
            )),
            project_id: self.project_id,
            config,
            session,
            invoker,
            dispatcher,
            handle,
        };

        for (name, object) in runtime.globals() {
            runtime.invoker.set_global(name, object)?;
        }

        info!(target: "runtime", "Runtime for project '{}' ready", runtime.project_id);
        Ok(runtime)
    }
}

/// Everything one script session owns.
///
/// Each component is independent and reaches the engine only through the
/// shared [`Invoker`].
pub struct Runtime {
    project_id: String,
    config: RuntimeConfig,
    session: Arc<SessionContext>,
    invoker: Arc<dyn Invoker>,
    dispatcher: Option<Arc<EngineDispatcher>>,
    handle: Handle,
    router: Arc<Router>,
    modules: Arc<ModuleLoader>,
    pool: Arc<WorkerPool>,
    scheduler: Arc<Scheduler>,
    lifecycle: Arc<ServiceLifecycle>,
    actions: Arc<ActionRegistry>,
    model_hooks: Arc<ModelHookRegistry>,
    ui: Arc<UiCorrelator>,
}

impl Runtime {
    pub fn builder(project_id: impl Into<String>) -> RuntimeBuilder {
        RuntimeBuilder::new(project_id)
    }

    /// Host objects installed as script globals, by name
    pub fn globals(&self) -> Vec<(&'static str, Arc<dyn HostObject>)> {
        fn global(name: &'static str, object: impl HostObject + 'static) -> (&'static str, Arc<dyn HostObject>) {
            (name, Arc::new(object))
        }

        vec![
            global("router", RouterBinding(self.router.clone())),
            global("modules", ModulesBinding(self.modules.clone())),
            global("delayed", DelayedBinding(self.pool.clone())),
            global("scheduler", SchedulerBinding(self.scheduler.clone())),
            global("service", ServiceBinding(self.lifecycle.clone())),
            global(
                "hooks",
                HooksBinding {
                    actions: self.actions.clone(),
                    models: self.model_hooks.clone(),
                },
            ),
            global("ui", UiBinding(self.ui.clone())),
        ]
    }

    /// Load the entry module, which registers routes, jobs and hooks.
    ///
    /// Blocks while the module body runs; call it from a blocking context.
    pub fn run_main(&self, entry: &str) -> Result<Arc<ModuleExports>, RuntimeError> {
        debug!(target: "runtime", "Running entry module '{}'", entry);
        Ok(self.modules.require(entry)?)
    }

    /// Point the ambient session at the caller of the current request
    pub fn set_current_session(&self, session_id: Option<String>) {
        self.session.set_current(session_id);
    }

    /// Stop the engine thread, if this runtime owns one. Blocks until it exits.
    pub fn shutdown_engine(&self) {
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.shutdown();
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn session(&self) -> &Arc<SessionContext> {
        &self.session
    }

    pub fn invoker(&self) -> &Arc<dyn Invoker> {
        &self.invoker
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn modules(&self) -> &Arc<ModuleLoader> {
        &self.modules
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn lifecycle(&self) -> &Arc<ServiceLifecycle> {
        &self.lifecycle
    }

    pub fn actions(&self) -> &Arc<ActionRegistry> {
        &self.actions
    }

    pub fn model_hooks(&self) -> &Arc<ModelHookRegistry> {
        &self.model_hooks
    }

    pub fn ui(&self) -> &Arc<UiCorrelator> {
        &self.ui
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestInvoker;

    #[tokio::test]
    async fn test_build_requires_engine() {
        assert!(matches!(
            Runtime::builder("p").build(),
            Err(RuntimeError::MissingEngine)
        ));
    }

    #[test]
    fn test_build_requires_tokio() {
        let invoker = Arc::new(TestInvoker::new());
        assert!(matches!(
            Runtime::builder("p").with_invoker(invoker).build(),
            Err(RuntimeError::NoTokioRuntime(_))
        ));
    }

    #[tokio::test]
    async fn test_globals_are_installed() {
        let invoker = Arc::new(TestInvoker::new());
        let runtime = Runtime::builder("p")
            .with_invoker(invoker.clone())
            .build()
            .unwrap();

        for name in ["router", "modules", "delayed", "scheduler", "service", "hooks", "ui"] {
            assert!(invoker.engine().global(name).is_some(), "missing global {}", name);
        }
        assert_eq!(runtime.pool().size(), 10);
        assert!(runtime.dispatcher.is_none());
    }

    #[tokio::test]
    async fn test_unknown_entry_module() {
        let invoker = Arc::new(TestInvoker::new());
        let runtime = Runtime::builder("p").with_invoker(invoker).build().unwrap();
        assert!(matches!(
            runtime.run_main("main"),
            Err(RuntimeError::Entry(ModuleError::NotFound(_)))
        ));
    }
}
