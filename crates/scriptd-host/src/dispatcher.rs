use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::cell::RefCell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use crate::session::SessionBinding;
use scriptd_api::{Callable, ExportCollector, HostObject, ModuleFile, ScriptEngine, ScriptError, ScriptValue};

/// Anything that can run script callables on behalf of host components.
///
/// Every component that calls into the script goes through this seam. The
/// production implementation is [`EngineDispatcher`], which serializes calls
/// onto the thread that owns the engine.
#[async_trait]
pub trait Invoker: Send + Sync {
    /// Invoke a callable from async host code
    async fn invoke(&self, callable: Callable, args: Vec<ScriptValue>) -> Result<ScriptValue, ScriptError>;

    /// Like [`Invoker::invoke`], with `session` in scope while the callable
    /// and anything it calls back into the host run
    async fn invoke_in_session(
        &self,
        session: SessionBinding,
        callable: Callable,
        args: Vec<ScriptValue>,
    ) -> Result<ScriptValue, ScriptError>;

    /// Invoke a callable from synchronous code (host functions, plain threads)
    fn invoke_blocking(&self, callable: Callable, args: Vec<ScriptValue>) -> Result<ScriptValue, ScriptError>;

    /// Run a module body; synchronous because `require` is synchronous
    fn eval_module(&self, file: &ModuleFile, collector: ExportCollector) -> Result<(), ScriptError>;

    /// Install a host object as a script global
    fn set_global(&self, name: &str, object: Arc<dyn HostObject>) -> Result<(), ScriptError>;
}

type Reply<T> = Box<dyn FnOnce(Result<T, ScriptError>) + Send>;

enum Job {
    Invoke {
        callable: Callable,
        args: Vec<ScriptValue>,
        session: Option<SessionBinding>,
        reply: Reply<ScriptValue>,
    },
    Eval {
        file: ModuleFile,
        collector: ExportCollector,
        reply: Reply<()>,
    },
    SetGlobal {
        name: String,
        object: Arc<dyn HostObject>,
        reply: Reply<()>,
    },
}

static NEXT_DISPATCHER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Engine owned by the current thread, if this is a dispatcher thread
    static ACTIVE_ENGINE: RefCell<Option<(u64, Rc<dyn ScriptEngine>)>> = const { RefCell::new(None) };
}

/// Single-consumer actor owning one engine instance.
///
/// The engine is built and used on a dedicated thread, so it does not need to
/// be `Send`. Calls from other threads are queued; calls made from the engine
/// thread itself (a host function re-entering the dispatcher) run inline.
pub struct EngineDispatcher {
    id: u64,
    name: String,
    jobs: Mutex<Option<UnboundedSender<Job>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl EngineDispatcher {
    /// Start the engine thread and build the engine on it
    pub fn spawn<E, F>(name: impl Into<String>, factory: F) -> Result<Self, ScriptError>
    where
        E: ScriptEngine + 'static,
        F: FnOnce() -> Result<E, ScriptError> + Send + 'static,
    {
        let name = name.into();
        let id = NEXT_DISPATCHER_ID.fetch_add(1, Ordering::SeqCst);
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), ScriptError>>();

        let thread_name = format!("engine-{}", name);
        let thread = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let engine = match catch_unwind(AssertUnwindSafe(factory)) {
                    Ok(Ok(engine)) => engine,
                    Ok(Err(e)) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                    Err(payload) => {
                        let _ = ready_tx.send(Err(ScriptError::Panicked(panic_message(&payload))));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                run_engine_loop(id, Rc::new(engine), jobs_rx);
            })
            .map_err(|e| ScriptError::EngineUnavailable(format!("failed to spawn engine thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(ScriptError::EngineUnavailable(format!(
                    "engine thread for '{}' exited during startup",
                    name
                )));
            }
        }

        info!(target: "dispatcher", "Engine '{}' started", name);

        Ok(Self {
            id,
            name,
            jobs: Mutex::new(Some(jobs_tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the calling thread is this dispatcher's engine thread
    pub fn on_engine_thread(&self) -> bool {
        ACTIVE_ENGINE.with(|slot| matches!(&*slot.borrow(), Some((id, _)) if *id == self.id))
    }

    pub fn is_running(&self) -> bool {
        self.jobs.lock().is_some()
    }

    /// Stop accepting calls, drain queued ones, and join the engine thread.
    ///
    /// Blocks until the thread exits; from async code run it on a blocking
    /// thread.
    pub fn shutdown(&self) {
        if self.jobs.lock().take().is_none() {
            return;
        }

        debug!(target: "dispatcher", "Shutting down engine '{}'", self.name);

        if self.on_engine_thread() {
            // The loop exits once it returns to recv; joining ourselves would hang
            return;
        }

        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                error!(target: "dispatcher", "Engine thread for '{}' panicked", self.name);
            }
        }

        info!(target: "dispatcher", "Engine '{}' stopped", self.name);
    }

    async fn invoke_async(
        &self,
        session: Option<SessionBinding>,
        callable: Callable,
        args: Vec<ScriptValue>,
    ) -> Result<ScriptValue, ScriptError> {
        if self.on_engine_thread() {
            let _scope = session.as_ref().map(SessionBinding::enter);
            return self.run_inline(|engine| engine.invoke(callable, args));
        }

        let (tx, rx) = oneshot::channel();
        self.submit(Job::Invoke {
            callable,
            args,
            session,
            reply: Box::new(move |result| {
                let _ = tx.send(result);
            }),
        })?;
        rx.await.map_err(|_| self.dropped_call())?
    }

    fn run_inline<T>(&self, f: impl FnOnce(&dyn ScriptEngine) -> Result<T, ScriptError>) -> Result<T, ScriptError> {
        let engine = ACTIVE_ENGINE
            .with(|slot| slot.borrow().as_ref().map(|(_, engine)| engine.clone()))
            .ok_or_else(|| ScriptError::EngineUnavailable(self.name.clone()))?;
        guarded(|| f(engine.as_ref()))
    }

    fn submit(&self, job: Job) -> Result<(), ScriptError> {
        let jobs = self.jobs.lock();
        let sender = jobs
            .as_ref()
            .ok_or_else(|| ScriptError::EngineUnavailable(format!("engine '{}' is shut down", self.name)))?;
        sender
            .send(job)
            .map_err(|_| ScriptError::EngineUnavailable(format!("engine '{}' has stopped", self.name)))
    }

    fn dropped_call(&self) -> ScriptError {
        ScriptError::EngineUnavailable(format!("engine '{}' dropped the call", self.name))
    }
}

#[async_trait]
impl Invoker for EngineDispatcher {
    async fn invoke(&self, callable: Callable, args: Vec<ScriptValue>) -> Result<ScriptValue, ScriptError> {
        self.invoke_async(None, callable, args).await
    }

    async fn invoke_in_session(
        &self,
        session: SessionBinding,
        callable: Callable,
        args: Vec<ScriptValue>,
    ) -> Result<ScriptValue, ScriptError> {
        self.invoke_async(Some(session), callable, args).await
    }

    fn invoke_blocking(&self, callable: Callable, args: Vec<ScriptValue>) -> Result<ScriptValue, ScriptError> {
        if self.on_engine_thread() {
            return self.run_inline(|engine| engine.invoke(callable, args));
        }

        let (tx, rx) = std_mpsc::sync_channel(1);
        self.submit(Job::Invoke {
            callable,
            args,
            session: None,
            reply: Box::new(move |result| {
                let _ = tx.send(result);
            }),
        })?;
        rx.recv().map_err(|_| self.dropped_call())?
    }

    fn eval_module(&self, file: &ModuleFile, collector: ExportCollector) -> Result<(), ScriptError> {
        if self.on_engine_thread() {
            return self.run_inline(|engine| engine.eval_module(file, collector));
        }

        let (tx, rx) = std_mpsc::sync_channel(1);
        self.submit(Job::Eval {
            file: file.clone(),
            collector,
            reply: Box::new(move |result| {
                let _ = tx.send(result);
            }),
        })?;
        rx.recv().map_err(|_| self.dropped_call())?
    }

    fn set_global(&self, name: &str, object: Arc<dyn HostObject>) -> Result<(), ScriptError> {
        if self.on_engine_thread() {
            return self.run_inline(|engine| engine.set_global(name, object));
        }

        let (tx, rx) = std_mpsc::sync_channel(1);
        self.submit(Job::SetGlobal {
            name: name.to_string(),
            object,
            reply: Box::new(move |result| {
                let _ = tx.send(result);
            }),
        })?;
        rx.recv().map_err(|_| self.dropped_call())?
    }
}

impl Drop for EngineDispatcher {
    fn drop(&mut self) {
        // Closing the channel lets the engine thread finish on its own
        self.jobs.lock().take();
    }
}

fn run_engine_loop(id: u64, engine: Rc<dyn ScriptEngine>, mut jobs: UnboundedReceiver<Job>) {
    ACTIVE_ENGINE.with(|slot| *slot.borrow_mut() = Some((id, engine.clone())));

    while let Some(job) = jobs.blocking_recv() {
        match job {
            Job::Invoke {
                callable,
                args,
                session,
                reply,
            } => {
                let result = {
                    let _scope = session.as_ref().map(SessionBinding::enter);
                    guarded(|| engine.invoke(callable, args))
                };
                if let Err(ScriptError::Panicked(msg)) = &result {
                    error!(target: "dispatcher", "Engine '{}' panicked invoking {}: {}", engine.name(), callable, msg);
                }
                reply(result);
            }
            Job::Eval {
                file,
                collector,
                reply,
            } => {
                let result = guarded(|| engine.eval_module(&file, collector));
                reply(result);
            }
            Job::SetGlobal { name, object, reply } => {
                reply(guarded(|| engine.set_global(&name, object)));
            }
        }
    }

    ACTIVE_ENGINE.with(|slot| slot.borrow_mut().take());
}

/// Run engine code, turning a panic into a script error
pub(crate) fn guarded<T>(f: impl FnOnce() -> Result<T, ScriptError>) -> Result<T, ScriptError> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(ScriptError::Panicked(panic_message(&payload))),
    }
}

pub(crate) fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scriptd_api::{ModuleExports, NativeEngine};
    use serde_json::json;

    fn spawn_native() -> (Arc<NativeEngine>, EngineDispatcher) {
        let engine = Arc::new(NativeEngine::new("test"));
        let for_thread = engine.clone();
        let dispatcher = EngineDispatcher::spawn("test", move || Ok(for_thread)).unwrap();
        (engine, dispatcher)
    }

    #[test]
    fn test_invoke_blocking_runs_on_engine_thread() {
        let (engine, dispatcher) = spawn_native();
        let thread_name = engine.register(|_| {
            Ok(json!(std::thread::current().name().unwrap_or_default()).into())
        });

        let result = dispatcher.invoke_blocking(thread_name, vec![]).unwrap();
        assert_eq!(result.as_str(), Some("engine-test"));
        assert!(!dispatcher.on_engine_thread());
    }

    #[tokio::test]
    async fn test_async_invoke() {
        let (engine, dispatcher) = spawn_native();
        let echo = engine.register(|args| Ok(args.into_iter().next().unwrap_or_else(ScriptValue::null)));

        let result = dispatcher.invoke(echo, vec![json!("hi").into()]).await.unwrap();
        assert_eq!(result.as_str(), Some("hi"));
    }

    #[test]
    fn test_panic_becomes_error_and_thread_survives() {
        let (engine, dispatcher) = spawn_native();
        let boom = engine.register(|_| panic!("kaboom"));
        let ok = engine.register(|_| Ok(json!(1).into()));

        let err = dispatcher.invoke_blocking(boom, vec![]).unwrap_err();
        assert_eq!(err, ScriptError::Panicked("kaboom".to_string()));
        assert!(dispatcher.invoke_blocking(ok, vec![]).is_ok());
    }

    #[test]
    fn test_reentrant_call_runs_inline() {
        let engine = Arc::new(NativeEngine::new("test"));
        let for_thread = engine.clone();
        let dispatcher = Arc::new(EngineDispatcher::spawn("test", move || Ok(for_thread)).unwrap());

        let inner = engine.register(|_| Ok(json!("inner").into()));
        let outer_dispatcher = dispatcher.clone();
        let outer = engine.register(move |_| outer_dispatcher.invoke_blocking(inner, vec![]));

        let result = dispatcher.invoke_blocking(outer, vec![]).unwrap();
        assert_eq!(result.as_str(), Some("inner"));
    }

    #[test]
    fn test_eval_module() {
        let (engine, dispatcher) = spawn_native();
        engine.define_module("body:config", |exports| {
            exports.export("port", json!(8080));
            Ok(())
        });

        let exports = Arc::new(ModuleExports::new("config"));
        dispatcher
            .eval_module(
                &ModuleFile::new("config", "body:config"),
                ExportCollector::new(exports.clone()),
            )
            .unwrap();
        assert_eq!(exports.get("port").unwrap().as_json(), Some(&json!(8080)));
    }

    #[test]
    fn test_set_global_reaches_engine() {
        let (engine, dispatcher) = spawn_native();
        let exports = Arc::new(ModuleExports::new("g"));
        dispatcher
            .set_global("g", Arc::new(ExportCollector::new(exports)))
            .unwrap();
        assert!(engine.global("g").is_some());
    }

    #[test]
    fn test_calls_fail_after_shutdown() {
        let (engine, dispatcher) = spawn_native();
        let ok = engine.register(|_| Ok(ScriptValue::null()));

        dispatcher.shutdown();
        assert!(!dispatcher.is_running());
        assert!(matches!(
            dispatcher.invoke_blocking(ok, vec![]),
            Err(ScriptError::EngineUnavailable(_))
        ));
        // Idempotent
        dispatcher.shutdown();
    }

    #[test]
    fn test_factory_error_is_returned() {
        let result = EngineDispatcher::spawn("broken", || -> Result<NativeEngine, ScriptError> {
            Err(ScriptError::Thrown("syntax error".to_string()))
        });
        assert_eq!(
            result.err(),
            Some(ScriptError::Thrown("syntax error".to_string()))
        );
    }

    #[tokio::test]
    async fn test_session_binding_is_scoped_to_the_call() {
        use crate::session::SessionContext;

        let (engine, dispatcher) = spawn_native();
        let sessions = Arc::new(SessionContext::new());
        sessions.set_current(Some("live".to_string()));

        let reader = sessions.clone();
        let read_session = engine.register(move |_| Ok(json!(reader.current()).into()));

        let pinned = sessions.bind_current();
        sessions.set_current(Some("later".to_string()));

        let inside = dispatcher.invoke_in_session(pinned, read_session, vec![]).await.unwrap();
        assert_eq!(inside.as_str(), Some("live"));

        let after = dispatcher.invoke(read_session, vec![]).await.unwrap();
        assert_eq!(after.as_str(), Some("later"));
    }
}
