use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::dispatcher::Invoker;
use scriptd_api::{Callable, ScriptError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Boot,
    Start,
    Shutdown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Boot => write!(f, "boot"),
            Phase::Start => write!(f, "start"),
            Phase::Shutdown => write!(f, "shutdown"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("{phase} callback #{index} failed: {source}")]
    Callback {
        phase: Phase,
        index: usize,
        #[source]
        source: ScriptError,
    },

    #[error("shutdown task aborted: {0}")]
    Aborted(String),
}

#[derive(Default)]
struct PhaseList {
    callbacks: Mutex<Vec<Callable>>,
    done: AtomicBool,
}

impl PhaseList {
    fn push(&self, callback: Callable) {
        self.callbacks.lock().push(callback);
    }

    fn snapshot(&self) -> Vec<Callable> {
        self.callbacks.lock().clone()
    }
}

/// Ordered boot, start and shutdown callbacks
pub struct ServiceLifecycle {
    boot: PhaseList,
    start: PhaseList,
    shutdown: PhaseList,
    shutdown_timeout: Duration,
    invoker: Arc<dyn Invoker>,
    handle: Handle,
}

impl ServiceLifecycle {
    pub fn new(shutdown_timeout: Duration, invoker: Arc<dyn Invoker>, handle: Handle) -> Self {
        Self {
            boot: PhaseList::default(),
            start: PhaseList::default(),
            shutdown: PhaseList::default(),
            shutdown_timeout,
            invoker,
            handle,
        }
    }

    pub fn on_boot(&self, callback: Callable) {
        self.boot.push(callback);
    }

    pub fn on_start(&self, callback: Callable) {
        self.start.push(callback);
    }

    pub fn on_shutdown(&self, callback: Callable) {
        self.shutdown.push(callback);
    }

    pub async fn execute_boot(&self) -> Result<(), LifecycleError> {
        self.execute(Phase::Boot, &self.boot).await
    }

    pub async fn execute_start(&self) -> Result<(), LifecycleError> {
        self.execute(Phase::Start, &self.start).await
    }

    /// Run shutdown callbacks, giving up after the configured timeout.
    ///
    /// On timeout this reports success and leaves the callbacks running in
    /// the background.
    pub async fn execute_shutdown(&self) -> Result<(), LifecycleError> {
        let callbacks = self.shutdown.snapshot();
        let invoker = self.invoker.clone();
        let task = self
            .handle
            .spawn(async move { run_phase(invoker.as_ref(), Phase::Shutdown, callbacks).await });

        match tokio::time::timeout(self.shutdown_timeout, task).await {
            Ok(Ok(result)) => {
                result?;
            }
            Ok(Err(e)) => return Err(LifecycleError::Aborted(e.to_string())),
            Err(_) => {
                warn!(
                    target: "lifecycle",
                    "Shutdown callbacks did not finish within {:?}, continuing",
                    self.shutdown_timeout
                );
            }
        }

        self.shutdown.done.store(true, Ordering::SeqCst);
        info!(target: "lifecycle", "Shutdown phase complete");
        Ok(())
    }

    pub fn is_booted(&self) -> bool {
        self.boot.done.load(Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.start.done.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.done.load(Ordering::SeqCst)
    }

    async fn execute(&self, phase: Phase, list: &PhaseList) -> Result<(), LifecycleError> {
        run_phase(self.invoker.as_ref(), phase, list.snapshot()).await?;
        list.done.store(true, Ordering::SeqCst);
        info!(target: "lifecycle", "{} phase complete", phase);
        Ok(())
    }
}

async fn run_phase(invoker: &dyn Invoker, phase: Phase, callbacks: Vec<Callable>) -> Result<(), LifecycleError> {
    debug!(target: "lifecycle", "Running {} {} callback(s)", callbacks.len(), phase);

    for (index, callback) in callbacks.into_iter().enumerate() {
        invoker
            .invoke(callback, vec![])
            .await
            .map_err(|source| LifecycleError::Callback {
                phase,
                index,
                source,
            })?;
    }
    Ok(())
}
