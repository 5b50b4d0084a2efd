//! Drives one [`Runtime`] through its service lifetime.
//!
//! The runner loads the entry module, runs the boot and start phases, starts
//! the scheduler and the form sweeper, then waits for a shutdown request.
//! Shutdown stops the timers, runs the shutdown phase and finally stops the
//! engine thread.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use scriptd_host::{Runtime, UiCorrelator};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ScriptdConfig;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Config not specified - use .with_config()")]
    MissingConfig,

    #[error("Config is for project '{config}' but the runtime serves '{runtime}'")]
    ProjectMismatch { config: String, runtime: String },
}

/// Builder for [`ServiceRunner`]
pub struct ServiceRunnerBuilder {
    config: Option<ScriptdConfig>,
    shutdown_rx: Option<watch::Receiver<bool>>,
    sweep_interval: Duration,
    run_entry: bool,
}

impl ServiceRunnerBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            shutdown_rx: None,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            run_entry: true,
        }
    }

    pub fn with_config(mut self, config: ScriptdConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Stop when this channel flips to `true`, in addition to ctrl-c and SIGTERM
    pub fn with_shutdown(mut self, shutdown_rx: watch::Receiver<bool>) -> Self {
        self.shutdown_rx = Some(shutdown_rx);
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Skip loading the entry module, for runtimes already set up by the caller
    pub fn without_entry(mut self) -> Self {
        self.run_entry = false;
        self
    }

    pub fn build(self, runtime: Arc<Runtime>) -> Result<ServiceRunner, BuildError> {
        let config = self.config.ok_or(BuildError::MissingConfig)?;
        if config.project_id != runtime.project_id() {
            return Err(BuildError::ProjectMismatch {
                config: config.project_id,
                runtime: runtime.project_id().to_string(),
            });
        }

        Ok(ServiceRunner {
            entry: self.run_entry.then(|| config.scripts.entry.clone()),
            runtime,
            shutdown_rx: self.shutdown_rx,
            sweep_interval: self.sweep_interval,
        })
    }
}

impl Default for ServiceRunnerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ServiceRunner {
    runtime: Arc<Runtime>,
    entry: Option<String>,
    shutdown_rx: Option<watch::Receiver<bool>>,
    sweep_interval: Duration,
}

impl ServiceRunner {
    pub fn builder() -> ServiceRunnerBuilder {
        ServiceRunnerBuilder::new()
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Run until shutdown is requested.
    ///
    /// A failing entry module, boot or start phase ends the run with an
    /// error after stopping the engine. Shutdown callback failures are logged.
    pub async fn run(self) -> anyhow::Result<()> {
        let project = self.runtime.project_id().to_string();
        info!(target: "runner", "Starting service for project '{}'", project);

        if let Err(e) = self.start_up().await {
            stop_engine(&self.runtime).await;
            return Err(e);
        }

        let sweeper = spawn_form_sweeper(self.runtime.ui().clone(), self.sweep_interval);
        wait_for_shutdown(self.shutdown_rx).await;
        info!(target: "runner", "Shutting down service for project '{}'", project);

        self.runtime.scheduler().stop();
        sweeper.abort();

        if let Err(e) = self.runtime.lifecycle().execute_shutdown().await {
            warn!(target: "runner", "Shutdown phase failed: {}", e);
        }

        stop_engine(&self.runtime).await;
        info!(target: "runner", "Service for project '{}' stopped", project);
        Ok(())
    }

    async fn start_up(&self) -> anyhow::Result<()> {
        if let Some(entry) = self.entry.clone() {
            let runtime = self.runtime.clone();
            let name = entry.clone();
            tokio::task::spawn_blocking(move || runtime.run_main(&name))
                .await
                .context("entry module task panicked")?
                .with_context(|| format!("loading entry module '{}'", entry))?;
        }

        let lifecycle = self.runtime.lifecycle();
        lifecycle.execute_boot().await.context("boot phase")?;
        lifecycle.execute_start().await.context("start phase")?;

        self.runtime.scheduler().start();
        Ok(())
    }
}

async fn stop_engine(runtime: &Arc<Runtime>) {
    let runtime = runtime.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || runtime.shutdown_engine()).await {
        warn!(target: "runner", "Engine shutdown task failed: {}", e);
    }
}

fn spawn_form_sweeper(ui: Arc<UiCorrelator>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let dropped = ui.sweep_expired();
            if dropped > 0 {
                debug!(target: "runner", "Dropped {} expired form(s)", dropped);
            }
        }
    })
}

async fn wait_for_shutdown(shutdown_rx: Option<watch::Receiver<bool>>) {
    let requested = async move {
        let Some(mut rx) = shutdown_rx else {
            return std::future::pending::<()>().await;
        };
        let closed = rx.wait_for(|stop| *stop).await.is_err();
        if closed {
            // Sender gone without asking for shutdown; rely on signals
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = requested => info!(target: "runner", "Shutdown requested"),
        _ = tokio::signal::ctrl_c() => info!(target: "runner", "Received ctrl-c"),
        _ = terminate() => info!(target: "runner", "Received SIGTERM"),
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            warn!(target: "runner", "Cannot listen for SIGTERM: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await
}
