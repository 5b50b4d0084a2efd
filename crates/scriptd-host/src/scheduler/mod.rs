pub mod cron;

pub use cron::{CronError, CronSchedule};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::dispatcher::Invoker;
use scriptd_api::Callable;

pub const DAILY: &str = "0 0 * * *";
pub const HOURLY: &str = "0 * * * *";

/// What happens when a job is due while its previous run is still going
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    /// Drop the tick
    #[default]
    Skip,
    /// Run the handler again alongside the earlier run
    Allow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct JobId(u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job#{}", self.0)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid cron spec '{spec}': {source}")]
    InvalidSpec {
        spec: String,
        #[source]
        source: CronError,
    },
}

struct ScheduledJob {
    id: JobId,
    schedule: CronSchedule,
    handler: Callable,
    in_flight: Arc<AtomicBool>,
}

/// Clears a job's in-flight flag when its run ends, however it ends
struct InFlight(Option<Arc<AtomicBool>>);

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Some(flag) = self.0.take() {
            flag.store(false, Ordering::SeqCst);
        }
    }
}

/// Cron-driven invocation of script callables.
///
/// Each job runs its own timer task; a failing or panicking handler only
/// affects its own tick.
pub struct Scheduler {
    jobs: Mutex<Vec<Arc<ScheduledJob>>>,
    stop: Mutex<Option<watch::Sender<bool>>>,
    next_id: AtomicU64,
    overlap: OverlapPolicy,
    invoker: Arc<dyn Invoker>,
    handle: Handle,
}

impl Scheduler {
    pub fn new(overlap: OverlapPolicy, invoker: Arc<dyn Invoker>, handle: Handle) -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
            stop: Mutex::new(None),
            next_id: AtomicU64::new(1),
            overlap,
            invoker,
            handle,
        }
    }

    /// Register a job, logging and dropping it if the spec does not parse
    pub fn add_job(&self, spec: &str, handler: Callable) -> Option<JobId> {
        match self.try_add_job(spec, handler) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(target: "scheduler", "Dropping job: {}", e);
                None
            }
        }
    }

    pub fn try_add_job(&self, spec: &str, handler: Callable) -> Result<JobId, ScheduleError> {
        let schedule = CronSchedule::parse(spec).map_err(|source| ScheduleError::InvalidSpec {
            spec: spec.to_string(),
            source,
        })?;

        let job = Arc::new(ScheduledJob {
            id: JobId(self.next_id.fetch_add(1, Ordering::SeqCst)),
            schedule,
            handler,
            in_flight: Arc::new(AtomicBool::new(false)),
        });
        let id = job.id;

        // Held across the push so a concurrent start() cannot spawn it twice
        let stop = self.stop.lock();
        self.jobs.lock().push(job.clone());
        debug!(target: "scheduler", "Registered {} ({})", id, job.schedule);

        if let Some(stop) = stop.as_ref() {
            self.spawn_job(job, stop.subscribe());
        }

        Ok(id)
    }

    pub fn daily(&self, handler: Callable) -> Option<JobId> {
        self.add_job(DAILY, handler)
    }

    pub fn hourly(&self, handler: Callable) -> Option<JobId> {
        self.add_job(HOURLY, handler)
    }

    /// Start every job's timer. No effect without jobs or when already running.
    pub fn start(&self) {
        let mut stop = self.stop.lock();
        if stop.is_some() {
            return;
        }

        let jobs = self.jobs.lock().clone();
        if jobs.is_empty() {
            debug!(target: "scheduler", "No jobs registered, not starting");
            return;
        }

        let (tx, _) = watch::channel(false);
        for job in jobs.iter() {
            self.spawn_job(job.clone(), tx.subscribe());
        }
        *stop = Some(tx);

        info!(target: "scheduler", "Scheduler started with {} job(s)", jobs.len());
    }

    /// Stop every timer. Runs already in progress finish on their own.
    pub fn stop(&self) {
        if let Some(tx) = self.stop.lock().take() {
            let _ = tx.send(true);
            info!(target: "scheduler", "Scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.stop.lock().is_some()
    }

    /// Registered jobs as `(id, spec)`
    pub fn jobs(&self) -> Vec<(JobId, String)> {
        self.jobs
            .lock()
            .iter()
            .map(|job| (job.id, job.schedule.source().to_string()))
            .collect()
    }

    fn spawn_job(&self, job: Arc<ScheduledJob>, stop: watch::Receiver<bool>) {
        let invoker = self.invoker.clone();
        let handle = self.handle.clone();
        let overlap = self.overlap;
        self.handle.spawn(run_job(job, invoker, handle, overlap, stop));
    }
}

async fn run_job(
    job: Arc<ScheduledJob>,
    invoker: Arc<dyn Invoker>,
    handle: Handle,
    overlap: OverlapPolicy,
    mut stop: watch::Receiver<bool>,
) {
    // Wall-clock schedule mapped onto the monotonic timer
    let anchor_wall = Utc::now();
    let anchor = Instant::now();
    let mut cursor = anchor_wall;

    loop {
        let Some(next) = job.schedule.next_after(cursor) else {
            warn!(target: "scheduler", "{} ({}) has no upcoming run", job.id, job.schedule);
            return;
        };

        let offset = (next - anchor_wall).to_std().unwrap_or_default();
        tokio::select! {
            _ = tokio::time::sleep_until(anchor + offset) => {}
            _ = stop.changed() => return,
        }
        cursor = next;

        let guard = match overlap {
            OverlapPolicy::Skip => {
                if job.in_flight.swap(true, Ordering::SeqCst) {
                    warn!(target: "scheduler", "{} is still running, skipping tick at {}", job.id, next);
                    continue;
                }
                InFlight(Some(job.in_flight.clone()))
            }
            OverlapPolicy::Allow => InFlight(None),
        };

        debug!(target: "scheduler", "Firing {} for {}", job.id, next);

        let invoker = invoker.clone();
        let id = job.id;
        let handler = job.handler;
        handle.spawn(async move {
            let _guard = guard;
            if let Err(e) = invoker.invoke(handler, vec![]).await {
                error!(target: "scheduler", "{} failed: {}", id, e);
            }
        });
    }
}
