//! Orchestration core for scriptd.
//!
//! Host-side triggers (HTTP requests, cron ticks, background tasks, model
//! events, dialog responses) arrive on many threads. Every one of them reaches
//! the single-threaded script engine through an [`Invoker`], normally an
//! [`EngineDispatcher`] that owns the engine on its own thread.

pub mod bindings;
pub mod config;
pub mod dispatcher;
pub mod hooks;
pub mod lifecycle;
pub mod modules;
pub mod pool;
pub mod router;
pub mod runtime;
pub mod scheduler;
pub mod session;
pub mod ui;

#[cfg(test)]
mod test_support;

pub use config::RuntimeConfig;
pub use dispatcher::{EngineDispatcher, Invoker};
pub use hooks::{ActionContext, ActionRegistry, HookError, HookType, ModelHookRegistry, normalize_payload};
pub use lifecycle::{LifecycleError, Phase, ServiceLifecycle};
pub use modules::{ModuleError, ModuleLoader};
pub use pool::{PoolStats, TaskId, TaskState, WorkerPool};
pub use router::{Method, PathPattern, RequestContext, ResponseEnvelope, RouteError, Router};
pub use runtime::{Runtime, RuntimeBuilder, RuntimeError};
pub use scheduler::{CronError, CronSchedule, JobId, OverlapPolicy, ScheduleError, Scheduler};
pub use session::{SessionBinding, SessionContext, SessionScope, SessionSnapshot};
pub use ui::{FormController, UiCorrelator, UiError};
