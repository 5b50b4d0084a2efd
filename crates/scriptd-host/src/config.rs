use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::pool::DEFAULT_POOL_SIZE;
use crate::scheduler::OverlapPolicy;

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_FORM_TTL: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_TASK_HISTORY: usize = 256;

/// Tunables for one runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker pool size; values <= 0 fall back to the default of 10
    pub pool_size: i64,

    /// Shutdown phase deadline in milliseconds; 0 means the 30s default
    pub shutdown_timeout_ms: u64,

    /// Idle time after which a pending form is dropped
    pub form_ttl_secs: u64,

    /// Finished task records kept for `task_state` lookups
    pub task_history: usize,

    /// What to do when a job ticks while its previous run is still going
    pub overlap: OverlapPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE as i64,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT.as_millis() as u64,
            form_ttl_secs: DEFAULT_FORM_TTL.as_secs(),
            task_history: DEFAULT_TASK_HISTORY,
            overlap: OverlapPolicy::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn effective_pool_size(&self) -> usize {
        if self.pool_size <= 0 {
            DEFAULT_POOL_SIZE
        } else {
            self.pool_size as usize
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        if self.shutdown_timeout_ms == 0 {
            DEFAULT_SHUTDOWN_TIMEOUT
        } else {
            Duration::from_millis(self.shutdown_timeout_ms)
        }
    }

    pub fn form_ttl(&self) -> Duration {
        if self.form_ttl_secs == 0 {
            DEFAULT_FORM_TTL
        } else {
            Duration::from_secs(self.form_ttl_secs)
        }
    }
}
