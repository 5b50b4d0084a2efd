use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::runtime::Handle;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, warn};

use crate::dispatcher::Invoker;
use crate::session::{SessionBinding, SessionContext};
use scriptd_api::Callable;

pub const DEFAULT_POOL_SIZE: usize = 10;

/// Handle for one task submitted to the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaskId(u64);

impl TaskId {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Done,
    Failed,
}

impl TaskState {
    pub fn is_finished(&self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub spawned: u64,
    pub completed: u64,
    pub failed: u64,
    pub running: u64,
}

struct TaskTable {
    states: HashMap<TaskId, TaskState>,
    finished: VecDeque<TaskId>,
    history: usize,
    stats: PoolStats,
}

impl TaskTable {
    fn set(&mut self, id: TaskId, state: TaskState) {
        let previous = self.states.insert(id, state);
        if previous == Some(TaskState::Running) {
            self.stats.running = self.stats.running.saturating_sub(1);
        }

        match state {
            TaskState::Pending => self.stats.spawned += 1,
            TaskState::Running => self.stats.running += 1,
            TaskState::Done => self.stats.completed += 1,
            TaskState::Failed => self.stats.failed += 1,
        }

        if state.is_finished() {
            self.finished.push_back(id);
            while self.finished.len() > self.history {
                if let Some(oldest) = self.finished.pop_front() {
                    self.states.remove(&oldest);
                }
            }
        }
    }
}

/// Marks a task failed if it is dropped before reporting an outcome
struct TaskGuard {
    table: Arc<Mutex<TaskTable>>,
    id: TaskId,
    finished: bool,
}

impl TaskGuard {
    fn finish(mut self, state: TaskState) {
        self.table.lock().set(self.id, state);
        self.finished = true;
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if !self.finished {
            warn!(target: "pool", "{} aborted", self.id);
            self.table.lock().set(self.id, TaskState::Failed);
        }
    }
}

/// A submitted task waiting for a slot
struct QueuedTask {
    handler: Callable,
    session: SessionBinding,
    guard: TaskGuard,
}

/// Bounded fire-and-forget execution of script callables ("delayed" tasks).
///
/// At most `size` handlers run at once. Tasks are admitted in submission
/// order, so a single-slot pool runs them strictly one after another. Each
/// task runs under the session that was current when it was submitted.
pub struct WorkerPool {
    size: usize,
    semaphore: Arc<Semaphore>,
    table: Arc<Mutex<TaskTable>>,
    next_id: AtomicU64,
    queue: mpsc::UnboundedSender<QueuedTask>,
    session: Arc<SessionContext>,
}

impl WorkerPool {
    /// `size` <= 0 uses [`DEFAULT_POOL_SIZE`]
    pub fn new(
        size: i64,
        history: usize,
        invoker: Arc<dyn Invoker>,
        session: Arc<SessionContext>,
        handle: Handle,
    ) -> Self {
        let size = if size <= 0 {
            DEFAULT_POOL_SIZE
        } else {
            size as usize
        };

        let semaphore = Arc::new(Semaphore::new(size));
        let table = Arc::new(Mutex::new(TaskTable {
            states: HashMap::new(),
            finished: VecDeque::new(),
            history,
            stats: PoolStats::default(),
        }));
        let (queue, rx) = mpsc::unbounded_channel();
        handle.spawn(feed(rx, semaphore.clone(), table.clone(), invoker));

        Self {
            size,
            semaphore,
            table,
            next_id: AtomicU64::new(1),
            queue,
            session,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Queue `handler` and return immediately
    pub fn run(&self, handler: Callable) -> TaskId {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.table.lock().set(id, TaskState::Pending);

        let task = QueuedTask {
            handler,
            session: self.session.bind_current(),
            guard: TaskGuard {
                table: self.table.clone(),
                id,
                finished: false,
            },
        };
        if self.queue.send(task).is_err() {
            // Dropping the task's guard records the failure
            warn!(target: "pool", "{} rejected, pool is shut down", id);
        }

        id
    }

    /// State of a task, or `None` once its record has been pruned
    pub fn task_state(&self, id: TaskId) -> Option<TaskState> {
        self.table.lock().states.get(&id).copied()
    }

    pub fn stats(&self) -> PoolStats {
        self.table.lock().stats
    }

    /// Slots not currently held by a running task
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Admit queued tasks one at a time as slots free up.
///
/// Permits are taken here rather than inside each task so that the
/// semaphore sees requests in submission order.
async fn feed(
    mut rx: mpsc::UnboundedReceiver<QueuedTask>,
    semaphore: Arc<Semaphore>,
    table: Arc<Mutex<TaskTable>>,
    invoker: Arc<dyn Invoker>,
) {
    while let Some(task) = rx.recv().await {
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            return;
        };

        let QueuedTask {
            handler,
            session,
            guard,
        } = task;
        let id = guard.id;
        table.lock().set(id, TaskState::Running);
        debug!(target: "pool", "{} running {}", id, handler);

        let invoker = invoker.clone();
        tokio::spawn(async move {
            let _permit = permit;
            match invoker.invoke_in_session(session, handler, vec![]).await {
                Ok(_) => guard.finish(TaskState::Done),
                Err(e) => {
                    warn!(target: "pool", "{} failed: {}", id, e);
                    guard.finish(TaskState::Failed);
                }
            }
        });
    }
}
