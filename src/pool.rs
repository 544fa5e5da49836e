use crate::gateway::GatewayError;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Semaphore, oneshot};
use tracing::{debug, warn};

/// How long `shutdown` waits for cancelled tasks to drain.
const SHUTDOWN_WAIT: std::time::Duration = std::time::Duration::from_millis(3000);

/// Cooperative cancellation flag shared between a task and its handle.
///
/// Raising the flag never interrupts a call already in flight; tasks
/// observe it at their next checkpoint.
#[derive(Debug, Clone)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Default for CancelFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Terminal state of a pooled task.
#[derive(Debug)]
pub enum TaskOutcome<T> {
    Completed(T),
    Failed(GatewayError),
    Cancelled,
}

/// Handle to a submitted task: raise its cancel flag, or await its outcome.
pub struct TaskHandle<T> {
    cancel: CancelFlag,
    rx: oneshot::Receiver<TaskOutcome<T>>,
}

impl<T> TaskHandle<T> {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Wait for the task to settle. A dropped sender reads as cancellation,
    /// which happens when the pool is shut down underneath the task.
    pub async fn join(self) -> TaskOutcome<T> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => TaskOutcome::Cancelled,
        }
    }
}

/// Bounded-concurrency task pool with cooperative cancellation.
///
/// Submission never blocks: tasks queue on a semaphore and at most
/// `workers` of them run at once. Every active task is tracked so
/// `cancel_all` can reach tasks that are still queued.
pub struct TaskPool {
    semaphore: Arc<Semaphore>,
    registry: Arc<Mutex<HashMap<u64, CancelFlag>>>,
    next_id: AtomicU64,
}

/// Worker count when the configuration does not pin one.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl TaskPool {
    pub fn new(workers: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(workers.max(1))),
            registry: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Submit a task. The future only starts once a worker slot is free;
    /// the flag is checked before acquiring a slot, after acquiring it, and
    /// again before the result is published, so a cancelled task never
    /// delivers a stale result.
    pub fn submit<T, F>(&self, fut: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, GatewayError>> + Send + 'static,
    {
        let cancel = CancelFlag::new();
        let (tx, rx) = oneshot::channel();

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut registry) = self.registry.lock() {
            registry.insert(id, cancel.clone());
        }

        let semaphore = Arc::clone(&self.semaphore);
        let registry = Arc::clone(&self.registry);
        let flag = cancel.clone();

        tokio::spawn(async move {
            let outcome = Self::run_task(semaphore, &flag, fut).await;
            if let Ok(mut registry) = registry.lock() {
                registry.remove(&id);
            }
            // The receiver may be gone if the caller stopped waiting.
            let _ = tx.send(outcome);
        });

        TaskHandle { cancel, rx }
    }

    async fn run_task<T, F>(
        semaphore: Arc<Semaphore>,
        flag: &CancelFlag,
        fut: F,
    ) -> TaskOutcome<T>
    where
        F: Future<Output = Result<T, GatewayError>>,
    {
        if flag.is_cancelled() {
            return TaskOutcome::Cancelled;
        }

        let _permit = match semaphore.acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return TaskOutcome::Cancelled,
        };

        if flag.is_cancelled() {
            return TaskOutcome::Cancelled;
        }

        let result = fut.await;

        if flag.is_cancelled() {
            return TaskOutcome::Cancelled;
        }

        match result {
            Ok(value) => TaskOutcome::Completed(value),
            Err(e) => TaskOutcome::Failed(e),
        }
    }

    /// Raise the cancel flag on every tracked task, queued or running.
    pub fn cancel_all(&self) {
        if let Ok(registry) = self.registry.lock() {
            debug!(tasks = registry.len(), "cancelling all pooled tasks");
            for flag in registry.values() {
                flag.cancel();
            }
        }
    }

    fn active_tasks(&self) -> usize {
        self.registry.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Cancel everything and wait a bounded time for tasks to settle.
    /// Returns whether the pool drained before the deadline.
    pub async fn shutdown(&self) -> bool {
        self.cancel_all();

        let deadline = tokio::time::Instant::now() + SHUTDOWN_WAIT;
        while self.active_tasks() > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining = self.active_tasks(),
                    "pool shutdown deadline reached with tasks still active"
                );
                return false;
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
        true
    }
}
