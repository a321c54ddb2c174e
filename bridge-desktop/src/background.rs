//! Background Task Execution Implementation

use async_trait::async_trait;
use bridge_traits::{
    background::{BackgroundExecutor, TaskHandler, TaskId, TaskStatus},
    error::{BridgeError, Result},
    time::{Clock, SystemClock},
};
use core_async::sync::{oneshot, RwLock};
use core_async::task::JoinHandle;
use core_async::time::sleep;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

type TaskTable = Arc<RwLock<HashMap<TaskId, TaskInfo>>>;

/// Tokio-based background executor for desktop.
///
/// Scheduling an id that is already waiting replaces the earlier timer. A run
/// that is already executing is left alone so a handler may schedule its own
/// next run.
pub struct TokioBackgroundExecutor {
    tasks: TaskTable,
    handlers: Arc<RwLock<HashMap<String, TaskHandler>>>,
    generations: AtomicU64,
    clock: Arc<dyn Clock>,
}

struct TaskInfo {
    generation: u64,
    status: TaskStatus,
    handle: Option<JoinHandle<()>>,
    cancel: Option<oneshot::Sender<()>>,
    last_run: Option<i64>,
    next_run: Option<i64>,
}

impl TokioBackgroundExecutor {
    /// Create a new background executor on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a background executor with a custom clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            generations: AtomicU64::new(0),
            clock,
        }
    }

    fn now_millis(clock: &dyn Clock) -> i64 {
        clock.unix_timestamp_millis()
    }

    fn duration_to_millis(duration: Duration) -> i64 {
        duration.as_millis().min(i64::MAX as u128) as i64
    }

    fn schedule_after(clock: &dyn Clock, delay: Duration) -> i64 {
        let now = Self::now_millis(clock);
        now.saturating_add(Self::duration_to_millis(delay))
    }

    fn millis_to_duration(millis: i64) -> Duration {
        if millis <= 0 {
            Duration::from_secs(0)
        } else {
            Duration::from_millis(millis as u64)
        }
    }

    async fn handler_for(&self, task_id: &str) -> Option<TaskHandler> {
        let handlers = self.handlers.read().await;
        handlers.get(task_id).cloned()
    }

    async fn update_current<F>(tasks: &TaskTable, id: &TaskId, generation: u64, update: F)
    where
        F: FnOnce(&mut TaskInfo),
    {
        let mut tasks = tasks.write().await;
        if let Some(info) = tasks.get_mut(id) {
            if info.generation == generation {
                update(info);
            }
        }
    }

    async fn run_one_time_task(
        tasks: TaskTable,
        id: TaskId,
        generation: u64,
        handler: TaskHandler,
        delay: Duration,
        cancel_rx: oneshot::Receiver<()>,
        clock: Arc<dyn Clock>,
    ) {
        tokio::select! {
            _ = cancel_rx => {
                Self::update_current(&tasks, &id, generation, |info| {
                    info.status = TaskStatus::Cancelled;
                    info.next_run = None;
                })
                .await;
                return;
            }
            _ = sleep(delay) => {}
        }

        Self::update_current(&tasks, &id, generation, |info| {
            info.status = TaskStatus::Running;
            info.next_run = None;
            info.cancel = None;
        })
        .await;

        debug!(task_id = %id.0, "Running scheduled task");
        let result = handler().await;

        Self::update_current(&tasks, &id, generation, |info| {
            info.last_run = Some(Self::now_millis(clock.as_ref()));
            info.status = match &result {
                Ok(()) => TaskStatus::Completed,
                Err(_) => TaskStatus::Failed,
            };
        })
        .await;

        if let Err(err) = result {
            warn!(task_id = %id.0, error = %err, "Scheduled task failed");
        }
    }
}

impl Default for TokioBackgroundExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackgroundExecutor for TokioBackgroundExecutor {
    async fn register_task_handler(&self, task_id: &str, handler: TaskHandler) -> Result<()> {
        let mut handlers = self.handlers.write().await;
        handlers.insert(task_id.to_string(), handler);
        debug!(task_id, "Registered task handler");
        Ok(())
    }

    async fn schedule_once(&self, task_id: &str, delay: Duration) -> Result<TaskId> {
        let id = TaskId::new(task_id);

        debug!(
            task_id = task_id,
            delay_secs = delay.as_secs(),
            "Scheduling one-time task"
        );

        let handler = self.handler_for(task_id).await.ok_or_else(|| {
            BridgeError::OperationFailed(format!("No handler registered for task: {}", task_id))
        })?;
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);

        let mut tasks = self.tasks.write().await;
        let previous = tasks.insert(
            id.clone(),
            TaskInfo {
                generation,
                status: TaskStatus::Scheduled,
                handle: None,
                cancel: Some(cancel_tx),
                last_run: None,
                next_run: Some(Self::schedule_after(self.clock.as_ref(), delay)),
            },
        );

        if let Some(mut previous) = previous {
            if previous.status == TaskStatus::Scheduled {
                debug!(task_id, "Replacing scheduled task");
                if let Some(cancel) = previous.cancel.take() {
                    let _ = cancel.send(());
                }
            }
            if let Some(info) = tasks.get_mut(&id) {
                info.last_run = previous.last_run;
            }
        }

        let handle = tokio::spawn(TokioBackgroundExecutor::run_one_time_task(
            Arc::clone(&self.tasks),
            id.clone(),
            generation,
            handler,
            delay,
            cancel_rx,
            Arc::clone(&self.clock),
        ));

        if let Some(info) = tasks.get_mut(&id) {
            info.handle = Some(handle);
        }

        Ok(id)
    }

    async fn cancel_task(&self, task_id: &TaskId) -> Result<()> {
        debug!(task_id = ?task_id, "Cancelling task");

        let mut tasks = self.tasks.write().await;
        if let Some(mut info) = tasks.remove(task_id) {
            if let Some(cancel) = info.cancel.take() {
                let _ = cancel.send(());
            }
            if info.status == TaskStatus::Scheduled {
                if let Some(handle) = info.handle.take() {
                    handle.abort();
                }
            }
            return Ok(());
        }

        Err(BridgeError::OperationFailed(format!(
            "Task not found: {:?}",
            task_id
        )))
    }

    async fn get_task_status(&self, task_id: &TaskId) -> Result<TaskStatus> {
        let tasks = self.tasks.read().await;
        tasks
            .get(task_id)
            .map(|info| info.status.clone())
            .ok_or_else(|| BridgeError::OperationFailed(format!("Task not found: {:?}", task_id)))
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn next_execution_time(&self, task_id: &TaskId) -> Result<Option<Duration>> {
        let tasks = self.tasks.read().await;
        if let Some(info) = tasks.get(task_id) {
            if let Some(next) = info.next_run {
                let now = Self::now_millis(self.clock.as_ref());
                let remaining = next - now;
                Ok(Some(Self::millis_to_duration(remaining)))
            } else {
                Ok(None)
            }
        } else {
            Err(BridgeError::OperationFailed(format!(
                "Task not found: {:?}",
                task_id
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::background::TaskFuture;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    fn counting_handler(counter: Arc<AtomicUsize>) -> TaskHandler {
        Arc::new(move || {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }) as TaskFuture
        })
    }

    #[core_async::test]
    async fn test_background_executor_creation() {
        let executor = TokioBackgroundExecutor::new();
        assert!(executor.is_available().await);
    }

    #[core_async::test]
    async fn test_schedule_once_executes() {
        let executor = TokioBackgroundExecutor::new();
        let flag = Arc::new(AtomicBool::new(false));
        let flag_clone = Arc::clone(&flag);

        executor
            .register_task_handler(
                "once",
                Arc::new(move || {
                    let flag = Arc::clone(&flag_clone);
                    Box::pin(async move {
                        flag.store(true, Ordering::SeqCst);
                        Ok(())
                    }) as TaskFuture
                }),
            )
            .await
            .unwrap();

        let task_id = executor
            .schedule_once("once", Duration::from_millis(25))
            .await
            .unwrap();

        sleep(Duration::from_millis(100)).await;

        assert_eq!(
            executor.get_task_status(&task_id).await.unwrap(),
            TaskStatus::Completed
        );
        assert!(flag.load(Ordering::SeqCst));
        assert_eq!(executor.next_execution_time(&task_id).await.unwrap(), None);
    }

    #[core_async::test]
    async fn test_schedule_without_handler_fails() {
        let executor = TokioBackgroundExecutor::new();
        assert!(executor
            .schedule_once("missing", Duration::from_millis(10))
            .await
            .is_err());
    }

    #[core_async::test]
    async fn test_rescheduling_replaces_waiting_timer() {
        let executor = TokioBackgroundExecutor::new();
        let counter = Arc::new(AtomicUsize::new(0));
        executor
            .register_task_handler("purge", counting_handler(Arc::clone(&counter)))
            .await
            .unwrap();

        executor
            .schedule_once("purge", Duration::from_millis(30))
            .await
            .unwrap();
        let task_id = executor
            .schedule_once("purge", Duration::from_secs(5))
            .await
            .unwrap();

        sleep(Duration::from_millis(120)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        let remaining = executor.next_execution_time(&task_id).await.unwrap().unwrap();
        assert!(remaining > Duration::from_secs(1));

        executor.cancel_task(&task_id).await.unwrap();
    }

    #[core_async::test]
    async fn test_handler_can_schedule_its_next_run() {
        let executor = Arc::new(TokioBackgroundExecutor::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let handler_executor = Arc::clone(&executor);
        let handler_runs = Arc::clone(&runs);
        executor
            .register_task_handler(
                "chain",
                Arc::new(move || {
                    let executor = Arc::clone(&handler_executor);
                    let runs = Arc::clone(&handler_runs);
                    Box::pin(async move {
                        if runs.fetch_add(1, Ordering::SeqCst) < 2 {
                            executor
                                .schedule_once("chain", Duration::from_millis(10))
                                .await?;
                        }
                        sleep(Duration::from_millis(5)).await;
                        Ok(())
                    }) as TaskFuture
                }),
            )
            .await
            .unwrap();

        executor
            .schedule_once("chain", Duration::from_millis(10))
            .await
            .unwrap();

        sleep(Duration::from_millis(200)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[core_async::test]
    async fn test_cancel_task() {
        let executor = TokioBackgroundExecutor::new();
        let counter = Arc::new(AtomicUsize::new(0));
        executor
            .register_task_handler("cancel", counting_handler(Arc::clone(&counter)))
            .await
            .unwrap();

        let task_id = executor
            .schedule_once("cancel", Duration::from_millis(30))
            .await
            .unwrap();

        executor.cancel_task(&task_id).await.unwrap();
        assert!(executor.get_task_status(&task_id).await.is_err());

        sleep(Duration::from_millis(80)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
