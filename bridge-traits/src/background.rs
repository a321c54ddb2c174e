//! Background Execution and Task Scheduling
//!
//! Provides platform-aware deferred task scheduling. The cache engine uses it
//! to run the purge on a fixed cadence; each run re-registers the next one.

use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

/// Future returned by a task handler.
pub type TaskFuture = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;

/// Work executed each time a scheduled task fires.
pub type TaskHandler = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

/// Scheduled task identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

/// Task execution status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    /// Task is scheduled but not yet running
    Scheduled,
    /// Task is currently executing
    Running,
    /// Task completed successfully
    Completed,
    /// Task failed
    Failed,
    /// Task was cancelled
    Cancelled,
}

/// Background task executor trait
///
/// Abstracts platform-specific deferred execution:
/// - **iOS**: BGTaskScheduler (processing tasks)
/// - **Android**: WorkManager
/// - **Desktop**: in-process Tokio timers
///
/// Scheduling a task id that is already scheduled replaces the earlier
/// registration. That is what lets a running task register its own next run
/// before doing any work.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::background::BackgroundExecutor;
/// use std::time::Duration;
///
/// async fn schedule_purge(executor: &dyn BackgroundExecutor) -> Result<()> {
///     executor
///         .schedule_once("episode-cache.purge", Duration::from_secs(6 * 3600))
///         .await?;
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait BackgroundExecutor: Send + Sync {
    /// Register the work to run when `task_id` fires.
    ///
    /// Must be called before the first `schedule_once` for that id. On
    /// mobile platforms this maps to the launch-time handler registration.
    async fn register_task_handler(&self, task_id: &str, handler: TaskHandler) -> Result<()>;

    /// Schedule a one-time delayed task
    async fn schedule_once(&self, task_id: &str, delay: Duration) -> Result<TaskId>;

    /// Cancel a scheduled task
    async fn cancel_task(&self, task_id: &TaskId) -> Result<()>;

    /// Get status of a task
    async fn get_task_status(&self, task_id: &TaskId) -> Result<TaskStatus>;

    /// Check if background execution is available
    async fn is_available(&self) -> bool {
        true
    }

    /// Get estimated time until next execution window
    ///
    /// Returns `None` if the task is not waiting on a timer.
    async fn next_execution_time(&self, task_id: &TaskId) -> Result<Option<Duration>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id() {
        let id1 = TaskId::new("purge");
        let id2 = TaskId::new("purge");

        assert_eq!(id1, id2);
        assert_ne!(id1, TaskId::new("other"));
    }
}
