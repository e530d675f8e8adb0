//! Routes dispatched tasks to lifecycle and resize operations.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::{Task, TaskKind, KEY_PARAM};
use crate::error::{ControllerError, ControllerResult, Transition};
use crate::lifecycle::Lifecycle;
use crate::resize::ResizeController;

/// Executes tasks by queue name.
pub struct TaskHandler {
    lifecycle: Arc<Lifecycle>,
    resizer: Arc<ResizeController>,
}

impl TaskHandler {
    pub fn new(lifecycle: Arc<Lifecycle>, resizer: Arc<ResizeController>) -> Self {
        Self { lifecycle, resizer }
    }

    /// Execute a task and return the operation's outcome.
    pub async fn handle(&self, task: &Task) -> ControllerResult<Transition> {
        let kind = TaskKind::from_queue(&task.queue)
            .ok_or_else(|| ControllerError::InvalidTask(format!("unknown queue {}", task.queue)))?;
        let key = task.params.get(KEY_PARAM).ok_or_else(|| {
            ControllerError::InvalidTask(format!("{} task without a {KEY_PARAM}", task.queue))
        })?;

        match kind {
            TaskKind::CreateRevision => self.lifecycle.create_revision(&key.parse()?).await,
            TaskKind::DeleteRevisionResource => {
                self.lifecycle.delete_revision_resource(&key.parse()?).await
            }
            TaskKind::DeleteRevision => self.lifecycle.delete_revision(&key.parse()?).await,
            TaskKind::DeleteTemplate => self.lifecycle.delete_template(&key.parse()?).await,
            TaskKind::CreateManager => self.lifecycle.create_manager(&key.parse()?).await,
            TaskKind::ResizeManager => self.resizer.resize(&key.parse()?).await,
            TaskKind::SyncManagerInstances => {
                self.lifecycle.sync_manager_instances(&key.parse()?).await
            }
            TaskKind::ShrinkDrainedManager => {
                self.lifecycle.shrink_drained_manager(&key.parse()?).await
            }
            TaskKind::DeleteManagerResource => {
                self.lifecycle.delete_manager_resource(&key.parse()?).await
            }
            TaskKind::DeleteManager => self.lifecycle.delete_manager(&key.parse()?).await,
            TaskKind::CheckDeletedInstance => {
                self.lifecycle.check_deleted_instance(&key.parse()?).await
            }
            TaskKind::CleanupDrainedInstance => {
                self.lifecycle.cleanup_drained_instance(&key.parse()?).await
            }
            TaskKind::CleanupDeletedInstance => {
                self.lifecycle
                    .cleanup_deleted_instance(&key.parse()?, Utc::now())
                    .await
            }
        }
    }

    /// Execute a task and log its outcome. Failures are never retried here;
    /// the next scheduler pass emits the task again if it is still needed.
    pub async fn run(&self, task: &Task) {
        let key = task.params.get(KEY_PARAM).map(String::as_str).unwrap_or("");
        match self.handle(task).await {
            Ok(Transition::Applied) => info!(queue = %task.queue, key = %key, "Task applied"),
            Ok(Transition::Unchanged) => debug!(queue = %task.queue, key = %key, "Task had nothing to do"),
            Err(e) if e.is_benign() => warn!(queue = %task.queue, key = %key, error = %e, "Task skipped"),
            Err(e) => error!(queue = %task.queue, key = %key, error = %e, "Task failed"),
        }
    }
}
