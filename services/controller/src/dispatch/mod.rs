//! Task dispatch.
//!
//! The scheduler never executes work itself: every unit of work is handed to
//! a [`TaskDispatcher`] as a named task on a named queue, carrying the key of
//! the record it targets. Handlers are idempotent and re-validate their
//! preconditions, so duplicate or stale tasks are harmless.

mod handler;
mod local;

use std::collections::HashMap;
use std::fmt;

pub use handler::TaskHandler;
pub use local::{LocalTaskQueue, QueuedTask, TaskReceiver, TaskRunner, DEFAULT_QUEUE_CAPACITY};

/// Parameter carrying the target record's key.
pub const KEY_PARAM: &str = "key";

/// Accepts tasks for asynchronous execution.
pub trait TaskDispatcher: Send + Sync {
    /// Enqueue a task. Returns false if the task could not be accepted; the
    /// next scheduler pass will emit it again.
    fn enqueue(&self, queue: &str, task_name: &str, params: HashMap<String, String>) -> bool;
}

/// A dispatched unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub queue: String,
    pub name: String,
    pub params: HashMap<String, String>,
}

/// Every kind of task the controller emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskKind {
    CreateRevision,
    DeleteRevisionResource,
    DeleteRevision,
    DeleteTemplate,
    CreateManager,
    ResizeManager,
    SyncManagerInstances,
    ShrinkDrainedManager,
    DeleteManagerResource,
    DeleteManager,
    CheckDeletedInstance,
    CleanupDrainedInstance,
    CleanupDeletedInstance,
}

impl TaskKind {
    pub const ALL: [TaskKind; 13] = [
        Self::CreateRevision,
        Self::DeleteRevisionResource,
        Self::DeleteRevision,
        Self::DeleteTemplate,
        Self::CreateManager,
        Self::ResizeManager,
        Self::SyncManagerInstances,
        Self::ShrinkDrainedManager,
        Self::DeleteManagerResource,
        Self::DeleteManager,
        Self::CheckDeletedInstance,
        Self::CleanupDrainedInstance,
        Self::CleanupDeletedInstance,
    ];

    /// Queue the task is dispatched on.
    pub fn queue(&self) -> &'static str {
        match self {
            Self::CreateRevision => "create-instance-template",
            Self::DeleteRevisionResource => "delete-instance-template",
            Self::DeleteRevision => "cleanup-instance-template-revision",
            Self::DeleteTemplate => "cleanup-instance-template",
            Self::CreateManager => "create-instance-group-manager",
            Self::ResizeManager => "resize-instance-group",
            Self::SyncManagerInstances => "fetch-instances",
            Self::ShrinkDrainedManager => "shrink-drained-instance-group-manager",
            Self::DeleteManagerResource => "delete-instance-group-manager",
            Self::DeleteManager => "cleanup-instance-group-manager",
            Self::CheckDeletedInstance => "mark-instance-deleted",
            Self::CleanupDrainedInstance => "delete-drained-instance",
            Self::CleanupDeletedInstance => "cleanup-deleted-instance",
        }
    }

    /// Handler route the task is addressed to.
    pub fn task_name(&self) -> String {
        format!("/internal/queues/{}", self.queue())
    }

    /// Look up a task kind by queue name.
    pub fn from_queue(queue: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.queue() == queue)
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.queue())
    }
}

/// Enqueue a task of `kind` targeting the record identified by `key`.
pub fn enqueue_key(dispatcher: &dyn TaskDispatcher, kind: TaskKind, key: &impl fmt::Display) -> bool {
    let params = HashMap::from([(KEY_PARAM.to_string(), key.to_string())]);
    dispatcher.enqueue(kind.queue(), &kind.task_name(), params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_queue_names_are_unique_and_routable() {
        let queues: HashSet<_> = TaskKind::ALL.iter().map(|k| k.queue()).collect();
        assert_eq!(queues.len(), TaskKind::ALL.len());

        for kind in TaskKind::ALL {
            assert_eq!(TaskKind::from_queue(kind.queue()), Some(kind));
        }
        assert_eq!(TaskKind::from_queue("unknown"), None);
    }

    #[test]
    fn test_task_name_is_route() {
        assert_eq!(
            TaskKind::ResizeManager.task_name(),
            "/internal/queues/resize-instance-group"
        );
    }
}
