//! In-process task queue and its runner.
//!
//! The queue is bounded and every task carries its enqueue time. A task is
//! retained for at most [`MAX_TASK_RETENTION`] from enqueue to completion:
//! tasks that waited longer are dropped at dequeue, and running tasks are cut
//! off once their remaining retention runs out. The deleted-instance grace
//! window is derived from this bound.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use gcefleet_reconcile::MAX_TASK_RETENTION;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::{Task, TaskDispatcher, TaskHandler, KEY_PARAM};

/// Default number of tasks the queue holds before rejecting enqueues.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// A task waiting in a [`LocalTaskQueue`].
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub task: Task,
    pub enqueued_at: Instant,
}

/// Receiving half of a [`LocalTaskQueue`].
pub type TaskReceiver = mpsc::Receiver<QueuedTask>;

/// Task dispatcher backed by a bounded in-process channel.
#[derive(Clone)]
pub struct LocalTaskQueue {
    sender: mpsc::Sender<QueuedTask>,
}

impl LocalTaskQueue {
    /// Create a queue holding up to `capacity` tasks and the receiver a
    /// [`TaskRunner`] consumes.
    pub fn new(capacity: usize) -> (Self, TaskReceiver) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

impl TaskDispatcher for LocalTaskQueue {
    /// Fails when the queue is full or the runner has shut down.
    fn enqueue(&self, queue: &str, task_name: &str, params: HashMap<String, String>) -> bool {
        let task = Task {
            queue: queue.to_string(),
            name: task_name.to_string(),
            params,
        };
        self.sender
            .try_send(QueuedTask {
                task,
                enqueued_at: Instant::now(),
            })
            .is_ok()
    }
}

/// Executes queued tasks with bounded concurrency.
pub struct TaskRunner {
    handler: Arc<TaskHandler>,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    retention: Duration,
}

impl TaskRunner {
    pub fn new(handler: Arc<TaskHandler>, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            handler,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            retention: MAX_TASK_RETENTION,
        }
    }

    /// Override how long a task may live from enqueue to completion.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Run tasks until shutdown is signaled, then wait for in-flight tasks.
    ///
    /// A task is only dequeued once a permit is available, so waiting for
    /// capacity never delays shutdown. Once this returns the queue is closed
    /// and further enqueues fail.
    #[instrument(skip_all)]
    pub async fn run(&self, mut tasks: TaskReceiver, mut shutdown: watch::Receiver<bool>) {
        info!(
            max_concurrent = self.max_concurrent,
            retention_secs = self.retention.as_secs(),
            "Starting task runner"
        );
        let mut in_flight = JoinSet::new();

        'run: loop {
            let permit = tokio::select! {
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    Self::reap(joined);
                    continue;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            loop {
                tokio::select! {
                    queued = tasks.recv() => match queued {
                        Some(queued) => {
                            self.start(&mut in_flight, queued, permit);
                            break;
                        }
                        None => break 'run,
                    },
                    Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                        Self::reap(joined);
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break 'run;
                        }
                    }
                }
            }
        }

        info!("Task runner shutting down");
        tasks.close();
        Self::join_all(&mut in_flight).await;
    }

    /// Execute every task currently queued and wait for all of them.
    ///
    /// Returns the number of tasks started; stale tasks are dropped and not
    /// counted.
    pub async fn drain(&self, tasks: &mut TaskReceiver) -> usize {
        let mut in_flight = JoinSet::new();
        let mut executed = 0;
        while let Ok(queued) = tasks.try_recv() {
            let Ok(permit) = self.permits.clone().acquire_owned().await else {
                break;
            };
            if self.start(&mut in_flight, queued, permit) {
                executed += 1;
            }
        }
        Self::join_all(&mut in_flight).await;
        debug!(executed, "Drained task queue");
        executed
    }

    /// Spawn a task holding `permit`, unless it has outlived its retention.
    fn start(
        &self,
        in_flight: &mut JoinSet<()>,
        queued: QueuedTask,
        permit: OwnedSemaphorePermit,
    ) -> bool {
        let QueuedTask { task, enqueued_at } = queued;
        let age = enqueued_at.elapsed();
        let Some(remaining) = self.retention.checked_sub(age).filter(|r| !r.is_zero()) else {
            warn!(
                queue = %task.queue,
                key = task.params.get(KEY_PARAM).map(String::as_str).unwrap_or(""),
                age_secs = age.as_secs(),
                "Dropping task past its retention"
            );
            return false;
        };

        let handler = self.handler.clone();
        in_flight.spawn(async move {
            if tokio::time::timeout(remaining, handler.run(&task)).await.is_err() {
                warn!(queue = %task.queue, "Task exceeded its retention and was abandoned");
            }
            drop(permit);
        });
        true
    }

    fn reap(joined: Result<(), tokio::task::JoinError>) {
        if let Err(e) = joined {
            error!(error = %e, "Task panicked");
        }
    }

    async fn join_all(in_flight: &mut JoinSet<()>) {
        while let Some(joined) = in_flight.join_next().await {
            Self::reap(joined);
        }
    }
}
