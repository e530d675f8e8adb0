//! Controller assembly.
//!
//! Builds the store, provider, lifecycle handlers, task queue and scheduler
//! from [`Settings`] and hands them to the binary as one value.

use std::sync::Arc;

use gcefleet_compute::{ComputeProvider, GceClient, MockProvider};
use gcefleet_reconcile::{DeletionGrace, ResizePolicy};
use tracing::info;

use crate::config::{ProviderKind, Settings};
use crate::dispatch::{LocalTaskQueue, TaskHandler, TaskReceiver, TaskRunner};
use crate::error::ControllerResult;
use crate::fleet::{ConfigSource, FileConfigSource};
use crate::lifecycle::Lifecycle;
use crate::resize::ResizeController;
use crate::scheduler::{PassStats, Scanner, SchedulerWorker};
use crate::store::Store;

/// A fully wired controller.
pub struct Controller {
    store: Arc<Store>,
    provider: Arc<dyn ComputeProvider>,
    scheduler: SchedulerWorker,
    runner: TaskRunner,
    tasks: TaskReceiver,
}

impl Controller {
    /// Build a controller from settings: opens the store, constructs the
    /// configured provider and reads the fleet file on every pass.
    pub fn from_settings(settings: &Settings) -> ControllerResult<Self> {
        let store = match &settings.store.path {
            Some(path) => {
                info!(path = %path.display(), "Opening state store");
                Store::open(path)?
            }
            None => {
                info!("Using in-memory state store");
                Store::open_in_memory()?
            }
        };

        let provider: Arc<dyn ComputeProvider> = match settings.provider.kind {
            ProviderKind::Gce => Arc::new(GceClient::new(
                settings.provider.base_url.as_str(),
                settings.provider.tokens(),
                settings.provider.request_timeout(),
            )?),
            ProviderKind::Mock => Arc::new(MockProvider::new()),
        };

        let source = Arc::new(FileConfigSource::new(&settings.fleet.config_path));
        Ok(Self::new(settings, Arc::new(store), provider, source))
    }

    /// Wire a controller around an existing store, provider and fleet
    /// configuration source.
    pub fn new(
        settings: &Settings,
        store: Arc<Store>,
        provider: Arc<dyn ComputeProvider>,
        source: Arc<dyn ConfigSource>,
    ) -> Self {
        let scheduler_settings = &settings.scheduler;
        let grace = DeletionGrace::new(scheduler_settings.deleted_instance_grace());
        let policy = ResizePolicy {
            step_limit: scheduler_settings.resize_step_limit,
        };

        let lifecycle = Arc::new(Lifecycle::new(store.clone(), provider.clone(), grace));
        let resizer = Arc::new(ResizeController::new(store.clone(), provider.clone(), policy));
        let handler = Arc::new(TaskHandler::new(lifecycle, resizer));

        let (queue, tasks) = LocalTaskQueue::new(scheduler_settings.queue_capacity);
        let runner = TaskRunner::new(handler, scheduler_settings.max_concurrent);
        let scanner = Scanner::new(store.clone(), Arc::new(queue), grace);
        let scheduler = SchedulerWorker::new(
            store.clone(),
            scanner,
            source,
            scheduler_settings.interval(),
        );

        Self {
            store,
            provider,
            scheduler,
            runner,
            tasks,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn provider(&self) -> &Arc<dyn ComputeProvider> {
        &self.provider
    }

    /// Run one scheduler pass and execute every task it emitted.
    pub async fn run_once(&mut self) -> ControllerResult<PassStats> {
        let stats = self.scheduler.run_once().await?;
        self.runner.drain(&mut self.tasks).await;
        Ok(stats)
    }

    /// Split into the parts the binary runs as background workers.
    pub fn into_workers(self) -> (SchedulerWorker, TaskRunner, TaskReceiver) {
        (self.scheduler, self.runner, self.tasks)
    }
}
