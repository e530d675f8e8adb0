//! Hierarchy scanner.
//!
//! Walks a snapshot of the store and emits one task per record that needs
//! work. The scanner writes nothing; every emitted task re-validates its own
//! preconditions when it runs.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use gcefleet_reconcile::DeletionGrace;
use tracing::{debug, warn};

use crate::dispatch::{enqueue_key, TaskDispatcher, TaskKind};
use crate::store::{Hierarchy, Store, StoreError};

/// Counts of tasks emitted by one scan.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanStats {
    pub enqueued: BTreeMap<TaskKind, usize>,
    pub rejected: usize,
}

impl ScanStats {
    /// Total tasks accepted by the dispatcher.
    pub fn total(&self) -> usize {
        self.enqueued.values().sum()
    }

    /// Tasks of one kind accepted by the dispatcher.
    pub fn count(&self, kind: TaskKind) -> usize {
        self.enqueued.get(&kind).copied().unwrap_or(0)
    }
}

/// Emits tasks for every record that needs work.
pub struct Scanner {
    store: Arc<Store>,
    dispatcher: Arc<dyn TaskDispatcher>,
    grace: DeletionGrace,
}

impl Scanner {
    pub fn new(store: Arc<Store>, dispatcher: Arc<dyn TaskDispatcher>, grace: DeletionGrace) -> Self {
        Self {
            store,
            dispatcher,
            grace,
        }
    }

    /// Scan the hierarchy once and emit tasks.
    pub fn scan(&self, now: DateTime<Utc>) -> Result<ScanStats, StoreError> {
        let hierarchy = Hierarchy::load(&self.store)?;
        let mut stats = ScanStats::default();

        self.schedule_revision_creation(&hierarchy, &mut stats);
        self.schedule_manager_creation(&hierarchy, &mut stats);
        self.schedule_instance_discovery(&hierarchy, &mut stats);
        self.schedule_resize(&hierarchy, &mut stats);
        self.schedule_drained_manager_shrink(&hierarchy, &mut stats);
        self.schedule_drained_instance_deletion(&hierarchy, &mut stats);
        self.schedule_manager_deletion(&hierarchy, &mut stats);
        self.schedule_revision_deletion(&hierarchy, &mut stats);
        self.schedule_template_deletion(&hierarchy, &mut stats);
        self.schedule_deleted_instance_check(&hierarchy, &mut stats);
        self.schedule_deleted_instance_cleanup(&hierarchy, now, &mut stats);

        debug!(
            enqueued = stats.total(),
            rejected = stats.rejected,
            "Hierarchy scan complete"
        );
        Ok(stats)
    }

    fn emit(&self, kind: TaskKind, key: &impl fmt::Display, stats: &mut ScanStats) {
        if enqueue_key(self.dispatcher.as_ref(), kind, key) {
            *stats.enqueued.entry(kind).or_default() += 1;
        } else {
            warn!(queue = kind.queue(), key = %key, "Failed to enqueue task");
            stats.rejected += 1;
        }
    }

    /// Active revisions without a provider template.
    fn schedule_revision_creation(&self, h: &Hierarchy, stats: &mut ScanStats) {
        for revision in h.active_revisions().filter(|r| r.url.is_none()) {
            self.emit(TaskKind::CreateRevision, &revision.key, stats);
        }
    }

    /// Active managers without a provider manager whose revision template exists.
    fn schedule_manager_creation(&self, h: &Hierarchy, stats: &mut ScanStats) {
        for manager in h.active_managers().filter(|m| m.url.is_none()) {
            let template_ready = h
                .revisions
                .get(manager.key.revision())
                .is_some_and(|r| r.url.is_some());
            if template_ready {
                self.emit(TaskKind::CreateManager, &manager.key, stats);
            }
        }
    }

    /// Every manager with a provider resource, drained or not.
    fn schedule_instance_discovery(&self, h: &Hierarchy, stats: &mut ScanStats) {
        for manager in h.managers.values().filter(|m| m.url.is_some()) {
            self.emit(TaskKind::SyncManagerInstances, &manager.key, stats);
        }
    }

    /// Active managers with a provider resource.
    fn schedule_resize(&self, h: &Hierarchy, stats: &mut ScanStats) {
        for manager in h.active_managers().filter(|m| m.url.is_some()) {
            self.emit(TaskKind::ResizeManager, &manager.key, stats);
        }
    }

    /// Drained managers with a provider resource that still own live,
    /// uncataloged instances.
    fn schedule_drained_manager_shrink(&self, h: &Hierarchy, stats: &mut ScanStats) {
        for manager in h.drained_managers().filter(|m| m.url.is_some()) {
            let has_removable = manager.instances.iter().any(|key| {
                h.instances
                    .get(key)
                    .is_some_and(|i| !i.deleted && !i.cataloged && i.url.is_some())
            });
            if has_removable {
                self.emit(TaskKind::ShrinkDrainedManager, &manager.key, stats);
            }
        }
    }

    /// Live, uncataloged instances of drained managers.
    fn schedule_drained_instance_deletion(&self, h: &Hierarchy, stats: &mut ScanStats) {
        for instance in h
            .instances_of_drained_managers()
            .filter(|i| !i.deleted && !i.cataloged && i.url.is_some())
        {
            self.emit(TaskKind::CleanupDrainedInstance, &instance.key, stats);
        }
    }

    /// Drained managers: the provider resource first once the manager is
    /// empty, then the record once the resource is gone.
    fn schedule_manager_deletion(&self, h: &Hierarchy, stats: &mut ScanStats) {
        for manager in h.drained_managers().filter(|m| m.instances.is_empty()) {
            let kind = if manager.url.is_some() {
                TaskKind::DeleteManagerResource
            } else {
                TaskKind::DeleteManager
            };
            self.emit(kind, &manager.key, stats);
        }
    }

    /// Drained revisions with no managers: the provider template first, then
    /// the record.
    fn schedule_revision_deletion(&self, h: &Hierarchy, stats: &mut ScanStats) {
        for revision in h.drained_revisions().filter(|r| !r.has_managers()) {
            let kind = if revision.url.is_some() {
                TaskKind::DeleteRevisionResource
            } else {
                TaskKind::DeleteRevision
            };
            self.emit(kind, &revision.key, stats);
        }
    }

    /// Templates that no longer reference any revision.
    fn schedule_template_deletion(&self, h: &Hierarchy, stats: &mut ScanStats) {
        for template in h.templates.values().filter(|t| t.is_empty()) {
            self.emit(TaskKind::DeleteTemplate, &template.key, stats);
        }
    }

    /// Instances pending deletion that are not yet confirmed deleted.
    fn schedule_deleted_instance_check(&self, h: &Hierarchy, stats: &mut ScanStats) {
        for instance in h
            .instances
            .values()
            .filter(|i| i.pending_deletion && !i.deleted)
        {
            self.emit(TaskKind::CheckDeletedInstance, &instance.key, stats);
        }
    }

    /// Deleted instances whose grace window has elapsed.
    fn schedule_deleted_instance_cleanup(
        &self,
        h: &Hierarchy,
        now: DateTime<Utc>,
        stats: &mut ScanStats,
    ) {
        for instance in h
            .instances
            .values()
            .filter(|i| i.deleted && self.grace.has_elapsed(i.last_updated, now))
        {
            self.emit(TaskKind::CleanupDeletedInstance, &instance.key, stats);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use chrono::Duration;
    use gcefleet_keys::{ManagerKey, RevisionKey};

    use super::*;
    use crate::dispatch::KEY_PARAM;
    use crate::store::{InstanceRecord, ManagerRecord, RevisionRecord, TemplateRecord};

    /// Records every task; optionally rejects them all.
    #[derive(Default)]
    struct RecordingDispatcher {
        tasks: Mutex<Vec<(String, String)>>,
        reject: bool,
    }

    impl TaskDispatcher for RecordingDispatcher {
        fn enqueue(&self, queue: &str, _task_name: &str, params: HashMap<String, String>) -> bool {
            if self.reject {
                return false;
            }
            self.tasks
                .lock()
                .unwrap()
                .push((queue.to_string(), params[KEY_PARAM].clone()));
            true
        }
    }

    impl RecordingDispatcher {
        fn keys(&self, kind: TaskKind) -> Vec<String> {
            self.tasks
                .lock()
                .unwrap()
                .iter()
                .filter(|(queue, _)| queue == kind.queue())
                .map(|(_, key)| key.clone())
                .collect()
        }
    }

    struct World {
        store: Arc<Store>,
        template: TemplateRecord,
        old: RevisionRecord,
        new: RevisionRecord,
    }

    /// A template whose old revision was drained in favour of a new one.
    fn world() -> World {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mut template = TemplateRecord::new("linux", "fleet-project");
        let old = RevisionRecord::new(
            RevisionKey::new(template.key.clone(), "aaaaaaaaaaaaaaaa").unwrap(),
            "linux",
            "fleet-project",
            serde_json::json!({}),
        );
        let new = RevisionRecord::new(
            RevisionKey::new(template.key.clone(), "bbbbbbbbbbbbbbbb").unwrap(),
            "linux",
            "fleet-project",
            serde_json::json!({}),
        );
        template.active = Some(new.key.clone());
        template.drained.insert(old.key.clone());
        World {
            store,
            template,
            old,
            new,
        }
    }

    impl World {
        fn manager(&mut self, old: bool, zone: &str, url: bool) -> ManagerRecord {
            let revision = if old { &mut self.old } else { &mut self.new };
            let mut manager =
                ManagerRecord::new(ManagerKey::new(revision.key.clone(), zone).unwrap(), 2, 4);
            if url {
                manager.url = Some(format!("https://compute/igm/{zone}"));
            }
            revision.active.insert(manager.key.clone());
            manager
        }

        fn save(&self, managers: &[&ManagerRecord], instances: &[&InstanceRecord]) {
            self.store
                .transaction(|tx| -> Result<(), StoreError> {
                    tx.put(&self.template)?;
                    tx.put(&self.old)?;
                    tx.put(&self.new)?;
                    for manager in managers {
                        tx.put(*manager)?;
                    }
                    for instance in instances {
                        tx.put(*instance)?;
                    }
                    Ok(())
                })
                .unwrap();
        }

        fn scan(&self, now: DateTime<Utc>) -> (Arc<RecordingDispatcher>, ScanStats) {
            let dispatcher = Arc::new(RecordingDispatcher::default());
            let scanner = Scanner::new(self.store.clone(), dispatcher.clone(), DeletionGrace::default());
            let stats = scanner.scan(now).unwrap();
            (dispatcher, stats)
        }
    }

    #[test]
    fn test_creation_waits_for_parent_url() {
        let mut w = world();
        let manager = w.manager(false, "us-central1-b", false);
        w.save(&[&manager], &[]);

        let (dispatcher, _) = w.scan(Utc::now());
        assert_eq!(dispatcher.keys(TaskKind::CreateRevision), vec![w.new.key.to_string()]);
        assert!(dispatcher.keys(TaskKind::CreateManager).is_empty());

        w.new.url = Some("https://compute/templates/new".to_string());
        w.save(&[&manager], &[]);
        let (dispatcher, _) = w.scan(Utc::now());
        assert!(dispatcher.keys(TaskKind::CreateRevision).is_empty());
        assert_eq!(dispatcher.keys(TaskKind::CreateManager), vec![manager.key.to_string()]);
    }

    #[test]
    fn test_resize_only_active_managers() {
        let mut w = world();
        let active = w.manager(false, "us-central1-b", true);
        let drained = w.manager(true, "us-central1-b", true);
        w.save(&[&active, &drained], &[]);

        let (dispatcher, _) = w.scan(Utc::now());

        assert_eq!(dispatcher.keys(TaskKind::ResizeManager), vec![active.key.to_string()]);
        assert_eq!(dispatcher.keys(TaskKind::SyncManagerInstances).len(), 2);
    }

    #[test]
    fn test_implicitly_drained_manager_is_torn_down() {
        let mut w = world();
        let drained = w.manager(true, "us-central1-b", true);
        let instance = InstanceRecord::new(
            "linux-aaaaaaaa-x1",
            drained.key.clone(),
            Some("https://compute/instances/linux-aaaaaaaa-x1".to_string()),
            Utc::now(),
        );
        let mut with_instance = drained.clone();
        with_instance.instances.insert(instance.key.clone());
        w.save(&[&with_instance], &[&instance]);

        let (dispatcher, _) = w.scan(Utc::now());
        assert_eq!(
            dispatcher.keys(TaskKind::ShrinkDrainedManager),
            vec![drained.key.to_string()]
        );
        assert_eq!(
            dispatcher.keys(TaskKind::CleanupDrainedInstance),
            vec![instance.key.to_string()]
        );
        assert!(dispatcher.keys(TaskKind::DeleteManagerResource).is_empty());

        w.save(&[&drained], &[]);
        let (dispatcher, _) = w.scan(Utc::now());
        assert!(dispatcher.keys(TaskKind::ShrinkDrainedManager).is_empty());
        assert_eq!(
            dispatcher.keys(TaskKind::DeleteManagerResource),
            vec![drained.key.to_string()]
        );
        assert!(dispatcher.keys(TaskKind::DeleteRevisionResource).is_empty());
    }

    #[test]
    fn test_empty_drained_revision_deletion_order() {
        let mut w = world();
        w.old.url = Some("https://compute/templates/old".to_string());
        w.save(&[], &[]);

        let (dispatcher, _) = w.scan(Utc::now());
        assert_eq!(
            dispatcher.keys(TaskKind::DeleteRevisionResource),
            vec![w.old.key.to_string()]
        );
        assert!(dispatcher.keys(TaskKind::DeleteRevision).is_empty());

        w.old.url = None;
        w.save(&[], &[]);
        let (dispatcher, _) = w.scan(Utc::now());
        assert_eq!(dispatcher.keys(TaskKind::DeleteRevision), vec![w.old.key.to_string()]);
        assert!(dispatcher.keys(TaskKind::DeleteTemplate).is_empty());
    }

    #[test]
    fn test_deleted_instance_cleanup_after_grace() {
        let mut w = world();
        let manager = w.manager(false, "us-central1-b", true);
        let marked = Utc::now();
        let mut deleted = InstanceRecord::new("linux-bbbbbbbb-x1", manager.key.clone(), None, marked);
        deleted.deleted = true;
        let mut pending = InstanceRecord::new(
            "linux-bbbbbbbb-x2",
            manager.key.clone(),
            Some("https://compute/instances/linux-bbbbbbbb-x2".to_string()),
            marked,
        );
        pending.pending_deletion = true;
        w.save(&[&manager], &[&deleted, &pending]);

        let (dispatcher, _) = w.scan(marked + Duration::minutes(19));
        assert!(dispatcher.keys(TaskKind::CleanupDeletedInstance).is_empty());
        assert_eq!(
            dispatcher.keys(TaskKind::CheckDeletedInstance),
            vec![pending.key.to_string()]
        );

        let (dispatcher, _) = w.scan(marked + Duration::minutes(21));
        assert_eq!(
            dispatcher.keys(TaskKind::CleanupDeletedInstance),
            vec![deleted.key.to_string()]
        );
    }

    #[test]
    fn test_rejected_tasks_are_counted() {
        let mut w = world();
        let manager = w.manager(false, "us-central1-b", true);
        w.save(&[&manager], &[]);
        let dispatcher = Arc::new(RecordingDispatcher {
            reject: true,
            ..Default::default()
        });
        let scanner = Scanner::new(w.store.clone(), dispatcher, DeletionGrace::default());

        let stats = scanner.scan(Utc::now()).unwrap();

        assert_eq!(stats.total(), 0);
        assert!(stats.rejected > 0);
    }
}
