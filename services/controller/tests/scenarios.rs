//! Reconciliation scenarios against the mock provider.
//!
//! Each test builds a small hierarchy directly in the store and drives one
//! operation through the public lifecycle and resize APIs.

use std::sync::Arc;

use chrono::Utc;
use gcefleet_compute::mock::{instance_link, template_link, CallKind, ProviderCall};
use gcefleet_compute::MockProvider;
use gcefleet_controller::lifecycle::Lifecycle;
use gcefleet_controller::resize::ResizeController;
use gcefleet_controller::store::{
    InstanceRecord, ManagerRecord, RevisionRecord, Store, StoreError, TemplateRecord,
};
use gcefleet_controller::Transition;
use gcefleet_keys::{InstanceKey, ManagerKey, RevisionKey};
use gcefleet_reconcile::{DeletionGrace, ResizePolicy};

const PROJECT: &str = "fleet-project";
const ZONE: &str = "us-central1-b";

struct Harness {
    store: Arc<Store>,
    provider: Arc<MockProvider>,
    lifecycle: Lifecycle,
    resizer: ResizeController,
}

fn harness() -> Harness {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let provider = Arc::new(MockProvider::new());
    Harness {
        lifecycle: Lifecycle::new(store.clone(), provider.clone(), DeletionGrace::default()),
        resizer: ResizeController::new(store.clone(), provider.clone(), ResizePolicy::default()),
        store,
        provider,
    }
}

fn revision(template: &TemplateRecord, hash: &str) -> RevisionRecord {
    RevisionRecord::new(
        RevisionKey::new(template.key.clone(), hash).unwrap(),
        "linux",
        PROJECT,
        serde_json::json!({ "machineType": "n1-standard-1" }),
    )
}

fn save(store: &Store, template: &TemplateRecord, revisions: &[&RevisionRecord], managers: &[&ManagerRecord]) {
    store
        .transaction(|tx| -> Result<(), StoreError> {
            tx.put(template)?;
            for revision in revisions {
                tx.put(*revision)?;
            }
            for manager in managers {
                tx.put(*manager)?;
            }
            Ok(())
        })
        .unwrap();
}

#[tokio::test]
async fn test_resize_subtracts_sibling_size() {
    let h = harness();
    let mut template = TemplateRecord::new("linux", PROJECT);
    let mut old = revision(&template, "1111111111111111");
    let mut new = revision(&template, "2222222222222222");

    let mut sibling = ManagerRecord::new(ManagerKey::new(old.key.clone(), ZONE).unwrap(), 10, 20);
    sibling.current_size = 4;
    old.active.insert(sibling.key.clone());

    let mut manager = ManagerRecord::new(ManagerKey::new(new.key.clone(), ZONE).unwrap(), 10, 20);
    manager.url = Some(h.provider.insert_manager(PROJECT, ZONE, &new.resource_name()));
    new.active.insert(manager.key.clone());

    template.drained.insert(old.key.clone());
    template.active = Some(new.key.clone());
    save(&h.store, &template, &[&old, &new], &[&sibling, &manager]);

    let outcome = h.resizer.resize(&manager.key).await.unwrap();

    assert_eq!(outcome, Transition::Applied);
    assert_eq!(
        h.provider.calls_of(CallKind::Resize),
        vec![ProviderCall::Resize {
            name: new.resource_name(),
            zone: ZONE.to_string(),
            size: 6,
        }]
    );
}

#[tokio::test]
async fn test_sibling_in_other_zone_is_ignored() {
    let h = harness();
    let mut template = TemplateRecord::new("linux", PROJECT);
    let mut old = revision(&template, "1111111111111111");
    let mut new = revision(&template, "2222222222222222");

    let mut elsewhere =
        ManagerRecord::new(ManagerKey::new(old.key.clone(), "europe-west1-c").unwrap(), 10, 20);
    elsewhere.current_size = 4;
    old.active.insert(elsewhere.key.clone());

    let mut manager = ManagerRecord::new(ManagerKey::new(new.key.clone(), ZONE).unwrap(), 10, 20);
    let url = h.provider.insert_manager(PROJECT, ZONE, &new.resource_name());
    manager.url = Some(url.clone());
    new.active.insert(manager.key.clone());

    template.drained.insert(old.key.clone());
    template.active = Some(new.key.clone());
    save(&h.store, &template, &[&old, &new], &[&elsewhere, &manager]);

    h.resizer.resize(&manager.key).await.unwrap();

    assert_eq!(h.provider.target_size(&url), Some(10));
}

#[tokio::test]
async fn test_resize_ramps_in_steps() {
    let h = harness();
    let mut template = TemplateRecord::new("linux", PROJECT);
    let mut rev = revision(&template, "3333333333333333");
    let mut manager = ManagerRecord::new(ManagerKey::new(rev.key.clone(), ZONE).unwrap(), 250, 500);
    let url = h.provider.insert_manager(PROJECT, ZONE, &rev.resource_name());
    manager.url = Some(url.clone());
    rev.active.insert(manager.key.clone());
    template.active = Some(rev.key.clone());
    save(&h.store, &template, &[&rev], &[&manager]);

    let mut targets = Vec::new();
    for _ in 0..4 {
        h.resizer.resize(&manager.key).await.unwrap();
        let target = h.provider.target_size(&url).unwrap();
        targets.push(target);
        // The provider finishes creating before the next pass.
        h.provider.set_idle_size(&url, Some(target));
    }

    assert_eq!(targets, vec![100, 200, 250, 250]);
    assert_eq!(h.provider.calls_of(CallKind::Resize).len(), 3);
}

#[tokio::test]
async fn test_create_manager_conflict_uses_existing_self_link() {
    let h = harness();
    let mut template = TemplateRecord::new("linux", PROJECT);
    let mut rev = revision(&template, "4444444444444444");
    rev.url = Some(template_link(PROJECT, &rev.resource_name()));
    let manager = ManagerRecord::new(ManagerKey::new(rev.key.clone(), ZONE).unwrap(), 2, 4);
    rev.active.insert(manager.key.clone());
    template.active = Some(rev.key.clone());
    save(&h.store, &template, &[&rev], &[&manager]);
    let existing = h.provider.insert_manager(PROJECT, ZONE, &rev.resource_name());

    let outcome = h.lifecycle.create_manager(&manager.key).await.unwrap();

    assert_eq!(outcome, Transition::Applied);
    let stored = h.store.get::<ManagerRecord>(&manager.key).unwrap().unwrap();
    assert_eq!(stored.url, Some(existing));
    assert_eq!(h.provider.calls_of(CallKind::CreateManager).len(), 1);
    assert_eq!(h.provider.calls_of(CallKind::GetManager).len(), 1);
}

#[tokio::test]
async fn test_pending_deletion_instance_is_marked_deleted() {
    let h = harness();
    let mut template = TemplateRecord::new("linux", PROJECT);
    let mut rev = revision(&template, "5555555555555555");
    let mut manager = ManagerRecord::new(ManagerKey::new(rev.key.clone(), ZONE).unwrap(), 2, 4);
    let mut instance = InstanceRecord::new(
        "linux-55555555-abcd",
        manager.key.clone(),
        Some(instance_link(PROJECT, ZONE, "linux-55555555-abcd")),
        Utc::now(),
    );
    instance.pending_deletion = true;
    manager.instances.insert(instance.key.clone());
    rev.active.insert(manager.key.clone());
    template.active = Some(rev.key.clone());
    save(&h.store, &template, &[&rev], &[&manager]);
    h.store
        .transaction(|tx| -> Result<(), StoreError> { tx.put(&instance) })
        .unwrap();

    let outcome = h.lifecycle.check_deleted_instance(&instance.key).await.unwrap();

    assert_eq!(outcome, Transition::Applied);
    let stored = h.store.get::<InstanceRecord>(&instance.key).unwrap().unwrap();
    assert!(stored.deleted);
    let manager = h.store.get::<ManagerRecord>(&manager.key).unwrap().unwrap();
    assert!(!manager.instances.contains(&instance.key));
}

#[tokio::test]
async fn test_placeholder_revision_deleted_without_provider_call() {
    let h = harness();
    let mut template = TemplateRecord::new("linux", PROJECT);
    let rev = revision(&template, "6666666666666666");
    template.drained.insert(rev.key.clone());
    save(&h.store, &template, &[&rev], &[]);

    let outcome = h.lifecycle.delete_revision(&rev.key).await.unwrap();

    assert_eq!(outcome, Transition::Applied);
    assert!(h.store.get::<RevisionRecord>(&rev.key).unwrap().is_none());
    let template = h.store.get::<TemplateRecord>(&template.key).unwrap().unwrap();
    assert!(template.drained.is_empty());
    assert!(h.provider.calls().is_empty());
}

#[tokio::test]
async fn test_missing_record_is_a_noop() {
    let h = harness();

    let outcome = h
        .lifecycle
        .check_deleted_instance(&InstanceKey::for_instance("linux-gone"))
        .await
        .unwrap();

    assert_eq!(outcome, Transition::Unchanged);
    assert!(h.provider.calls().is_empty());
}
