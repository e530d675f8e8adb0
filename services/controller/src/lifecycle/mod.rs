//! Lifecycle transitions for every level of the hierarchy.
//!
//! Each operation is idempotent and safe to run concurrently with itself:
//! preconditions are re-checked inside the transaction that applies the
//! change, and any state a concurrent run already applied turns the
//! operation into a no-op.
//!
//! Provider calls always happen outside a transaction. An operation that
//! needs both first talks to the provider and then records the outcome in a
//! short transaction scoped to one record and its parent.

mod instances;
mod managers;
mod templates;

use std::sync::Arc;

use gcefleet_compute::ComputeProvider;
use gcefleet_reconcile::DeletionGrace;
use tracing::warn;

use crate::error::{ControllerError, ControllerResult, Transition};
use crate::prober::ExistenceProber;
use crate::store::Store;

pub use instances::DeletionPath;

/// Applies lifecycle transitions against the store and the provider.
pub struct Lifecycle {
    store: Arc<Store>,
    provider: Arc<dyn ComputeProvider>,
    prober: ExistenceProber,
    grace: DeletionGrace,
}

impl Lifecycle {
    pub fn new(store: Arc<Store>, provider: Arc<dyn ComputeProvider>, grace: DeletionGrace) -> Self {
        Self {
            prober: ExistenceProber::new(provider.clone()),
            store,
            provider,
            grace,
        }
    }

    /// The store this lifecycle writes to.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }
}

/// Turn a missing local record into a logged no-op.
///
/// Tasks for records that were removed in the meantime are expected; they
/// are never treated as failures.
fn settle(result: ControllerResult<Transition>) -> ControllerResult<Transition> {
    match result {
        Err(ControllerError::NotFoundLocal { kind, key }) => {
            warn!(kind, key = %key, "Record does not exist");
            Ok(Transition::Unchanged)
        }
        other => other,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fixtures shared by the lifecycle tests.

    use std::sync::Arc;

    use gcefleet_compute::MockProvider;
    use gcefleet_keys::{ManagerKey, RevisionKey};
    use gcefleet_reconcile::DeletionGrace;

    use super::Lifecycle;
    use crate::store::{ManagerRecord, RevisionRecord, Store, StoreError, TemplateRecord};

    pub const PROJECT: &str = "fleet-project";
    pub const ZONE: &str = "us-central1-b";

    pub struct Fixture {
        pub store: Arc<Store>,
        pub provider: Arc<MockProvider>,
        pub lifecycle: Lifecycle,
        pub template: TemplateRecord,
        pub revision: RevisionRecord,
        pub manager: ManagerRecord,
    }

    /// A template with one active revision holding one active manager.
    pub fn fixture() -> Fixture {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let provider = Arc::new(MockProvider::new());
        let lifecycle = Lifecycle::new(store.clone(), provider.clone(), DeletionGrace::default());

        let mut template = TemplateRecord::new("linux", PROJECT);
        let revision_key = RevisionKey::new(template.key.clone(), "0123456789abcdef").unwrap();
        let mut revision = RevisionRecord::new(
            revision_key.clone(),
            "linux",
            PROJECT,
            serde_json::json!({ "machineType": "n1-standard-1" }),
        );
        let manager = ManagerRecord::new(ManagerKey::new(revision_key.clone(), ZONE).unwrap(), 3, 10);
        template.active = Some(revision_key);
        revision.active.insert(manager.key.clone());

        let fixture = Fixture {
            store,
            provider,
            lifecycle,
            template,
            revision,
            manager,
        };
        fixture.save();
        fixture
    }

    impl Fixture {
        /// Persist the fixture's current records.
        pub fn save(&self) {
            self.store
                .transaction(|tx| -> Result<(), StoreError> {
                    tx.put(&self.template)?;
                    tx.put(&self.revision)?;
                    tx.put(&self.manager)
                })
                .unwrap();
        }

        /// Move the fixture's revision from active to drained.
        pub fn drain_revision(&mut self) {
            self.template.active = None;
            self.template.drained.insert(self.revision.key.clone());
            self.save();
        }

        pub fn template(&self) -> TemplateRecord {
            self.store.get(&self.template.key).unwrap().unwrap()
        }

        pub fn revision(&self) -> Option<RevisionRecord> {
            self.store.get(&self.revision.key).unwrap()
        }

        pub fn manager(&self) -> Option<ManagerRecord> {
            self.store.get(&self.manager.key).unwrap()
        }
    }
}
