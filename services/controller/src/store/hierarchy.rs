//! Point-in-time snapshot of the whole hierarchy.
//!
//! The scheduler scans this snapshot instead of issuing per-record queries.
//! Records are held in maps keyed by their own keys; parents are found by
//! the key prefix every child key carries.

use std::collections::BTreeMap;

use gcefleet_keys::{InstanceKey, ManagerKey, RevisionKey, TemplateKey};

use super::records::{
    manager_drain, Drain, InstanceRecord, ManagerRecord, RevisionRecord, TemplateRecord,
};
use super::sqlite::{Store, StoreError};

/// Snapshot of every record in the store.
#[derive(Debug, Default, Clone)]
pub struct Hierarchy {
    pub templates: BTreeMap<TemplateKey, TemplateRecord>,
    pub revisions: BTreeMap<RevisionKey, RevisionRecord>,
    pub managers: BTreeMap<ManagerKey, ManagerRecord>,
    pub instances: BTreeMap<InstanceKey, InstanceRecord>,
}

impl Hierarchy {
    /// Load a snapshot from the store.
    pub fn load(store: &Store) -> Result<Self, StoreError> {
        Ok(Self {
            templates: index(store.list::<TemplateRecord>()?, |r| r.key.clone()),
            revisions: index(store.list::<RevisionRecord>()?, |r| r.key.clone()),
            managers: index(store.list::<ManagerRecord>()?, |r| r.key.clone()),
            instances: index(store.list::<InstanceRecord>()?, |r| r.key.clone()),
        })
    }

    /// Revisions the owning template has drained.
    pub fn drained_revisions(&self) -> impl Iterator<Item = &RevisionRecord> {
        self.templates
            .values()
            .flat_map(|t| t.drained.iter())
            .filter_map(|key| self.revisions.get(key))
    }

    /// Revisions the owning template currently builds from.
    pub fn active_revisions(&self) -> impl Iterator<Item = &RevisionRecord> {
        self.templates
            .values()
            .filter_map(|t| t.active.as_ref())
            .filter_map(|key| self.revisions.get(key))
    }

    /// Drain state of a manager, or `None` if its ancestors are missing.
    pub fn manager_drain(&self, key: &ManagerKey) -> Option<Drain> {
        let revision = self.revisions.get(key.revision())?;
        let template = self.templates.get(key.template())?;
        Some(manager_drain(template, revision, key))
    }

    /// Managers that are drained explicitly or through their revision.
    pub fn drained_managers(&self) -> impl Iterator<Item = &ManagerRecord> {
        self.managers
            .values()
            .filter(|m| self.manager_drain(&m.key).is_some_and(|d| d.is_drained()))
    }

    /// Managers listed as active under an active revision.
    pub fn active_managers(&self) -> impl Iterator<Item = &ManagerRecord> {
        self.managers
            .values()
            .filter(|m| self.manager_drain(&m.key) == Some(Drain::Active))
    }

    /// Instances whose manager is drained.
    pub fn instances_of_drained_managers(&self) -> impl Iterator<Item = &InstanceRecord> {
        self.drained_managers()
            .flat_map(|m| m.instances.iter())
            .filter_map(|key| self.instances.get(key))
    }
}

fn index<K: Ord, R>(records: Vec<R>, key: impl Fn(&R) -> K) -> BTreeMap<K, R> {
    records.into_iter().map(|r| (key(&r), r)).collect()
}
