//! Persisted records for every level of the hierarchy.
//!
//! Parent/child relationships are encoded in the keys: a manager key embeds
//! its revision key, which embeds its template key. Membership of a child in
//! its parent is tracked by the parent's `active`/`drained` sets, which are
//! the only source of truth for drain state.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use gcefleet_keys::{InstanceKey, ManagerKey, RevisionKey, TemplateKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A record type persisted in the store.
pub trait Record: Serialize + DeserializeOwned {
    /// Key type identifying the record.
    type Key: std::fmt::Display;

    /// Table the record lives in.
    const TABLE: &'static str;

    /// Human-readable kind, used in logs and errors.
    const KIND: &'static str;

    /// The record's key.
    fn key(&self) -> &Self::Key;

    /// Key of the immediate parent, if any.
    fn parent(&self) -> Option<String>;

    /// Key of the template this record ultimately belongs to, if any.
    fn root(&self) -> Option<String>;
}

/// A configured template: the root of the hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateRecord {
    pub key: TemplateKey,
    pub base_name: String,
    pub project: String,

    /// The single revision new capacity is built from.
    #[serde(default)]
    pub active: Option<RevisionKey>,

    /// Superseded revisions waiting to be torn down.
    #[serde(default)]
    pub drained: BTreeSet<RevisionKey>,
}

impl TemplateRecord {
    /// A fresh template with no revisions.
    pub fn new(base_name: impl Into<String>, project: impl Into<String>) -> Self {
        let base_name = base_name.into();
        let project = project.into();
        Self {
            key: TemplateKey::for_template(&base_name, &project),
            base_name,
            project,
            active: None,
            drained: BTreeSet::new(),
        }
    }

    /// Returns true if no revision references this template anymore.
    pub fn is_empty(&self) -> bool {
        self.active.is_none() && self.drained.is_empty()
    }

    /// Returns true if `revision` has been drained from this template.
    pub fn is_drained(&self, revision: &RevisionKey) -> bool {
        self.drained.contains(revision)
    }
}

impl Record for TemplateRecord {
    type Key = TemplateKey;
    const TABLE: &'static str = "templates";
    const KIND: &'static str = "InstanceTemplate";

    fn key(&self) -> &TemplateKey {
        &self.key
    }

    fn parent(&self) -> Option<String> {
        None
    }

    fn root(&self) -> Option<String> {
        None
    }
}

/// One immutable revision of a template's configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionRecord {
    pub key: RevisionKey,

    /// Template base name, copied down for provider naming.
    pub base_name: String,
    pub project: String,

    /// Instance properties sent to the provider.
    #[serde(default)]
    pub properties: serde_json::Value,

    /// Provider URL of the instance template, once created.
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub active: BTreeSet<ManagerKey>,

    #[serde(default)]
    pub drained: BTreeSet<ManagerKey>,
}

impl RevisionRecord {
    /// A fresh revision with no managers and no provider resource.
    pub fn new(
        key: RevisionKey,
        base_name: impl Into<String>,
        project: impl Into<String>,
        properties: serde_json::Value,
    ) -> Self {
        Self {
            key,
            base_name: base_name.into(),
            project: project.into(),
            properties,
            url: None,
            active: BTreeSet::new(),
            drained: BTreeSet::new(),
        }
    }

    /// Returns true if any manager, active or drained, references this revision.
    pub fn has_managers(&self) -> bool {
        !self.active.is_empty() || !self.drained.is_empty()
    }

    /// Provider name of the instance template and of every manager built
    /// from it.
    pub fn resource_name(&self) -> String {
        format!("{}-{}", self.base_name, self.key.revision())
    }

    /// Prefix for the names of instances created by this revision's managers.
    pub fn base_instance_name(&self) -> String {
        let revision = self.key.revision();
        let short = revision.get(..8).unwrap_or(revision);
        format!("{}-{}", self.base_name, short)
    }
}

impl Record for RevisionRecord {
    type Key = RevisionKey;
    const TABLE: &'static str = "revisions";
    const KIND: &'static str = "InstanceTemplateRevision";

    fn key(&self) -> &RevisionKey {
        &self.key
    }

    fn parent(&self) -> Option<String> {
        Some(self.key.template().to_string())
    }

    fn root(&self) -> Option<String> {
        Some(self.key.template().to_string())
    }
}

/// A managed group of identical instances in one zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerRecord {
    pub key: ManagerKey,

    /// Provider URL, once created.
    #[serde(default)]
    pub url: Option<String>,

    pub minimum_size: i64,
    pub maximum_size: i64,

    /// Size last observed by instance discovery.
    #[serde(default)]
    pub current_size: i64,

    #[serde(default)]
    pub instances: BTreeSet<InstanceKey>,
}

impl ManagerRecord {
    /// A fresh manager with no provider resource.
    pub fn new(key: ManagerKey, minimum_size: i64, maximum_size: i64) -> Self {
        Self {
            key,
            url: None,
            minimum_size,
            maximum_size,
            current_size: 0,
            instances: BTreeSet::new(),
        }
    }
}

impl Record for ManagerRecord {
    type Key = ManagerKey;
    const TABLE: &'static str = "managers";
    const KIND: &'static str = "InstanceGroupManager";

    fn key(&self) -> &ManagerKey {
        &self.key
    }

    fn parent(&self) -> Option<String> {
        Some(self.key.revision().to_string())
    }

    fn root(&self) -> Option<String> {
        Some(self.key.template().to_string())
    }
}

/// A single compute instance owned by a manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub key: InstanceKey,
    pub name: String,

    /// Owning manager.
    pub manager: ManagerKey,

    #[serde(default)]
    pub url: Option<String>,

    /// Registered with the external catalog.
    #[serde(default)]
    pub cataloged: bool,

    /// Deletion has been requested and awaits confirmation.
    #[serde(default)]
    pub pending_deletion: bool,

    /// Confirmed gone at the provider; purged after the grace window.
    #[serde(default)]
    pub deleted: bool,

    pub last_updated: DateTime<Utc>,
}

impl InstanceRecord {
    /// A freshly discovered instance.
    pub fn new(
        name: impl Into<String>,
        manager: ManagerKey,
        url: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let name = name.into();
        Self {
            key: InstanceKey::for_instance(&name),
            name,
            manager,
            url,
            cataloged: false,
            pending_deletion: false,
            deleted: false,
            last_updated: now,
        }
    }
}

impl Record for InstanceRecord {
    type Key = InstanceKey;
    const TABLE: &'static str = "instances";
    const KIND: &'static str = "Instance";

    fn key(&self) -> &InstanceKey {
        &self.key
    }

    fn parent(&self) -> Option<String> {
        Some(self.manager.to_string())
    }

    fn root(&self) -> Option<String> {
        Some(self.manager.template().to_string())
    }
}

/// Drain state of a manager, derived from its ancestors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drain {
    /// Listed in its revision's active set under an active revision.
    Active,

    /// Listed in its revision's drained set.
    Explicit,

    /// Active in a revision that is itself drained.
    Implicit,

    /// Referenced by neither set of its revision.
    Detached,
}

impl Drain {
    /// Returns true for explicit and implicit drains.
    pub fn is_drained(&self) -> bool {
        matches!(self, Self::Explicit | Self::Implicit)
    }
}

/// Derive a manager's drain state from its revision and template records.
pub fn manager_drain(
    template: &TemplateRecord,
    revision: &RevisionRecord,
    manager: &ManagerKey,
) -> Drain {
    if revision.drained.contains(manager) {
        Drain::Explicit
    } else if revision.active.contains(manager) {
        if template.is_drained(&revision.key) {
            Drain::Implicit
        } else {
            Drain::Active
        }
    } else {
        Drain::Detached
    }
}
