//! Local state persistence for the controller.
//!
//! This module provides SQLite-based storage for:
//! - Template, revision, manager and instance records
//! - Drain membership, carried by each parent's active/drained sets
//!
//! Every state change goes through [`Store::transaction`], which scopes a
//! read-modify-write to one parent and one child at a time.

mod hierarchy;
mod records;
mod sqlite;

pub use hierarchy::Hierarchy;
pub use records::{
    manager_drain, Drain, InstanceRecord, ManagerRecord, Record, RevisionRecord, TemplateRecord,
};
pub use sqlite::{Store, StoreError, Tx};
