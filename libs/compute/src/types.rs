//! Provider resource representations.
//!
//! Field names follow the compute API's camelCase JSON; unknown fields are
//! ignored so that the full resource bodies can be deserialized.

use serde::{Deserialize, Serialize};

/// A long-running operation returned by mutating calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// URL of the resource the operation acts on.
    pub target_link: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// An instance template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceTemplate {
    pub name: String,
    pub self_link: String,
}

/// Counts of managed instances by pending action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentActions {
    /// Instances with no pending action (the idle size).
    #[serde(default)]
    pub none: Option<i64>,

    #[serde(default)]
    pub creating: Option<i64>,

    #[serde(default)]
    pub deleting: Option<i64>,

    #[serde(default)]
    pub recreating: Option<i64>,
}

/// An instance group manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceGroupManager {
    pub name: String,
    pub self_link: String,

    #[serde(default)]
    pub target_size: Option<i64>,

    #[serde(default)]
    pub current_actions: Option<CurrentActions>,
}

impl InstanceGroupManager {
    /// Instances not currently being created or deleted, if reported.
    pub fn idle_size(&self) -> Option<i64> {
        self.current_actions.as_ref().and_then(|a| a.none)
    }
}

/// Parameters for creating an instance group manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewInstanceGroupManager {
    pub name: String,
    pub zone: String,
    pub instance_template: String,
    pub target_size: i64,
    pub base_instance_name: String,
}

/// One entry of a manager's managed-instance listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedInstance {
    /// URL of the instance.
    pub instance: String,

    #[serde(default)]
    pub current_action: Option<String>,
}

impl ManagedInstance {
    /// The instance name (last path segment of its URL).
    pub fn name(&self) -> Option<&str> {
        resource_name(&self.instance)
    }
}

/// Returns the last path segment of a resource URL.
pub fn resource_name(url: &str) -> Option<&str> {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
}
