//! Compute provider interface.
//!
//! The controller only ever talks to the provider through this trait, so the
//! HTTP client and the in-memory mock are interchangeable.

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::types::{
    InstanceGroupManager, InstanceTemplate, ManagedInstance, NewInstanceGroupManager, Operation,
};

/// Result type for provider calls.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Compute provider interface.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Create an instance template. Returns 409 if it already exists.
    async fn create_instance_template(
        &self,
        project: &str,
        name: &str,
        properties: &serde_json::Value,
    ) -> ProviderResult<Operation>;

    /// Fetch an instance template by name.
    async fn get_instance_template(
        &self,
        project: &str,
        name: &str,
    ) -> ProviderResult<InstanceTemplate>;

    /// Create an instance group manager. Returns 409 if it already exists.
    async fn create_instance_group_manager(
        &self,
        project: &str,
        manager: &NewInstanceGroupManager,
    ) -> ProviderResult<Operation>;

    /// Fetch an instance group manager by name and zone.
    async fn get_instance_group_manager(
        &self,
        project: &str,
        name: &str,
        zone: &str,
    ) -> ProviderResult<InstanceGroupManager>;

    /// Set the target size of an instance group manager.
    async fn resize_instance_group_manager(
        &self,
        project: &str,
        name: &str,
        zone: &str,
        size: i64,
    ) -> ProviderResult<Operation>;

    /// List the instances owned by an instance group manager.
    async fn list_managed_instances(
        &self,
        project: &str,
        name: &str,
        zone: &str,
    ) -> ProviderResult<Vec<ManagedInstance>>;

    /// Delete specific instances of an instance group manager, lowering its
    /// target size by the number deleted so they are not recreated.
    async fn delete_managed_instances(
        &self,
        project: &str,
        name: &str,
        zone: &str,
        instances: &[String],
    ) -> ProviderResult<Operation>;

    /// Delete the resource at the given URL. Returns 404 if it is already gone.
    async fn delete(&self, url: &str) -> ProviderResult<Operation>;

    /// Read the resource at the given URL.
    async fn get(&self, url: &str) -> ProviderResult<serde_json::Value>;
}
