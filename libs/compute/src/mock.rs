//! In-memory compute provider for testing and development.
//!
//! Keeps templates, managers and instances in a map keyed by their self links
//! and records every call so tests can assert on what was sent. Failures can
//! be injected per call kind.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::ProviderError;
use crate::provider::{ComputeProvider, ProviderResult};
use crate::types::{
    CurrentActions, InstanceGroupManager, InstanceTemplate, ManagedInstance,
    NewInstanceGroupManager, Operation,
};

/// Base URL used for self links handed out by the mock.
pub const MOCK_BASE_URL: &str = "https://compute.mock/v1";

/// Kinds of provider calls, for failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    CreateTemplate,
    GetTemplate,
    CreateManager,
    GetManager,
    Resize,
    ListInstances,
    DeleteInstances,
    Delete,
    Get,
}

/// A recorded provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    CreateTemplate { name: String },
    GetTemplate { name: String },
    CreateManager { name: String, zone: String, target_size: i64 },
    GetManager { name: String, zone: String },
    Resize { name: String, zone: String, size: i64 },
    ListInstances { name: String, zone: String },
    DeleteInstances { name: String, zone: String, instances: Vec<String> },
    Delete { url: String },
    Get { url: String },
}

impl ProviderCall {
    fn kind(&self) -> CallKind {
        match self {
            Self::CreateTemplate { .. } => CallKind::CreateTemplate,
            Self::GetTemplate { .. } => CallKind::GetTemplate,
            Self::CreateManager { .. } => CallKind::CreateManager,
            Self::GetManager { .. } => CallKind::GetManager,
            Self::Resize { .. } => CallKind::Resize,
            Self::ListInstances { .. } => CallKind::ListInstances,
            Self::DeleteInstances { .. } => CallKind::DeleteInstances,
            Self::Delete { .. } => CallKind::Delete,
            Self::Get { .. } => CallKind::Get,
        }
    }
}

#[derive(Debug, Clone)]
struct MockManager {
    name: String,
    target_size: i64,
    idle_size: Option<i64>,
    instances: Vec<String>,
}

#[derive(Debug, Default)]
struct MockState {
    templates: BTreeMap<String, String>,
    managers: BTreeMap<String, MockManager>,
    instances: BTreeSet<String>,
    calls: Vec<ProviderCall>,
    failures: HashMap<CallKind, VecDeque<u16>>,
}

/// Mock compute provider.
#[derive(Debug, Default)]
pub struct MockProvider {
    state: Mutex<MockState>,
}

/// Self link of an instance template.
pub fn template_link(project: &str, name: &str) -> String {
    format!("{MOCK_BASE_URL}/projects/{project}/global/instanceTemplates/{name}")
}

/// Self link of an instance group manager.
pub fn manager_link(project: &str, zone: &str, name: &str) -> String {
    format!("{MOCK_BASE_URL}/projects/{project}/zones/{zone}/instanceGroupManagers/{name}")
}

/// Self link of an instance.
pub fn instance_link(project: &str, zone: &str, name: &str) -> String {
    format!("{MOCK_BASE_URL}/projects/{project}/zones/{zone}/instances/{name}")
}

impl MockProvider {
    /// Create an empty mock provider.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        // A panic while holding the lock only happens inside a failing test.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next call of `kind` fail with `status`. Queued failures are
    /// consumed in order.
    pub fn fail_next(&self, kind: CallKind, status: u16) {
        self.lock().failures.entry(kind).or_default().push_back(status);
    }

    /// All calls received so far.
    pub fn calls(&self) -> Vec<ProviderCall> {
        self.lock().calls.clone()
    }

    /// Calls of the given kind received so far.
    pub fn calls_of(&self, kind: CallKind) -> Vec<ProviderCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.kind() == kind)
            .cloned()
            .collect()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Register an existing instance template and return its self link.
    pub fn insert_template(&self, project: &str, name: &str) -> String {
        let link = template_link(project, name);
        self.lock().templates.insert(link.clone(), name.to_string());
        link
    }

    /// Register an existing manager and return its self link.
    pub fn insert_manager(&self, project: &str, zone: &str, name: &str) -> String {
        let link = manager_link(project, zone, name);
        self.lock().managers.insert(
            link.clone(),
            MockManager {
                name: name.to_string(),
                target_size: 0,
                idle_size: Some(0),
                instances: Vec::new(),
            },
        );
        link
    }

    /// Set the idle size a manager reports; `None` omits `currentActions.none`.
    pub fn set_idle_size(&self, manager_url: &str, idle: Option<i64>) {
        if let Some(manager) = self.lock().managers.get_mut(manager_url) {
            manager.idle_size = idle;
        }
    }

    /// Add an instance to a manager and mark it as existing.
    pub fn add_managed_instance(&self, manager_url: &str, instance_url: &str) {
        let mut state = self.lock();
        state.instances.insert(instance_url.to_string());
        if let Some(manager) = state.managers.get_mut(manager_url) {
            manager.instances.push(instance_url.to_string());
        }
    }

    /// Register an existing instance outside any manager.
    pub fn insert_instance(&self, url: &str) {
        self.lock().instances.insert(url.to_string());
    }

    /// Remove an instance everywhere, as if it had been deleted.
    pub fn remove_instance(&self, url: &str) {
        let mut state = self.lock();
        state.instances.remove(url);
        for manager in state.managers.values_mut() {
            manager.instances.retain(|i| i != url);
        }
    }

    /// Whether any resource exists at `url`.
    pub fn exists(&self, url: &str) -> bool {
        let state = self.lock();
        state.templates.contains_key(url)
            || state.managers.contains_key(url)
            || state.instances.contains(url)
    }

    /// Current target size of a manager.
    pub fn target_size(&self, manager_url: &str) -> Option<i64> {
        self.lock().managers.get(manager_url).map(|m| m.target_size)
    }

    /// Record a call and apply any injected failure for it.
    fn record(&self, state: &mut MockState, call: ProviderCall) -> ProviderResult<()> {
        let kind = call.kind();
        debug!(call = ?call, "[MOCK] Provider call");
        state.calls.push(call);
        if let Some(status) = state.failures.get_mut(&kind).and_then(|q| q.pop_front()) {
            return Err(ProviderError::status(status, "injected failure"));
        }
        Ok(())
    }
}

fn not_found(url: &str) -> ProviderError {
    ProviderError::status(404, format!("resource not found: {url}"))
}

#[async_trait]
impl ComputeProvider for MockProvider {
    async fn create_instance_template(
        &self,
        project: &str,
        name: &str,
        _properties: &serde_json::Value,
    ) -> ProviderResult<Operation> {
        let mut state = self.lock();
        self.record(
            &mut state,
            ProviderCall::CreateTemplate {
                name: name.to_string(),
            },
        )?;

        let link = template_link(project, name);
        if state.templates.contains_key(&link) {
            return Err(ProviderError::status(409, "instance template already exists"));
        }
        state.templates.insert(link.clone(), name.to_string());
        info!(name = %name, "[MOCK] Created instance template");

        Ok(Operation {
            target_link: link,
            status: Some("DONE".to_string()),
        })
    }

    async fn get_instance_template(
        &self,
        project: &str,
        name: &str,
    ) -> ProviderResult<InstanceTemplate> {
        let mut state = self.lock();
        self.record(
            &mut state,
            ProviderCall::GetTemplate {
                name: name.to_string(),
            },
        )?;

        let link = template_link(project, name);
        if !state.templates.contains_key(&link) {
            return Err(not_found(&link));
        }
        Ok(InstanceTemplate {
            name: name.to_string(),
            self_link: link,
        })
    }

    async fn create_instance_group_manager(
        &self,
        project: &str,
        manager: &NewInstanceGroupManager,
    ) -> ProviderResult<Operation> {
        let mut state = self.lock();
        self.record(
            &mut state,
            ProviderCall::CreateManager {
                name: manager.name.clone(),
                zone: manager.zone.clone(),
                target_size: manager.target_size,
            },
        )?;

        let link = manager_link(project, &manager.zone, &manager.name);
        if state.managers.contains_key(&link) {
            return Err(ProviderError::status(409, "instance group manager already exists"));
        }
        state.managers.insert(
            link.clone(),
            MockManager {
                name: manager.name.clone(),
                target_size: manager.target_size,
                idle_size: Some(0),
                instances: Vec::new(),
            },
        );
        info!(name = %manager.name, zone = %manager.zone, "[MOCK] Created instance group manager");

        Ok(Operation {
            target_link: link,
            status: Some("DONE".to_string()),
        })
    }

    async fn get_instance_group_manager(
        &self,
        project: &str,
        name: &str,
        zone: &str,
    ) -> ProviderResult<InstanceGroupManager> {
        let mut state = self.lock();
        self.record(
            &mut state,
            ProviderCall::GetManager {
                name: name.to_string(),
                zone: zone.to_string(),
            },
        )?;

        let link = manager_link(project, zone, name);
        let manager = state.managers.get(&link).ok_or_else(|| not_found(&link))?;
        Ok(InstanceGroupManager {
            name: manager.name.clone(),
            self_link: link.clone(),
            target_size: Some(manager.target_size),
            current_actions: Some(CurrentActions {
                none: manager.idle_size,
                ..CurrentActions::default()
            }),
        })
    }

    async fn resize_instance_group_manager(
        &self,
        project: &str,
        name: &str,
        zone: &str,
        size: i64,
    ) -> ProviderResult<Operation> {
        let mut state = self.lock();
        self.record(
            &mut state,
            ProviderCall::Resize {
                name: name.to_string(),
                zone: zone.to_string(),
                size,
            },
        )?;

        let link = manager_link(project, zone, name);
        let manager = state.managers.get_mut(&link).ok_or_else(|| not_found(&link))?;
        manager.target_size = size;
        info!(name = %name, zone = %zone, size, "[MOCK] Resized instance group manager");

        Ok(Operation {
            target_link: link,
            status: Some("DONE".to_string()),
        })
    }

    async fn list_managed_instances(
        &self,
        project: &str,
        name: &str,
        zone: &str,
    ) -> ProviderResult<Vec<ManagedInstance>> {
        let mut state = self.lock();
        self.record(
            &mut state,
            ProviderCall::ListInstances {
                name: name.to_string(),
                zone: zone.to_string(),
            },
        )?;

        let link = manager_link(project, zone, name);
        let manager = state.managers.get(&link).ok_or_else(|| not_found(&link))?;
        Ok(manager
            .instances
            .iter()
            .map(|url| ManagedInstance {
                instance: url.clone(),
                current_action: Some("NONE".to_string()),
            })
            .collect())
    }

    async fn delete_managed_instances(
        &self,
        project: &str,
        name: &str,
        zone: &str,
        instances: &[String],
    ) -> ProviderResult<Operation> {
        let mut state = self.lock();
        self.record(
            &mut state,
            ProviderCall::DeleteInstances {
                name: name.to_string(),
                zone: zone.to_string(),
                instances: instances.to_vec(),
            },
        )?;

        let link = manager_link(project, zone, name);
        let manager = state.managers.get_mut(&link).ok_or_else(|| not_found(&link))?;
        let before = manager.instances.len();
        manager.instances.retain(|i| !instances.contains(i));
        let deleted = (before - manager.instances.len()) as i64;
        manager.target_size = (manager.target_size - deleted).max(0);
        for url in instances {
            state.instances.remove(url);
        }
        info!(name = %name, zone = %zone, deleted, "[MOCK] Deleted managed instances");

        Ok(Operation {
            target_link: link,
            status: Some("DONE".to_string()),
        })
    }

    async fn delete(&self, url: &str) -> ProviderResult<Operation> {
        let mut state = self.lock();
        self.record(
            &mut state,
            ProviderCall::Delete {
                url: url.to_string(),
            },
        )?;

        let removed = state.templates.remove(url).is_some()
            || state.managers.remove(url).is_some()
            || state.instances.remove(url);
        if !removed {
            return Err(not_found(url));
        }
        info!(url = %url, "[MOCK] Deleted resource");

        Ok(Operation {
            target_link: url.to_string(),
            status: Some("DONE".to_string()),
        })
    }

    async fn get(&self, url: &str) -> ProviderResult<serde_json::Value> {
        let mut state = self.lock();
        self.record(
            &mut state,
            ProviderCall::Get {
                url: url.to_string(),
            },
        )?;

        let exists = state.templates.contains_key(url)
            || state.managers.contains_key(url)
            || state.instances.contains(url);
        if !exists {
            return Err(not_found(url));
        }
        Ok(serde_json::json!({ "selfLink": url }))
    }
}
