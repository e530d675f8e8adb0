//! Fleet configuration: the declared templates and managers.
//!
//! Loaded from a TOML file such as:
//!
//! ```toml
//! [[templates]]
//! base_name = "linux"
//! project = "fleet-project"
//! properties = { machineType = "n1-standard-1" }
//!
//! [[managers]]
//! template_base_name = "linux"
//! zone = "us-central1-b"
//! minimum_size = 10
//! maximum_size = 20
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use gcefleet_keys::validate_field;
use gcefleet_reconcile::RevisionHash;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::error::{ControllerError, ControllerResult};

/// A declared template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateConfig {
    pub base_name: String,
    pub project: String,

    /// Instance-template properties passed to the provider verbatim.
    #[serde(default = "empty_object")]
    pub properties: serde_json::Value,

    #[serde(default)]
    pub dimensions: BTreeMap<String, String>,
}

impl TemplateConfig {
    /// Content-derived revision of this template's configuration.
    pub fn revision(&self) -> RevisionHash {
        RevisionHash::from_json(&serde_json::json!({
            "base_name": self.base_name,
            "project": self.project,
            "properties": self.properties,
            "dimensions": self.dimensions,
        }))
    }
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// A declared manager: one zone's capacity for a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerConfig {
    pub template_base_name: String,
    pub zone: String,

    #[serde(default)]
    pub minimum_size: i64,

    #[serde(default)]
    pub maximum_size: i64,
}

/// The whole fleet declaration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub templates: Vec<TemplateConfig>,

    #[serde(default)]
    pub managers: Vec<ManagerConfig>,
}

/// Every problem found while validating a fleet configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", problems.join("; "))]
pub struct ValidationError {
    pub problems: Vec<String>,
}

impl ValidationError {
    fn single(problem: impl Into<String>) -> Self {
        Self {
            problems: vec![problem.into()],
        }
    }
}

impl FleetConfig {
    /// Parse a TOML document.
    pub fn from_toml(content: &str) -> Result<Self, ValidationError> {
        toml::from_str(content).map_err(|e| ValidationError::single(e.to_string()))
    }

    /// Check the configuration for consistency, collecting every problem.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut problems = Vec::new();

        let mut base_names = HashSet::new();
        for (i, template) in self.templates.iter().enumerate() {
            if template.base_name.trim().is_empty() {
                problems.push(format!("templates[{i}]: base_name is empty"));
            }
            if template.project.trim().is_empty() {
                problems.push(format!("templates[{i}]: project is empty"));
            }
            if !template.properties.is_object() {
                problems.push(format!("templates[{i}]: properties must be a table"));
            }
            if !base_names.insert(template.base_name.as_str()) {
                problems.push(format!(
                    "templates[{i}]: base_name {} is not globally unique",
                    template.base_name
                ));
            }
        }

        let mut zones: HashMap<&str, HashSet<&str>> = HashMap::new();
        for (i, manager) in self.managers.iter().enumerate() {
            if let Err(e) = validate_field("zone", &manager.zone) {
                problems.push(format!("managers[{i}]: {e}"));
            }
            if !base_names.contains(manager.template_base_name.as_str()) {
                problems.push(format!(
                    "managers[{i}]: unknown template {}",
                    manager.template_base_name
                ));
            }
            if manager.minimum_size < 0 {
                problems.push(format!("managers[{i}]: minimum_size is negative"));
            }
            if manager.minimum_size > manager.maximum_size {
                problems.push(format!(
                    "managers[{i}]: minimum_size {} exceeds maximum_size {}",
                    manager.minimum_size, manager.maximum_size
                ));
            }
            if !zones
                .entry(manager.template_base_name.as_str())
                .or_default()
                .insert(manager.zone.as_str())
            {
                problems.push(format!(
                    "managers[{i}]: zone {} is not unique for template {}",
                    manager.zone, manager.template_base_name
                ));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { problems })
        }
    }

    /// Managers declared for a template.
    pub fn managers_for<'a>(
        &'a self,
        base_name: &'a str,
    ) -> impl Iterator<Item = &'a ManagerConfig> + 'a {
        self.managers
            .iter()
            .filter(move |m| m.template_base_name == base_name)
    }
}

/// A fetched configuration and the revision of its source.
#[derive(Debug, Clone)]
pub struct FetchedConfig {
    pub revision: String,
    pub config: FleetConfig,
}

/// Where the fleet configuration comes from.
pub trait ConfigSource: Send + Sync {
    /// Fetch the current configuration. Parse errors are reported as
    /// validation errors.
    fn fetch(&self) -> ControllerResult<FetchedConfig>;
}

/// Reads the fleet configuration from a TOML file.
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl ConfigSource for FileConfigSource {
    fn fetch(&self) -> ControllerResult<FetchedConfig> {
        let content =
            std::fs::read_to_string(&self.path).map_err(|source| ControllerError::ConfigRead {
                path: self.path.clone(),
                source,
            })?;
        Ok(FetchedConfig {
            revision: RevisionHash::from_bytes(content.as_bytes()).to_string(),
            config: FleetConfig::from_toml(&content)?,
        })
    }
}

/// Result of a configuration refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The source still holds the adopted revision.
    Unchanged,

    /// A new revision was validated and adopted.
    Updated { revision: String },
}

/// The currently adopted fleet configuration.
#[derive(Debug, Default)]
pub struct ConfigState {
    adopted: Option<FetchedConfig>,
    last_refreshed: Option<DateTime<Utc>>,
}

impl ConfigState {
    pub fn new() -> Self {
        Self::default()
    }

    /// The adopted configuration, if any has been validated yet.
    pub fn config(&self) -> Option<&FleetConfig> {
        self.adopted.as_ref().map(|a| &a.config)
    }

    /// Revision of the adopted configuration.
    pub fn revision(&self) -> Option<&str> {
        self.adopted.as_ref().map(|a| a.revision.as_str())
    }

    /// When the source was last fetched successfully.
    pub fn last_refreshed(&self) -> Option<DateTime<Utc>> {
        self.last_refreshed
    }

    /// Fetch the configuration and adopt it if it changed and is valid.
    ///
    /// An invalid configuration is rejected and the previously adopted one
    /// stays in effect.
    pub fn refresh(
        &mut self,
        source: &dyn ConfigSource,
        now: DateTime<Utc>,
    ) -> ControllerResult<RefreshOutcome> {
        let fetched = match source.fetch() {
            Ok(fetched) => fetched,
            Err(e) => {
                warn!(error = %e, revision = ?self.revision(), "Keeping previous fleet configuration");
                return Err(e);
            }
        };
        if self.revision() == Some(fetched.revision.as_str()) {
            self.last_refreshed = Some(now);
            return Ok(RefreshOutcome::Unchanged);
        }

        if let Err(e) = fetched.config.validate() {
            warn!(error = %e, revision = %fetched.revision, "Rejected invalid fleet configuration");
            return Err(e.into());
        }

        info!(
            revision = %fetched.revision,
            templates = fetched.config.templates.len(),
            managers = fetched.config.managers.len(),
            "Adopted fleet configuration"
        );
        let revision = fetched.revision.clone();
        self.adopted = Some(fetched);
        self.last_refreshed = Some(now);
        Ok(RefreshOutcome::Updated { revision })
    }
}
