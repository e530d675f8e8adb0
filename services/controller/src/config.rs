//! Controller settings.
//!
//! Layered with the `config` crate: built-in defaults, then an optional
//! settings file, then `GCEFLEET_*` environment variables using `__` to
//! separate sections (e.g. `GCEFLEET_SCHEDULER__MAX_CONCURRENT=20`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use gcefleet_compute::gce::{DEFAULT_COMPUTE_URL, DEFAULT_METADATA_TOKEN_URL};
use gcefleet_compute::TokenSource;
use gcefleet_reconcile::{
    DEFAULT_DELETED_INSTANCE_GRACE, DEFAULT_MAX_CONCURRENT, DEFAULT_RECONCILE_INTERVAL,
    RESIZE_STEP_LIMIT,
};
use serde::{Deserialize, Serialize};

use crate::dispatch::DEFAULT_QUEUE_CAPACITY;

/// Top-level controller settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub provider: ProviderSettings,

    #[serde(default)]
    pub store: StoreSettings,

    #[serde(default)]
    pub scheduler: SchedulerSettings,

    #[serde(default)]
    pub fleet: FleetSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Which compute provider implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// The compute REST API.
    Gce,

    /// In-memory provider, for local runs.
    Mock,
}

/// How provider access tokens are obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    None,
    Static,
    Metadata,
}

/// Compute provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default = "default_provider_kind")]
    pub kind: ProviderKind,

    /// API base URL
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_token_kind")]
    pub token_source: TokenKind,

    /// Bearer token when `token_source` is `static`
    #[serde(default)]
    pub token: String,

    /// Token endpoint when `token_source` is `metadata`
    #[serde(default = "default_metadata_url")]
    pub metadata_url: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            kind: default_provider_kind(),
            base_url: default_base_url(),
            token_source: default_token_kind(),
            token: String::new(),
            metadata_url: default_metadata_url(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl ProviderSettings {
    pub fn tokens(&self) -> TokenSource {
        match self.token_source {
            TokenKind::None => TokenSource::None,
            TokenKind::Static => TokenSource::Static(self.token.clone()),
            TokenKind::Metadata => TokenSource::Metadata {
                url: self.metadata_url.clone(),
            },
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Record store settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSettings {
    /// SQLite database path; in-memory when unset.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Scheduler and task execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Seconds between scheduler passes
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Maximum concurrently executing tasks
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Seconds a deleted instance record is kept before it may be purged
    #[serde(default = "default_grace")]
    pub deleted_instance_grace_secs: u64,

    /// Maximum instances added by a single resize
    #[serde(default = "default_step_limit")]
    pub resize_step_limit: i64,

    /// Tasks held in the queue before further enqueues are rejected
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            max_concurrent: default_max_concurrent(),
            deleted_instance_grace_secs: default_grace(),
            resize_step_limit: default_step_limit(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl SchedulerSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn deleted_instance_grace(&self) -> Duration {
        Duration::from_secs(self.deleted_instance_grace_secs)
    }

    /// Reject values the resize policy and task runner cannot honor.
    pub fn validate(&self) -> Result<(), ::config::ConfigError> {
        if !(1..=RESIZE_STEP_LIMIT).contains(&self.resize_step_limit) {
            return Err(::config::ConfigError::Message(format!(
                "scheduler.resize_step_limit must be between 1 and {RESIZE_STEP_LIMIT}, got {}",
                self.resize_step_limit
            )));
        }
        if self.max_concurrent == 0 {
            return Err(::config::ConfigError::Message(
                "scheduler.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(::config::ConfigError::Message(
                "scheduler.queue_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Fleet configuration source settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetSettings {
    /// Path of the fleet TOML file
    #[serde(default = "default_fleet_path")]
    pub config_path: PathBuf,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            config_path: default_fleet_path(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Level used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default = "default_true")]
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: true,
        }
    }
}

// Default value helpers
fn default_true() -> bool {
    true
}

fn default_provider_kind() -> ProviderKind {
    ProviderKind::Gce
}

fn default_base_url() -> String {
    DEFAULT_COMPUTE_URL.to_string()
}

fn default_token_kind() -> TokenKind {
    TokenKind::Metadata
}

fn default_metadata_url() -> String {
    DEFAULT_METADATA_TOKEN_URL.to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_interval() -> u64 {
    DEFAULT_RECONCILE_INTERVAL.as_secs()
}

fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT
}

fn default_grace() -> u64 {
    DEFAULT_DELETED_INSTANCE_GRACE.as_secs()
}

fn default_step_limit() -> i64 {
    RESIZE_STEP_LIMIT
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_fleet_path() -> PathBuf {
    PathBuf::from("fleet.toml")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    /// Load settings from defaults, an optional file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ::config::ConfigError> {
        let mut builder = ::config::Config::builder();

        builder = builder.add_source(::config::Config::try_from(&Settings::default())?);

        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(false));
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix("GCEFLEET")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.scheduler.validate()?;
        Ok(settings)
    }
}
