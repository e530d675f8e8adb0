//! Declared fleet configuration and its adoption into the hierarchy.

mod adopt;
mod config;

pub use adopt::{adopt, AdoptStats};
pub use config::{
    ConfigSource, ConfigState, FetchedConfig, FileConfigSource, FleetConfig, ManagerConfig,
    RefreshOutcome, TemplateConfig, ValidationError,
};
