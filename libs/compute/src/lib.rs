//! Compute provider access for the fleet controller.
//!
//! ## Modules
//!
//! - `provider`: the [`ComputeProvider`] trait the controller depends on
//! - `gce`: HTTP implementation against the compute REST API
//! - `mock`: in-memory implementation for tests and local runs
//! - `types`: resource representations shared by both

mod error;
pub mod gce;
pub mod mock;
mod provider;
pub mod types;

pub use error::ProviderError;
pub use gce::{GceClient, TokenSource};
pub use mock::MockProvider;
pub use provider::{ComputeProvider, ProviderResult};
