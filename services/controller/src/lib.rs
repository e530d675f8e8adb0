//! Fleet reconciliation controller.
//!
//! Keeps a four-level hierarchy of instance templates, template revisions,
//! instance group managers and instances converged with a compute provider.
//! A scheduler pass adopts the declared fleet configuration, scans the
//! hierarchy and emits one idempotent task per unit of work; tasks run on a
//! bounded worker pool.
//!
//! ## Modules
//!
//! - `config`: controller settings
//! - `dispatch`: task kinds, the local queue and the task runner
//! - `fleet`: declared fleet configuration and its adoption
//! - `lifecycle`: per-record create, drain, delete and cleanup transitions
//! - `prober`: provider resource existence checks
//! - `resize`: step-limited manager growth
//! - `scheduler`: periodic scanning and task emission
//! - `store`: SQLite-backed hierarchy records

pub mod config;
pub mod dispatch;
pub mod error;
pub mod fleet;
pub mod lifecycle;
pub mod prober;
pub mod resize;
pub mod scheduler;
pub mod state;
pub mod store;

pub use error::{ControllerError, ControllerResult, Transition};
pub use state::Controller;
