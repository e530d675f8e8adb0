//! Scheduler module for periodic reconciliation.
//!
//! The scheduler is responsible for:
//! - Refreshing and adopting the fleet configuration
//! - Scanning the hierarchy for records that need work
//! - Emitting one task per unit of work to the task dispatcher

mod scanner;
mod worker;

pub use scanner::{ScanStats, Scanner};
pub use worker::{PassStats, SchedulerWorker};
