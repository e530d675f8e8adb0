//! # gcefleet-keys
//!
//! Deterministic keys for the four-level resource hierarchy managed by the
//! fleet controller:
//!
//! ```text
//! TemplateKey                      tmpl_<digest>
//! └── RevisionKey                  tmpl_<digest>/rev_<revision>
//!     └── ManagerKey               tmpl_<digest>/rev_<revision>/zone_<zone>
//! InstanceKey                      inst_<digest>
//! ```
//!
//! ## Design Principles
//!
//! - Keys are derived from identifying fields, never generated randomly, so a
//!   record can be re-derived and re-created after a partial failure
//! - Child keys embed their ancestors; the parent of any key is recoverable
//!   without a store lookup
//! - Every key has a canonical string form with strict parsing, which is what
//!   task parameters carry between the scheduler and its handlers

mod error;
mod macros;
mod types;

pub use error::KeyError;
pub use types::*;

use sha2::{Digest, Sha256};

/// Hash identifying fields into a hex digest.
///
/// Fields are separated by a NUL byte so that `("ab", "c")` and `("a", "bc")`
/// produce different digests.
pub fn digest_parts(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update([0u8]);
        }
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}
