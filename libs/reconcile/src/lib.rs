//! Reconciliation primitives for the fleet controller.
//!
//! This library holds the pure decision logic the controller applies on every
//! scheduler pass. Key concepts:
//!
//! - **Desired size**: the configured minimum size of a manager, less whatever
//!   sibling revisions in the same zone already provide.
//! - **Idle size**: instances the provider reports as not mid-create or
//!   mid-delete; the only safe baseline for a further resize.
//! - **Grace window**: how long a deleted instance record is kept before it may
//!   be purged.
//!
//! # Invariants
//!
//! - All decisions are deterministic given the same inputs
//! - A single resize never grows a manager by more than the step limit
//! - Resizing only ever grows; shrinking happens through drain and delete

use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Maximum number of instances a single resize may add.
///
/// Repeated scheduler passes let a manager reach its target size; the pass
/// interval together with this limit bounds the instance creation rate.
pub const RESIZE_STEP_LIMIT: i64 = 100;

/// Default reconciliation interval.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(60);

/// Default bound on concurrently executing work items.
pub const DEFAULT_MAX_CONCURRENT: usize = 50;

/// Longest a dispatched task may stay queued or running before it is dropped.
pub const MAX_TASK_RETENTION: Duration = Duration::from_secs(10 * 60);

/// Default grace window before a deleted instance record may be purged.
///
/// A discovery task that started before an instance disappeared can finish
/// after the deletion was recorded and re-create the record. Waiting twice the
/// maximum task retention keeps a purge from racing with such a task.
pub const DEFAULT_DELETED_INSTANCE_GRACE: Duration =
    Duration::from_secs(2 * MAX_TASK_RETENTION.as_secs());

/// A content-derived revision string.
///
/// Used to give each distinct template configuration its own revision, so an
/// unchanged configuration maps onto the same record on every adoption.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RevisionHash(String);

impl RevisionHash {
    /// Compute a revision hash from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        Self::from_bytes(canonical_json(json).as_bytes())
    }

    /// Compute a revision hash from raw bytes (e.g. a config file).
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let result = hasher.finalize();
        Self(hex::encode(&result[..16])) // First 16 bytes (128 bits)
    }

    /// Get the hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RevisionHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("\"{}\":{}", escape_json_string(k), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        serde_json::Value::String(s) => format!("\"{}\"", escape_json_string(s)),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Null => "null".to_string(),
    }
}

fn escape_json_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

/// Outcome of a resize computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeDecision {
    /// Issue a resize to this target size.
    Grow { target: i64 },

    /// Nothing to do; the target does not exceed the idle size.
    Hold { target: i64 },
}

impl ResizeDecision {
    /// Returns true if a resize should be issued.
    pub fn is_grow(&self) -> bool {
        matches!(self, Self::Grow { .. })
    }

    /// The computed target, whether or not it is acted on.
    pub fn target(&self) -> i64 {
        match self {
            Self::Grow { target } | Self::Hold { target } => *target,
        }
    }
}

/// Step-limited resize policy for instance group managers.
#[derive(Debug, Clone)]
pub struct ResizePolicy {
    /// Maximum growth per invocation.
    pub step_limit: i64,
}

impl Default for ResizePolicy {
    fn default() -> Self {
        Self {
            step_limit: RESIZE_STEP_LIMIT,
        }
    }
}

impl ResizePolicy {
    /// Compute the resize decision for a manager.
    ///
    /// `sibling_size` is the total current size of managers for the same
    /// template and zone under other revisions; `idle_size` is the provider's
    /// count of instances with no pending action.
    pub fn decide(&self, minimum_size: i64, sibling_size: i64, idle_size: i64) -> ResizeDecision {
        let target = (minimum_size - sibling_size).min(idle_size + self.step_limit);
        if target <= idle_size {
            ResizeDecision::Hold { target }
        } else {
            ResizeDecision::Grow { target }
        }
    }
}

/// Grace window applied before purging deleted records.
#[derive(Debug, Clone, Copy)]
pub struct DeletionGrace {
    window: Duration,
}

impl Default for DeletionGrace {
    fn default() -> Self {
        Self::new(DEFAULT_DELETED_INSTANCE_GRACE)
    }
}

impl DeletionGrace {
    /// Create a grace window of the given length.
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    /// The window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Returns true once strictly more than the window has elapsed since
    /// `marked_at`. Timestamps in the future never expire.
    pub fn has_elapsed(&self, marked_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match now.signed_duration_since(marked_at).to_std() {
            Ok(elapsed) => elapsed > self.window,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    #[test]
    fn test_revision_hash_deterministic() {
        let json1 = serde_json::json!({"b": 2, "a": {"y": [1, 2], "x": "v"}});
        let json2 = serde_json::json!({"a": {"x": "v", "y": [1, 2]}, "b": 2});

        assert_eq!(RevisionHash::from_json(&json1), RevisionHash::from_json(&json2));
    }

    #[test]
    fn test_revision_hash_changes_with_content() {
        let json1 = serde_json::json!({"machineType": "n1-standard-1"});
        let json2 = serde_json::json!({"machineType": "n1-standard-2"});

        assert_ne!(RevisionHash::from_json(&json1), RevisionHash::from_json(&json2));
    }

    #[test]
    fn test_revision_hash_length() {
        let hash = RevisionHash::from_bytes(b"templates");
        assert_eq!(hash.as_str().len(), 32);
    }

    #[test]
    fn test_resize_counts_siblings() {
        let policy = ResizePolicy::default();

        // minimum 10, a sibling revision already holds 4, nothing idle yet
        let decision = policy.decide(10, 4, 0);
        assert_eq!(decision, ResizeDecision::Grow { target: 6 });
        assert!(decision.is_grow());
    }

    #[test]
    fn test_resize_is_step_limited() {
        let policy = ResizePolicy::default();

        let decision = policy.decide(1000, 0, 50);
        assert_eq!(decision, ResizeDecision::Grow { target: 150 });
    }

    #[test]
    fn test_resize_never_shrinks() {
        let policy = ResizePolicy::default();

        // siblings already exceed the minimum
        assert_eq!(policy.decide(10, 12, 3), ResizeDecision::Hold { target: -2 });
        // already at target
        assert!(!policy.decide(10, 0, 10).is_grow());
    }

    #[test]
    fn test_grace_window_boundaries() {
        let grace = DeletionGrace::default();
        let marked = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        assert!(!grace.has_elapsed(marked, marked + chrono::Duration::minutes(19)));
        assert!(!grace.has_elapsed(marked, marked + chrono::Duration::minutes(20)));
        assert!(grace.has_elapsed(marked, marked + chrono::Duration::minutes(21)));
        assert!(!grace.has_elapsed(marked, marked - chrono::Duration::minutes(30)));
    }

    #[test]
    fn test_default_grace_is_twice_task_retention() {
        assert_eq!(DEFAULT_DELETED_INSTANCE_GRACE, Duration::from_secs(20 * 60));
    }

    proptest! {
        #[test]
        fn prop_resize_growth_is_bounded(
            minimum in 0i64..5_000,
            siblings in 0i64..5_000,
            idle in 0i64..5_000,
        ) {
            let policy = ResizePolicy::default();
            if let ResizeDecision::Grow { target } = policy.decide(minimum, siblings, idle) {
                prop_assert!(target > idle);
                prop_assert!(target - idle <= RESIZE_STEP_LIMIT);
                prop_assert!(target <= minimum - siblings);
            }
        }
    }
}
