//! Key definitions for every level of the hierarchy.

use crate::{define_hashed_key, impl_string_serde, KeyError};

// =============================================================================
// Root Keys
// =============================================================================

define_hashed_key!(TemplateKey, "tmpl");
define_hashed_key!(InstanceKey, "inst");

impl TemplateKey {
    /// Key for the template with the given base name in the given project.
    #[must_use]
    pub fn for_template(base_name: &str, project: &str) -> Self {
        Self::from_digest_of(&[base_name, project])
    }
}

impl InstanceKey {
    /// Key for the instance with the given name.
    #[must_use]
    pub fn for_instance(name: &str) -> Self {
        Self::from_digest_of(&[name])
    }
}

// =============================================================================
// Nested Keys
// =============================================================================

const REVISION_PREFIX: &str = "rev";
const ZONE_PREFIX: &str = "zone";

/// Key for a template revision: the owning template plus a content-derived
/// revision string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RevisionKey {
    template: TemplateKey,
    revision: String,
}

impl RevisionKey {
    /// Creates a revision key under the given template.
    pub fn new(template: TemplateKey, revision: impl Into<String>) -> Result<Self, KeyError> {
        let revision = revision.into();
        validate_field("revision", &revision)?;
        Ok(Self { template, revision })
    }

    /// The owning template.
    pub fn template(&self) -> &TemplateKey {
        &self.template
    }

    /// The revision string.
    pub fn revision(&self) -> &str {
        &self.revision
    }

    /// Parses a key in the format `tmpl_{digest}/rev_{revision}`.
    pub fn parse(s: &str) -> Result<Self, KeyError> {
        let segments = split_segments(s, 2)?;
        let template = TemplateKey::parse(segments[0])?;
        let revision = strip_segment(segments[1], REVISION_PREFIX)?;
        Self::new(template, revision)
    }
}

impl std::fmt::Display for RevisionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}_{}", self.template, REVISION_PREFIX, self.revision)
    }
}

impl std::str::FromStr for RevisionKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl_string_serde!(RevisionKey);

/// Key for an instance group manager: one manager per zone per revision.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ManagerKey {
    revision: RevisionKey,
    zone: String,
}

impl ManagerKey {
    /// Creates a manager key under the given revision.
    pub fn new(revision: RevisionKey, zone: impl Into<String>) -> Result<Self, KeyError> {
        let zone = zone.into();
        validate_field("zone", &zone)?;
        Ok(Self { revision, zone })
    }

    /// The owning revision.
    pub fn revision(&self) -> &RevisionKey {
        &self.revision
    }

    /// The owning template (grandparent).
    pub fn template(&self) -> &TemplateKey {
        self.revision.template()
    }

    /// The zone this manager lives in.
    pub fn zone(&self) -> &str {
        &self.zone
    }

    /// Parses a key in the format `tmpl_{digest}/rev_{revision}/zone_{zone}`.
    pub fn parse(s: &str) -> Result<Self, KeyError> {
        let segments = split_segments(s, 3)?;
        let template = TemplateKey::parse(segments[0])?;
        let revision = strip_segment(segments[1], REVISION_PREFIX)?;
        let zone = strip_segment(segments[2], ZONE_PREFIX)?;
        Self::new(RevisionKey::new(template, revision)?, zone)
    }
}

impl std::fmt::Display for ManagerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}_{}", self.revision, ZONE_PREFIX, self.zone)
    }
}

impl std::str::FromStr for ManagerKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl_string_serde!(ManagerKey);

/// Check that `value` can be embedded in a key: non-empty, with no `/` and
/// no whitespace.
pub fn validate_field(field: &'static str, value: &str) -> Result<(), KeyError> {
    if value.is_empty() || value.contains('/') || value.chars().any(char::is_whitespace) {
        return Err(KeyError::InvalidField {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

fn split_segments(s: &str, expected: usize) -> Result<Vec<&str>, KeyError> {
    if s.is_empty() {
        return Err(KeyError::Empty);
    }
    let segments: Vec<&str> = s.split('/').collect();
    if segments.len() != expected {
        return Err(KeyError::InvalidDepth {
            expected,
            actual: segments.len(),
        });
    }
    Ok(segments)
}

fn strip_segment<'a>(segment: &'a str, expected: &'static str) -> Result<&'a str, KeyError> {
    let Some((prefix, value)) = segment.split_once('_') else {
        return Err(KeyError::MissingSeparator(segment.to_string()));
    };
    if prefix != expected {
        return Err(KeyError::InvalidPrefix {
            expected,
            actual: prefix.to_string(),
        });
    }
    Ok(value)
}
