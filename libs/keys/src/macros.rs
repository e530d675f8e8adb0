//! Macros for defining key types.

/// Defines a root key whose identity is a digest of identifying fields.
///
/// This generates a newtype wrapper around a hex SHA-256 digest with:
/// - A `PREFIX` constant
/// - `from_digest_of()` to derive the key from identifying fields
/// - `parse()` to parse from string
/// - `Display`, `FromStr`, `Serialize` and `Deserialize` implementations
///
/// # Example
///
/// ```ignore
/// define_hashed_key!(TemplateKey, "tmpl");
///
/// let key = TemplateKey::from_digest_of(&["linux", "my-project"]);
/// let parsed: TemplateKey = key.to_string().parse()?;
/// ```
#[macro_export]
macro_rules! define_hashed_key {
    ($name:ident, $prefix:literal) => {
        /// A deterministic key for this record type.
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            /// The prefix for this key type.
            pub const PREFIX: &'static str = $prefix;

            /// Derives the key from identifying fields.
            #[must_use]
            pub fn from_digest_of(parts: &[&str]) -> Self {
                Self($crate::digest_parts(parts))
            }

            /// Returns the hex digest portion of the key.
            #[must_use]
            pub fn digest(&self) -> &str {
                &self.0
            }

            /// Parses a key from a string.
            ///
            /// The string must be in the format `{prefix}_{digest}`.
            pub fn parse(s: &str) -> Result<Self, $crate::KeyError> {
                if s.is_empty() {
                    return Err($crate::KeyError::Empty);
                }

                let Some((prefix, digest)) = s.split_once('_') else {
                    return Err($crate::KeyError::MissingSeparator(s.to_string()));
                };

                if prefix != Self::PREFIX {
                    return Err($crate::KeyError::InvalidPrefix {
                        expected: Self::PREFIX,
                        actual: prefix.to_string(),
                    });
                }

                if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err($crate::KeyError::InvalidDigest(digest.to_string()));
                }

                Ok(Self(digest.to_ascii_lowercase()))
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}_{}", Self::PREFIX, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::KeyError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        $crate::impl_string_serde!($name);
    };
}

/// Implements `Serialize`/`Deserialize` through the canonical string form.
#[macro_export]
macro_rules! impl_string_serde {
    ($name:ident) => {
        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                s.parse::<$name>().map_err(serde::de::Error::custom)
            }
        }
    };
}
