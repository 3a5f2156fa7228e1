//! Strongly-typed identifiers for achgate entities.
//!
//! File IDs and shard keys end up as path components inside the staging
//! tree, so every identifier is validated to be a single, safe path segment:
//!
//! - **Non-empty** and at most 255 bytes
//! - **No separators**: `/`, `\` and NUL are rejected
//! - **Not hidden**: a leading `.` is rejected (`.`/`..` and temp files)
//!
//! Shard keys name directories next to an isolated batch's merge output, so
//! [`UPLOADED_DIR`] and names ending in [`CANCELED_SUFFIX`] are reserved.
//!
//! # Example
//!
//! ```rust
//! use achgate_core::id::{FileId, ShardKey};
//!
//! let file = FileId::new("f1").unwrap();
//! let key = ShardKey::new("s1").unwrap();
//! assert_eq!(file.as_str(), "f1");
//! assert!(ShardKey::new("../etc").is_err());
//! # let _ = key;
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const MAX_SEGMENT_LEN: usize = 255;

/// Directory inside an isolated batch holding its merged output.
pub const UPLOADED_DIR: &str = "uploaded";

/// Suffix marking a canceled staged file.
pub const CANCELED_SUFFIX: &str = ".canceled";

fn validate_segment(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidId {
            message: format!("{kind} cannot be empty"),
        });
    }
    if value.len() > MAX_SEGMENT_LEN {
        return Err(Error::InvalidId {
            message: format!("{kind} exceeds {MAX_SEGMENT_LEN} bytes"),
        });
    }
    if value.starts_with('.') {
        return Err(Error::InvalidId {
            message: format!("{kind} '{value}' cannot start with '.'"),
        });
    }
    if value.contains(['/', '\\', '\0']) {
        return Err(Error::InvalidId {
            message: format!("{kind} '{value}' contains a path separator"),
        });
    }
    Ok(())
}

/// Caller-assigned identifier of an incoming file.
///
/// Each staged file on disk is named `<FileId>.ach`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FileId(String);

impl FileId {
    /// Creates a file ID after validating it is a safe path segment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidId`] if the value is empty or not a single path segment.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate_segment("file ID", &id)?;
        Ok(Self(id))
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Opaque tenant routing key attached to every incoming file.
///
/// Many shard keys may map to one [`ShardName`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ShardKey(String);

impl ShardKey {
    /// Creates a shard key after validating it is a safe path segment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidId`] if the value is empty, not a single path
    /// segment, or reserved by the staging layout.
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        validate_segment("shard key", &key)?;
        if key == UPLOADED_DIR || key.ends_with(CANCELED_SUFFIX) {
            return Err(Error::InvalidId {
                message: format!("shard key '{key}' is reserved"),
            });
        }
        Ok(Self(key))
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Name of a configured shard (one aggregator per name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ShardName(String);

impl ShardName {
    /// Creates a shard name after validating it is a safe path segment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidId`] if the value is empty or not a single path segment.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_segment("shard name", &name)?;
        Ok(Self(name))
    }

    /// Returns the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

macro_rules! impl_string_id {
    ($($ty:ident),+) => {$(
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $ty {
            type Error = Error;

            fn try_from(value: String) -> Result<Self> {
                Self::new(value)
            }
        }

        impl From<$ty> for String {
            fn from(value: $ty) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $ty {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    )+};
}

impl_string_id!(FileId, ShardKey, ShardName);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_segments() {
        assert!(FileId::new("2024-01-02_payroll.v2").is_ok());
        assert!(ShardKey::new("f0b1c2").is_ok());
        assert!(ShardName::new("testing").is_ok());
    }

    #[test]
    fn rejects_unsafe_segments() {
        for bad in ["", ".", "..", ".hidden", "a/b", "a\\b", "nul\0byte"] {
            assert!(FileId::new(bad).is_err(), "{bad:?} should be rejected");
        }
        assert!(ShardKey::new("x".repeat(256)).is_err());
    }

    #[test]
    fn shard_keys_cannot_shadow_staging_directories() {
        assert!(matches!(ShardKey::new("uploaded"), Err(Error::InvalidId { .. })));
        assert!(ShardKey::new("s1.canceled").is_err());
        assert!(serde_json::from_str::<ShardKey>("\"uploaded\"").is_err());
        assert!(ShardKey::new("uploaded-2024").is_ok());
        assert!(FileId::new("uploaded").is_ok());
    }

    #[test]
    fn serde_validates_on_deserialize() {
        let parsed: ShardKey = serde_json::from_str("\"s1\"").unwrap();
        assert_eq!(parsed.as_str(), "s1");
        assert!(serde_json::from_str::<FileId>("\"../x\"").is_err());
        assert_eq!(serde_json::to_string(&parsed).unwrap(), "\"s1\"");
    }
}
