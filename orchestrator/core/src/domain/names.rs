// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Names
//!
//! Validated identifiers for every orchestrated object. Names are unique
//! within their namespace and are what operators type on the command line;
//! the UUID of an object is its persistent identity.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const MAX_NAME_LENGTH: usize = 48;
pub const MAX_EXT_FILE_PATH_LENGTH: usize = 255;
pub const MAX_VOLUME_NUMBER: u32 = 65_535;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    #[error("{kind} name must not be empty")]
    Empty { kind: &'static str },

    #[error("{kind} name '{name}' exceeds {max} characters")]
    TooLong {
        kind: &'static str,
        name: String,
        max: usize,
    },

    #[error("{kind} name '{name}' must start with a letter")]
    InvalidStart { kind: &'static str, name: String },

    #[error("{kind} name '{name}' contains invalid character '{ch}'")]
    InvalidCharacter {
        kind: &'static str,
        name: String,
        ch: char,
    },

    #[error("external file path '{0}' must be absolute and must not contain empty or '..' segments")]
    InvalidPath(String),

    #[error("volume number {0} is out of range (0-{max})", max = MAX_VOLUME_NUMBER)]
    VolumeNumberOutOfRange(u32),
}

fn check_name(kind: &'static str, name: &str) -> Result<(), NameError> {
    let mut chars = name.chars();
    let first = chars.next().ok_or(NameError::Empty { kind })?;
    if name.chars().count() > MAX_NAME_LENGTH {
        return Err(NameError::TooLong {
            kind,
            name: name.to_string(),
            max: MAX_NAME_LENGTH,
        });
    }
    if !first.is_ascii_alphabetic() {
        return Err(NameError::InvalidStart {
            kind,
            name: name.to_string(),
        });
    }
    if let Some(ch) = chars.find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-')) {
        return Err(NameError::InvalidCharacter {
            kind,
            name: name.to_string(),
            ch,
        });
    }
    Ok(())
}

macro_rules! object_name {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Result<Self, NameError> {
                let value = value.into();
                check_name($kind, &value)?;
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = NameError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(name: $name) -> Self {
                name.0
            }
        }

        impl FromStr for $name {
            type Err = NameError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

object_name!(
    /// Name of a satellite node
    NodeName,
    "node"
);
object_name!(
    /// Name of a resource definition and of all its resources
    ResourceName,
    "resource"
);
object_name!(SnapshotName, "snapshot");
object_name!(StorPoolName, "storage pool");
object_name!(RemoteName, "remote");
object_name!(ScheduleName, "schedule");
object_name!(ResourceGroupName, "resource group");

/// Absolute path of a file the controller distributes to satellites
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ExternalFileName(String);

impl ExternalFileName {
    pub fn new(value: impl Into<String>) -> Result<Self, NameError> {
        let value = value.into();
        let valid = value.starts_with('/')
            && value.len() > 1
            && value.len() <= MAX_EXT_FILE_PATH_LENGTH
            && value[1..].split('/').all(|seg| !seg.is_empty() && seg != "." && seg != "..");
        if !valid {
            return Err(NameError::InvalidPath(value));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ExternalFileName {
    type Error = NameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ExternalFileName> for String {
    fn from(name: ExternalFileName) -> Self {
        name.0
    }
}

impl fmt::Display for ExternalFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Number of a volume within a resource definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct VolumeNumber(u32);

impl VolumeNumber {
    pub fn new(value: u32) -> Result<Self, NameError> {
        if value > MAX_VOLUME_NUMBER {
            return Err(NameError::VolumeNumberOutOfRange(value));
        }
        Ok(Self(value))
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl TryFrom<u32> for VolumeNumber {
    type Error = NameError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<VolumeNumber> for u32 {
    fn from(nr: VolumeNumber) -> Self {
        nr.0
    }
}

impl fmt::Display for VolumeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        assert!(NodeName::new("alpha").is_ok());
        assert!(ResourceName::new("pvc-1_data").is_ok());
        assert!(SnapshotName::new("back_20260101_120000").is_ok());
    }

    #[test]
    fn test_invalid_names() {
        assert!(matches!(NodeName::new(""), Err(NameError::Empty { .. })));
        assert!(matches!(NodeName::new("1node"), Err(NameError::InvalidStart { .. })));
        assert!(matches!(
            ResourceName::new("bad name"),
            Err(NameError::InvalidCharacter { ch: ' ', .. })
        ));
        assert!(matches!(
            StorPoolName::new("a".repeat(MAX_NAME_LENGTH + 1)),
            Err(NameError::TooLong { .. })
        ));
    }

    #[test]
    fn test_external_file_paths() {
        assert!(ExternalFileName::new("/etc/drbd.d/global.conf").is_ok());
        assert!(ExternalFileName::new("relative/path").is_err());
        assert!(ExternalFileName::new("/etc/../passwd").is_err());
        assert!(ExternalFileName::new("/etc//x").is_err());
        assert!(ExternalFileName::new("/").is_err());
    }

    #[test]
    fn test_name_serde_rejects_invalid() {
        let name: NodeName = serde_json::from_str("\"node-a\"").unwrap();
        assert_eq!(name.as_str(), "node-a");
        assert!(serde_json::from_str::<NodeName>("\"-bad\"").is_err());
    }

    #[test]
    fn test_volume_number_range() {
        assert_eq!(VolumeNumber::new(7).unwrap().value(), 7);
        assert!(VolumeNumber::new(MAX_VOLUME_NUMBER + 1).is_err());
    }
}
