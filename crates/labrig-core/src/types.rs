/*!
 * Core data types for labrig.
 *
 * This module defines the fundamental data types shared by the module layer
 * and the device engine: resource identifiers and fault records.
 */
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unique identifier for labrig resources (devices, module keys, task keys)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Id(String);

impl Id {
    /// Create a new ID with a random UUID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create an ID from a string
    pub fn from_string<S: AsRef<str>>(s: S) -> Self {
        Self(s.as_ref().to_string())
    }

    /// Get the string representation of the ID
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for Id {
    fn from(s: &str) -> Self {
        Self::from_string(s)
    }
}

impl From<String> for Id {
    fn from(s: String) -> Self {
        Self::from_string(s)
    }
}

impl From<Uuid> for Id {
    fn from(uuid: Uuid) -> Self {
        Self::from_string(uuid.to_string())
    }
}

/// A fault record as reported by devices and function modules.
///
/// `group` identifies the reporting subsystem, `code` the fault within the
/// group and `data` carries fault-specific detail (sub-unit index, raw module
/// status word, ...). Records are immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Error group of the reporting subsystem
    pub group: u16,
    /// Error code within the group
    pub code: u16,
    /// Additional fault-specific data
    pub data: u16,
    /// Time the fault was recorded
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    /// Create a new fault record stamped with the current time
    pub fn new(group: u16, code: u16, data: u16) -> Self {
        Self {
            group,
            code,
            data,
            timestamp: Utc::now(),
        }
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "group 0x{:04x} code 0x{:04x} data 0x{:04x} at {}",
            self.group, self.code, self.data, self.timestamp
        )
    }
}
