/*!
 * Core data types shared across FleetLink crates.
 */
use std::borrow::Borrow;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The identifier of a device, unique within one registry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(String);

impl Id {
    /// Create an ID from a string
    pub fn from_string<S: AsRef<str>>(s: S) -> Self {
        Self(s.as_ref().to_string())
    }

    /// Get the string representation of the ID
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the id is empty or whitespace only
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Id {
    fn from(s: &str) -> Self {
        Self::from_string(s)
    }
}

impl From<String> for Id {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for Id {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Free-form, family-specific key/value data
pub type Details = serde_json::Map<String, serde_json::Value>;

/// UTC timestamp used for observation times
pub type Timestamp = DateTime<Utc>;

/// Current UTC time
pub fn now() -> Timestamp {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_id_lookup_by_str() {
        let mut map = HashMap::new();
        map.insert(Id::from("nas-1"), 1);
        assert_eq!(map.get("nas-1"), Some(&1));
        assert!(map.get("nas-2").is_none());
    }

    #[test]
    fn test_id_serde_is_plain_string() {
        let id: Id = serde_json::from_str("\"edge-fw\"").unwrap();
        assert_eq!(id.as_str(), "edge-fw");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"edge-fw\"");
    }

    #[test]
    fn test_blank_id() {
        assert!(Id::from("  ").is_blank());
        assert!(!Id::from("x").is_blank());
    }
}
