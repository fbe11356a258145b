//! Shared value types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Principals embedded in a signed certificate.
///
/// Stored in the comma-separated form the authority's `valid_principals`
/// parameter expects. Whitespace around entries and empty entries are
/// dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Principals(Vec<String>);

impl Principals {
    /// Parse a comma-separated principal list
    pub fn parse(raw: &str) -> Self {
        Self(
            raw.split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl fmt::Display for Principals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(","))
    }
}

impl From<String> for Principals {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl From<&str> for Principals {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

impl From<Principals> for String {
    fn from(p: Principals) -> Self {
        p.to_string()
    }
}
