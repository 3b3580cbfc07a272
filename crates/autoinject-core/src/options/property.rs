use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::InjectionError;

/// A key this engine may write into an options string.
///
/// `required` keys must all be present before the engine treats a string as
/// one it previously wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PropertyKey {
    pub name: &'static str,
    pub required: bool,
}

impl PropertyKey {
    pub const fn required(name: &'static str) -> Self {
        Self {
            name,
            required: true,
        }
    }

    pub const fn optional(name: &'static str) -> Self {
        Self {
            name,
            required: false,
        }
    }

    /// Pair this key with a value.
    pub fn with(&self, value: impl Into<String>) -> SystemProperty {
        SystemProperty::new(self.name, value)
    }
}

/// `-Dkey=value` token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemProperty {
    pub key: String,
    pub value: String,
}

impl SystemProperty {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for SystemProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-D{}={}", self.key, self.value)
    }
}

impl FromStr for SystemProperty {
    type Err = InjectionError;

    /// Parses `-Dkey=value`. The key ends at the first `=`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s
            .strip_prefix("-D")
            .ok_or_else(|| InjectionError::Decode(format!("not a system property: {s}")))?;
        let (key, value) = body
            .split_once('=')
            .ok_or_else(|| InjectionError::Decode(format!("missing '=' in {s}")))?;
        if key.is_empty() {
            return Err(InjectionError::Decode(format!("empty key in {s}")));
        }
        Ok(Self::new(key, value))
    }
}
