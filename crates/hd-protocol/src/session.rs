//! Session identifier type

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opaque handle for an interactive session, assigned by the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u32);

impl SessionId {
    /// Create a new session ID
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

impl From<u32> for SessionId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl FromStr for SessionId {
    type Err = std::num::ParseIntError;

    /// Accepts both the display form (`session-7`) and the bare number (`7`)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let raw = raw.strip_prefix("session-").unwrap_or(raw);
        raw.parse::<u32>().map(Self)
    }
}
