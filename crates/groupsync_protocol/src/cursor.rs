//! Sync cursors ("sync keys").

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque server-issued token meaning "client has seen everything up to here".
///
/// The value `"0"` is the sentinel for "no prior state"; presenting it asks
/// the server for a fresh start.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncCursor(String);

impl SyncCursor {
    /// Wire value of the initial cursor.
    pub const INITIAL: &'static str = "0";

    /// Creates the initial cursor.
    pub fn initial() -> Self {
        Self(Self::INITIAL.to_string())
    }

    /// Wraps a server-issued value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns true if no state has been received yet.
    pub fn is_initial(&self) -> bool {
        self.0 == Self::INITIAL
    }

    /// Returns the wire value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SyncCursor {
    fn default() -> Self {
        Self::initial()
    }
}

impl fmt::Display for SyncCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_sentinel() {
        assert!(SyncCursor::initial().is_initial());
        assert!(SyncCursor::default().is_initial());
        assert!(SyncCursor::new("0").is_initial());
        assert!(!SyncCursor::new("{abc}1").is_initial());
    }

    #[test]
    fn serializes_as_plain_string() {
        let json = serde_json::to_string(&SyncCursor::new("42")).unwrap();
        assert_eq!(json, "\"42\"");
    }
}
