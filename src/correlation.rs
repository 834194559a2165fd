use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Unique correlation token used to match an RPC request with its reply.
///
/// Tokens are random UUID v4 values in standard 36-byte string form. They
/// carry no ordering information and are never derived from a counter, so
/// clients in different processes sharing a broker cannot collide.
///
/// The token travels as transport metadata, never inside the message body.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a new unique correlation token.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the token as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `other` (as read from a delivery) is this token.
    pub fn matches(&self, other: Option<&str>) -> bool {
        other == Some(self.0.as_str())
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<&CorrelationId> for Arc<str> {
    fn from(value: &CorrelationId) -> Self {
        Arc::from(value.0.as_str())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generate_unique() {
        // ---
        let ids: HashSet<CorrelationId> = (0..1000).map(|_| CorrelationId::generate()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_format() {
        // ---
        let id = CorrelationId::generate();
        let s = id.to_string();
        assert_eq!(s.len(), 36); // Standard UUID format
        assert_eq!(Uuid::parse_str(&s).map(|u| u.get_version_num()).ok(), Some(4));
    }

    #[test]
    fn test_matches() {
        // ---
        let id = CorrelationId::from("abc");
        assert!(id.matches(Some("abc")));
        assert!(!id.matches(Some("abd")));
        assert!(!id.matches(None));
    }
}
