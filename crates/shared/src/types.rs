//! Common types used across Huddle

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::HuddleError;

// =============================================================================
// ID Wrappers
// =============================================================================

/// Handle for one live bidirectional channel to one actor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ConnectionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Pre-validated identity of the human or agent behind a connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(pub String);

impl ActorId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ActorId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ActorId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An actor together with the name shown to other participants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: ActorId,
    pub name: String,
}

impl Actor {
    pub fn new(id: impl Into<ActorId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

// =============================================================================
// Resource Keys
// =============================================================================

/// Composite `(type, id)` identifier of a collaborated-on object.
///
/// Also the topic name for broadcasts. Displayed and parsed as `type:id`;
/// the type may not contain `:` but the id may (e.g. `client-timeline:a:b`
/// has type `client-timeline` and id `a:b`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawResourceKey", into = "RawResourceKey")]
pub struct ResourceKey {
    resource_type: String,
    resource_id: String,
}

impl ResourceKey {
    /// Build a key, rejecting empty components and a `:` in the type
    pub fn new(
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Result<Self, HuddleError> {
        let resource_type = resource_type.into();
        let resource_id = resource_id.into();

        if resource_type.trim().is_empty() {
            return Err(HuddleError::MalformedKey(
                "resource type must not be empty".to_string(),
            ));
        }
        if resource_type.contains(':') {
            return Err(HuddleError::MalformedKey(format!(
                "resource type `{resource_type}` must not contain ':'"
            )));
        }
        if resource_id.trim().is_empty() {
            return Err(HuddleError::MalformedKey(
                "resource id must not be empty".to_string(),
            ));
        }

        Ok(Self {
            resource_type,
            resource_id,
        })
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource_type, self.resource_id)
    }
}

impl FromStr for ResourceKey {
    type Err = HuddleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((resource_type, resource_id)) => Self::new(resource_type, resource_id),
            None => Err(HuddleError::MalformedKey(format!(
                "`{s}` is not of the form type:id"
            ))),
        }
    }
}

/// Wire shape of a [`ResourceKey`]
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawResourceKey {
    #[serde(rename = "type")]
    resource_type: String,
    id: String,
}

impl TryFrom<RawResourceKey> for ResourceKey {
    type Error = HuddleError;

    fn try_from(raw: RawResourceKey) -> Result<Self, Self::Error> {
        Self::new(raw.resource_type, raw.id)
    }
}

impl From<ResourceKey> for RawResourceKey {
    fn from(key: ResourceKey) -> Self {
        Self {
            resource_type: key.resource_type,
            id: key.resource_id,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_key_structural_equality() {
        let a = ResourceKey::new("ticket", "507f1f77").unwrap();
        let b = ResourceKey::new("ticket".to_string(), "507f1f77".to_string()).unwrap();
        let c = ResourceKey::new("document", "507f1f77").unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_resource_key_rejects_empty_parts() {
        assert!(matches!(
            ResourceKey::new("", "abc"),
            Err(HuddleError::MalformedKey(_))
        ));
        assert!(matches!(
            ResourceKey::new("ticket", "  "),
            Err(HuddleError::MalformedKey(_))
        ));
        assert!(matches!(
            ResourceKey::new("a:b", "abc"),
            Err(HuddleError::MalformedKey(_))
        ));
    }

    #[test]
    fn test_resource_key_parse_keeps_colons_in_id() {
        let key: ResourceKey = "client-timeline:abc:def".parse().unwrap();
        assert_eq!(key.resource_type(), "client-timeline");
        assert_eq!(key.resource_id(), "abc:def");
        assert_eq!(key.to_string(), "client-timeline:abc:def");

        assert!("no-separator".parse::<ResourceKey>().is_err());
    }

    #[test]
    fn test_resource_key_wire_format() {
        let key = ResourceKey::new("ticket", "T1").unwrap();
        let json = serde_json::to_value(&key).unwrap();
        assert_eq!(json, serde_json::json!({"type": "ticket", "id": "T1"}));

        let bad = serde_json::from_str::<ResourceKey>(r#"{"type":"","id":"T1"}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn test_connection_ids_are_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }
}
