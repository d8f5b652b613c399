//! Shared data types carried inside broker messages

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// Workspace identifier
///
/// Producers send it either as a JSON string or as an integer; both
/// normalize to the same string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct WorkspaceId(String);

impl WorkspaceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkspaceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl<'de> Deserialize<'de> for WorkspaceId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Unsigned(u64),
            Signed(i64),
        }

        let id = match Raw::deserialize(deserializer)? {
            Raw::Text(s) => s,
            Raw::Unsigned(n) => n.to_string(),
            Raw::Signed(n) => n.to_string(),
        };

        if id.is_empty() {
            return Err(serde::de::Error::custom("workspace id must not be empty"));
        }

        Ok(Self(id))
    }
}

/// Attachment of a node interface to a collision domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAttachment {
    /// Interface name inside the VM (e.g. `eth0`)
    pub interface: String,
    /// Virtual network segment the interface is plugged into
    pub collision_domain: String,
}

/// Launch parameters for one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Logical node name, unique within a workspace
    pub name: String,
    /// Node kind (host, router, switch, ...)
    #[serde(rename = "type")]
    pub kind: String,
    /// Interfaces and the collision domains they connect to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network: Vec<NetworkAttachment>,
    /// Driver-specific extras passed through untouched
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            network: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_interface(
        mut self,
        interface: impl Into<String>,
        collision_domain: impl Into<String>,
    ) -> Self {
        self.network.push(NetworkAttachment {
            interface: interface.into(),
            collision_domain: collision_domain.into(),
        });
        self
    }
}

/// Reference to an existing node (stop requests)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRef {
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_workspace_id_from_string_or_number() {
        let a: WorkspaceId = serde_json::from_value(json!("7")).unwrap();
        let b: WorkspaceId = serde_json::from_value(json!(7)).unwrap();
        assert_eq!(a, b);
        assert_eq!(serde_json::to_value(&a).unwrap(), json!("7"));
    }

    #[test]
    fn test_workspace_id_rejects_empty_and_objects() {
        assert!(serde_json::from_value::<WorkspaceId>(json!("")).is_err());
        assert!(serde_json::from_value::<WorkspaceId>(json!({"id": 1})).is_err());
    }

    #[test]
    fn test_node_spec_keeps_extras() {
        let spec: NodeSpec = serde_json::from_value(json!({
            "name": "r1",
            "type": "router",
            "network": [{"interface": "eth0", "collision_domain": "A"}],
            "memory": 64
        }))
        .unwrap();

        assert_eq!(spec.kind, "router");
        assert_eq!(spec.network[0].collision_domain, "A");
        assert_eq!(spec.extra.get("memory"), Some(&json!(64)));
    }

    #[test]
    fn test_node_spec_network_optional() {
        let spec: NodeSpec = serde_json::from_value(json!({"name": "A", "type": "host"})).unwrap();
        assert!(spec.network.is_empty());
    }
}
