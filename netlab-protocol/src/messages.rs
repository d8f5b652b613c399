//! Broker request and reply bodies

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::types::{NodeRef, NodeSpec, WorkspaceId};

/// Error raised for a request body that cannot be processed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Message is not a JSON object")]
    NotAnObject,

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid message: {0}")]
    Invalid(String),
}

/// Parse a JSON object, checking that the listed fields are present first
///
/// Missing fields are reported by name instead of through serde's
/// generic message so the reply tells the producer exactly what is wrong.
fn parse_with_fields<T: DeserializeOwned>(
    payload: &[u8],
    required: &[&'static str],
) -> Result<T, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_slice(payload).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;

    let object = value.as_object().ok_or(ProtocolError::NotAnObject)?;
    for field in required {
        if object.get(*field).map_or(true, |v| v.is_null()) {
            return Err(ProtocolError::MissingField(field));
        }
    }

    serde_json::from_value(value).map_err(|e| ProtocolError::Invalid(e.to_string()))
}

// ==================== Requests ====================

/// Request to create a workspace (consumed from the create queue)
///
/// The whole object is persisted as the workspace's `config.json`, so
/// unknown keys are kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateWorkspaceRequest {
    pub workspace: WorkspaceId,
    pub driver: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl CreateWorkspaceRequest {
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        parse_with_fields(payload, &["workspace", "driver"])
    }
}

/// Request to start nodes in a workspace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRequest {
    pub workspace: WorkspaceId,
    /// Per-node launch specs, replied to in this order
    pub parameters: Vec<NodeSpec>,
}

impl NodeRequest {
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        parse_with_fields(payload, &["workspace", "parameters"])
    }
}

/// Request to stop nodes in a workspace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopRequest {
    pub workspace: WorkspaceId,
    pub parameters: Vec<NodeRef>,
}

impl StopRequest {
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        parse_with_fields(payload, &["workspace", "parameters"])
    }
}

/// Request to tear a workspace down
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestroyRequest {
    pub workspace: WorkspaceId,
}

impl DestroyRequest {
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        parse_with_fields(payload, &["workspace"])
    }
}

// ==================== Replies ====================

/// Outcome of one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Success,
    Error,
}

/// Per-node reply entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReply {
    pub name: String,
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl NodeReply {
    pub fn started(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            status: ReplyStatus::Success,
            port: Some(port),
            cause: None,
        }
    }

    pub fn stopped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: ReplyStatus::Success,
            port: None,
            cause: None,
        }
    }

    pub fn failed(name: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: ReplyStatus::Error,
            port: None,
            cause: Some(cause.into()),
        }
    }
}

/// Whole-request reply (create, destroy, malformed requests)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReply {
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl StatusReply {
    pub fn success() -> Self {
        Self {
            status: ReplyStatus::Success,
            host: None,
            cause: None,
        }
    }

    pub fn success_on(host: impl Into<String>) -> Self {
        Self {
            host: Some(host.into()),
            ..Self::success()
        }
    }

    pub fn error(cause: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Error,
            host: None,
            cause: Some(cause.into()),
        }
    }
}

/// Address change observed inside a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceUpdate {
    pub workspace: WorkspaceId,
    pub node: String,
    pub interface: String,
    pub address: String,
}

// ==================== Bridge framing ====================

/// One message crossing the local broker bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Queue (inbound) or routing key (outbound)
    pub routing_key: String,
    /// Routing key the reply should be published to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new(routing_key: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            routing_key: routing_key.into(),
            reply_to: None,
            payload,
        }
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_request_parse() {
        let req = NodeRequest::parse(
            br#"{"workspace":"7","parameters":[{"name":"A","type":"host"}]}"#,
        )
        .unwrap();
        assert_eq!(req.workspace.as_str(), "7");
        assert_eq!(req.parameters.len(), 1);
        assert_eq!(req.parameters[0].name, "A");
    }

    #[test]
    fn test_node_request_missing_fields() {
        assert_eq!(
            NodeRequest::parse(br#"{"parameters":[]}"#),
            Err(ProtocolError::MissingField("workspace"))
        );
        assert_eq!(
            NodeRequest::parse(br#"{"workspace":"7"}"#),
            Err(ProtocolError::MissingField("parameters"))
        );
        assert_eq!(
            NodeRequest::parse(br#"{"workspace":null,"parameters":[]}"#),
            Err(ProtocolError::MissingField("workspace"))
        );
    }

    #[test]
    fn test_node_request_rejects_garbage() {
        assert!(matches!(
            NodeRequest::parse(b"not json"),
            Err(ProtocolError::InvalidJson(_))
        ));
        assert_eq!(NodeRequest::parse(b"[1,2]"), Err(ProtocolError::NotAnObject));
        assert!(matches!(
            NodeRequest::parse(br#"{"workspace":"7","parameters":[{"type":"host"}]}"#),
            Err(ProtocolError::Invalid(_))
        ));
    }

    #[test]
    fn test_create_request_keeps_unknown_keys() {
        let req = CreateWorkspaceRequest::parse(
            br#"{"workspace":3,"driver":"netkit","owner":"lab-admin"}"#,
        )
        .unwrap();
        assert_eq!(req.workspace.as_str(), "3");
        assert_eq!(req.extra.get("owner"), Some(&json!("lab-admin")));

        let back = serde_json::to_value(&req).unwrap();
        assert_eq!(back["owner"], json!("lab-admin"));
        assert_eq!(back["workspace"], json!("3"));
    }

    #[test]
    fn test_node_reply_shapes() {
        assert_eq!(
            serde_json::to_value(NodeReply::started("A", 40001)).unwrap(),
            json!({"name": "A", "status": "success", "port": 40001})
        );
        assert_eq!(
            serde_json::to_value(NodeReply::failed("A", "spawn failed")).unwrap(),
            json!({"name": "A", "status": "error", "cause": "spawn failed"})
        );
        assert_eq!(
            serde_json::to_value(NodeReply::stopped("A")).unwrap(),
            json!({"name": "A", "status": "success"})
        );
    }

    #[test]
    fn test_status_reply_shapes() {
        assert_eq!(
            serde_json::to_value(StatusReply::success_on("lab-host")).unwrap(),
            json!({"status": "success", "host": "lab-host"})
        );
        assert_eq!(
            serde_json::to_value(StatusReply::error("Workspace 7 already created")).unwrap(),
            json!({"status": "error", "cause": "Workspace 7 already created"})
        );
    }

    #[test]
    fn test_envelope_reply_to_optional() {
        let env: Envelope =
            serde_json::from_value(json!({"routing_key": "q", "payload": {}})).unwrap();
        assert!(env.reply_to.is_none());

        let env = Envelope::new("q", json!({})).with_reply_to("r");
        assert_eq!(env.reply_to.as_deref(), Some("r"));
    }
}
