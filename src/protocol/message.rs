use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request body: `{ "action": ..., "data": ... }`.
///
/// The correlation token and reply address are not part of the body; they
/// travel as envelope metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest<T = Value> {
    /// Label selecting the server-side handler.
    pub action: String,
    /// Handler input.
    pub data: T,
}

impl<T> RpcRequest<T> {
    pub fn new(action: impl Into<String>, data: T) -> Self {
        Self {
            action: action.into(),
            data,
        }
    }
}

/// Outcome reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReplyStatus {
    Success,
    NotFound,
    Error,
}

/// Reply body: `{ "status": ..., "data"?: ..., "errorMessage"?: ... }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcReply {
    pub status: ReplyStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl RpcReply {
    pub fn success(data: Value) -> Self {
        Self {
            status: ReplyStatus::Success,
            data: Some(data),
            error_message: None,
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: ReplyStatus::NotFound,
            data: None,
            error_message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Error,
            data: None,
            error_message: Some(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        // ---
        let req = RpcRequest::new("ping", json!({ "x": 1 }));
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value, json!({ "action": "ping", "data": { "x": 1 } }));
    }

    #[test]
    fn test_reply_omits_absent_fields() {
        // ---
        let value = serde_json::to_value(RpcReply::not_found()).unwrap();
        assert_eq!(value, json!({ "status": "notFound" }));

        let value = serde_json::to_value(RpcReply::error("boom")).unwrap();
        assert_eq!(value, json!({ "status": "error", "errorMessage": "boom" }));
    }

    #[test]
    fn test_reply_accepts_foreign_error_shape() {
        // ---
        // Older servers answer unknown actions with an empty data object
        // and no message.
        let reply: RpcReply =
            serde_json::from_value(json!({ "status": "error", "data": {} })).unwrap();
        assert_eq!(reply.status, ReplyStatus::Error);
        assert!(reply.error_message.is_none());
    }
}
