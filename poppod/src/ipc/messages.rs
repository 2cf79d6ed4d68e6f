//! IPC protocol types
//!
//! Length-prefixed JSON frames. A command frame is `{cmd, id, args}` and is
//! answered by `{id, ok, result | error}`; event frames `{event, payload}`
//! flow to clients that sent `subscribe`.

use serde::{Deserialize, Serialize};

use crate::error::DaemonError;

/// Command frame from a client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    pub cmd: String,
    pub id: u64,
    #[serde(default)]
    pub args: serde_json::Value,
}

/// Error body inside a reply
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Reply frame to a command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reply {
    pub id: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Reply {
    pub fn success(id: u64, result: serde_json::Value) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: u64, code: &str, message: impl Into<String>) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(ErrorBody {
                code: code.to_string(),
                message: message.into(),
            }),
        }
    }

    pub fn from_error(id: u64, error: &DaemonError) -> Self {
        Self::failure(id, error.code(), error.to_string())
    }
}

/// Event frame pushed to subscribed clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    pub payload: serde_json::Value,
}

/// Anything the server writes on a connection
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Reply(Reply),
    Event(EventFrame),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_round_trip() {
        let request = Request {
            cmd: "register-project".into(),
            id: 7,
            args: serde_json::json!({"path": "/tmp/p"}),
        };
        let json = serde_json::to_string(&request).unwrap();
        let parsed: Request = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn test_request_args_default_to_null() {
        let parsed: Request = serde_json::from_str(r#"{"cmd":"ping","id":1}"#).unwrap();
        assert_eq!(parsed.args, serde_json::Value::Null);
    }

    #[test]
    fn test_success_reply_omits_error() {
        let reply = Reply::success(3, serde_json::json!({"pong": true}));
        let json = serde_json::to_string(&reply).unwrap();
        assert!(!json.contains("error"));
        assert!(json.contains(r#""ok":true"#));
    }

    #[test]
    fn test_failure_reply_carries_code() {
        let error = DaemonError::InvalidArgs("missing path".into());
        let reply = Reply::from_error(9, &error);
        assert!(!reply.ok);
        assert_eq!(reply.error.as_ref().unwrap().code, "invalid-args");
    }
}
