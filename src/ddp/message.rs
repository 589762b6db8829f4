//! # Protocol Messages
//!
//! Client and server message catalogues. Every message is a JSON object with
//! a `msg` discriminator; payload values use extended JSON.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ejson::{DocumentFields, EJson};
use super::errors::DdpResult;

/// Protocol versions this implementation speaks, most preferred first
pub const SUPPORTED_VERSIONS: [&str; 3] = ["1", "pre2", "pre1"];

/// Opaque tracing context riding along a call
pub type Baggage = BTreeMap<String, String>;

/// Machine-readable error code: either a string or a number
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorCode {
    Number(i64),
    Text(String),
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Number(n) => write!(f, "{}", n),
            ErrorCode::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for ErrorCode {
    fn from(s: &str) -> Self {
        ErrorCode::Text(s.to_string())
    }
}

impl From<i64> for ErrorCode {
    fn from(n: i64) -> Self {
        ErrorCode::Number(n)
    }
}

impl From<i32> for ErrorCode {
    fn from(n: i32) -> Self {
        ErrorCode::Number(i64::from(n))
    }
}

/// Error payload carried by `result` and `nosub`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_client_safe: Option<bool>,

    pub error: ErrorCode,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
}

impl ErrorPayload {
    /// Payload that exposes only a code and a message
    pub fn opaque(error: impl Into<ErrorCode>, message: impl Into<String>) -> Self {
        Self {
            is_client_safe: None,
            error: error.into(),
            reason: None,
            message: Some(message.into()),
            details: None,
            error_type: None,
        }
    }

    /// Fully populated client-safe payload
    pub fn client_safe(
        error: impl Into<ErrorCode>,
        reason: impl Into<String>,
        details: Option<String>,
    ) -> Self {
        let error = error.into();
        let reason = reason.into();
        Self {
            is_client_safe: Some(true),
            message: Some(format!("{} [{}]", reason, error)),
            error,
            reason: Some(reason),
            details,
            error_type: Some("Meteor.Error".to_string()),
        }
    }

    /// Best human-readable description
    pub fn describe(&self) -> String {
        self.message
            .clone()
            .or_else(|| self.reason.clone())
            .unwrap_or_else(|| self.error.to_string())
    }
}

/// Messages sent by the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "camelCase")]
pub enum ClientMessage {
    Connect {
        version: String,
        #[serde(default)]
        support: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session: Option<String>,
    },
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Method {
        id: String,
        method: String,
        #[serde(default)]
        params: Vec<EJson>,
        #[serde(
            default,
            rename = "randomSeed",
            skip_serializing_if = "Option::is_none"
        )]
        random_seed: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        baggage: Option<Baggage>,
    },
    Sub {
        id: String,
        name: String,
        #[serde(default)]
        params: Vec<EJson>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        baggage: Option<Baggage>,
    },
    Unsub {
        id: String,
    },
}

impl ClientMessage {
    /// The `msg` discriminator
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Connect { .. } => "connect",
            ClientMessage::Ping { .. } => "ping",
            ClientMessage::Pong { .. } => "pong",
            ClientMessage::Method { .. } => "method",
            ClientMessage::Sub { .. } => "sub",
            ClientMessage::Unsub { .. } => "unsub",
        }
    }
}

/// Messages sent by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "camelCase")]
pub enum ServerMessage {
    Connected {
        session: String,
    },
    Failed {
        version: String,
    },
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Result {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<EJson>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorPayload>,
    },
    Updated {
        methods: Vec<String>,
    },
    Ready {
        subs: Vec<String>,
    },
    Nosub {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorPayload>,
    },
    Added {
        collection: String,
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fields: Option<DocumentFields>,
    },
    Changed {
        collection: String,
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fields: Option<DocumentFields>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cleared: Option<Vec<String>>,
    },
    Removed {
        collection: String,
        id: String,
    },
    AddedBefore {
        collection: String,
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fields: Option<DocumentFields>,
        #[serde(default)]
        before: Option<String>,
    },
    MovedBefore {
        collection: String,
        id: String,
        #[serde(default)]
        before: Option<String>,
    },
    Error {
        reason: String,
        #[serde(
            default,
            rename = "offendingMessage",
            skip_serializing_if = "Option::is_none"
        )]
        offending_message: Option<Value>,
    },
}

impl ServerMessage {
    /// The `msg` discriminator
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Connected { .. } => "connected",
            ServerMessage::Failed { .. } => "failed",
            ServerMessage::Ping { .. } => "ping",
            ServerMessage::Pong { .. } => "pong",
            ServerMessage::Result { .. } => "result",
            ServerMessage::Updated { .. } => "updated",
            ServerMessage::Ready { .. } => "ready",
            ServerMessage::Nosub { .. } => "nosub",
            ServerMessage::Added { .. } => "added",
            ServerMessage::Changed { .. } => "changed",
            ServerMessage::Removed { .. } => "removed",
            ServerMessage::AddedBefore { .. } => "addedBefore",
            ServerMessage::MovedBefore { .. } => "movedBefore",
            ServerMessage::Error { .. } => "error",
        }
    }

    /// Build a `changed`, leaving out empty parts
    pub fn changed(
        collection: &str,
        id: &str,
        fields: DocumentFields,
        cleared: Vec<String>,
    ) -> Self {
        ServerMessage::Changed {
            collection: collection.to_string(),
            id: id.to_string(),
            fields: (!fields.is_empty()).then_some(fields),
            cleared: (!cleared.is_empty()).then_some(cleared),
        }
    }
}

/// Encode a single message as one extended JSON string
pub fn encode_message<T: Serialize>(message: &T) -> DdpResult<String> {
    Ok(serde_json::to_string(message)?)
}

/// Decode a single extended JSON message string
pub fn decode_message<T: serde::de::DeserializeOwned>(text: &str) -> DdpResult<T> {
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_connect() {
        let msg: ClientMessage =
            decode_message(r#"{"msg":"connect","version":"1","support":["1","pre2","pre1"]}"#)
                .unwrap();
        match msg {
            ClientMessage::Connect { version, support, .. } => {
                assert_eq!(version, "1");
                assert_eq!(support.len(), 3);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_method_with_seed_and_dates() {
        let msg: ClientMessage = decode_message(
            r#"{"msg":"method","id":"1","method":"add","params":[{"$date":10}],"randomSeed":"abc"}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::Method { params, random_seed, baggage, .. } => {
                assert!(matches!(params[0], EJson::Date(_)));
                assert_eq!(random_seed.as_deref(), Some("abc"));
                assert!(baggage.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_ping_without_id() {
        let msg: ClientMessage = decode_message(r#"{"msg":"ping"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Ping { id: None });
        assert_eq!(msg.kind(), "ping");
    }

    #[test]
    fn test_unknown_message_rejected() {
        assert!(decode_message::<ClientMessage>(r#"{"msg":"launch"}"#).is_err());
        assert!(decode_message::<ClientMessage>(r#"{"id":"1"}"#).is_err());
    }

    #[test]
    fn test_changed_omits_empty_parts() {
        let msg = ServerMessage::changed("tasks", "a", DocumentFields::new(), vec!["x".into()]);
        let encoded: Value = serde_json::from_str(&encode_message(&msg).unwrap()).unwrap();
        assert_eq!(
            encoded,
            json!({"msg": "changed", "collection": "tasks", "id": "a", "cleared": ["x"]})
        );
    }

    #[test]
    fn test_nosub_error_shape() {
        let msg = ServerMessage::Nosub {
            id: "s1".into(),
            error: Some(ErrorPayload::client_safe(404, "Subscription 'x' not found", None)),
        };
        let encoded: Value = serde_json::from_str(&encode_message(&msg).unwrap()).unwrap();
        assert_eq!(encoded["error"]["error"], json!(404));
        assert_eq!(encoded["error"]["isClientSafe"], json!(true));
        assert_eq!(encoded["error"]["errorType"], json!("Meteor.Error"));
        assert_eq!(
            encoded["error"]["message"],
            json!("Subscription 'x' not found [404]")
        );
    }

    #[test]
    fn test_opaque_error_exposes_only_code_and_message() {
        let payload = ErrorPayload::opaque("internal-error", "Internal server error");
        let encoded = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            encoded,
            json!({"error": "internal-error", "message": "Internal server error"})
        );
    }

    #[test]
    fn test_added_before_kind() {
        let msg: ServerMessage = decode_message(
            r#"{"msg":"addedBefore","collection":"c","id":"1","fields":{"a":1},"before":null}"#,
        )
        .unwrap();
        assert_eq!(msg.kind(), "addedBefore");
    }
}
