//! JSON wire protocol between replicas and the sync server.
//!
//! Clients send intents tagged by `"action"`. The server answers with
//! tagged events (`initial_data`, `add`, `remove`, `error`) and untagged
//! lookup replies.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::crdt::Timestamp;
use crate::error::ProtocolError;

/// Actions a client may send.
pub const ACTIONS: [&str; 3] = ["add", "remove", "lookup"];

/// A parsed client request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Intent {
    Add { key: String, value: Value },
    Remove { key: String },
    Lookup { key: String },
}

impl Intent {
    /// Parses one text frame into an intent.
    ///
    /// Unparsable JSON or missing fields are `Malformed`; a well-formed
    /// message naming any other action is `UnknownAction`.
    pub fn parse(text: &str) -> Result<Intent, ProtocolError> {
        let raw: Value = serde_json::from_str(text)?;
        let action = raw
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::Malformed("missing string field `action`".into()))?;
        if !ACTIONS.contains(&action) {
            return Err(ProtocolError::UnknownAction(action.to_string()));
        }
        Ok(serde_json::from_value(raw)?)
    }

    pub fn key(&self) -> &str {
        match self {
            Intent::Add { key, .. } | Intent::Remove { key } | Intent::Lookup { key } => key,
        }
    }
}

/// Events tagged by `"action"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Full visible state, sent once when a replica joins
    InitialData { data: BTreeMap<String, Value> },
    Add {
        key: String,
        value: Value,
        timestamp: Timestamp,
    },
    Remove {
        key: String,
        value: Option<Value>,
        timestamp: Timestamp,
    },
    /// Rejection of the sender's last message
    Error { error: String },
}

/// Reply to a lookup, sent only to the requester.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupReply {
    pub key: String,
    pub value: Option<Value>,
}

/// Anything the server sends to a replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Event(ServerEvent),
    Lookup(LookupReply),
}

impl ServerMessage {
    pub fn initial_data(data: BTreeMap<String, Value>) -> Self {
        ServerMessage::Event(ServerEvent::InitialData { data })
    }

    pub fn added(key: String, value: Value, timestamp: Timestamp) -> Self {
        ServerMessage::Event(ServerEvent::Add {
            key,
            value,
            timestamp,
        })
    }

    pub fn removed(key: String, timestamp: Timestamp) -> Self {
        ServerMessage::Event(ServerEvent::Remove {
            key,
            value: None,
            timestamp,
        })
    }

    pub fn lookup(key: String, value: Option<Value>) -> Self {
        ServerMessage::Lookup(LookupReply { key, value })
    }

    pub fn error(error: impl Into<String>) -> Self {
        ServerMessage::Event(ServerEvent::Error {
            error: error.into(),
        })
    }

    /// Encodes the message as a JSON text frame.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_intents() {
        assert_eq!(
            Intent::parse(r#"{"action":"add","key":"x","value":"1"}"#).unwrap(),
            Intent::Add {
                key: "x".into(),
                value: json!("1"),
            }
        );
        assert_eq!(
            Intent::parse(r#"{"action":"remove","key":"x"}"#).unwrap(),
            Intent::Remove { key: "x".into() }
        );
        assert_eq!(
            Intent::parse(r#"{"action":"lookup","key":"x"}"#).unwrap(),
            Intent::Lookup { key: "x".into() }
        );
    }

    #[test]
    fn test_add_accepts_any_json_value() {
        let intent = Intent::parse(r#"{"action":"add","key":"cfg","value":{"n":[1,2]}}"#).unwrap();
        assert_eq!(intent.key(), "cfg");
        assert!(matches!(intent, Intent::Add { value, .. } if value == json!({"n": [1, 2]})));
    }

    #[test]
    fn test_rejects_malformed() {
        for text in [
            "not json",
            r#"{"key":"x"}"#,
            r#"{"action":42,"key":"x"}"#,
            r#"{"action":"add","key":"x"}"#,
            r#"{"action":"remove"}"#,
            r#"{"action":"lookup","key":7}"#,
        ] {
            assert!(
                matches!(Intent::parse(text), Err(ProtocolError::Malformed(_))),
                "expected malformed: {text}"
            );
        }
    }

    #[test]
    fn test_rejects_unknown_action() {
        assert_eq!(
            Intent::parse(r#"{"action":"clear","key":"x"}"#),
            Err(ProtocolError::UnknownAction("clear".into()))
        );
    }

    #[test]
    fn test_server_message_shapes() {
        let ts = Timestamp::from_raw(77);

        let initial = ServerMessage::initial_data(BTreeMap::from([("x".to_string(), json!("1"))]));
        assert_eq!(
            serde_json::to_value(&initial).unwrap(),
            json!({"action": "initial_data", "data": {"x": "1"}})
        );

        let added = ServerMessage::added("x".into(), json!("1"), ts);
        assert_eq!(
            serde_json::to_value(&added).unwrap(),
            json!({"action": "add", "key": "x", "value": "1", "timestamp": 77})
        );

        let removed = ServerMessage::removed("x".into(), ts);
        assert_eq!(
            serde_json::to_value(&removed).unwrap(),
            json!({"action": "remove", "key": "x", "value": null, "timestamp": 77})
        );

        let reply = ServerMessage::lookup("x".into(), None);
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({"key": "x", "value": null})
        );
    }

    #[test]
    fn test_server_messages_decode_back() {
        let reply: ServerMessage = serde_json::from_str(r#"{"key":"x","value":"1"}"#).unwrap();
        assert_eq!(reply, ServerMessage::lookup("x".into(), Some(json!("1"))));

        let event: ServerMessage =
            serde_json::from_str(r#"{"action":"remove","key":"x","value":null,"timestamp":5}"#)
                .unwrap();
        assert_eq!(event, ServerMessage::removed("x".into(), Timestamp::from_raw(5)));
    }
}
