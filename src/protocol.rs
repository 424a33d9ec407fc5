//! # Wire Protocol
//!
//! Every WebSocket frame is a UTF-8 JSON object shaped as an envelope:
//! `{ "type": "<message_type>", "args": { <named fields> } }`. This module
//! defines the `ServerMessage`/`ClientMessage` enums carrying that envelope's
//! payload and their manual `{type, args}` (de)serialization.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::change::Change;

/// Messages the server sends to a connected client. `Clone` because a
/// broadcast fans the same message out to every subscriber's outbound queue.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// First message on connect: the id assigned to this client.
    Hello { id: u64 },
    /// Full state for a just-subscribed topic. `id` is the string topic's
    /// current version; `None` for every other topic type.
    Init { topic_name: String, value: Json, id: Option<String> },
    /// One or more authoritative changes, all part of the same transition.
    Update { changes: Vec<Change>, action_id: String },
    /// The server rejected a client action outright.
    Reject { reason: String },
    /// Legacy, more specific rejection naming the offending change.
    RejectUpdate { topic_name: String, change: Change, reason: String },
    /// Reply to a `request` relayed from another client.
    Response { request_id: String, response: Json },
}

/// Messages a client sends to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Subscribe { topic_name: String },
    Unsubscribe { topic_name: String },
    /// A proposed atomic mutation: the server either accepts every command
    /// and broadcasts the result, or rejects all of them.
    Action { action_id: String, commands: Vec<Change> },
    /// A correlated RPC addressed to another connected client by service name.
    Request { service_name: String, args: Json, request_id: String },
    /// Reply to a `request`, relayed back to its originator.
    Response { request_id: String, response: Json },
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    args: serde_json::Map<String, Json>,
}

fn obj(fields: Vec<(&str, Json)>) -> serde_json::Map<String, Json> {
    fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

fn field(args: &mut serde_json::Map<String, Json>, key: &str) -> Result<Json, String> {
    args.remove(key).ok_or_else(|| format!("missing field '{key}'"))
}

fn string_field(args: &mut serde_json::Map<String, Json>, key: &str) -> Result<String, String> {
    match field(args, key)? {
        Json::String(s) => Ok(s),
        other => Err(format!("field '{key}' must be a string, got {other}")),
    }
}

fn changes_field(args: &mut serde_json::Map<String, Json>, key: &str) -> Result<Vec<Change>, String> {
    let json = field(args, key)?;
    let arr = match json {
        Json::Array(a) => a,
        other => return Err(format!("field '{key}' must be an array, got {other}")),
    };
    arr.into_iter()
        .map(|v| serde_json::from_value(v).map_err(|e| e.to_string()))
        .collect()
}

impl ServerMessage {
    pub fn to_json(&self) -> serde_json::Value {
        let (kind, args) = match self {
            ServerMessage::Hello { id } => ("hello", obj(vec![("id", Json::from(*id))])),
            ServerMessage::Init { topic_name, value, id } => (
                "init",
                obj(vec![
                    ("topic_name", Json::String(topic_name.clone())),
                    ("value", value.clone()),
                    ("id", id.clone().map(Json::String).unwrap_or(Json::Null)),
                ]),
            ),
            ServerMessage::Update { changes, action_id } => {
                let changes_json: Vec<Json> = changes
                    .iter()
                    .map(|c| serde_json::to_value(c).expect("Change always serializes"))
                    .collect();
                (
                    "update",
                    obj(vec![
                        ("changes", Json::Array(changes_json)),
                        ("action_id", Json::String(action_id.clone())),
                    ]),
                )
            }
            ServerMessage::Reject { reason } => ("reject", obj(vec![("reason", Json::String(reason.clone()))])),
            ServerMessage::RejectUpdate { topic_name, change, reason } => (
                "reject_update",
                obj(vec![
                    ("topic_name", Json::String(topic_name.clone())),
                    ("change", serde_json::to_value(change).expect("Change always serializes")),
                    ("reason", Json::String(reason.clone())),
                ]),
            ),
            ServerMessage::Response { request_id, response } => (
                "response",
                obj(vec![
                    ("request_id", Json::String(request_id.clone())),
                    ("response", response.clone()),
                ]),
            ),
        };
        serde_json::to_value(Envelope { kind: kind.to_string(), args }).expect("envelope always serializes")
    }

    pub fn to_frame(&self) -> String {
        self.to_json().to_string()
    }

    pub fn from_frame(frame: &str) -> Result<Self, String> {
        let envelope: Envelope = serde_json::from_str(frame).map_err(|e| e.to_string())?;
        let Envelope { kind, mut args } = envelope;
        match kind.as_str() {
            "hello" => Ok(ServerMessage::Hello {
                id: field(&mut args, "id")?.as_u64().ok_or("field 'id' must be a non-negative integer")?,
            }),
            "init" => Ok(ServerMessage::Init {
                topic_name: string_field(&mut args, "topic_name")?,
                value: field(&mut args, "value")?,
                id: match field(&mut args, "id")? {
                    Json::Null => None,
                    Json::String(s) => Some(s),
                    other => return Err(format!("field 'id' must be a string or null, got {other}")),
                },
            }),
            "update" => Ok(ServerMessage::Update {
                changes: changes_field(&mut args, "changes")?,
                action_id: string_field(&mut args, "action_id")?,
            }),
            "reject" => Ok(ServerMessage::Reject { reason: string_field(&mut args, "reason")? }),
            "reject_update" => Ok(ServerMessage::RejectUpdate {
                topic_name: string_field(&mut args, "topic_name")?,
                change: serde_json::from_value(field(&mut args, "change")?).map_err(|e| e.to_string())?,
                reason: string_field(&mut args, "reason")?,
            }),
            "response" => Ok(ServerMessage::Response {
                request_id: string_field(&mut args, "request_id")?,
                response: field(&mut args, "response").unwrap_or(Json::Null),
            }),
            other => Err(format!("unknown server message type '{other}'")),
        }
    }
}

impl ClientMessage {
    pub fn to_json(&self) -> serde_json::Value {
        let (kind, args) = match self {
            ClientMessage::Subscribe { topic_name } => {
                ("subscribe", obj(vec![("topic_name", Json::String(topic_name.clone()))]))
            }
            ClientMessage::Unsubscribe { topic_name } => {
                ("unsubscribe", obj(vec![("topic_name", Json::String(topic_name.clone()))]))
            }
            ClientMessage::Action { action_id, commands } => {
                let commands_json: Vec<Json> = commands
                    .iter()
                    .map(|c| serde_json::to_value(c).expect("Change always serializes"))
                    .collect();
                (
                    "action",
                    obj(vec![
                        ("action_id", Json::String(action_id.clone())),
                        ("commands", Json::Array(commands_json)),
                    ]),
                )
            }
            ClientMessage::Request { service_name, args, request_id } => (
                "request",
                obj(vec![
                    ("service_name", Json::String(service_name.clone())),
                    ("args", args.clone()),
                    ("request_id", Json::String(request_id.clone())),
                ]),
            ),
            ClientMessage::Response { request_id, response } => (
                "response",
                obj(vec![
                    ("request_id", Json::String(request_id.clone())),
                    ("response", response.clone()),
                ]),
            ),
        };
        serde_json::to_value(Envelope { kind: kind.to_string(), args }).expect("envelope always serializes")
    }

    pub fn to_frame(&self) -> String {
        self.to_json().to_string()
    }

    pub fn from_frame(frame: &str) -> Result<Self, String> {
        let envelope: Envelope = serde_json::from_str(frame).map_err(|e| e.to_string())?;
        let Envelope { kind, mut args } = envelope;
        match kind.as_str() {
            "subscribe" => Ok(ClientMessage::Subscribe { topic_name: string_field(&mut args, "topic_name")? }),
            "unsubscribe" => Ok(ClientMessage::Unsubscribe { topic_name: string_field(&mut args, "topic_name")? }),
            "action" => Ok(ClientMessage::Action {
                action_id: string_field(&mut args, "action_id")?,
                commands: changes_field(&mut args, "commands")?,
            }),
            "request" => Ok(ClientMessage::Request {
                service_name: string_field(&mut args, "service_name")?,
                args: field(&mut args, "args").unwrap_or(Json::Null),
                request_id: string_field(&mut args, "request_id")?,
            }),
            "response" => Ok(ClientMessage::Response {
                request_id: string_field(&mut args, "request_id")?,
                response: field(&mut args, "response").unwrap_or(Json::Null),
            }),
            other => Err(format!("unknown client message type '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{ChangeBody, IntKind};
    use crate::value::TopicType;

    #[test]
    fn hello_round_trips_through_a_frame() {
        let msg = ServerMessage::Hello { id: 42 };
        let frame = msg.to_frame();
        assert_eq!(frame, r#"{"args":{"id":42},"type":"hello"}"#);
    }

    #[test]
    fn subscribe_parses_from_a_frame() {
        let frame = r#"{"type":"subscribe","args":{"topic_name":"room/messages"}}"#;
        let msg = ClientMessage::from_frame(frame).unwrap();
        assert_eq!(msg, ClientMessage::Subscribe { topic_name: "room/messages".to_string() });
    }

    #[test]
    fn action_parses_embedded_changes() {
        let change = Change::new("n".into(), TopicType::Int, ChangeBody::Int(IntKind::Add { value: 1 }));
        let frame = serde_json::json!({
            "type": "action",
            "args": { "action_id": "a1", "commands": [change] },
        })
        .to_string();
        let msg = ClientMessage::from_frame(&frame).unwrap();
        match msg {
            ClientMessage::Action { action_id, commands } => {
                assert_eq!(action_id, "a1");
                assert_eq!(commands.len(), 1);
            }
            _ => panic!("expected Action"),
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        let frame = r#"{"type":"nonsense","args":{}}"#;
        assert!(ClientMessage::from_frame(frame).is_err());
    }

    #[test]
    fn server_message_round_trips_through_from_frame() {
        let msg = ServerMessage::Init {
            topic_name: "room/count".to_string(),
            value: serde_json::json!(3),
            id: None,
        };
        let parsed = ServerMessage::from_frame(&msg.to_frame()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn client_message_action_round_trips_through_to_frame() {
        let change = Change::new("n".into(), TopicType::Int, ChangeBody::Int(IntKind::Add { value: 1 }));
        let msg = ClientMessage::Action { action_id: "a1".to_string(), commands: vec![change] };
        let parsed = ClientMessage::from_frame(&msg.to_frame()).unwrap();
        assert_eq!(parsed, msg);
    }
}
