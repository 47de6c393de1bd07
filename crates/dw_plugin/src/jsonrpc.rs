use std::collections::HashMap;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::command::CommandInfo;

/// JSON‑RPC 2.0 core types for darwinflow plugins communicated over stdin/stdout.
///
/// Every frame is one JSON object on one line. The host only ever writes
/// [`Request`]s; a plugin answers with [`Response`]s and may interleave
/// [`RpcEvent`]s at any point. The two are told apart by the `"event":"event"`
/// discriminator, see [`Incoming::parse`].
///
/// ```ignore
/// use serde_json::json;
/// use dw_plugin::jsonrpc::{Id, Method, Request};
///
/// let req = Request::call(Id::Number(1), Method::GetEntity, Some(json!({"entity_id": "note-1"})));
/// let s = serde_json::to_string(&req).unwrap();
/// ```
pub const JSONRPC_VERSION: &str = "2.0";

/// Value of the `event` field that marks a plugin → host frame as an event.
pub const EVENT_DISCRIMINATOR: &str = "event";

/// Fixed error code namespace. Domain errors live in the server range.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    pub const SERVER_ERROR: i64 = -32000;
    pub const NOT_FOUND: i64 = -32001;
    pub const ALREADY_EXISTS: i64 = -32002;
    pub const PERMISSION_DENIED: i64 = -32003;
    pub const READ_ONLY: i64 = -32004;
    pub const NOT_IMPLEMENTED: i64 = -32005;

    pub const SERVER_ERROR_MIN: i64 = -32099;
    pub const SERVER_ERROR_MAX: i64 = -32000;

    pub fn is_server_error(code: i64) -> bool {
        (SERVER_ERROR_MIN..=SERVER_ERROR_MAX).contains(&code)
    }
}

/// `id` MAY be a string, number or null. We support all forms.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Number(i64),
    String(String),
    Null,
}

impl Id {
    /// Correlation key. `7` and `"7"` map to the same slot so plugins that
    /// echo numeric ids back as strings still resolve their waiter.
    pub fn key(&self) -> String {
        match self {
            Id::Number(n) => n.to_string(),
            Id::String(s) => s.trim().to_string(),
            Id::Null => "null".to_string(),
        }
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

/// JSON‑RPC 2.0 Request object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    /// Omitted for *notifications*.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Id>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

fn default_version() -> String {
    JSONRPC_VERSION.to_owned()
}

/// JSON‑RPC 2.0 Error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("rpc error {code}: {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), data: None }
    }
}

/// JSON‑RPC 2.0 Response object.
/// Exactly one of `result` or `error` **must** be present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub id: Id,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

/// Asynchronous notification a plugin pushes on the same stream as its responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcEvent {
    /// Always [`EVENT_DISCRIMINATOR`].
    pub event: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub source: String,
    /// RFC 3339.
    #[serde(default)]
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl RpcEvent {
    pub fn new(event_type: impl Into<String>, source: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            event: EVENT_DISCRIMINATOR.to_owned(),
            event_type: event_type.into(),
            source: source.into(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            payload: if payload.is_empty() { None } else { Some(payload) },
            metadata: None,
            version: None,
        }
    }
}

/// A single plugin → host frame after demultiplexing.
#[derive(Debug, Clone)]
pub enum Incoming {
    Response(Response),
    Event(RpcEvent),
}

impl Incoming {
    /// Decode one line. The discriminator is checked before anything else so an
    /// event is never mistaken for a response, whatever other fields it carries.
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(line)?;
        let is_event = value
            .get("event")
            .and_then(Value::as_str)
            .is_some_and(|d| d == EVENT_DISCRIMINATOR);
        if is_event {
            Ok(Incoming::Event(serde_json::from_value(value)?))
        } else {
            Ok(Incoming::Response(serde_json::from_value(value)?))
        }
    }
}

// -----------------------------------------------------------------------------
// Helper constructors – make it ergonomic to build requests and responses.
// -----------------------------------------------------------------------------
impl Request {
    /// Create a *notification* (no response expected).
    pub fn notification(method: Method, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id: None,
            method: method.to_string(),
            params,
        }
    }

    /// Create a *call* expecting a response.
    pub fn call(id: Id, method: Method, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id: Some(id),
            method: method.to_string(),
            params,
        }
    }
}

impl Response {
    /// Convenience helper for a successful result.
    pub fn success(id: Id, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Convenience helper for an error result.
    pub fn fail(id: Id, code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id,
            result: None,
            error: Some(RpcError { code, message: message.into(), data }),
        }
    }

    /// Collapse into the one side that is present. A response with neither
    /// field is treated as a `null` result.
    pub fn into_result(self) -> Result<Value, RpcError> {
        match (self.error, self.result) {
            (Some(err), _) => Err(err),
            (None, Some(v)) => Ok(v),
            (None, None) => Ok(Value::Null),
        }
    }
}

/// Method catalog spoken between host and plugin subprocesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Init,
    GetInfo,
    GetCapabilities,
    GetEntityTypes,
    QueryEntities,
    GetEntity,
    UpdateEntity,
    GetCommands,
    ExecuteCommand,
    StartEventStream,
    StopEventStream,
}

// -----------------------------------------------------------------------------
// Params / results
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InitParams {
    pub working_dir: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub config: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetEntityParams {
    pub entity_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateEntityParams {
    pub entity_id: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteCommandParams {
    pub command_name: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecuteCommandResult {
    pub exit_code: i32,
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

pub type GetCommandsResult = Vec<CommandInfo>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_uses_snake_case_method_names() {
        let req = Request::call(Id::Number(1), Method::GetEntityTypes, None);
        let s = serde_json::to_string(&req).unwrap();
        assert_eq!(s, r#"{"jsonrpc":"2.0","id":1,"method":"get_entity_types"}"#);

        let m: Method = "start_event_stream".parse().unwrap();
        assert_eq!(m, Method::StartEventStream);
        assert!("messageIn".parse::<Method>().is_err());
    }

    #[test]
    fn notification_omits_id() {
        let req = Request::notification(Method::StopEventStream, None);
        let v = serde_json::to_value(&req).unwrap();
        assert!(v.get("id").is_none());
    }

    #[test]
    fn parse_demultiplexes_events_and_responses() {
        let ev = r#"{"event":"event","type":"stream.started","source":"notes","timestamp":"2025-01-01T00:00:00Z","payload":{"note_count":2}}"#;
        match Incoming::parse(ev).unwrap() {
            Incoming::Event(e) => {
                assert_eq!(e.event_type, "stream.started");
                assert_eq!(e.payload.unwrap()["note_count"], json!(2));
            }
            other => panic!("expected event, got {other:?}"),
        }

        let rsp = r#"{"jsonrpc":"2.0","id":1,"result":{"name":"notes"}}"#;
        match Incoming::parse(rsp).unwrap() {
            Incoming::Response(r) => {
                assert_eq!(r.id, Id::Number(1));
                assert_eq!(r.into_result().unwrap()["name"], json!("notes"));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Incoming::parse("not json").is_err());
        assert!(Incoming::parse(r#"{"event":"event"}"#).is_err());
    }

    #[test]
    fn error_response_collapses_to_err() {
        let rsp = Response::fail(Id::String("x".into()), codes::METHOD_NOT_FOUND, "nope", None);
        let err = rsp.into_result().unwrap_err();
        assert_eq!(err.code, -32601);
    }

    #[test]
    fn id_keys_normalise_numbers_and_strings() {
        assert_eq!(Id::Number(7).key(), Id::String("7".into()).key());
        assert_ne!(Id::Number(7).key(), Id::Number(8).key());
    }

    #[test]
    fn server_error_range() {
        assert!(codes::is_server_error(codes::NOT_FOUND));
        assert!(codes::is_server_error(-32099));
        assert!(!codes::is_server_error(codes::INTERNAL_ERROR));
    }
}
