//! Registry records and the mailbox wire schema.
//!
//! All path fields use `PathBuf`. Field names on the wire are fixed: clients
//! and servers built from different versions must agree on them byte for byte.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::ArgumentError;

/// Error `type` reported for unknown endpoints.
pub const NOT_FOUND: &str = "NotFound";
/// Error `type` reported for requests with an unrecognised `type` field.
pub const PROTOCOL_ERROR: &str = "ProtocolError";
/// Error `type` reported when arguments do not match the endpoint signature.
pub const TYPE_ERROR: &str = "TypeError";
/// Error `type` reported when an endpoint result cannot be encoded as JSON.
pub const SERIALIZATION_ERROR: &str = "SerializationError";
/// Error `type` reported when an endpoint panicked.
pub const PANIC: &str = "Panic";

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Registry entry pointing a service name at its workspace and owner process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub name: String,
    /// Service workspace holding `requests/` and `responses/`.
    pub root: PathBuf,
    pub pid: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

impl ServiceRecord {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>, pid: i32) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            pid,
            started_at: Some(Utc::now()),
        }
    }

    /// Record owned by the calling process.
    pub fn for_current_process(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self::new(name, root, current_pid())
    }
}

/// The calling process id in the signed form used by records and `kill(2)`.
pub fn current_pid() -> i32 {
    std::process::id() as i32
}

// ---------------------------------------------------------------------------
// Arguments
// ---------------------------------------------------------------------------

/// Positional and keyword values for a call or a constructor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Arguments {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn positional<I>(values: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        Self {
            args: values.into_iter().map(Into::into).collect(),
            kwargs: Map::new(),
        }
    }

    pub fn with_arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty() && self.kwargs.is_empty()
    }

    /// Fetch a parameter passed either at `index` or as keyword `name`.
    ///
    /// Positional values win when both are present.
    pub fn param<T: DeserializeOwned>(&self, index: usize, name: &str) -> Result<T, ArgumentError> {
        let value = self
            .args
            .get(index)
            .or_else(|| self.kwargs.get(name))
            .ok_or_else(|| ArgumentError::Missing {
                index,
                name: name.to_string(),
            })?;
        decode(name, value)
    }

    /// Like [`Arguments::param`], but falls back to `default` when absent.
    pub fn param_or<T: DeserializeOwned>(
        &self,
        index: usize,
        name: &str,
        default: T,
    ) -> Result<T, ArgumentError> {
        match self.args.get(index).or_else(|| self.kwargs.get(name)) {
            Some(value) => decode(name, value),
            None => Ok(default),
        }
    }
}

fn decode<T: DeserializeOwned>(name: &str, value: &Value) -> Result<T, ArgumentError> {
    T::deserialize(value).map_err(|source| ArgumentError::Invalid {
        name: name.to_string(),
        source,
    })
}

impl fmt::Display for Arguments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "args={} kwargs={}",
            Value::Array(self.args.clone()),
            Value::Object(self.kwargs.clone())
        )
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Value of the request `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    ListEndpoints,
    Call,
    /// Anything else, including a missing, `null` or non-string field.
    /// Answered with `ProtocolError`.
    #[default]
    Unknown,
}

impl<'de> Deserialize<'de> for RequestKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(match value.as_str() {
            Some("list_endpoints") => RequestKind::ListEndpoints,
            Some("call") => RequestKind::Call,
            _ => RequestKind::Unknown,
        })
    }
}

/// A request file written by a client into `requests/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: RequestKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(default)]
    pub ctor_args: Vec<Value>,
    #[serde(default)]
    pub ctor_kwargs: Map<String, Value>,
}

impl RequestMessage {
    pub fn list_endpoints() -> Self {
        Self {
            id: None,
            kind: RequestKind::ListEndpoints,
            endpoint: None,
            args: Vec::new(),
            kwargs: Map::new(),
            ctor_args: Vec::new(),
            ctor_kwargs: Map::new(),
        }
    }

    pub fn call(endpoint: impl Into<String>, call: Arguments, ctor: Arguments) -> Self {
        Self {
            id: None,
            kind: RequestKind::Call,
            endpoint: Some(endpoint.into()),
            args: call.args,
            kwargs: call.kwargs,
            ctor_args: ctor.args,
            ctor_kwargs: ctor.kwargs,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn call_arguments(&self) -> Arguments {
        Arguments {
            args: self.args.clone(),
            kwargs: self.kwargs.clone(),
        }
    }

    pub fn ctor_arguments(&self) -> Arguments {
        Arguments {
            args: self.ctor_args.clone(),
            kwargs: self.ctor_kwargs.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// Structured description of a failure raised on the server side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// A response file written by the server into `responses/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub id: String,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

impl ResponseMessage {
    pub fn ok(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            status: ResponseStatus::Ok,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: impl Into<String>, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: ResponseStatus::Error,
            result: None,
            error: Some(RemoteError {
                kind: kind.into(),
                message: message.into(),
            }),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }

    /// Split into the result value or the remote error.
    ///
    /// A missing `result` on success reads as `null`; a missing `error` on
    /// failure reads as an `"Unknown"` error.
    pub fn into_result(self) -> Result<Value, RemoteError> {
        match self.status {
            ResponseStatus::Ok => Ok(self.result.unwrap_or(Value::Null)),
            ResponseStatus::Error => Err(self.error.unwrap_or_else(|| RemoteError {
                kind: "Unknown".to_string(),
                message: "error response carried no details".to_string(),
            })),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_request_type_deserializes_to_unknown() {
        let request: RequestMessage =
            serde_json::from_value(json!({"id": "a", "type": "reboot"})).expect("decode");
        assert_eq!(request.kind, RequestKind::Unknown);
        assert!(request.args.is_empty());
    }

    #[test]
    fn non_string_request_type_is_unknown() {
        for kind in [json!(5), json!(null), json!(["call"]), json!({"call": true})] {
            let request: RequestMessage =
                serde_json::from_value(json!({"id": "a", "type": kind})).expect("decode");
            assert_eq!(request.kind, RequestKind::Unknown, "type = {kind}");
        }
    }

    #[test]
    fn missing_request_type_is_unknown() {
        let request: RequestMessage = serde_json::from_value(json!({"id": "a"})).expect("decode");
        assert_eq!(request.kind, RequestKind::Unknown);
    }

    #[test]
    fn call_request_uses_wire_field_names() {
        let request = RequestMessage::call(
            "double",
            Arguments::positional([21]),
            Arguments::new().with_kwarg("greeting", "hi"),
        )
        .with_id("req-1");
        let value = serde_json::to_value(&request).expect("encode");
        assert_eq!(value["type"], json!("call"));
        assert_eq!(value["endpoint"], json!("double"));
        assert_eq!(value["args"], json!([21]));
        assert_eq!(value["ctor_kwargs"], json!({"greeting": "hi"}));
    }

    #[test]
    fn error_response_carries_type_field() {
        let response = ResponseMessage::error("x", NOT_FOUND, "Endpoint 'missing' not found");
        let value = serde_json::to_value(&response).expect("encode");
        assert_eq!(value["status"], json!("error"));
        assert_eq!(value["error"]["type"], json!("NotFound"));
        assert!(value.get("result").is_none());
    }

    #[test]
    fn ok_response_with_null_result_reads_back_as_null() {
        let raw = r#"{"id":"x","status":"ok","result":null}"#;
        let response: ResponseMessage = serde_json::from_str(raw).expect("decode");
        assert_eq!(response.into_result().expect("ok"), Value::Null);
    }

    #[test]
    fn param_prefers_positional_then_keyword() {
        let positional = Arguments::positional([4]);
        assert_eq!(positional.param::<i64>(0, "x").expect("x"), 4);

        let keyword = Arguments::new().with_kwarg("x", 7);
        assert_eq!(keyword.param::<i64>(0, "x").expect("x"), 7);

        let err = Arguments::new().param::<i64>(0, "x").unwrap_err();
        assert!(matches!(err, ArgumentError::Missing { index: 0, .. }));
    }

    #[test]
    fn param_rejects_wrong_type() {
        let args = Arguments::positional(["not a number"]);
        let err = args.param::<i64>(0, "x").unwrap_err();
        assert!(err.to_string().contains("'x'"), "got: {err}");
    }

    #[test]
    fn record_without_started_at_still_parses() {
        let record: ServiceRecord =
            serde_json::from_str(r#"{"name":"svc","root":"/tmp/svc","pid":42}"#).expect("decode");
        assert_eq!(record.pid, 42);
        assert!(record.started_at.is_none());
    }
}
