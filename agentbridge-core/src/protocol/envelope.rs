//! Request and response envelopes exchanged on capability topics.
//!
//! Requests carry `{requestIndex, payload}`. Responses add a status, an
//! optional message, and an optional structured exception. A response index
//! of `-1` is reserved for replies that are not tied to any request and is
//! only ever produced together with `ERROR`: [`Response::error`] is the only
//! constructor that yields it, and decoding rejects any other combination.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::BridgeError;

/// Free-form JSON object carried by envelopes.
pub type Payload = Map<String, Value>;

/// Index reserved for responses that answer no particular request.
pub const UNBOUND_REQUEST_INDEX: i32 = -1;

// ============================================================================
// Status
// ============================================================================

/// Outcome reported by a backend.
///
/// Serialized in lowercase (`"completed"`); parsing accepts any case and
/// either `_` or `-` as separator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseStatus {
    /// The backend needs more input to continue the conversation
    InputRequired,
    /// The backend finished successfully
    Completed,
    /// The backend ran but reported a business failure
    Failed,
    /// The exchange itself failed
    Error,
}

impl ResponseStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InputRequired => "input_required",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Error => "error",
        }
    }

    /// `COMPLETED` and `INPUT_REQUIRED` map to successful protocol results.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed | Self::InputRequired)
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResponseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "input_required" => Ok(Self::InputRequired),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown response status '{other}'")),
        }
    }
}

impl Serialize for ResponseStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ResponseStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Exception
// ============================================================================

/// Structured exception attached to failed responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializableException {
    pub class_name: String,
    pub message: String,
    #[serde(default)]
    pub stack_trace: Vec<String>,
}

impl SerializableException {
    /// Captures an error and its source chain.
    #[must_use]
    pub fn from_error(err: &BridgeError) -> Self {
        let mut stack_trace = Vec::new();
        let mut source = std::error::Error::source(err);
        while let Some(cause) = source {
            stack_trace.push(cause.to_string());
            source = std::error::Error::source(cause);
        }
        Self {
            class_name: err.error_type_name().to_string(),
            message: err.to_string(),
            stack_trace,
        }
    }
}

// ============================================================================
// Request
// ============================================================================

/// Envelope published on a capability's request topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub request_index: i32,
    #[serde(default)]
    pub payload: Payload,
}

impl Request {
    #[must_use]
    pub fn new(request_index: i32, payload: Payload) -> Self {
        Self {
            request_index,
            payload,
        }
    }
}

// ============================================================================
// Response
// ============================================================================

/// Envelope published on a capability's response topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawResponse")]
pub struct Response {
    request_index: i32,
    status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exception: Option<SerializableException>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Payload>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawResponse {
    request_index: i32,
    status: ResponseStatus,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    exception: Option<SerializableException>,
    #[serde(default)]
    payload: Option<Payload>,
}

impl TryFrom<RawResponse> for Response {
    type Error = String;

    fn try_from(raw: RawResponse) -> Result<Self, Self::Error> {
        if raw.request_index < UNBOUND_REQUEST_INDEX {
            return Err(format!("invalid requestIndex {}", raw.request_index));
        }
        if raw.request_index == UNBOUND_REQUEST_INDEX && raw.status != ResponseStatus::Error {
            return Err(format!(
                "requestIndex -1 is only valid with status error, got {}",
                raw.status
            ));
        }
        Ok(Self {
            request_index: raw.request_index,
            status: raw.status,
            message: raw.message,
            exception: raw.exception,
            payload: raw.payload,
        })
    }
}

impl Response {
    /// Creates a response answering the request at `request_index`.
    #[must_use]
    pub fn new(request_index: u32, status: ResponseStatus, payload: Option<Payload>) -> Self {
        Self {
            request_index: i32::try_from(request_index).unwrap_or(i32::MAX),
            status,
            message: None,
            exception: None,
            payload,
        }
    }

    /// Successful response carrying `payload`.
    #[must_use]
    pub fn completed(request_index: u32, payload: Payload) -> Self {
        Self::new(request_index, ResponseStatus::Completed, Some(payload))
    }

    /// Response not tied to any request, built from a bridge failure.
    #[must_use]
    pub fn error(err: &BridgeError) -> Self {
        Self {
            request_index: UNBOUND_REQUEST_INDEX,
            status: ResponseStatus::Error,
            message: Some(err.to_string()),
            exception: Some(SerializableException::from_error(err)),
            payload: None,
        }
    }

    /// `ERROR` response answering a specific request.
    #[must_use]
    pub fn error_for(request_index: u32, message: impl Into<String>, class_name: &str) -> Self {
        let message = message.into();
        let mut response = Self::new(request_index, ResponseStatus::Error, None);
        response.exception = Some(SerializableException {
            class_name: class_name.to_string(),
            message: message.clone(),
            stack_trace: Vec::new(),
        });
        response.message = Some(message);
        response
    }

    /// Binds the response to the request at `request_index`.
    #[must_use]
    pub fn answering(mut self, request_index: u32) -> Self {
        self.request_index = i32::try_from(request_index).unwrap_or(i32::MAX);
        self
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    #[must_use]
    pub fn request_index(&self) -> i32 {
        self.request_index
    }

    #[must_use]
    pub fn status(&self) -> ResponseStatus {
        self.status
    }

    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    #[must_use]
    pub fn exception(&self) -> Option<&SerializableException> {
        self.exception.as_ref()
    }

    #[must_use]
    pub fn payload(&self) -> Option<&Payload> {
        self.payload.as_ref()
    }

    #[must_use]
    pub fn into_payload(self) -> Option<Payload> {
        self.payload
    }

    /// Best available human-readable failure text.
    #[must_use]
    pub fn failure_message(&self) -> String {
        self.message
            .clone()
            .or_else(|| self.exception.as_ref().map(|e| e.message.clone()))
            .unwrap_or_else(|| format!("backend reported status {}", self.status))
    }
}

// ============================================================================
// Envelope schemas
// ============================================================================

/// JSON schema of a request envelope wrapping `payload_schema`.
#[must_use]
pub fn request_envelope_schema(payload_schema: Value) -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "requestIndex": { "type": "integer" },
            "payload": payload_schema
        },
        "required": ["requestIndex", "payload"]
    })
}

/// JSON schema of a response envelope wrapping `payload_schema`.
#[must_use]
pub fn response_envelope_schema(payload_schema: Value) -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "requestIndex": { "type": "integer" },
            "status": {
                "type": "string",
                "enum": ["input_required", "completed", "failed", "error"]
            },
            "message": { "type": "string" },
            "exception": {
                "type": "object",
                "properties": {
                    "className": { "type": "string" },
                    "message": { "type": "string" },
                    "stackTrace": { "type": "array", "items": { "type": "string" } }
                }
            },
            "payload": payload_schema
        },
        "required": ["requestIndex", "status"]
    })
}

/// JSON schema of a correlation key object with a single string field.
#[must_use]
pub fn correlation_key_schema(field: &str) -> Value {
    serde_json::json!({
        "type": "object",
        "properties": { field: { "type": "string" } },
        "required": [field]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            _ => panic!("payload must be an object"),
        }
    }

    #[test]
    fn test_request_round_trip() {
        let request = Request::new(3, payload(json!({"a": 1, "b": 2})));
        let wire = serde_json::to_value(&request).unwrap();
        assert_eq!(wire, json!({"requestIndex": 3, "payload": {"a": 1, "b": 2}}));

        let decoded: Request = serde_json::from_value(wire).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let response = Response::completed(0, payload(json!({"result": 5})));
        let wire = serde_json::to_value(&response).unwrap();
        assert_eq!(wire["status"], "completed");
        assert!(wire.get("exception").is_none());
    }

    #[test]
    fn test_status_parses_any_case() {
        for raw in ["COMPLETED", "Completed", "completed"] {
            assert_eq!(raw.parse::<ResponseStatus>().unwrap(), ResponseStatus::Completed);
        }
        assert_eq!(
            "INPUT_REQUIRED".parse::<ResponseStatus>().unwrap(),
            ResponseStatus::InputRequired
        );
        assert_eq!(
            "input-required".parse::<ResponseStatus>().unwrap(),
            ResponseStatus::InputRequired
        );
        assert!("done".parse::<ResponseStatus>().is_err());
    }

    #[test]
    fn test_decode_uppercase_reply() {
        let response: Response = serde_json::from_value(json!({
            "requestIndex": 0,
            "status": "COMPLETED",
            "payload": {"result": 5}
        }))
        .unwrap();
        assert_eq!(response.status(), ResponseStatus::Completed);
        assert_eq!(response.payload().unwrap()["result"], 5);
    }

    #[test]
    fn test_unbound_index_requires_error_status() {
        let err = serde_json::from_value::<Response>(json!({
            "requestIndex": -1,
            "status": "completed"
        }))
        .unwrap_err();
        assert!(err.to_string().contains("requestIndex -1"));

        let ok: Response = serde_json::from_value(json!({
            "requestIndex": -1,
            "status": "error",
            "message": "boom"
        }))
        .unwrap();
        assert_eq!(ok.status(), ResponseStatus::Error);
    }

    #[test]
    fn test_error_response_carries_exception() {
        let err = BridgeError::Timeout {
            registration: "sum".into(),
            correlation_id: "abc".into(),
            timeout_ms: 200,
        };
        let response = Response::error(&err);

        assert_eq!(response.request_index(), UNBOUND_REQUEST_INDEX);
        assert_eq!(response.status(), ResponseStatus::Error);
        let exception = response.exception().unwrap();
        assert_eq!(exception.class_name, "timeout");
        assert!(exception.message.contains("200ms"));
    }

    #[test]
    fn test_failure_message_falls_back_to_status() {
        let response = Response::new(0, ResponseStatus::Failed, None);
        assert_eq!(response.failure_message(), "backend reported status failed");
    }

    fn any_status() -> impl Strategy<Value = ResponseStatus> {
        prop_oneof![
            Just(ResponseStatus::InputRequired),
            Just(ResponseStatus::Completed),
            Just(ResponseStatus::Failed),
            Just(ResponseStatus::Error),
        ]
    }

    proptest! {
        #[test]
        fn prop_decoded_unbound_index_implies_error(index in -3i32..4, status in any_status()) {
            let wire = json!({ "requestIndex": index, "status": status.as_str() });
            if let Ok(response) = serde_json::from_value::<Response>(wire) {
                prop_assert!(response.request_index() >= 0 || response.status() == ResponseStatus::Error);
            }
        }

        #[test]
        fn prop_constructed_responses_never_use_unbound_index(index in 0u32..1000, status in any_status()) {
            let response = Response::new(index, status, None);
            prop_assert!(response.request_index() >= 0);
        }
    }
}
