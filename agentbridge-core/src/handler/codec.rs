//! Per-kind call decoding and result encoding.
//!
//! Each capability kind maps an inbound call to a request payload and a
//! backend reply to the result shape its front end expects.

use serde_json::{Value, json};

use super::server::{AgentState, CallResult, ResourceContents, ToolContent};
use crate::error::BridgeError;
use crate::protocol::{Payload, Response, ResponseStatus};
use crate::registration::{CapabilityKind, Registration};

const DEFAULT_MIME_TYPE: &str = "text/plain";

// ============================================================================
// Decode
// ============================================================================

/// Turns raw call arguments into the request payload.
pub fn decode_call(registration: &Registration, raw: Value) -> Result<Payload, BridgeError> {
    let kind = registration.kind();
    let invalid = |reason: &str| BridgeError::Decode {
        kind,
        name: registration.name.clone(),
        reason: reason.to_string(),
    };

    match kind {
        CapabilityKind::Tool | CapabilityKind::Rest => match raw {
            Value::Object(arguments) => Ok(arguments),
            Value::Null => Ok(Payload::new()),
            _ => Err(invalid("arguments must be a JSON object")),
        },
        CapabilityKind::Resource => {
            let uri = match raw {
                Value::String(uri) => uri,
                Value::Object(mut request) => match request.remove("uri") {
                    Some(Value::String(uri)) => uri,
                    Some(_) => return Err(invalid("uri must be a string")),
                    None => registration
                        .resource_url()
                        .ok_or_else(|| invalid("read request has no uri"))?,
                },
                Value::Null => registration
                    .resource_url()
                    .ok_or_else(|| invalid("read request has no uri"))?,
                _ => return Err(invalid("read request must be an object or a uri")),
            };
            let mut payload = Payload::new();
            payload.insert("uri".to_string(), Value::String(uri));
            Ok(payload)
        }
        CapabilityKind::A2a => match raw {
            Value::Object(mut params) => match params.remove("message") {
                Some(Value::Object(message)) => Ok(message),
                Some(_) => Err(invalid("message must be a JSON object")),
                None => Ok(params),
            },
            _ => Err(invalid("message must be a JSON object")),
        },
    }
}

/// Result reported when a call could not be decoded.
#[must_use]
pub fn decode_error_result(kind: CapabilityKind, err: &BridgeError) -> CallResult {
    let message = err.to_string();
    match kind {
        CapabilityKind::Tool => tool_error(message),
        CapabilityKind::Resource => CallResult::Error {
            message,
            exception: None,
        },
        CapabilityKind::A2a => CallResult::Agent {
            state: AgentState::Failed,
            payload: None,
            message: Some(message),
        },
        CapabilityKind::Rest => CallResult::Rest {
            status: 400,
            body: json!({ "error": err.error_type_name(), "message": message }),
        },
    }
}

// ============================================================================
// Encode
// ============================================================================

/// Maps a backend reply to the kind's result shape.
#[must_use]
pub fn encode_response(registration: &Registration, response: Response) -> CallResult {
    let kind = registration.kind();
    if !response.status().is_success() {
        return encode_failure(kind, response);
    }

    match kind {
        CapabilityKind::Tool => {
            let payload = Value::Object(response.into_payload().unwrap_or_default());
            CallResult::Tool {
                content: vec![ToolContent::Text {
                    text: payload.to_string(),
                }],
                is_error: false,
            }
        }
        CapabilityKind::Resource => encode_resource(registration, response),
        CapabilityKind::A2a => {
            let state = if response.status() == ResponseStatus::InputRequired {
                AgentState::InputRequired
            } else {
                AgentState::Completed
            };
            let message = response.message().map(str::to_string);
            CallResult::Agent {
                state,
                payload: response.into_payload(),
                message,
            }
        }
        CapabilityKind::Rest => CallResult::Rest {
            status: 200,
            body: Value::Object(response.into_payload().unwrap_or_default()),
        },
    }
}

fn encode_failure(kind: CapabilityKind, response: Response) -> CallResult {
    let message = response.failure_message();
    match kind {
        CapabilityKind::Tool => tool_error(message),
        CapabilityKind::Resource => CallResult::Error {
            message,
            exception: response.exception().cloned(),
        },
        CapabilityKind::A2a => CallResult::Agent {
            state: AgentState::Failed,
            payload: None,
            message: Some(message),
        },
        CapabilityKind::Rest => {
            let error = response
                .exception()
                .map(|e| e.class_name.clone())
                .unwrap_or_else(|| response.status().to_string());
            CallResult::Rest {
                status: 500,
                body: json!({ "error": error, "message": message }),
            }
        }
    }
}

fn encode_resource(registration: &Registration, response: Response) -> CallResult {
    let Some(payload) = response.into_payload() else {
        return CallResult::Error {
            message: format!("resource '{}' replied without contents", registration.name),
            exception: None,
        };
    };

    let field = |name: &str| payload.get(name).and_then(Value::as_str).map(str::to_string);
    let uri = field("uri")
        .or_else(|| registration.resource_url())
        .unwrap_or_default();
    let mime_type = field("mimeType")
        .or_else(|| registration.mime_type.clone())
        .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string());

    let is_blob = field("type").is_some_and(|kind| kind.eq_ignore_ascii_case("blob"));
    let contents = if is_blob {
        match field("blob") {
            Some(blob) => ResourceContents::Blob {
                uri,
                mime_type,
                blob,
            },
            None => {
                return CallResult::Error {
                    message: format!("blob reply from '{}' has no blob", registration.name),
                    exception: None,
                };
            }
        }
    } else {
        ResourceContents::Text {
            uri,
            mime_type,
            text: field("text").unwrap_or_default(),
        }
    };
    CallResult::Resource {
        contents: vec![contents],
    }
}

fn tool_error(message: String) -> CallResult {
    CallResult::Tool {
        content: vec![ToolContent::Text { text: message }],
        is_error: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool() -> Registration {
        Registration::tool("sum", "adds", "sum-req", "sum-res")
    }

    fn resource() -> Registration {
        Registration::resource("doc", "a doc", "doc-req", "doc-res", "text/markdown", "/docs/readme")
    }

    fn completed(value: Value) -> Response {
        Response::completed(0, value.as_object().cloned().unwrap_or_default())
    }

    #[test]
    fn test_tool_arguments_must_be_object() {
        assert_eq!(
            decode_call(&tool(), json!({"a": 1})).unwrap()["a"],
            1
        );
        assert!(decode_call(&tool(), Value::Null).unwrap().is_empty());

        let err = decode_call(&tool(), json!([1, 2])).unwrap_err();
        assert_eq!(err.error_type_name(), "decode_error");
    }

    #[test]
    fn test_resource_call_becomes_uri_payload() {
        let payload = decode_call(&resource(), json!({"uri": "docs/other"})).unwrap();
        assert_eq!(payload, json!({"uri": "docs/other"}).as_object().cloned().unwrap());

        let payload = decode_call(&resource(), Value::Null).unwrap();
        assert_eq!(payload["uri"], "docs/readme");
    }

    #[test]
    fn test_a2a_unwraps_message() {
        let payload = decode_call(
            &tool().with_kind(CapabilityKind::A2a),
            json!({"message": {"role": "user", "parts": []}}),
        )
        .unwrap();
        assert_eq!(payload["role"], "user");
        assert!(decode_call(&tool().with_kind(CapabilityKind::A2a), json!("hi")).is_err());
    }

    #[test]
    fn test_tool_result_is_json_text() {
        let result = encode_response(&tool(), completed(json!({"result": 5})));
        assert_eq!(
            result,
            CallResult::Tool {
                content: vec![ToolContent::Text {
                    text: "{\"result\":5}".to_string()
                }],
                is_error: false,
            }
        );
    }

    #[test]
    fn test_failed_reply_is_error_result() {
        let response = Response::error_for(0, "division by zero", "ArithmeticException");
        let result = encode_response(&tool(), response.clone());
        assert!(result.is_error());

        let rest = encode_response(&tool().with_kind(CapabilityKind::Rest), response);
        assert_eq!(
            rest,
            CallResult::Rest {
                status: 500,
                body: json!({"error": "ArithmeticException", "message": "division by zero"}),
            }
        );
    }

    #[test]
    fn test_resource_text_and_blob() {
        let text = encode_response(
            &resource(),
            completed(json!({"type": "text", "text": "# Readme"})),
        );
        assert_eq!(
            text,
            CallResult::Resource {
                contents: vec![ResourceContents::Text {
                    uri: "docs/readme".to_string(),
                    mime_type: "text/markdown".to_string(),
                    text: "# Readme".to_string(),
                }]
            }
        );

        let blob = encode_response(
            &resource(),
            completed(json!({"type": "BLOB", "uri": "docs/img", "mimeType": "image/png", "blob": "aGk="})),
        );
        assert_eq!(
            blob,
            CallResult::Resource {
                contents: vec![ResourceContents::Blob {
                    uri: "docs/img".to_string(),
                    mime_type: "image/png".to_string(),
                    blob: "aGk=".to_string(),
                }]
            }
        );
    }

    #[test]
    fn test_agent_states() {
        let agent = tool().with_kind(CapabilityKind::A2a);
        let pending = Response::new(0, ResponseStatus::InputRequired, None).with_message("which city?");
        assert_eq!(
            encode_response(&agent, pending),
            CallResult::Agent {
                state: AgentState::InputRequired,
                payload: None,
                message: Some("which city?".to_string()),
            }
        );

        let failed = Response::new(0, ResponseStatus::Failed, None).with_message("no");
        assert!(encode_response(&agent, failed).is_error());
    }

    #[test]
    fn test_rest_decode_error_is_bad_request() {
        let rest = tool().with_kind(CapabilityKind::Rest);
        let err = decode_call(&rest, json!(3)).unwrap_err();
        let CallResult::Rest { status, body } = decode_error_result(CapabilityKind::Rest, &err) else {
            panic!("expected rest result");
        };
        assert_eq!(status, 400);
        assert_eq!(body["error"], "decode_error");
    }
}
