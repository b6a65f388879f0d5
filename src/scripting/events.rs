//! Typed scripting responses and events.
//!
//! The engine answers a `scripting/script` request with one direct result,
//! a plan notification, a progress notification per scripted object, and a
//! terminal completion event. [`decode_response`] maps a raw JSON-RPC message
//! onto the closed [`ScriptingMessage`] union by inspecting its shape.

use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use tracing::debug;

use crate::jsonrpc::RequestId;

/// Terminal completion event.
pub const SCRIPT_COMPLETE_METHOD: &str = "scripting/scriptComplete";
/// Notification form of the completion event sent under the request's method name.
pub const SCRIPT_METHOD: &str = "scripting/script";
/// Plan of the objects about to be scripted.
pub const SCRIPT_PLAN_METHOD: &str = "scripting/scriptPlanNotification";
/// Per-object progress.
pub const SCRIPT_PROGRESS_METHOD: &str = "scripting/scriptProgressNotification";

/// One decoded message for a scripting request.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptingMessage {
    /// Direct reply to the `scripting/script` request.
    Response(ScriptResponse),
    Plan(ScriptPlanNotification),
    Progress(ScriptProgressNotification),
    /// Terminal event; nothing follows it for the same request.
    Complete(ScriptCompleteEvent),
    /// Anything else, passed through unchanged.
    Unrecognized(Value),
}

impl ScriptingMessage {
    /// True for the terminal completion event.
    pub fn is_complete(&self) -> bool {
        matches!(self, ScriptingMessage::Complete(_))
    }

    /// Engine operation id carried by the message, if any.
    pub fn operation_id(&self) -> Option<&str> {
        match self {
            ScriptingMessage::Response(response) => response.operation_id.as_deref(),
            ScriptingMessage::Plan(plan) => Some(&plan.operation_id),
            ScriptingMessage::Progress(progress) => Some(&progress.operation_id),
            ScriptingMessage::Complete(complete) => Some(&complete.operation_id),
            ScriptingMessage::Unrecognized(_) => None,
        }
    }
}

/// Database object as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ScriptingObject {
    #[serde(rename = "type", default)]
    pub object_type: Option<String>,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub name: String,
}

/// Direct result of the `scripting/script` call.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptResponse {
    pub request_id: RequestId,
    pub operation_id: Option<String>,
    pub result: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptPlanNotification {
    #[serde(deserialize_with = "lenient::text")]
    pub operation_id: String,
    #[serde(default, deserialize_with = "lenient::optional_count")]
    pub sequence_number: Option<u64>,
    #[serde(default)]
    pub scripting_objects: Vec<ScriptingObject>,
    #[serde(deserialize_with = "lenient::count")]
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptProgressNotification {
    #[serde(deserialize_with = "lenient::text")]
    pub operation_id: String,
    #[serde(default, deserialize_with = "lenient::optional_count")]
    pub sequence_number: Option<u64>,
    pub scripting_object: ScriptingObject,
    pub status: String,
    #[serde(deserialize_with = "lenient::count")]
    pub completed_count: u64,
    #[serde(deserialize_with = "lenient::count")]
    pub total_count: u64,
}

/// Terminal event of a scripting operation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptCompleteEvent {
    #[serde(deserialize_with = "lenient::text")]
    pub operation_id: String,
    #[serde(default, deserialize_with = "lenient::optional_count")]
    pub sequence_number: Option<u64>,
    #[serde(deserialize_with = "lenient::flag")]
    pub success: bool,
    #[serde(deserialize_with = "lenient::flag")]
    pub canceled: bool,
    #[serde(deserialize_with = "lenient::flag")]
    pub has_error: bool,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_details: Value,
}

impl ScriptCompleteEvent {
    /// Failed completion produced on the client side.
    pub fn failed(operation_id: impl Into<String>, message: impl Into<String>, details: Value) -> Self {
        Self {
            operation_id: operation_id.into(),
            sequence_number: None,
            success: false,
            canceled: false,
            has_error: true,
            error_message: Some(message.into()),
            error_details: details,
        }
    }
}

/// Classify a raw JSON-RPC message. Never fails.
///
/// A `method` field is checked before `id`/`result`, so a message carrying
/// both is treated as an event. Known events whose params do not match the
/// contract are passed through as [`ScriptingMessage::Unrecognized`].
pub fn decode_response(message: Value) -> ScriptingMessage {
    if let Some(method) = message.get("method").and_then(Value::as_str) {
        let params = message.get("params").cloned().unwrap_or(Value::Null);
        let decoded = match method {
            SCRIPT_COMPLETE_METHOD | SCRIPT_METHOD => {
                serde_json::from_value(params).map(ScriptingMessage::Complete)
            }
            SCRIPT_PLAN_METHOD => serde_json::from_value(params).map(ScriptingMessage::Plan),
            SCRIPT_PROGRESS_METHOD => {
                serde_json::from_value(params).map(ScriptingMessage::Progress)
            }
            _ => return unrecognized(message),
        };

        return match decoded {
            Ok(event) => event,
            Err(e) => {
                debug!("Malformed {} event: {}", method, e);
                ScriptingMessage::Unrecognized(message)
            }
        };
    }

    let request_id = message.get("id").and_then(Value::as_u64);
    if let Some(request_id) = request_id {
        if let Some(result) = message.get("result") {
            let operation_id = result.get("operationId").and_then(lenient::value_text);
            return ScriptingMessage::Response(ScriptResponse {
                request_id,
                operation_id,
                result: result.clone(),
            });
        }

        if let Some(error) = message.get("error") {
            let text = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown engine error");
            debug!("Request {} rejected by engine: {}", request_id, text);
            return ScriptingMessage::Complete(ScriptCompleteEvent::failed(
                request_id.to_string(),
                text,
                json!(error),
            ));
        }
    }

    unrecognized(message)
}

fn unrecognized(message: Value) -> ScriptingMessage {
    debug!("Unable to decode response to an event type: {}", message);
    ScriptingMessage::Unrecognized(message)
}

/// Deserializers for the loosely-typed fields the engine emits.
///
/// Booleans may arrive as `"true"`/`"false"`, counters as numeric strings,
/// and operation ids as strings or numbers.
mod lenient {
    use super::*;
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Loose {
        Bool(bool),
        Number(serde_json::Number),
        Text(String),
    }

    pub fn value_text(value: &Value) -> Option<String> {
        match value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        match Loose::deserialize(deserializer)? {
            Loose::Text(s) => Ok(s),
            Loose::Number(n) => Ok(n.to_string()),
            Loose::Bool(b) => Err(D::Error::custom(format!("expected an id, got {}", b))),
        }
    }

    pub fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        match Loose::deserialize(deserializer)? {
            Loose::Bool(b) => Ok(b),
            Loose::Text(s) if s.eq_ignore_ascii_case("true") => Ok(true),
            Loose::Text(s) if s.eq_ignore_ascii_case("false") => Ok(false),
            other => Err(D::Error::custom(format!(
                "expected a boolean, got {}",
                describe(&other)
            ))),
        }
    }

    pub fn count<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let loose = Loose::deserialize(deserializer)?;
        to_count(&loose).ok_or_else(|| {
            D::Error::custom(format!("expected a count, got {}", describe(&loose)))
        })
    }

    pub fn optional_count<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<u64>, D::Error> {
        match Option::<Loose>::deserialize(deserializer)? {
            None => Ok(None),
            Some(loose) => to_count(&loose).map(Some).ok_or_else(|| {
                D::Error::custom(format!("expected a count, got {}", describe(&loose)))
            }),
        }
    }

    fn to_count(loose: &Loose) -> Option<u64> {
        match loose {
            Loose::Number(n) => n.as_u64(),
            Loose::Text(s) => s.trim().parse().ok(),
            Loose::Bool(_) => None,
        }
    }

    fn describe(loose: &Loose) -> String {
        match loose {
            Loose::Bool(b) => b.to_string(),
            Loose::Number(n) => n.to_string(),
            Loose::Text(s) => format!("{:?}", s),
        }
    }
}
