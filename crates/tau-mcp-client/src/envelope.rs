//! JSON-RPC 2.0 envelope model shared by every transport binding.
//!
//! Envelopes are decoded leniently: anything that does not form a request,
//! notification or response is reported as an [`EnvelopeDecodeError`] so the
//! inbound listener can discard it as stream noise.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::McpClientError;

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
/// Correlation id carried by requests and responses.
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(number) => number.as_i64().map(RequestId::Number),
            Value::String(text) => Some(RequestId::String(text.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            RequestId::Number(number) => json!(number),
            RequestId::String(text) => json!(text),
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(number) => write!(f, "{number}"),
            RequestId::String(text) => write!(f, "{text}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        RequestId::Number(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        RequestId::String(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Error object carried by a failed response.
pub struct JsonRpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcRequest {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcNotification {
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    Result(Value),
    Error(JsonRpcErrorObject),
}

#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcResponse {
    pub id: RequestId,
    pub payload: ResponsePayload,
}

impl JsonRpcResponse {
    pub fn is_error(&self) -> bool {
        matches!(self.payload, ResponsePayload::Error(_))
    }

    /// Converts the response into the caller-facing outcome: the `result`
    /// value, or a [`McpClientError::Protocol`] carrying the server's error.
    pub fn into_result(self) -> Result<Value, McpClientError> {
        match self.payload {
            ResponsePayload::Result(value) => Ok(value),
            ResponsePayload::Error(error) => Err(McpClientError::Protocol {
                code: error.code,
                message: error.message,
                data: error.data,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// One wire-level JSON-RPC message.
pub enum Envelope {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Why an inbound text frame could not be turned into an [`Envelope`].
pub enum EnvelopeDecodeError {
    Empty,
    InvalidJson(String),
    NotAnObject,
    InvalidId,
    InvalidMethod,
    AmbiguousResponse,
    MissingPayload,
    InvalidErrorObject(String),
}

impl fmt::Display for EnvelopeDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvelopeDecodeError::Empty => write!(f, "empty frame"),
            EnvelopeDecodeError::InvalidJson(detail) => write!(f, "invalid json: {detail}"),
            EnvelopeDecodeError::NotAnObject => write!(f, "frame is not a json object"),
            EnvelopeDecodeError::InvalidId => write!(f, "id must be an integer or string"),
            EnvelopeDecodeError::InvalidMethod => write!(f, "method must be a string"),
            EnvelopeDecodeError::AmbiguousResponse => {
                write!(f, "response carries both result and error")
            }
            EnvelopeDecodeError::MissingPayload => {
                write!(f, "frame is neither a request, notification nor response")
            }
            EnvelopeDecodeError::InvalidErrorObject(detail) => {
                write!(f, "invalid error object: {detail}")
            }
        }
    }
}

impl std::error::Error for EnvelopeDecodeError {}

impl Envelope {
    pub fn request(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Envelope::Request(JsonRpcRequest {
            id,
            method: method.into(),
            params,
        })
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Envelope::Notification(JsonRpcNotification {
            method: method.into(),
            params,
        })
    }

    pub fn result(id: RequestId, result: Value) -> Self {
        Envelope::Response(JsonRpcResponse {
            id,
            payload: ResponsePayload::Result(result),
        })
    }

    pub fn error(id: RequestId, code: i64, message: impl Into<String>) -> Self {
        Envelope::Response(JsonRpcResponse {
            id,
            payload: ResponsePayload::Error(JsonRpcErrorObject {
                code,
                message: message.into(),
                data: None,
            }),
        })
    }

    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Envelope::Request(request) => Some(&request.id),
            Envelope::Response(response) => Some(&response.id),
            Envelope::Notification(_) => None,
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Envelope::Request(request) => Some(request.method.as_str()),
            Envelope::Notification(notification) => Some(notification.method.as_str()),
            Envelope::Response(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Request(_) => "request",
            Envelope::Notification(_) => "notification",
            Envelope::Response(_) => "response",
        }
    }

    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        object.insert("jsonrpc".to_string(), json!(JSONRPC_VERSION));
        match self {
            Envelope::Request(request) => {
                object.insert("id".to_string(), request.id.to_value());
                object.insert("method".to_string(), json!(request.method));
                if let Some(params) = request.params.as_ref() {
                    object.insert("params".to_string(), params.clone());
                }
            }
            Envelope::Notification(notification) => {
                object.insert("method".to_string(), json!(notification.method));
                if let Some(params) = notification.params.as_ref() {
                    object.insert("params".to_string(), params.clone());
                }
            }
            Envelope::Response(response) => {
                object.insert("id".to_string(), response.id.to_value());
                match &response.payload {
                    ResponsePayload::Result(result) => {
                        object.insert("result".to_string(), result.clone());
                    }
                    ResponsePayload::Error(error) => {
                        object.insert("error".to_string(), json!(error));
                    }
                }
            }
        }
        Value::Object(object)
    }

    /// Serializes the envelope as a single line without a trailing newline.
    pub fn encode(&self) -> String {
        self.to_value().to_string()
    }

    pub fn decode(raw: &str) -> Result<Self, EnvelopeDecodeError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(EnvelopeDecodeError::Empty);
        }
        let value = serde_json::from_str::<Value>(trimmed)
            .map_err(|error| EnvelopeDecodeError::InvalidJson(error.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, EnvelopeDecodeError> {
        let Value::Object(mut object) = value else {
            return Err(EnvelopeDecodeError::NotAnObject);
        };

        let id = match object.remove("id") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(RequestId::from_value(&raw).ok_or(EnvelopeDecodeError::InvalidId)?),
        };

        if let Some(method) = object.remove("method") {
            let Value::String(method) = method else {
                return Err(EnvelopeDecodeError::InvalidMethod);
            };
            let params = object.remove("params");
            return Ok(match id {
                Some(id) => Envelope::Request(JsonRpcRequest { id, method, params }),
                None => Envelope::Notification(JsonRpcNotification { method, params }),
            });
        }

        let result = object.remove("result");
        let error = object.remove("error");
        let payload = match (result, error) {
            (Some(_), Some(_)) => return Err(EnvelopeDecodeError::AmbiguousResponse),
            (Some(result), None) => ResponsePayload::Result(result),
            (None, Some(error)) => ResponsePayload::Error(
                serde_json::from_value::<JsonRpcErrorObject>(error).map_err(|error| {
                    EnvelopeDecodeError::InvalidErrorObject(error.to_string())
                })?,
            ),
            (None, None) => return Err(EnvelopeDecodeError::MissingPayload),
        };
        // A response without a usable id cannot be correlated with anything.
        let id = id.ok_or(EnvelopeDecodeError::MissingPayload)?;
        Ok(Envelope::Response(JsonRpcResponse { id, payload }))
    }
}
