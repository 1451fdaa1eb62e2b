//! JSON-RPC 2.0 envelope.
//!
//! Every frame on the provider stream is one [`Message`]. Its role is not
//! tagged on the wire; it is derived from which of `id` / `method` are
//! present:
//!
//! | `id` | `method` | Kind                                  |
//! |------|----------|---------------------------------------|
//! | yes  | no       | [`MessageKind::Response`]             |
//! | no   | yes      | [`MessageKind::Notification`]         |
//! | yes  | yes      | [`MessageKind::Request`] (server-initiated) |
//! | no   | no       | malformed, [`AppError::Protocol`]     |

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::{AppError, Result};

/// Protocol tag carried in every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC error code: the method does not exist.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Standard JSON-RPC error code: invalid method parameters.
pub const INVALID_PARAMS: i64 = -32602;

/// Standard JSON-RPC error code: internal error.
pub const INTERNAL_ERROR: i64 = -32603;

/// Correlation id. Outbound ids are always numeric; inbound ids may be either.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Integer id.
    Number(i64),
    /// String id.
    String(String),
}

impl RequestId {
    /// Interpret the id as one of this client's numeric correlation ids.
    ///
    /// Returns `None` for ids this client can never have issued (negative,
    /// zero, or non-numeric strings).
    #[must_use]
    pub fn as_correlation(&self) -> Option<u64> {
        match self {
            Self::Number(n) => u64::try_from(*n).ok().filter(|n| *n > 0),
            Self::String(s) => s.parse::<u64>().ok().filter(|n| *n > 0),
        }
    }
}

impl From<u64> for RequestId {
    fn from(id: u64) -> Self {
        i64::try_from(id).map_or_else(|_| Self::String(id.to_string()), Self::Number)
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

/// Error object carried by an error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Numeric error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional provider-defined payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Build an error object without data.
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// The error returned for methods nobody handles.
    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("method not supported: {method}"))
    }
}

impl Display for RpcError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "code {}: {}", self.code, self.message)
    }
}

/// Wire envelope for requests, notifications and responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Protocol tag, always `"2.0"` on output.
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    /// Correlation id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    /// Method name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Method parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Successful result. An explicit `null` is preserved as `Some(Value::Null)`.
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    /// Error result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

/// Classified view of a [`Message`].
#[derive(Debug, Clone)]
pub enum MessageKind {
    /// Reply to one of our requests.
    Response {
        /// Id echoed from the request.
        id: RequestId,
        /// `Ok(result)`, [`AppError::Remote`] for an error object, or
        /// [`AppError::Protocol`] when the reply carries neither.
        outcome: Result<Value>,
    },
    /// One-way message from the provider.
    Notification {
        /// Notification method.
        method: String,
        /// Notification parameters.
        params: Option<Value>,
    },
    /// Request initiated by the provider; must be answered.
    Request {
        /// Provider-chosen id.
        id: RequestId,
        /// Request method.
        method: String,
        /// Request parameters.
        params: Option<Value>,
    },
}

impl Message {
    /// Build a request envelope.
    #[must_use]
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: Some(id.into()),
            method: Some(method.into()),
            params,
            ..Self::empty()
        }
    }

    /// Build a notification envelope.
    #[must_use]
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: Some(method.into()),
            params,
            ..Self::empty()
        }
    }

    /// Build a success response.
    #[must_use]
    pub fn response(id: RequestId, result: Value) -> Self {
        Self {
            id: Some(id),
            result: Some(result),
            ..Self::empty()
        }
    }

    /// Build an error response.
    #[must_use]
    pub fn error_response(id: RequestId, error: RpcError) -> Self {
        Self {
            id: Some(id),
            error: Some(error),
            ..Self::empty()
        }
    }

    /// Classify the envelope by the presence of `id` and `method`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Protocol`] when neither `id` nor `method` is
    /// present.
    pub fn into_kind(self) -> Result<MessageKind> {
        match (self.id, self.method) {
            (Some(id), None) => {
                let outcome = match (self.result, self.error) {
                    (_, Some(error)) => Err(AppError::Remote(error)),
                    (Some(result), None) => Ok(result),
                    (None, None) => Err(AppError::Protocol(format!(
                        "response {id} carries neither result nor error"
                    ))),
                };
                Ok(MessageKind::Response { id, outcome })
            }
            (None, Some(method)) => Ok(MessageKind::Notification {
                method,
                params: self.params,
            }),
            (Some(id), Some(method)) => Ok(MessageKind::Request {
                id,
                method,
                params: self.params,
            }),
            (None, None) => Err(AppError::Protocol(
                "envelope has neither id nor method".into(),
            )),
        }
    }

    fn empty() -> Self {
        Self {
            jsonrpc: default_jsonrpc(),
            id: None,
            method: None,
            params: None,
            result: None,
            error: None,
        }
    }
}

fn default_jsonrpc() -> String {
    JSONRPC_VERSION.to_owned()
}

/// Keep `"result": null` distinguishable from an absent `result`.
fn deserialize_present<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}
