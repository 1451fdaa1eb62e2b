//! Typed request and result payloads.
//!
//! Params and results travel as opaque [`serde_json::Value`]s; call sites
//! decode them into these shapes with [`decode_result`], which turns a shape
//! mismatch into [`AppError::Protocol`].

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{AppError, Result};

/// Protocol revision requested during `initialize` unless configured otherwise.
pub const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";

/// Name/version pair identifying a client or server implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    /// Implementation name.
    pub name: String,
    /// Implementation version.
    pub version: String,
}

/// `roots` client capability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootsCapability {
    /// Whether the client emits `notifications/roots/list_changed`.
    #[serde(default)]
    pub list_changed: bool,
}

/// Capabilities advertised by this client in `initialize`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientCapabilities {
    /// Present when the client can service `sampling/createMessage`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling: Option<Value>,
    /// Present when the client exposes filesystem roots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roots: Option<RootsCapability>,
}

/// Per-feature capability flag block (`{"listChanged": true, …}`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureCapability {
    /// The server emits `…/list_changed` notifications for this feature.
    #[serde(default)]
    pub list_changed: bool,
    /// The server supports resource subscriptions.
    #[serde(default)]
    pub subscribe: bool,
}

/// Capabilities advertised by the server in its `initialize` result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerCapabilities {
    /// Tool support.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<FeatureCapability>,
    /// Resource support.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<FeatureCapability>,
    /// Prompt support.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts: Option<FeatureCapability>,
    /// Structured log message support.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<Value>,
    /// Non-standard capabilities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experimental: Option<Value>,
}

/// `initialize` request parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    /// Requested protocol revision.
    pub protocol_version: String,
    /// Client capabilities.
    pub capabilities: ClientCapabilities,
    /// Client identity.
    pub client_info: Implementation,
}

/// Raw `initialize` result as it appears on the wire.
///
/// Providers report their identity either flat (`name`/`version` at the top
/// level) or nested under `serverInfo`; both are accepted.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitializeResult {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    server_info: Option<Implementation>,
    protocol_version: String,
    #[serde(default)]
    capabilities: ServerCapabilities,
    #[serde(default)]
    instructions: Option<String>,
}

/// Negotiated server identity and capabilities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    /// Server name.
    pub name: String,
    /// Server version.
    pub version: String,
    /// Protocol revision the server agreed to.
    pub protocol_version: String,
    /// Advertised capabilities.
    pub capabilities: ServerCapabilities,
    /// Optional usage instructions for the model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

impl ServerInfo {
    /// Decode an `initialize` result in either accepted shape.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Protocol`] when the result is not an object with a
    /// `protocolVersion` and a server name.
    pub fn from_initialize_result(value: Value) -> Result<Self> {
        let raw: InitializeResult = decode_result("initialize", value)?;
        let (name, version) = match (raw.server_info, raw.name) {
            (Some(info), _) => (info.name, info.version),
            (None, Some(name)) => (name, raw.version.unwrap_or_default()),
            (None, None) => {
                return Err(AppError::Protocol(
                    "initialize result does not name the server".into(),
                ))
            }
        };
        Ok(Self {
            name,
            version,
            protocol_version: raw.protocol_version,
            capabilities: raw.capabilities,
            instructions: raw.instructions,
        })
    }
}

/// A tool advertised by a provider. `name` is the catalog key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    /// Unique tool name.
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// JSON Schema describing the tool's arguments.
    #[serde(default = "empty_object_schema")]
    pub input_schema: Value,
}

/// A resource advertised by a provider. `uri` is the catalog key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    /// Unique resource URI.
    pub uri: String,
    /// Display name.
    pub name: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Optional MIME type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// One declared prompt argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptArgument {
    /// Argument name.
    pub name: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whether the argument must be supplied.
    #[serde(default)]
    pub required: bool,
}

/// A prompt template advertised by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    /// Unique prompt name.
    pub name: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Declared arguments.
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
}

/// One content entry of a tool result or prompt message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    /// Content type (`text`, `image`, `resource`, …).
    #[serde(rename = "type")]
    pub kind: String,
    /// Text payload for `text` entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Base64 payload for binary entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Referenced resource URI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    /// MIME type of `data`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Embedded resource for `resource` entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<Value>,
}

impl Content {
    /// Build a `text` content entry.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".into(),
            text: Some(text.into()),
            data: None,
            uri: None,
            mime_type: None,
            resource: None,
        }
    }
}

/// Decoded `tools/call` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    /// Result content entries.
    #[serde(default)]
    pub content: Vec<Content>,
    /// Set when the tool itself reports failure. This is a successful
    /// protocol exchange, not an [`AppError`].
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResult {
    /// Concatenate every `text` entry, newline-separated.
    #[must_use]
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| c.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// One entry of a `resources/read` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceContent {
    /// URI of the returned content.
    pub uri: String,
    /// Optional MIME type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Text body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Base64 body for binary resources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>,
}

/// Decoded `resources/read` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadResourceResult {
    /// Returned content entries.
    #[serde(default)]
    pub contents: Vec<ResourceContent>,
}

/// One message of an expanded prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    /// `user` or `assistant`.
    pub role: String,
    /// Message content.
    pub content: Content,
}

/// Decoded `prompts/get` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptResult {
    /// Optional description of the expanded prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Expanded messages.
    #[serde(default)]
    pub messages: Vec<PromptMessage>,
}

/// `tools/call` parameters.
#[derive(Debug, Clone, Serialize)]
pub struct CallToolParams<'a> {
    /// Tool name.
    pub name: &'a str,
    /// Tool arguments.
    pub arguments: Value,
}

/// `prompts/get` parameters.
#[derive(Debug, Clone, Serialize)]
pub struct GetPromptParams<'a> {
    /// Prompt name.
    pub name: &'a str,
    /// Prompt arguments.
    pub arguments: &'a HashMap<String, String>,
}

/// One page of a cursor-paginated list result.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Page<T> {
    #[serde(default = "Vec::new", alias = "tools", alias = "resources", alias = "prompts")]
    pub items: Vec<T>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Decode a result value into `T`, naming `method` in the error.
///
/// # Errors
///
/// Returns [`AppError::Protocol`] when `value` does not match `T`.
pub fn decode_result<T: DeserializeOwned>(method: &str, value: Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| AppError::Protocol(format!("unexpected {method} result shape: {e}")))
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object" })
}
