//! Wire protocol spoken with tool providers.
//!
//! - `message`: the JSON-RPC 2.0 envelope and its classification.
//! - `model`: typed payloads for the methods this client issues.

pub mod message;
pub mod model;

/// Method names issued or handled by the session.
pub mod methods {
    /// Handshake request.
    pub const INITIALIZE: &str = "initialize";
    /// Sent once the `initialize` response has been accepted.
    pub const INITIALIZED: &str = "notifications/initialized";
    /// Liveness probe, in either direction.
    pub const PING: &str = "ping";
    /// Tool catalog listing.
    pub const TOOLS_LIST: &str = "tools/list";
    /// Tool invocation.
    pub const TOOLS_CALL: &str = "tools/call";
    /// Resource catalog listing.
    pub const RESOURCES_LIST: &str = "resources/list";
    /// Resource read.
    pub const RESOURCES_READ: &str = "resources/read";
    /// Prompt catalog listing.
    pub const PROMPTS_LIST: &str = "prompts/list";
    /// Prompt expansion.
    pub const PROMPTS_GET: &str = "prompts/get";
    /// Best-effort notice that the client abandoned a request.
    pub const CANCELLED: &str = "notifications/cancelled";
    /// Server notice that its tool catalog changed.
    pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
    /// Server notice that its resource catalog changed.
    pub const RESOURCES_LIST_CHANGED: &str = "notifications/resources/list_changed";
    /// Server notice that its prompt catalog changed.
    pub const PROMPTS_LIST_CHANGED: &str = "notifications/prompts/list_changed";
}
