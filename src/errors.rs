//! Error types shared across the crate.

use std::fmt::{Display, Formatter};

use crate::protocol::message::RpcError;

/// Shared crate result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Error enumeration covering every session and manager failure mode.
///
/// Per-request variants ([`Timeout`](Self::Timeout), [`Remote`](Self::Remote),
/// [`ToolNotFound`](Self::ToolNotFound), …) only ever affect the call that
/// produced them. [`Transport`](Self::Transport) is session-fatal: once a
/// session reports it, every later request on that session reports it too.
#[derive(Debug, Clone)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// The provider executable could not be started.
    Spawn(String),
    /// `initialize` or the initial catalog fetch failed.
    Handshake(String),
    /// I/O or framing failure on the provider stream; terminates the session.
    Transport(String),
    /// No response arrived within the request deadline.
    Timeout(String),
    /// The caller, or a session close, aborted the request.
    Cancelled(String),
    /// Tool name absent from the last known catalog snapshot.
    ToolNotFound(String),
    /// Prompt name absent from the last known catalog snapshot.
    PromptNotFound(String),
    /// `resources/read` returned zero content entries.
    ResourceEmpty(String),
    /// Malformed envelope or unexpected payload shape.
    Protocol(String),
    /// Error object reported by the provider, preserved verbatim.
    Remote(RpcError),
    /// Operation requires a `Ready` session.
    NotConnected(String),
    /// The name or handle is taken by a session that is `Ready` or still
    /// connecting; only `Closing`/`Closed` entries may be replaced.
    AlreadyConnected(String),
    /// The manager has no `Ready` session under the requested name.
    ServerNotConnected(String),
    /// Local file-system or I/O failure outside the provider stream.
    Io(String),
}

impl AppError {
    /// Whether this error terminated the session it came from.
    #[must_use]
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::Handshake(msg) => write!(f, "handshake: {msg}"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::Cancelled(msg) => write!(f, "cancelled: {msg}"),
            Self::ToolNotFound(msg) => write!(f, "tool not found: {msg}"),
            Self::PromptNotFound(msg) => write!(f, "prompt not found: {msg}"),
            Self::ResourceEmpty(msg) => write!(f, "resource empty: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Remote(err) => write!(f, "remote: {err}"),
            Self::NotConnected(msg) => write!(f, "not connected: {msg}"),
            Self::AlreadyConnected(msg) => write!(f, "already connected: {msg}"),
            Self::ServerNotConnected(msg) => write!(f, "server not connected: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<RpcError> for AppError {
    fn from(err: RpcError) -> Self {
        Self::Remote(err)
    }
}
