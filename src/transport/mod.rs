//! Provider transport: one duplex byte stream plus, for spawned providers,
//! the owning process handle.
//!
//! - `codec`: NDJSON framing of [`Message`](crate::protocol::message::Message)s.
//! - `writer`: lock-serialised outbound frame writer.
//! - `spawner`: process launch and graceful-terminate-with-escalation.

pub mod codec;
pub mod spawner;
pub mod writer;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::ServerConfig;
use crate::transport::spawner::ChildProcess;
use crate::Result;

/// Boxed inbound half of a provider stream.
pub type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed outbound half of a provider stream.
pub type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// A connected duplex stream to one provider.
pub struct Transport {
    /// Provider output (its stdout).
    pub reader: BoxedRead,
    /// Provider input (its stdin).
    pub writer: BoxedWrite,
    /// Child process, when the session launched the provider itself.
    pub process: Option<ChildProcess>,
}

impl Transport {
    /// Launch the provider described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Spawn`](crate::AppError::Spawn) when the process
    /// cannot be started.
    pub fn spawn(server: &str, config: &ServerConfig) -> Result<Self> {
        spawner::spawn_provider(server, config)
    }

    /// Wrap an already-open stream pair with no process attached, e.g. the
    /// halves of a [`tokio::io::duplex`] pipe.
    #[must_use]
    pub fn from_streams<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            process: None,
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("process", &self.process)
            .finish_non_exhaustive()
    }
}
