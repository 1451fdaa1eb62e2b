//! Serialised frame writer.
//!
//! Every outbound frame for a session goes through one [`FrameWriter`]. The
//! frame is fully encoded before the writer lock is taken, and the lock is
//! held across the whole `write_all` + `flush`, so concurrent callers never
//! interleave partial lines on the provider's stdin.
//!
//! A provider that stops reading its stdin can leave a write pending
//! forever. [`FrameWriter::shutdown`] aborts such a write instead of waiting
//! for its lock, and a write whose future is dropped part-way marks the
//! stream as torn: the line may be half on the wire, so every later send
//! fails with [`AppError::Transport`].

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::codec::Encoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::message::Message;
use crate::transport::codec::FrameCodec;
use crate::transport::BoxedWrite;
use crate::{AppError, Result};

/// Lock-serialised NDJSON writer over a provider's input stream.
pub struct FrameWriter {
    server: String,
    sink: Mutex<Option<BoxedWrite>>,
    closed: CancellationToken,
    torn: AtomicBool,
}

/// Marks the stream torn unless disarmed before it drops.
struct TearGuard<'a> {
    torn: &'a AtomicBool,
    armed: bool,
}

impl Drop for TearGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.torn.store(true, Ordering::Release);
        }
    }
}

impl FrameWriter {
    /// Wrap `sink` for the session named `server`.
    #[must_use]
    pub fn new(server: impl Into<String>, sink: BoxedWrite) -> Self {
        Self {
            server: server.into(),
            sink: Mutex::new(Some(sink)),
            closed: CancellationToken::new(),
            torn: AtomicBool::new(false),
        }
    }

    /// Encode `msg` and write it as exactly one line.
    ///
    /// Cancel-safe only before the write starts: dropping the returned
    /// future mid-write tears the stream (see [`is_torn`](Self::is_torn)).
    ///
    /// # Errors
    ///
    /// - [`AppError::Protocol`] if the envelope cannot be serialised.
    /// - [`AppError::Transport`] if the stream was shut down or torn, or the
    ///   write fails (e.g. the provider process has exited).
    pub async fn send(&self, msg: &Message) -> Result<()> {
        let mut frame = BytesMut::new();
        FrameCodec::new().encode(msg, &mut frame)?;

        tokio::select! {
            biased;
            () = self.closed.cancelled() => Err(self.closed_error()),
            written = self.write_frame(&frame) => written,
        }
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<()> {
        let mut guard = self.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            return Err(self.closed_error());
        };
        if self.is_torn() {
            return Err(AppError::Transport(format!(
                "write failed: an earlier frame to '{}' was abandoned mid-write",
                self.server
            )));
        }

        let mut tear = TearGuard {
            torn: &self.torn,
            armed: true,
        };
        let written = async {
            sink.write_all(frame).await?;
            sink.flush().await
        }
        .await;
        tear.armed = false;

        written.map_err(|e| {
            warn!(server = %self.server, error = %e, "frame writer: write failed");
            AppError::Transport(format!("write failed: {e}"))
        })
    }

    /// True once a write was abandoned part-way; the stream can no longer
    /// be trusted to hold whole lines.
    #[must_use]
    pub fn is_torn(&self) -> bool {
        self.torn.load(Ordering::Acquire)
    }

    /// Close the stream so the provider observes EOF on its stdin.
    ///
    /// A write blocked on a provider that is not reading is aborted first.
    /// Idempotent; later [`send`](Self::send) calls fail with
    /// [`AppError::Transport`].
    pub async fn shutdown(&self) {
        self.closed.cancel();
        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            if let Err(e) = sink.shutdown().await {
                debug!(server = %self.server, error = %e, "frame writer: shutdown error ignored");
            }
        }
    }

    fn closed_error(&self) -> AppError {
        AppError::Transport(format!(
            "write failed: stream to '{}' is closed",
            self.server
        ))
    }
}

impl std::fmt::Debug for FrameWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameWriter")
            .field("server", &self.server)
            .field("torn", &self.is_torn())
            .finish_non_exhaustive()
    }
}
