//! NDJSON frame codec for provider streams.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a maximum line length and
//! JSON (de)serialisation of [`Message`] envelopes. Use [`FrameCodec`] with
//! [`tokio_util::codec::FramedRead`] on the provider's stdout; the writer
//! side encodes through the same codec (see [`super::writer`]).
//!
//! Every decode failure is **stream-fatal**: once a line fails to parse, or
//! exceeds the length limit, the byte boundary can no longer be trusted and
//! the session terminates. Blank lines are the only input skipped silently.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::protocol::message::Message;
use crate::{AppError, Result};

/// Maximum line length accepted from a provider: 16 MiB.
///
/// Tool results can carry sizeable base64 payloads, so the limit is more
/// generous than a typical control-channel limit.
pub const MAX_FRAME_BYTES: usize = 16 * 1_048_576;

/// Newline-delimited JSON codec for [`Message`] frames.
///
/// # Examples
///
/// ```rust,ignore
/// use tokio_util::codec::FramedRead;
/// use provider_session::transport::codec::FrameCodec;
///
/// let frames = FramedRead::new(child_stdout, FrameCodec::new());
/// ```
#[derive(Debug)]
pub struct FrameCodec(LinesCodec);

impl FrameCodec {
    /// Create a codec with the default [`MAX_FRAME_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_length(MAX_FRAME_BYTES)
    }

    /// Create a codec with a custom line limit.
    #[must_use]
    pub fn with_max_length(max: usize) -> Self {
        Self(LinesCodec::new_with_max_length(max))
    }

    fn parse(line: &str) -> Result<Message> {
        serde_json::from_str(line)
            .map_err(|e| AppError::Transport(format!("malformed frame: {e}")))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = AppError;

    /// Decode the next non-blank line from `src` into a [`Message`].
    ///
    /// Returns `Ok(None)` while no complete line is buffered.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        loop {
            match self.0.decode(src).map_err(map_codec_error)? {
                None => return Ok(None),
                Some(line) if line.trim().is_empty() => {}
                Some(line) => return Self::parse(&line).map(Some),
            }
        }
    }

    /// Decode the final, possibly unterminated, line at EOF.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        loop {
            match self.0.decode_eof(src).map_err(map_codec_error)? {
                None => return Ok(None),
                Some(line) if line.trim().is_empty() => {}
                Some(line) => return Self::parse(&line).map(Some),
            }
        }
    }
}

impl Encoder<&Message> for FrameCodec {
    type Error = AppError;

    /// Serialise `item` as one compact JSON line terminated by exactly one `\n`.
    fn encode(&mut self, item: &Message, dst: &mut BytesMut) -> Result<()> {
        let line = serde_json::to_string(item)
            .map_err(|e| AppError::Protocol(format!("failed to serialise outbound frame: {e}")))?;
        // LinesCodec::encode does not enforce the max length; only decoding does.
        self.0.encode(line, dst).map_err(map_codec_error)
    }
}

// ── Private helper ────────────────────────────────────────────────────────────

fn map_codec_error(e: LinesCodecError) -> AppError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            AppError::Transport("frame too long: line length limit exceeded".into())
        }
        LinesCodecError::Io(io_err) => AppError::Transport(format!("stream error: {io_err}")),
    }
}
