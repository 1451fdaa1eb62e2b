//! The session's single reader task.
//!
//! Exactly one task reads the provider's output for the whole life of a
//! session and fans each frame out:
//!
//! | Frame                     | Action                                           |
//! |---------------------------|--------------------------------------------------|
//! | Response, known id        | complete the pending entry                        |
//! | Response, unknown id      | dropped, logged at `DEBUG`                        |
//! | Notification              | queued for its handler, or dropped if unhandled   |
//! | Server request            | queued for its handler, else answered directly    |
//! | Valid JSON, no id/method  | dropped, logged at `WARN`                         |
//! | Decode failure / EOF      | session-fatal                                     |

use std::sync::{Arc, Weak};

use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::protocol::message::{Message, MessageKind, RequestId, RpcError, INTERNAL_ERROR};
use crate::protocol::methods;
use crate::session::dispatch::Inbound;
use crate::session::SessionInner;
use crate::transport::codec::FrameCodec;
use crate::transport::writer::FrameWriter;
use crate::transport::BoxedRead;
use crate::AppError;

/// Start the reader for `session`.
pub(crate) fn spawn_reader(
    session: Weak<SessionInner>,
    stream: BoxedRead,
    queue: mpsc::Sender<Inbound>,
    writer: Arc<FrameWriter>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut frames = FramedRead::new(stream, FrameCodec::new());
        let reason = loop {
            let frame = tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                frame = frames.next() => frame,
            };
            let Some(inner) = session.upgrade() else {
                return;
            };
            match frame {
                None => break "provider closed its output stream".to_owned(),
                Some(Err(err)) => break fatal_reason(err),
                Some(Ok(message)) => {
                    inner.touch_heartbeat();
                    route(&inner, message, &queue, &writer);
                }
            }
        };

        if let Some(inner) = session.upgrade() {
            inner.fail(reason).await;
        }
    });
}

fn fatal_reason(err: AppError) -> String {
    match err {
        AppError::Transport(msg) => msg,
        other => other.to_string(),
    }
}

fn route(
    inner: &SessionInner,
    message: Message,
    queue: &mpsc::Sender<Inbound>,
    writer: &Arc<FrameWriter>,
) {
    let server = inner.name.as_str();
    let session_id = inner.id.as_str();

    let kind = match message.into_kind() {
        Ok(kind) => kind,
        Err(err) => {
            warn!(server, session_id, %err, "dropping malformed envelope");
            return;
        }
    };

    match kind {
        MessageKind::Response { id, outcome } => {
            let delivered = id
                .as_correlation()
                .and_then(|n| inner.tables().pending.complete(n, outcome));
            match delivered {
                Some(method) => trace!(server, session_id, request_id = %id, method = %method, "response delivered"),
                None => debug!(server, session_id, request_id = %id, "dropping response for unknown id"),
            }
        }

        MessageKind::Notification { method, params } => {
            let Some(handler) = inner.handlers().notification(&method) else {
                debug!(server, session_id, method = %method, "no handler for notification");
                return;
            };
            match queue.try_send(Inbound::Notification {
                method,
                params,
                handler,
            }) {
                Ok(()) => {}
                Err(TrySendError::Full(Inbound::Notification { method, .. })) => {
                    warn!(server, session_id, method = %method, "dispatch queue full, notification dropped");
                }
                Err(_) => debug!(server, session_id, "dispatcher gone, notification dropped"),
            }
        }

        MessageKind::Request { id, method, params } => {
            let Some(handler) = inner.handlers().request(&method) else {
                let reply = if method == methods::PING {
                    Message::response(id, json!({}))
                } else {
                    debug!(server, session_id, method = %method, "rejecting unsupported server request");
                    Message::error_response(id, RpcError::method_not_found(&method))
                };
                reply_in_background(server, writer, reply);
                return;
            };
            match queue.try_send(Inbound::Request {
                id,
                method,
                params,
                handler,
            }) {
                Ok(()) => {}
                Err(TrySendError::Full(Inbound::Request { id, method, .. })) => {
                    warn!(server, session_id, method = %method, "dispatch queue full, rejecting server request");
                    reject_busy(server, writer, id);
                }
                Err(_) => debug!(server, session_id, "dispatcher gone, server request dropped"),
            }
        }
    }
}

fn reject_busy(server: &str, writer: &Arc<FrameWriter>, id: RequestId) {
    let reply = Message::error_response(
        id,
        RpcError::new(INTERNAL_ERROR, "client is busy, request queue is full"),
    );
    reply_in_background(server, writer, reply);
}

// Replies go through their own task so a provider that stops reading its
// stdin can never stall the reader.
fn reply_in_background(server: &str, writer: &Arc<FrameWriter>, reply: Message) {
    let writer = Arc::clone(writer);
    let server = server.to_owned();
    tokio::spawn(async move {
        if let Err(err) = writer.send(&reply).await {
            debug!(server = %server, %err, "reply to server request not written");
        }
    });
}
