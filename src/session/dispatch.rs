//! Bounded dispatch of inbound notifications and server-initiated requests.
//!
//! The reader never runs handlers itself. It pushes work onto a bounded
//! queue with `try_send`, and a single worker task drains the queue in wire
//! order. Each handler runs in its own spawned task which the worker awaits,
//! so a panicking handler is contained without breaking ordering.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::message::{Message, RequestId, RpcError, INTERNAL_ERROR};
use crate::transport::writer::FrameWriter;

/// Capacity of the per-session dispatch queue.
pub(crate) const DISPATCH_QUEUE_DEPTH: usize = 256;

/// Boxed future returned by registered handlers.
pub type HandlerFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

pub(crate) type NotificationFn = Arc<dyn Fn(Option<Value>) -> HandlerFuture<()> + Send + Sync>;

pub(crate) type RequestFn =
    Arc<dyn Fn(Option<Value>) -> HandlerFuture<Result<Value, RpcError>> + Send + Sync>;

/// Method → handler registrations of one session.
#[derive(Default)]
pub(crate) struct HandlerTable {
    notifications: HashMap<String, NotificationFn>,
    requests: HashMap<String, RequestFn>,
}

impl HandlerTable {
    pub(crate) fn set_notification(&mut self, method: String, handler: NotificationFn) {
        self.notifications.insert(method, handler);
    }

    pub(crate) fn set_request(&mut self, method: String, handler: RequestFn) {
        self.requests.insert(method, handler);
    }

    pub(crate) fn notification(&self, method: &str) -> Option<NotificationFn> {
        self.notifications.get(method).cloned()
    }

    pub(crate) fn request(&self, method: &str) -> Option<RequestFn> {
        self.requests.get(method).cloned()
    }
}

/// One unit of queued inbound work.
pub(crate) enum Inbound {
    Notification {
        method: String,
        params: Option<Value>,
        handler: NotificationFn,
    },
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
        handler: RequestFn,
    },
}

/// Start the worker that drains `queue` until `cancel` fires or every
/// sender is gone.
pub(crate) fn spawn_dispatcher(
    server: String,
    mut queue: mpsc::Receiver<Inbound>,
    writer: Arc<FrameWriter>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let work = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                work = queue.recv() => match work {
                    Some(work) => work,
                    None => break,
                },
            };
            match work {
                Inbound::Notification {
                    method,
                    params,
                    handler,
                } => {
                    if let Err(err) = tokio::spawn(handler(params)).await {
                        warn!(server = %server, method = %method, %err, "notification handler panicked");
                    }
                }
                Inbound::Request {
                    id,
                    method,
                    params,
                    handler,
                } => {
                    let reply = match tokio::spawn(handler(params)).await {
                        Ok(Ok(result)) => Message::response(id, result),
                        Ok(Err(error)) => Message::error_response(id, error),
                        Err(err) => {
                            warn!(server = %server, method = %method, %err, "request handler panicked");
                            Message::error_response(
                                id,
                                RpcError::new(INTERNAL_ERROR, format!("{method} handler failed")),
                            )
                        }
                    };
                    if let Err(err) = writer.send(&reply).await {
                        debug!(server = %server, method = %method, %err, "reply to server request not written");
                    }
                }
            }
        }
        debug!(server = %server, "dispatcher stopped");
    });
}
