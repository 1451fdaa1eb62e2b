//! One logical connection to a single tool-provider process.
//!
//! A [`Session`] owns the provider transport, the single reader task, the
//! pending-request table, the handler table and the catalog snapshot. It is a
//! cheap [`Clone`] handle; every clone drives the same connection.
//!
//! # State machine
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──spawned──▶ Initializing ──handshake──▶ Ready
//!       │                       │                        │                        │
//!       └───────────────────────┴─────── failure / close ┴──────▶ Closing ──▶ Closed
//! ```
//!
//! Setup is all-or-nothing: any failure before `Ready` kills the provider
//! and ends in `Closed`. Only a `Ready` session accepts calls. A session
//! handle is single-use; reconnecting means creating a new [`Session`].
//!
//! # Termination
//!
//! Every path out of `Ready` goes through `Closing`, and the transition into
//! `Closing` happens exactly once. Whoever wins it cancels the session scope,
//! resolves every pending request ([`AppError::Transport`] for a fatal stream
//! error, [`AppError::Cancelled`] for a deliberate close) and runs the
//! interrupt, wait, force-kill sequence. Concurrent `close` calls wait for
//! `Closed` instead of racing a second escalation.

pub mod catalog;
mod dispatch;
mod pending;
mod reader;

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use catalog::Catalog;
pub use dispatch::HandlerFuture;

use crate::config::{ClientConfig, ServerConfig};
use crate::protocol::message::{Message, RpcError};
use crate::protocol::methods;
use crate::protocol::model::{
    decode_result, CallToolParams, GetPromptParams, InitializeParams, Page, Prompt, PromptResult,
    ReadResourceResult, Resource, ServerInfo, Tool, ToolResult,
};
use crate::session::catalog::dedupe_by_key;
use crate::session::dispatch::{HandlerTable, DISPATCH_QUEUE_DEPTH};
use crate::session::pending::{Completion, PendingTable};
use crate::transport::spawner::ChildProcess;
use crate::transport::writer::FrameWriter;
use crate::transport::Transport;
use crate::{AppError, Result};

/// Upper bound on pages fetched for one list call.
const MAX_PAGES: usize = 64;

/// Upper bound on flushing and closing the provider's stdin during shutdown.
const WRITER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

// ── State ─────────────────────────────────────────────────────────────────────

/// Lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Created, `connect` not yet called.
    Disconnected,
    /// Launching the provider.
    Connecting,
    /// Transport up, handshake in progress.
    Initializing,
    /// Handshake and initial catalog fetch succeeded.
    Ready,
    /// Shutdown in progress.
    Closing,
    /// Terminal.
    Closed,
}

impl Display for SessionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Per-call overrides for a request.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Deadline for this call; the server's `request_timeout` when `None`.
    pub timeout: Option<Duration>,
    /// Caller-owned cancellation token.
    pub cancel: Option<CancellationToken>,
}

impl RequestOptions {
    /// Override the deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Abort the call when `token` is cancelled.
    #[must_use]
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Which states a request may be issued in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Handshake traffic: `Initializing` or `Ready`.
    Setup,
    /// Caller traffic: `Ready` only.
    Ready,
}

enum Shutdown {
    Close,
    Fatal(String),
}

// ── Shared state ──────────────────────────────────────────────────────────────

/// Pending table and catalog share one lock.
#[derive(Debug, Default)]
struct Tables {
    pending: PendingTable,
    catalog: Catalog,
}

pub(crate) struct SessionInner {
    id: String,
    name: String,
    config: ServerConfig,
    client: ClientConfig,
    state: watch::Sender<SessionState>,
    tables: Mutex<Tables>,
    handlers: RwLock<HandlerTable>,
    next_id: AtomicU64,
    writer: Mutex<Option<Arc<FrameWriter>>>,
    process: tokio::sync::Mutex<Option<ChildProcess>>,
    pid: Mutex<Option<u32>>,
    cancel: CancellationToken,
    server_info: Mutex<Option<ServerInfo>>,
    last_heartbeat: Mutex<Option<DateTime<Utc>>>,
    fatal: Mutex<Option<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionInner {
    fn tables(&self) -> MutexGuard<'_, Tables> {
        lock(&self.tables)
    }

    fn handlers(&self) -> RwLockReadGuard<'_, HandlerTable> {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn touch_heartbeat(&self) {
        *lock(&self.last_heartbeat) = Some(Utc::now());
    }

    /// Move `from` → `to`; false if the session is no longer in `from`.
    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// Error reported to callers once the session can no longer serve them.
    fn termination_error(&self) -> AppError {
        let state = self.state.borrow();
        if let Some(reason) = lock(&self.fatal).clone() {
            return AppError::Transport(reason);
        }
        AppError::NotConnected(format!("session '{}' is {}", self.name, *state))
    }

    fn writer(&self) -> Result<Arc<FrameWriter>> {
        lock(&self.writer)
            .clone()
            .ok_or_else(|| self.termination_error())
    }

    fn register(&self, method: &str) -> Result<(u64, Completion)> {
        let mut tables = self.tables();
        if self.cancel.is_cancelled() {
            drop(tables);
            return Err(self.termination_error());
        }
        let id = loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 && !tables.pending.contains(id) {
                break id;
            }
        };
        Ok((id, tables.pending.insert(id, method)))
    }

    /// Enter `Closing`. Returns false when another caller already did.
    fn begin_shutdown(&self, cause: &Shutdown) -> bool {
        let started = self.state.send_if_modified(|state| {
            if matches!(*state, SessionState::Closing | SessionState::Closed) {
                return false;
            }
            if let Shutdown::Fatal(reason) = cause {
                *lock(&self.fatal) = Some(reason.clone());
            }
            *state = SessionState::Closing;
            true
        });
        if !started {
            return false;
        }

        self.cancel.cancel();
        let drained = match cause {
            Shutdown::Fatal(reason) => self
                .tables()
                .pending
                .drain(|| AppError::Transport(reason.clone())),
            Shutdown::Close => {
                let msg = format!("session '{}' closed", self.name);
                self.tables()
                    .pending
                    .drain(|| AppError::Cancelled(msg.clone()))
            }
        };
        if drained > 0 {
            debug!(server = %self.name, session_id = %self.id, drained, "resolved pending requests");
        }
        true
    }

    /// Release the transport and stop the provider, then publish `Closed`.
    async fn finish_shutdown(&self, grace: Duration) {
        let writer = lock(&self.writer).take();
        if let Some(writer) = writer {
            if tokio::time::timeout(WRITER_SHUTDOWN_TIMEOUT, writer.shutdown())
                .await
                .is_err()
            {
                debug!(server = %self.name, "provider stdin did not close in time");
            }
        }

        let process = self.process.lock().await.take();
        if let Some(mut process) = process {
            let outcome = process.terminate(grace).await;
            debug!(server = %self.name, session_id = %self.id, ?outcome, "provider stopped");
        }
        *lock(&self.pid) = None;

        self.state.send_replace(SessionState::Closed);
    }

    async fn wait_closed(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so this only returns once `Closed`.
        let _ = rx.wait_for(|s| *s == SessionState::Closed).await;
    }

    /// Terminate after a session-fatal error.
    async fn fail(&self, reason: String) {
        if self.begin_shutdown(&Shutdown::Fatal(reason.clone())) {
            warn!(server = %self.name, session_id = %self.id, %reason, "session terminated");
            self.finish_shutdown(self.config.shutdown_grace).await;
        }
    }

    /// Abort a connect attempt; the provider is killed without a grace period.
    async fn abort_setup(&self, err: &AppError) {
        if self.begin_shutdown(&Shutdown::Fatal(err.to_string())) {
            self.finish_shutdown(Duration::ZERO).await;
        } else {
            self.wait_closed().await;
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Removes a pending entry if the waiting future is dropped early.
struct PendingGuard<'a> {
    inner: &'a SessionInner,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.tables().pending.remove(self.id);
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

/// Handle on one provider connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

/// Non-owning [`Session`] reference, for handlers that must not keep the
/// session alive.
#[derive(Clone)]
pub struct WeakSession {
    inner: Weak<SessionInner>,
}

impl WeakSession {
    /// The session, if any handle to it is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<Session> {
        self.inner.upgrade().map(|inner| Session { inner })
    }
}

impl Session {
    /// Create a `Disconnected` session for the provider `name`.
    #[must_use]
    pub fn new(name: impl Into<String>, config: ServerConfig, client: ClientConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            inner: Arc::new(SessionInner {
                id: Uuid::new_v4().to_string(),
                name: name.into(),
                config,
                client,
                state,
                tables: Mutex::new(Tables::default()),
                handlers: RwLock::new(HandlerTable::default()),
                next_id: AtomicU64::new(1),
                writer: Mutex::new(None),
                process: tokio::sync::Mutex::new(None),
                pid: Mutex::new(None),
                cancel: CancellationToken::new(),
                server_info: Mutex::new(None),
                last_heartbeat: Mutex::new(None),
                fatal: Mutex::new(None),
            }),
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Launch the configured provider and run the handshake.
    ///
    /// # Errors
    ///
    /// - [`AppError::Spawn`] if the executable cannot be started.
    /// - [`AppError::Handshake`] if `initialize` or the catalog fetch fails.
    /// - [`AppError::Cancelled`] if the session is closed while connecting.
    /// - [`AppError::AlreadyConnected`] / [`AppError::NotConnected`] when the
    ///   session is not `Disconnected`.
    pub async fn connect(&self) -> Result<ServerInfo> {
        self.begin_connect()?;
        let inner = &self.inner;
        match Transport::spawn(&inner.name, &inner.config) {
            Ok(transport) => self.establish(transport).await,
            Err(err) => {
                inner.abort_setup(&err).await;
                Err(err)
            }
        }
    }

    /// Run the handshake over an already-open transport, e.g. an in-memory
    /// [`tokio::io::duplex`] pair.
    ///
    /// # Errors
    ///
    /// Same as [`connect`](Self::connect), minus [`AppError::Spawn`].
    pub async fn connect_with_transport(&self, transport: Transport) -> Result<ServerInfo> {
        self.begin_connect()?;
        self.establish(transport).await
    }

    fn begin_connect(&self) -> Result<()> {
        if self
            .inner
            .transition(SessionState::Disconnected, SessionState::Connecting)
        {
            return Ok(());
        }
        match self.state() {
            SessionState::Closing | SessionState::Closed => Err(self.inner.termination_error()),
            state => Err(AppError::AlreadyConnected(format!(
                "session '{}' is {state}",
                self.inner.name
            ))),
        }
    }

    async fn establish(&self, transport: Transport) -> Result<ServerInfo> {
        let inner = &self.inner;
        let span = info_span!("session_connect", server = %inner.name, session_id = %inner.id);
        async move {
            let Transport {
                reader,
                writer,
                process,
            } = transport;
            let writer = Arc::new(FrameWriter::new(inner.name.clone(), writer));
            *lock(&inner.writer) = Some(Arc::clone(&writer));
            *lock(&inner.pid) = process.as_ref().and_then(ChildProcess::id);
            *inner.process.lock().await = process;

            if !inner.transition(SessionState::Connecting, SessionState::Initializing) {
                // Closed while spawning: release whatever was just stored.
                inner.finish_shutdown(Duration::ZERO).await;
                return Err(AppError::Cancelled(format!(
                    "session '{}' closed during connect",
                    inner.name
                )));
            }

            let (queue_tx, queue_rx) = mpsc::channel(DISPATCH_QUEUE_DEPTH);
            dispatch::spawn_dispatcher(
                inner.name.clone(),
                queue_rx,
                Arc::clone(&writer),
                inner.cancel.clone(),
            );
            reader::spawn_reader(
                Arc::downgrade(inner),
                reader,
                queue_tx,
                writer,
                inner.cancel.clone(),
            );

            let info = match self.handshake().await {
                Ok(info) => info,
                Err(err) => {
                    warn!(%err, "handshake failed");
                    inner.abort_setup(&err).await;
                    return Err(err);
                }
            };

            if !inner.transition(SessionState::Initializing, SessionState::Ready) {
                inner.wait_closed().await;
                return Err(inner.termination_error());
            }
            info!(
                provider = %info.name,
                version = %info.version,
                protocol = %info.protocol_version,
                "session ready"
            );
            Ok(info)
        }
        .instrument(span)
        .await
    }

    async fn handshake(&self) -> Result<ServerInfo> {
        let client = &self.inner.client;
        let params = InitializeParams {
            protocol_version: client.protocol_version.clone(),
            capabilities: client.capabilities(),
            client_info: client.implementation(),
        };
        let params = serde_json::to_value(params)?;

        let result = self
            .request(methods::INITIALIZE, Some(params), RequestOptions::default(), Phase::Setup)
            .await
            .map_err(|e| setup_error(methods::INITIALIZE, e))?;
        let info = ServerInfo::from_initialize_result(result)
            .map_err(|e| setup_error(methods::INITIALIZE, e))?;
        *lock(&self.inner.server_info) = Some(info.clone());

        self.send_notification(methods::INITIALIZED, None, Phase::Setup)
            .await
            .map_err(|e| setup_error(methods::INITIALIZED, e))?;

        self.refresh_tools_in(Phase::Setup)
            .await
            .map_err(|e| setup_error(methods::TOOLS_LIST, e))?;
        if info.capabilities.resources.is_some() {
            self.refresh_resources_in(Phase::Setup)
                .await
                .map_err(|e| setup_error(methods::RESOURCES_LIST, e))?;
        }
        if info.capabilities.prompts.is_some() {
            self.refresh_prompts_in(Phase::Setup)
                .await
                .map_err(|e| setup_error(methods::PROMPTS_LIST, e))?;
        }
        Ok(info)
    }

    /// Shut the session down: cancel in-flight requests, close the
    /// provider's stdin, interrupt it, wait up to `shutdown_grace`, then
    /// force-kill.
    ///
    /// Idempotent. Concurrent callers all return once the session is
    /// `Closed`; only the first runs the escalation.
    ///
    /// # Errors
    ///
    /// Never fails; the `Result` keeps the call shape uniform with the rest
    /// of the session API.
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.begin_shutdown(&Shutdown::Close) {
            info!(server = %inner.name, session_id = %inner.id, "closing session");
            inner.finish_shutdown(inner.config.shutdown_grace).await;
            info!(server = %inner.name, session_id = %inner.id, "session closed");
        } else {
            inner.wait_closed().await;
        }
        Ok(())
    }

    // ── Requests ──────────────────────────────────────────────────────────────

    /// Send `method` and wait for its response with the default deadline.
    ///
    /// # Errors
    ///
    /// - [`AppError::NotConnected`] unless the session is `Ready`.
    /// - [`AppError::Transport`] if the session has failed or fails meanwhile.
    /// - [`AppError::Timeout`] if no response arrives in time.
    /// - [`AppError::Cancelled`] if the session is closed meanwhile.
    /// - [`AppError::Remote`] for an error response.
    pub async fn send_request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.send_request_with(method, params, RequestOptions::default())
            .await
    }

    /// [`send_request`](Self::send_request) with per-call options.
    ///
    /// # Errors
    ///
    /// As [`send_request`](Self::send_request); [`AppError::Cancelled`] also
    /// when `options.cancel` fires.
    pub async fn send_request_with(
        &self,
        method: &str,
        params: Option<Value>,
        options: RequestOptions,
    ) -> Result<Value> {
        self.request(method, params, options, Phase::Ready).await
    }

    /// Send a notification.
    ///
    /// # Errors
    ///
    /// [`AppError::NotConnected`] unless `Ready`; [`AppError::Transport`] if
    /// the write fails.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.send_notification(method, params, Phase::Ready).await
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        options: RequestOptions,
        phase: Phase,
    ) -> Result<Value> {
        let inner = &*self.inner;
        self.ensure_state(phase)?;
        let writer = inner.writer()?;
        let timeout = options.timeout.unwrap_or(inner.config.request_timeout);
        let cancel = options.cancel.unwrap_or_default();

        let (id, mut rx) = inner.register(method)?;
        let _guard = PendingGuard { inner, id };
        debug!(server = %inner.name, session_id = %inner.id, request_id = id, method, "sending request");

        // The deadline covers the write too: a provider that stops reading
        // its stdin must not block the caller forever.
        let deadline = Instant::now() + timeout;
        let message = Message::request(id, method, params);
        // Session termination resolves `rx` through the pending-table drain.
        let written = tokio::select! {
            biased;
            outcome = &mut rx => {
                return outcome.unwrap_or_else(|_| Err(inner.termination_error()));
            }
            () = cancel.cancelled() => {
                Err(AppError::Cancelled(format!("{method} (id {id}) cancelled by caller")))
            }
            () = tokio::time::sleep_until(deadline) => {
                Err(AppError::Timeout(format!("{method} (id {id}) could not be written within {timeout:?}")))
            }
            sent = writer.send(&message) => match sent {
                Ok(()) => Ok(()),
                Err(err) => {
                    self.fail_in_background(&err);
                    return Err(err);
                }
            },
        };

        let abort = match written {
            Err(abort) => {
                if writer.is_torn() {
                    warn!(server = %inner.name, request_id = id, method, "request abandoned mid-write");
                    self.fail_in_background(&AppError::Transport(format!(
                        "{method} (id {id}) abandoned mid-write: {abort}"
                    )));
                }
                abort
            }
            Ok(()) => tokio::select! {
                biased;
                outcome = &mut rx => {
                    return outcome.unwrap_or_else(|_| Err(inner.termination_error()));
                }
                () = cancel.cancelled() => {
                    AppError::Cancelled(format!("{method} (id {id}) cancelled by caller"))
                }
                () = tokio::time::sleep_until(deadline) => {
                    AppError::Timeout(format!("{method} (id {id}) got no response within {timeout:?}"))
                }
            },
        };

        // A response that won the race against the deadline still counts.
        if !inner.tables().pending.remove(id) {
            if let Ok(outcome) = rx.try_recv() {
                return outcome;
            }
        }

        debug!(server = %inner.name, request_id = id, method, %abort, "request abandoned");
        if inner.state() == SessionState::Ready && !writer.is_torn() {
            let notice = Message::notification(
                methods::CANCELLED,
                Some(json!({ "requestId": id, "reason": abort.to_string() })),
            );
            tokio::spawn(async move {
                // Best effort; the provider may already be gone.
                let _ = writer.send(&notice).await;
            });
        }
        Err(abort)
    }

    async fn send_notification(
        &self,
        method: &str,
        params: Option<Value>,
        phase: Phase,
    ) -> Result<()> {
        self.ensure_state(phase)?;
        let writer = self.inner.writer()?;
        writer
            .send(&Message::notification(method, params))
            .await
            .inspect_err(|err| self.fail_in_background(err))
    }

    fn ensure_state(&self, phase: Phase) -> Result<()> {
        let state = self.state();
        let allowed = match phase {
            Phase::Setup => matches!(state, SessionState::Initializing | SessionState::Ready),
            Phase::Ready => state == SessionState::Ready,
        };
        if allowed {
            Ok(())
        } else {
            Err(self.inner.termination_error())
        }
    }

    /// A failed write means the stream is gone; tear the session down
    /// without making the caller wait for the escalation.
    fn fail_in_background(&self, err: &AppError) {
        if !err.is_session_fatal() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let reason = match err {
            AppError::Transport(msg) => msg.clone(),
            other => other.to_string(),
        };
        tokio::spawn(async move { inner.fail(reason).await });
    }

    // ── Catalog ───────────────────────────────────────────────────────────────

    /// Last known tool snapshot.
    #[must_use]
    pub fn list_tools(&self) -> Arc<Vec<Tool>> {
        Arc::clone(&self.inner.tables().catalog.tools)
    }

    /// Last known resource snapshot.
    #[must_use]
    pub fn list_resources(&self) -> Arc<Vec<Resource>> {
        Arc::clone(&self.inner.tables().catalog.resources)
    }

    /// Last known prompt snapshot.
    #[must_use]
    pub fn list_prompts(&self) -> Arc<Vec<Prompt>> {
        Arc::clone(&self.inner.tables().catalog.prompts)
    }

    /// The whole catalog snapshot.
    #[must_use]
    pub fn catalog(&self) -> Catalog {
        self.inner.tables().catalog.clone()
    }

    /// Re-fetch `tools/list` and replace the tool snapshot.
    ///
    /// # Errors
    ///
    /// Any [`send_request`](Self::send_request) error, or
    /// [`AppError::Protocol`] for an unexpected result shape. The previous
    /// snapshot is kept on failure.
    pub async fn refresh_tools(&self) -> Result<Arc<Vec<Tool>>> {
        self.refresh_tools_in(Phase::Ready).await
    }

    /// Re-fetch `resources/list` and replace the resource snapshot.
    ///
    /// # Errors
    ///
    /// As [`refresh_tools`](Self::refresh_tools).
    pub async fn refresh_resources(&self) -> Result<Arc<Vec<Resource>>> {
        self.refresh_resources_in(Phase::Ready).await
    }

    /// Re-fetch `prompts/list` and replace the prompt snapshot.
    ///
    /// # Errors
    ///
    /// As [`refresh_tools`](Self::refresh_tools).
    pub async fn refresh_prompts(&self) -> Result<Arc<Vec<Prompt>>> {
        self.refresh_prompts_in(Phase::Ready).await
    }

    async fn refresh_tools_in(&self, phase: Phase) -> Result<Arc<Vec<Tool>>> {
        let tools: Vec<Tool> = self.fetch_all(methods::TOOLS_LIST, phase).await?;
        let tools = Arc::new(dedupe_by_key(tools, |t| t.name.as_str()));
        self.inner.tables().catalog.tools = Arc::clone(&tools);
        debug!(server = %self.inner.name, count = tools.len(), "tool snapshot replaced");
        Ok(tools)
    }

    async fn refresh_resources_in(&self, phase: Phase) -> Result<Arc<Vec<Resource>>> {
        let resources: Vec<Resource> = self.fetch_all(methods::RESOURCES_LIST, phase).await?;
        let resources = Arc::new(dedupe_by_key(resources, |r| r.uri.as_str()));
        self.inner.tables().catalog.resources = Arc::clone(&resources);
        debug!(server = %self.inner.name, count = resources.len(), "resource snapshot replaced");
        Ok(resources)
    }

    async fn refresh_prompts_in(&self, phase: Phase) -> Result<Arc<Vec<Prompt>>> {
        let prompts: Vec<Prompt> = self.fetch_all(methods::PROMPTS_LIST, phase).await?;
        let prompts = Arc::new(dedupe_by_key(prompts, |p| p.name.as_str()));
        self.inner.tables().catalog.prompts = Arc::clone(&prompts);
        debug!(server = %self.inner.name, count = prompts.len(), "prompt snapshot replaced");
        Ok(prompts)
    }

    async fn fetch_all<T: DeserializeOwned>(&self, method: &str, phase: Phase) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let value = self
                .request(method, params, RequestOptions::default(), phase)
                .await?;
            let page: Page<T> = decode_result(method, value)?;
            items.extend(page.items);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(items),
            }
        }
        Err(AppError::Protocol(format!(
            "{method} still paginating after {MAX_PAGES} pages"
        )))
    }

    // ── RPC wrappers ──────────────────────────────────────────────────────────

    /// Invoke a tool from the current snapshot.
    ///
    /// # Errors
    ///
    /// - [`AppError::ToolNotFound`] if `name` is not in the last snapshot;
    ///   nothing is written to the provider in that case.
    /// - Any [`send_request`](Self::send_request) error.
    /// - [`AppError::Protocol`] if the result is not a tool result.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolResult> {
        self.call_tool_with(name, arguments, RequestOptions::default())
            .await
    }

    /// [`call_tool`](Self::call_tool) with per-call options.
    ///
    /// # Errors
    ///
    /// As [`call_tool`](Self::call_tool).
    pub async fn call_tool_with(
        &self,
        name: &str,
        arguments: Value,
        options: RequestOptions,
    ) -> Result<ToolResult> {
        self.ensure_state(Phase::Ready)?;
        let known = self.inner.tables().catalog.tool(name).is_some();
        if !known {
            return Err(AppError::ToolNotFound(format!(
                "'{name}' is not advertised by '{}'",
                self.inner.name
            )));
        }
        let params = serde_json::to_value(CallToolParams { name, arguments })?;
        let value = self
            .request(methods::TOOLS_CALL, Some(params), options, Phase::Ready)
            .await?;
        decode_result(methods::TOOLS_CALL, value)
    }

    /// Read a resource by URI.
    ///
    /// The URI is not checked against the snapshot, since providers may
    /// serve templated URIs they never list.
    ///
    /// # Errors
    ///
    /// - [`AppError::ResourceEmpty`] when the provider returns no contents.
    /// - Any [`send_request`](Self::send_request) error.
    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult> {
        let value = self
            .send_request(methods::RESOURCES_READ, Some(json!({ "uri": uri })))
            .await?;
        let result: ReadResourceResult = decode_result(methods::RESOURCES_READ, value)?;
        if result.contents.is_empty() {
            return Err(AppError::ResourceEmpty(format!(
                "'{uri}' returned no contents"
            )));
        }
        Ok(result)
    }

    /// Expand a prompt from the current snapshot.
    ///
    /// # Errors
    ///
    /// [`AppError::PromptNotFound`] if `name` is not in the last snapshot,
    /// otherwise any [`send_request`](Self::send_request) error.
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: &HashMap<String, String>,
    ) -> Result<PromptResult> {
        self.ensure_state(Phase::Ready)?;
        let known = self.inner.tables().catalog.prompt(name).is_some();
        if !known {
            return Err(AppError::PromptNotFound(format!(
                "'{name}' is not advertised by '{}'",
                self.inner.name
            )));
        }
        let params = serde_json::to_value(GetPromptParams { name, arguments })?;
        let value = self.send_request(methods::PROMPTS_GET, Some(params)).await?;
        decode_result(methods::PROMPTS_GET, value)
    }

    /// Liveness probe with the default deadline.
    ///
    /// # Errors
    ///
    /// Any [`send_request`](Self::send_request) error.
    pub async fn ping(&self) -> Result<()> {
        self.ping_with(RequestOptions::default()).await
    }

    /// Liveness probe with per-call options.
    ///
    /// # Errors
    ///
    /// Any [`send_request`](Self::send_request) error.
    pub async fn ping_with(&self, options: RequestOptions) -> Result<()> {
        self.request(methods::PING, Some(json!({})), options, Phase::Ready)
            .await
            .map(|_| ())
    }

    // ── Handlers ──────────────────────────────────────────────────────────────

    /// Register the handler for a notification method, replacing any
    /// previous one. Handlers run one at a time in wire order.
    pub fn on_notification<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: dispatch::NotificationFn =
            Arc::new(move |params| -> HandlerFuture<()> { Box::pin(handler(params)) });
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .set_notification(method.into(), handler);
    }

    /// Register the handler for a server-initiated request method. Its
    /// result, or error object, is written back under the request's id.
    pub fn on_request<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, RpcError>> + Send + 'static,
    {
        let handler: dispatch::RequestFn = Arc::new(
            move |params| -> HandlerFuture<std::result::Result<Value, RpcError>> {
                Box::pin(handler(params))
            },
        );
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .set_request(method.into(), handler);
    }

    // ── Observability ─────────────────────────────────────────────────────────

    /// Per-instance id used in log fields.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Registration name of the provider.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// Watch lifecycle transitions.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// True only while `Ready`.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// Server identity and capabilities from the handshake.
    #[must_use]
    pub fn server_info(&self) -> Option<ServerInfo> {
        lock(&self.inner.server_info).clone()
    }

    /// Arrival time of the most recent inbound frame.
    #[must_use]
    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        *lock(&self.inner.last_heartbeat)
    }

    /// OS process id of the provider while it runs.
    #[must_use]
    pub fn process_id(&self) -> Option<u32> {
        *lock(&self.inner.pid)
    }

    /// Number of requests awaiting a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.tables().pending.len()
    }

    /// Reason the session terminated, if it failed rather than being closed.
    #[must_use]
    pub fn fatal_reason(&self) -> Option<String> {
        lock(&self.inner.fatal).clone()
    }

    /// Non-owning handle.
    #[must_use]
    pub fn downgrade(&self) -> WeakSession {
        WeakSession {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Whether both handles drive the same connection.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.inner.name)
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn setup_error(method: &str, err: AppError) -> AppError {
    match err {
        AppError::Cancelled(_) | AppError::Handshake(_) => err,
        other => AppError::Handshake(format!("{method} failed: {other}")),
    }
}
