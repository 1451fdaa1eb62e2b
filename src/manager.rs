//! Named registry of provider sessions.
//!
//! The registry lock only guards the name → [`Session`] map. Every
//! operation clones the sessions it needs and releases the lock before
//! awaiting anything, so one slow provider never blocks registry-wide calls.
//!
//! Lifecycle changes are broadcast as [`ManagerEvent`]s. A session that dies
//! on its own stays registered (and reports unhealthy) until it is replaced
//! by [`SessionManager::connect_server`] or removed by
//! [`SessionManager::disconnect_server`]; there is no automatic reconnect.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, GlobalConfig, ServerConfig};
use crate::protocol::methods;
use crate::protocol::model::{ReadResourceResult, Resource, ServerInfo, Tool, ToolResult};
use crate::session::{RequestOptions, Session, SessionState};
use crate::transport::Transport;
use crate::{AppError, Result};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle events broadcast by the manager.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    /// A session reached `Ready`.
    Connected {
        /// Registration name.
        server: String,
        /// Negotiated server identity.
        info: ServerInfo,
    },
    /// A session was closed and removed on request.
    Disconnected {
        /// Registration name.
        server: String,
    },
    /// A registered session terminated without being asked to.
    ServerDown {
        /// Registration name.
        server: String,
        /// Fatal error that ended the session.
        reason: String,
    },
}

/// A tool together with the server that advertises it.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerTool {
    /// Registration name of the providing server.
    pub server: String,
    /// The tool.
    pub tool: Tool,
}

/// A resource together with the server that advertises it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerResource {
    /// Registration name of the providing server.
    pub server: String,
    /// The resource.
    pub resource: Resource,
}

/// Supervises many sessions by name.
pub struct SessionManager {
    client: ClientConfig,
    sessions: RwLock<HashMap<String, Session>>,
    events: broadcast::Sender<ManagerEvent>,
}

impl SessionManager {
    /// Create an empty manager presenting `client` to every provider.
    #[must_use]
    pub fn new(client: ClientConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            client,
            sessions: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Create an empty manager from the `[client]` section of `config`.
    #[must_use]
    pub fn from_config(config: &GlobalConfig) -> Self {
        Self::new(config.client.clone())
    }

    /// Receive lifecycle events from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    // ── Connect / disconnect ──────────────────────────────────────────────────

    /// Launch and connect the provider `name`, replacing a stale entry.
    ///
    /// # Errors
    ///
    /// - [`AppError::AlreadyConnected`] while the session under `name` is
    ///   `Ready`, and also while an earlier connect of `name` is still in
    ///   progress. Only `Closing`/`Closed` entries are replaced.
    /// - Any [`Session::connect`] error; the failed session is not kept.
    pub async fn connect_server(&self, name: &str, config: ServerConfig) -> Result<ServerInfo> {
        self.connect_inner(name, config, None).await
    }

    /// [`connect_server`](Self::connect_server) over an already-open
    /// transport instead of a spawned process.
    ///
    /// # Errors
    ///
    /// As [`connect_server`](Self::connect_server).
    pub async fn connect_server_with_transport(
        &self,
        name: &str,
        config: ServerConfig,
        transport: Transport,
    ) -> Result<ServerInfo> {
        self.connect_inner(name, config, Some(transport)).await
    }

    /// Connect every configured server concurrently.
    ///
    /// Failures are logged and reported per server; they do not stop the
    /// other connections.
    pub async fn connect_all(
        &self,
        servers: &BTreeMap<String, ServerConfig>,
    ) -> BTreeMap<String, Result<ServerInfo>> {
        let attempts = servers.iter().map(|(name, config)| async move {
            let outcome = self.connect_server(name, config.clone()).await;
            if let Err(err) = &outcome {
                warn!(server = %name, %err, "failed to connect server");
            }
            (name.clone(), outcome)
        });
        join_all(attempts).await.into_iter().collect()
    }

    async fn connect_inner(
        &self,
        name: &str,
        config: ServerConfig,
        transport: Option<Transport>,
    ) -> Result<ServerInfo> {
        let session = Session::new(name, config, self.client.clone());

        let stale = {
            let mut sessions = self.sessions.write().await;
            if let Some(existing) = sessions.get(name) {
                let state = existing.state();
                if !matches!(state, SessionState::Closing | SessionState::Closed) {
                    return Err(AppError::AlreadyConnected(format!(
                        "server '{name}' is {state}"
                    )));
                }
            }
            sessions.insert(name.to_owned(), session.clone())
        };
        if let Some(stale) = stale {
            debug!(server = name, session_id = stale.id(), "replacing stale session");
            stale.close().await?;
        }

        refresh_catalog_on_change(&session);
        let connected = match transport {
            Some(transport) => session.connect_with_transport(transport).await,
            None => session.connect().await,
        };

        match connected {
            Ok(info) => {
                self.watch_for_failure(&session);
                info!(server = name, session_id = session.id(), provider = %info.name, "server connected");
                let _ = self.events.send(ManagerEvent::Connected {
                    server: name.to_owned(),
                    info: info.clone(),
                });
                Ok(info)
            }
            Err(err) => {
                let mut sessions = self.sessions.write().await;
                if sessions.get(name).is_some_and(|s| s.ptr_eq(&session)) {
                    sessions.remove(name);
                }
                Err(err)
            }
        }
    }

    /// Emit [`ManagerEvent::ServerDown`] if `session` ends with a fatal error.
    fn watch_for_failure(&self, session: &Session) {
        let mut state = session.subscribe_state();
        let weak = session.downgrade();
        let events = self.events.clone();
        let server = session.name().to_owned();
        tokio::spawn(async move {
            if state
                .wait_for(|s| *s == SessionState::Closed)
                .await
                .is_err()
            {
                return;
            }
            let Some(reason) = weak.upgrade().and_then(|s| s.fatal_reason()) else {
                return;
            };
            warn!(server = %server, %reason, "server down");
            let _ = events.send(ManagerEvent::ServerDown { server, reason });
        });
    }

    /// Close the session registered as `name` and forget it.
    ///
    /// # Errors
    ///
    /// [`AppError::ServerNotConnected`] if nothing is registered under `name`.
    pub async fn disconnect_server(&self, name: &str) -> Result<()> {
        let session = self
            .sessions
            .write()
            .await
            .remove(name)
            .ok_or_else(|| AppError::ServerNotConnected(format!("server '{name}' is not registered")))?;
        session.close().await?;
        info!(server = name, "server disconnected");
        let _ = self.events.send(ManagerEvent::Disconnected {
            server: name.to_owned(),
        });
        Ok(())
    }

    /// Close and forget every session, concurrently.
    pub async fn disconnect_all(&self) {
        let sessions: Vec<(String, Session)> = self.sessions.write().await.drain().collect();
        let closes = sessions.into_iter().map(|(name, session)| async move {
            if let Err(err) = session.close().await {
                warn!(server = %name, %err, "error while closing session");
            }
            let _ = self.events.send(ManagerEvent::Disconnected { server: name });
        });
        join_all(closes).await;
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    /// Names of the `Ready` sessions, sorted.
    pub async fn get_connected_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .sessions
            .read()
            .await
            .iter()
            .filter(|(_, s)| s.is_connected())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// The registered session under `name`, in whatever state it is.
    pub async fn session(&self, name: &str) -> Option<Session> {
        self.sessions.read().await.get(name).cloned()
    }

    /// Tools of every `Ready` session, sorted by server then tool name.
    pub async fn get_all_tools(&self) -> Vec<ServerTool> {
        let mut tools: Vec<ServerTool> = self
            .ready_sessions()
            .await
            .into_iter()
            .flat_map(|(server, session)| {
                session
                    .list_tools()
                    .iter()
                    .map(|tool| ServerTool {
                        server: server.clone(),
                        tool: tool.clone(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        tools.sort_by(|a, b| (&a.server, &a.tool.name).cmp(&(&b.server, &b.tool.name)));
        tools
    }

    /// Resources of every `Ready` session, sorted by server then URI.
    pub async fn get_all_resources(&self) -> Vec<ServerResource> {
        let mut resources: Vec<ServerResource> = self
            .ready_sessions()
            .await
            .into_iter()
            .flat_map(|(server, session)| {
                session
                    .list_resources()
                    .iter()
                    .map(|resource| ServerResource {
                        server: server.clone(),
                        resource: resource.clone(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        resources.sort_by(|a, b| (&a.server, &a.resource.uri).cmp(&(&b.server, &b.resource.uri)));
        resources
    }

    // ── Routing ───────────────────────────────────────────────────────────────

    /// Call `tool` on the server registered as `server`.
    ///
    /// # Errors
    ///
    /// [`AppError::ServerNotConnected`] if `server` is absent or not `Ready`,
    /// otherwise any [`Session::call_tool`] error.
    pub async fn call_tool(&self, server: &str, tool: &str, arguments: Value) -> Result<ToolResult> {
        self.ready_session(server)
            .await?
            .call_tool(tool, arguments)
            .await
    }

    /// Read `uri` from the server registered as `server`.
    ///
    /// # Errors
    ///
    /// [`AppError::ServerNotConnected`] if `server` is absent or not `Ready`,
    /// otherwise any [`Session::read_resource`] error.
    pub async fn read_resource(&self, server: &str, uri: &str) -> Result<ReadResourceResult> {
        self.ready_session(server).await?.read_resource(uri).await
    }

    /// Ping every registered session concurrently.
    ///
    /// A session is healthy when it is `Ready` and answers within
    /// `client.health_check_timeout`. The whole check is bounded by that
    /// timeout, not by the number of sessions.
    pub async fn health_check(&self) -> HashMap<String, bool> {
        let deadline = self.client.health_check_timeout;
        let sessions: Vec<(String, Session)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(name, s)| (name.clone(), s.clone()))
            .collect();

        let checks = sessions.into_iter().map(|(name, session)| async move {
            let healthy = session.is_connected()
                && tokio::time::timeout(
                    deadline,
                    session.ping_with(RequestOptions::default().with_timeout(deadline)),
                )
                .await
                .is_ok_and(|pinged| pinged.is_ok());
            if !healthy {
                debug!(server = %name, state = %session.state(), "health check failed");
            }
            (name, healthy)
        });
        join_all(checks).await.into_iter().collect()
    }

    async fn ready_session(&self, name: &str) -> Result<Session> {
        let sessions = self.sessions.read().await;
        match sessions.get(name) {
            Some(session) if session.is_connected() => Ok(session.clone()),
            Some(session) => Err(AppError::ServerNotConnected(format!(
                "server '{name}' is {}",
                session.state()
            ))),
            None => Err(AppError::ServerNotConnected(format!(
                "server '{name}' is not registered"
            ))),
        }
    }

    async fn ready_sessions(&self) -> Vec<(String, Session)> {
        self.sessions
            .read()
            .await
            .iter()
            .filter(|(_, s)| s.is_connected())
            .map(|(name, s)| (name.clone(), s.clone()))
            .collect()
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("client", &self.client.name)
            .finish_non_exhaustive()
    }
}

/// Keep the catalog snapshots current when the provider announces a change.
fn refresh_catalog_on_change(session: &Session) {
    on_list_changed(session, methods::TOOLS_LIST_CHANGED, |session| async move {
        session.refresh_tools().await.map(|tools| tools.len())
    });
    on_list_changed(session, methods::RESOURCES_LIST_CHANGED, |session| async move {
        session.refresh_resources().await.map(|resources| resources.len())
    });
    on_list_changed(session, methods::PROMPTS_LIST_CHANGED, |session| async move {
        session.refresh_prompts().await.map(|prompts| prompts.len())
    });
}

fn on_list_changed<F, Fut>(session: &Session, method: &'static str, refresh: F)
where
    F: Fn(Session) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<usize>> + Send + 'static,
{
    let weak = session.downgrade();
    let refresh = Arc::new(refresh);
    session.on_notification(method, move |_| {
        let weak = weak.clone();
        let refresh = Arc::clone(&refresh);
        async move {
            let Some(session) = weak.upgrade() else {
                return;
            };
            let server = session.name().to_owned();
            match refresh(session).await {
                Ok(count) => debug!(server = %server, method, count, "catalog refreshed"),
                Err(err) => warn!(server = %server, method, %err, "catalog refresh failed"),
            }
        }
    });
}
