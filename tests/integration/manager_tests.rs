//! `SessionManager`: registry rules, routing, health and lifecycle events.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::broadcast;

use provider_session::config::{ClientConfig, ServerConfig};
use provider_session::manager::{ManagerEvent, SessionManager};
use provider_session::protocol::methods;
use provider_session::session::SessionState;
use provider_session::AppError;

use super::test_helpers::{echo_provider, eventually, stub_config, stub_pair, tool, StubPeer, RECV_TIMEOUT};

/// Register `name` over an in-memory stub advertising `tools`.
async fn connect_stub(manager: &SessionManager, name: &str, tools: Value) -> StubPeer {
    let (transport, mut peer) = stub_pair();
    let (connected, ()) = tokio::join!(
        manager.connect_server_with_transport(name, stub_config(), transport),
        peer.handshake(tools),
    );
    connected.expect("stub must connect");
    peer
}

async fn next_event(events: &mut broadcast::Receiver<ManagerEvent>) -> ManagerEvent {
    tokio::time::timeout(RECV_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for a manager event")
        .expect("event channel open")
}

fn short_health_client() -> ClientConfig {
    ClientConfig {
        health_check_timeout: Duration::from_millis(300),
        ..ClientConfig::default()
    }
}

// ── Registry ─────────────────────────────────────────────────

#[tokio::test]
async fn duplicate_connect_is_rejected_until_disconnected() {
    let manager = SessionManager::new(ClientConfig::default());
    let _peer = connect_stub(&manager, "files", json!([tool("read")])).await;

    let (transport, _unused) = stub_pair();
    let err = manager
        .connect_server_with_transport("files", stub_config(), transport)
        .await
        .expect_err("name is taken");
    assert!(matches!(err, AppError::AlreadyConnected(_)), "got {err}");
    assert_eq!(manager.get_connected_servers().await, ["files"]);

    manager.disconnect_server("files").await.expect("disconnect");
    assert!(manager.session("files").await.is_none());

    let _peer = connect_stub(&manager, "files", json!([tool("read")])).await;
    assert_eq!(manager.get_connected_servers().await, ["files"]);
}

/// A connect still in its handshake holds the name against a second one.
#[tokio::test]
async fn connect_in_progress_rejects_a_second_connect() {
    let manager = SessionManager::new(ClientConfig::default());
    let (transport, mut peer) = stub_pair();
    let (second_transport, _second_peer) = stub_pair();

    let (first, (), second) = tokio::join!(
        manager.connect_server_with_transport("files", stub_config(), transport),
        peer.handshake(json!([tool("read")])),
        async {
            tokio::task::yield_now().await;
            manager
                .connect_server_with_transport("files", stub_config(), second_transport)
                .await
        },
    );
    first.expect("first connect completes");
    let err = second.expect_err("name is taken while connecting");
    assert!(matches!(err, AppError::AlreadyConnected(_)), "got {err}");
}

#[tokio::test]
async fn disconnect_unknown_server_is_an_error() {
    let manager = SessionManager::new(ClientConfig::default());
    let err = manager
        .disconnect_server("nobody")
        .await
        .expect_err("nothing registered");
    assert!(matches!(err, AppError::ServerNotConnected(_)), "got {err}");
}

/// A failed connect leaves no registration behind.
#[tokio::test]
async fn failed_connect_is_not_registered() {
    let manager = SessionManager::new(ClientConfig::default());
    let err = manager
        .connect_server("ghost", ServerConfig::new("/nonexistent/provider-session-ghost"))
        .await
        .expect_err("spawn must fail");
    assert!(matches!(err, AppError::Spawn(_)), "got {err}");
    assert!(manager.session("ghost").await.is_none());
    assert!(manager.get_connected_servers().await.is_empty());
}

#[tokio::test]
async fn connect_all_reports_each_server() {
    let manager = SessionManager::new(ClientConfig::default());
    let servers = BTreeMap::from([
        ("echo".to_owned(), echo_provider(&[])),
        (
            "ghost".to_owned(),
            ServerConfig::new("/nonexistent/provider-session-ghost"),
        ),
    ]);

    let outcomes = manager.connect_all(&servers).await;
    assert_eq!(outcomes.len(), 2);
    assert_eq!(
        outcomes["echo"].as_ref().expect("echo connects").name,
        "echo-provider"
    );
    assert!(matches!(outcomes["ghost"], Err(AppError::Spawn(_))));
    assert_eq!(manager.get_connected_servers().await, ["echo"]);

    manager.disconnect_all().await;
}

// ── Aggregation and routing ──────────────────────────────────

#[tokio::test]
async fn aggregated_tools_are_sorted_by_server_then_name() {
    let manager = SessionManager::new(ClientConfig::default());
    let _b = connect_stub(&manager, "beta", json!([tool("zeta"), tool("alpha")])).await;
    let _a = connect_stub(&manager, "alpha", json!([tool("write"), tool("read")])).await;

    let listed: Vec<(String, String)> = manager
        .get_all_tools()
        .await
        .into_iter()
        .map(|t| (t.server, t.tool.name))
        .collect();
    let expected = [
        ("alpha", "read"),
        ("alpha", "write"),
        ("beta", "alpha"),
        ("beta", "zeta"),
    ]
    .map(|(s, t)| (s.to_owned(), t.to_owned()));
    assert_eq!(listed, expected);
    assert_eq!(manager.get_connected_servers().await, ["alpha", "beta"]);
}

#[tokio::test]
async fn calls_route_to_the_named_server() {
    let manager = SessionManager::new(ClientConfig::default());
    let mut peer = connect_stub(&manager, "files", json!([tool("read")])).await;

    let call = tokio::spawn(async move {
        let outcome = manager.call_tool("files", "read", json!({ "path": "a" })).await;
        (manager, outcome)
    });
    let (id, params) = peer.expect_request(methods::TOOLS_CALL).await;
    assert_eq!(params["name"], "read");
    peer.reply(id, json!({ "content": [{ "type": "text", "text": "contents" }] }))
        .await;

    let (manager, outcome) = call.await.expect("call task");
    assert_eq!(outcome.expect("routed call").text(), "contents");

    let err = manager
        .call_tool("nobody", "read", json!({}))
        .await
        .expect_err("unknown server");
    assert!(matches!(err, AppError::ServerNotConnected(_)), "got {err}");
    let err = manager
        .read_resource("nobody", "memo://x")
        .await
        .expect_err("unknown server");
    assert!(matches!(err, AppError::ServerNotConnected(_)), "got {err}");
}

// ── Failure handling ─────────────────────────────────────────

/// A provider dying on its own produces `ServerDown`; the dead entry stays
/// registered but unroutable until a reconnect replaces it.
#[tokio::test]
async fn dead_server_is_reported_and_replaceable() {
    let manager = SessionManager::new(ClientConfig::default());
    let mut events = manager.subscribe();
    let peer = connect_stub(&manager, "files", json!([tool("read")])).await;
    assert!(matches!(
        next_event(&mut events).await,
        ManagerEvent::Connected { server, .. } if server == "files"
    ));

    drop(peer);
    match next_event(&mut events).await {
        ManagerEvent::ServerDown { server, reason } => {
            assert_eq!(server, "files");
            assert!(!reason.is_empty());
        }
        other => panic!("expected ServerDown, got {other:?}"),
    }

    let stale = manager.session("files").await.expect("still registered");
    assert_eq!(stale.state(), SessionState::Closed);
    assert!(manager.get_connected_servers().await.is_empty());
    let err = manager
        .call_tool("files", "read", json!({}))
        .await
        .expect_err("dead server");
    assert!(matches!(err, AppError::ServerNotConnected(_)), "got {err}");

    let _peer = connect_stub(&manager, "files", json!([tool("read")])).await;
    let fresh = manager.session("files").await.expect("re-registered");
    assert!(!fresh.ptr_eq(&stale));
    assert!(fresh.is_connected());
}

/// `tools/list_changed` triggers a refresh; the manager sees the new list.
#[tokio::test]
async fn list_changed_refreshes_the_tool_catalog() {
    let manager = SessionManager::new(ClientConfig::default());
    let mut peer = connect_stub(&manager, "files", json!([tool("read")])).await;

    peer.notify(methods::TOOLS_LIST_CHANGED, None).await;
    let (id, _) = peer.expect_request(methods::TOOLS_LIST).await;
    peer.reply(id, json!({ "tools": [tool("read"), tool("write")] }))
        .await;

    let session = manager.session("files").await.expect("registered");
    let refreshed = eventually(Duration::from_secs(2), || {
        session.catalog().tool("write").is_some()
    })
    .await;
    assert!(refreshed, "tool snapshot was not refreshed");
    assert_eq!(manager.get_all_tools().await.len(), 2);
}

/// Resource and prompt announcements refresh their own snapshots.
#[tokio::test]
async fn list_changed_refreshes_resources_and_prompts() {
    let manager = SessionManager::new(ClientConfig::default());
    let mut peer = connect_stub(&manager, "files", json!([tool("read")])).await;

    peer.notify(methods::RESOURCES_LIST_CHANGED, None).await;
    let (id, _) = peer.expect_request(methods::RESOURCES_LIST).await;
    peer.reply(id, json!({ "resources": [{ "uri": "file:///notes.md", "name": "notes" }] }))
        .await;

    peer.notify(methods::PROMPTS_LIST_CHANGED, None).await;
    let (id, _) = peer.expect_request(methods::PROMPTS_LIST).await;
    peer.reply(id, json!({ "prompts": [{ "name": "summarise" }] }))
        .await;

    let session = manager.session("files").await.expect("registered");
    let refreshed = eventually(Duration::from_secs(2), || {
        let catalog = session.catalog();
        catalog.resource("file:///notes.md").is_some() && catalog.prompt("summarise").is_some()
    })
    .await;
    assert!(refreshed, "resource and prompt snapshots were not refreshed");
    assert_eq!(manager.get_all_resources().await.len(), 1);
}

// ── Health ───────────────────────────────────────────────────

/// One hung provider does not stretch the health check beyond roughly one
/// deadline, and does not mark its healthy neighbour unhealthy.
#[tokio::test]
async fn health_check_is_bounded_by_one_deadline() {
    let manager = SessionManager::new(short_health_client());
    manager
        .connect_server("fast", echo_provider(&[]))
        .await
        .expect("fast connects");
    manager
        .connect_server("hung", echo_provider(&["--hang-on-ping"]))
        .await
        .expect("hung connects");

    let started = Instant::now();
    let health = manager.health_check().await;
    let elapsed = started.elapsed();

    assert_eq!(health.get("fast"), Some(&true));
    assert_eq!(health.get("hung"), Some(&false));
    assert!(elapsed < Duration::from_millis(900), "health check took {elapsed:?}");

    manager.disconnect_all().await;
}

#[tokio::test]
async fn closed_session_reports_unhealthy() {
    let manager = SessionManager::new(short_health_client());
    let peer = connect_stub(&manager, "files", json!([])).await;
    let session = manager.session("files").await.expect("registered");
    drop(peer);
    let closed = eventually(Duration::from_secs(2), || {
        session.state() == SessionState::Closed
    })
    .await;
    assert!(closed);

    let health = manager.health_check().await;
    assert_eq!(health.get("files"), Some(&false));
}

// ── Disconnect all ───────────────────────────────────────────

#[tokio::test]
async fn disconnect_all_closes_every_session() {
    let manager = SessionManager::new(ClientConfig::default());
    let mut events = manager.subscribe();
    let _a = connect_stub(&manager, "a", json!([])).await;
    let _b = connect_stub(&manager, "b", json!([])).await;
    let a = manager.session("a").await.expect("a");
    let b = manager.session("b").await.expect("b");
    next_event(&mut events).await;
    next_event(&mut events).await;

    manager.disconnect_all().await;

    assert_eq!(a.state(), SessionState::Closed);
    assert_eq!(b.state(), SessionState::Closed);
    assert!(manager.session("a").await.is_none());
    assert!(manager.session("b").await.is_none());

    let mut disconnected = Vec::new();
    for _ in 0..2 {
        match next_event(&mut events).await {
            ManagerEvent::Disconnected { server } => disconnected.push(server),
            other => panic!("expected Disconnected, got {other:?}"),
        }
    }
    disconnected.sort();
    assert_eq!(disconnected, ["a", "b"]);
}
