//! Session lifecycle: handshake, termination paths and state reporting.

use std::time::Duration;

use futures_util::future::join_all;
use serde_json::json;

use provider_session::config::ClientConfig;
use provider_session::protocol::message::RpcError;
use provider_session::protocol::methods;
use provider_session::protocol::model::DEFAULT_PROTOCOL_VERSION;
use provider_session::session::{Session, SessionState};
use provider_session::AppError;

use super::test_helpers::{
    connected_session, eventually, initialize_result, stub_config, stub_pair, tool,
};

fn fresh_session() -> Session {
    Session::new("stub", stub_config(), ClientConfig::default())
}

// ── Before connect ───────────────────────────────────────────

#[tokio::test]
async fn requests_before_connect_are_rejected() {
    let session = fresh_session();
    assert_eq!(session.state(), SessionState::Disconnected);

    let err = session
        .send_request("test/early", None)
        .await
        .expect_err("must be rejected");
    assert!(matches!(err, AppError::NotConnected(_)), "got {err}");

    let err = session.call_tool("echo", json!({})).await.expect_err("rejected");
    assert!(matches!(err, AppError::NotConnected(_)), "got {err}");
    assert!(session.server_info().is_none());
    assert!(session.last_heartbeat().is_none());
}

#[tokio::test]
async fn close_before_connect_ends_closed() {
    let session = fresh_session();
    session.close().await.expect("close");
    assert_eq!(session.state(), SessionState::Closed);
    assert!(session.fatal_reason().is_none());
}

// ── Handshake ────────────────────────────────────────────────

/// The handshake is `initialize`, then the `initialized` notice, then the
/// catalog lists the provider advertised, in that order.
#[tokio::test]
async fn handshake_fetches_advertised_catalogs_in_order() {
    let (transport, mut peer) = stub_pair();
    let session = fresh_session();
    let connecting = tokio::spawn({
        let session = session.clone();
        async move { session.connect_with_transport(transport).await }
    });

    let (id, params) = peer.expect_request(methods::INITIALIZE).await;
    assert_eq!(params["protocolVersion"], DEFAULT_PROTOCOL_VERSION);
    assert_eq!(params["clientInfo"]["version"], env!("CARGO_PKG_VERSION"));
    assert!(params["capabilities"].is_object());
    peer.reply(
        id,
        json!({
            "protocolVersion": "2024-11-05",
            "serverInfo": { "name": "full", "version": "2.0.0" },
            "capabilities": { "tools": { "listChanged": true }, "resources": {}, "prompts": {} }
        }),
    )
    .await;

    peer.expect_notification(methods::INITIALIZED).await;
    let (id, _) = peer.expect_request(methods::TOOLS_LIST).await;
    peer.reply(id, json!({ "tools": [tool("echo")] })).await;
    let (id, _) = peer.expect_request(methods::RESOURCES_LIST).await;
    peer.reply(
        id,
        json!({ "resources": [{ "uri": "memo://a", "name": "a" }] }),
    )
    .await;
    let (id, _) = peer.expect_request(methods::PROMPTS_LIST).await;
    peer.reply(id, json!({ "prompts": [{ "name": "greet" }] }))
        .await;

    let info = connecting.await.expect("connect task").expect("connect");
    assert_eq!(info.name, "full");
    assert_eq!(info.version, "2.0.0");
    assert!(info.capabilities.tools.is_some_and(|t| t.list_changed));

    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(session.list_tools().len(), 1);
    assert_eq!(session.list_resources()[0].uri, "memo://a");
    assert_eq!(session.list_prompts()[0].name, "greet");
    assert!(session.last_heartbeat().is_some());
    assert!(session.process_id().is_none(), "in-memory sessions have no pid");
}

/// Without the capability, `resources/list` and `prompts/list` are never sent.
#[tokio::test]
async fn handshake_skips_unadvertised_catalogs() {
    let (session, mut peer) = connected_session(json!([tool("echo")])).await;
    peer.expect_silence(Duration::from_millis(150)).await;
    assert!(session.list_resources().is_empty());
    assert!(session.list_prompts().is_empty());
}

#[tokio::test]
async fn initialize_error_fails_connect_and_closes() {
    let (transport, mut peer) = stub_pair();
    let session = fresh_session();
    let connecting = tokio::spawn({
        let session = session.clone();
        async move { session.connect_with_transport(transport).await }
    });

    let (id, _) = peer.expect_request(methods::INITIALIZE).await;
    peer.reply_error(id, RpcError::new(-32_000, "unsupported protocol"))
        .await;

    let err = connecting
        .await
        .expect("connect task")
        .expect_err("connect must fail");
    match &err {
        AppError::Handshake(msg) => assert!(msg.contains("unsupported protocol"), "got {msg}"),
        other => panic!("expected handshake error, got {other}"),
    }
    assert_eq!(session.state(), SessionState::Closed);
    assert!(peer.next().await.is_none(), "stream must be closed");
}

#[tokio::test]
async fn anonymous_initialize_result_fails_handshake() {
    let (transport, mut peer) = stub_pair();
    let session = fresh_session();
    let connecting = tokio::spawn({
        let session = session.clone();
        async move { session.connect_with_transport(transport).await }
    });

    let (id, _) = peer.expect_request(methods::INITIALIZE).await;
    peer.reply(id, json!({ "protocolVersion": "2024-11-05" })).await;

    let err = connecting.await.expect("connect task").expect_err("must fail");
    assert!(matches!(err, AppError::Handshake(_)), "got {err}");
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn failed_catalog_fetch_fails_handshake() {
    let (transport, mut peer) = stub_pair();
    let session = fresh_session();
    let connecting = tokio::spawn({
        let session = session.clone();
        async move { session.connect_with_transport(transport).await }
    });

    let (id, _) = peer.expect_request(methods::INITIALIZE).await;
    peer.reply(id, initialize_result(json!({ "tools": {} }))).await;
    peer.expect_notification(methods::INITIALIZED).await;
    let (id, _) = peer.expect_request(methods::TOOLS_LIST).await;
    peer.reply_error(id, RpcError::new(-32_603, "catalog unavailable"))
        .await;

    let err = connecting.await.expect("connect task").expect_err("must fail");
    match &err {
        AppError::Handshake(msg) => assert!(msg.starts_with("tools/list failed"), "got {msg}"),
        other => panic!("expected handshake error, got {other}"),
    }
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn provider_vanishing_mid_handshake_fails_connect() {
    let (transport, mut peer) = stub_pair();
    let session = fresh_session();
    let connecting = tokio::spawn({
        let session = session.clone();
        async move { session.connect_with_transport(transport).await }
    });

    peer.expect_request(methods::INITIALIZE).await;
    drop(peer);

    let err = connecting.await.expect("connect task").expect_err("must fail");
    assert!(matches!(err, AppError::Handshake(_)), "got {err}");
    assert_eq!(session.state(), SessionState::Closed);
}

/// Closing while the handshake is in flight cancels it.
#[tokio::test]
async fn close_during_handshake_cancels_connect() {
    let (transport, mut peer) = stub_pair();
    let session = fresh_session();
    let connecting = tokio::spawn({
        let session = session.clone();
        async move { session.connect_with_transport(transport).await }
    });

    peer.expect_request(methods::INITIALIZE).await;
    session.close().await.expect("close");

    let err = connecting.await.expect("connect task").expect_err("must fail");
    assert!(matches!(err, AppError::Cancelled(_)), "got {err}");
    assert_eq!(session.state(), SessionState::Closed);
    assert!(session.fatal_reason().is_none());
}

#[tokio::test]
async fn connect_twice_is_rejected() {
    let (session, _peer) = connected_session(json!([])).await;
    let (transport, _other) = stub_pair();

    let err = session
        .connect_with_transport(transport)
        .await
        .expect_err("second connect must fail");
    assert!(matches!(err, AppError::AlreadyConnected(_)), "got {err}");
    assert_eq!(session.state(), SessionState::Ready, "first connection untouched");
}

#[tokio::test]
async fn closed_session_cannot_reconnect() {
    let (session, _peer) = connected_session(json!([])).await;
    session.close().await.expect("close");

    let (transport, _other) = stub_pair();
    let err = session
        .connect_with_transport(transport)
        .await
        .expect_err("closed sessions are single-use");
    assert!(matches!(err, AppError::NotConnected(_)), "got {err}");
}

// ── Close ────────────────────────────────────────────────────

/// Concurrent closes all return, the in-flight request is cancelled, and
/// the provider sees its input stream end.
#[tokio::test]
async fn concurrent_close_is_idempotent() {
    let (session, mut peer) = connected_session(json!([])).await;
    let mut states = session.subscribe_state();

    let in_flight = tokio::spawn({
        let session = session.clone();
        async move { session.send_request("test/slow", None).await }
    });
    peer.expect_request("test/slow").await;

    let closes = (0..4).map(|_| {
        let session = session.clone();
        async move { session.close().await }
    });
    for outcome in join_all(closes).await {
        outcome.expect("close never fails");
    }

    let err = in_flight.await.expect("request task").expect_err("cancelled");
    assert!(matches!(err, AppError::Cancelled(_)), "got {err}");
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(session.pending_count(), 0);
    assert!(states.has_changed().expect("sender alive"));
    assert_eq!(*states.borrow_and_update(), SessionState::Closed);
    assert!(peer.next().await.is_none(), "provider must see EOF");

    let err = session
        .send_request("test/after", None)
        .await
        .expect_err("closed");
    assert!(matches!(err, AppError::NotConnected(_)), "got {err}");
    session.close().await.expect("closing again is a no-op");
}

// ── Stream failure ───────────────────────────────────────────

#[tokio::test]
async fn provider_eof_fails_in_flight_requests() {
    let (session, mut peer) = connected_session(json!([])).await;

    let in_flight = tokio::spawn({
        let session = session.clone();
        async move { session.send_request("test/slow", None).await }
    });
    peer.expect_request("test/slow").await;
    drop(peer);

    let err = in_flight.await.expect("request task").expect_err("must fail");
    assert!(matches!(err, AppError::Transport(_)), "got {err}");
    assert!(err.is_session_fatal());

    let closed = eventually(Duration::from_secs(2), || {
        session.state() == SessionState::Closed
    })
    .await;
    assert!(closed, "session must close after EOF");
    let reason = session.fatal_reason().expect("fatal reason recorded");
    assert!(reason.contains("closed its output stream"), "got {reason}");
}

// ── Notifications out ────────────────────────────────────────

#[tokio::test]
async fn notify_writes_one_notification() {
    let (session, mut peer) = connected_session(json!([])).await;

    session
        .notify("notifications/roots/list_changed", None)
        .await
        .expect("notify");
    let params = peer
        .expect_notification("notifications/roots/list_changed")
        .await;
    assert!(params.is_null());
    assert_eq!(session.pending_count(), 0);
}
