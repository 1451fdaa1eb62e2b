//! Serialised frame writer.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde_json::json;
use tokio::io::AsyncReadExt;

use provider_session::protocol::message::Message;
use provider_session::transport::writer::FrameWriter;
use provider_session::AppError;

/// Concurrent senders never interleave partial lines.
#[tokio::test]
async fn concurrent_sends_produce_whole_lines() {
    let (client, mut server) = tokio::io::duplex(1 << 20);
    let writer = Arc::new(FrameWriter::new("test", Box::new(client)));
    let payload = "y".repeat(4_096);

    let sends = (0..32_u64).map(|n| {
        let writer = Arc::clone(&writer);
        let payload = payload.clone();
        async move {
            writer
                .send(&Message::request(n + 1, "test/bulk", Some(json!({ "p": payload }))))
                .await
        }
    });
    for outcome in join_all(sends).await {
        outcome.expect("send");
    }
    writer.shutdown().await;

    let mut raw = String::new();
    server.read_to_string(&mut raw).await.expect("read");
    let lines: Vec<&str> = raw.lines().collect();
    assert_eq!(lines.len(), 32);
    for line in lines {
        let msg: Message = serde_json::from_str(line).expect("each line is one envelope");
        assert_eq!(msg.method.as_deref(), Some("test/bulk"));
    }
}

#[tokio::test]
async fn send_after_shutdown_is_a_transport_error() {
    let (client, _server) = tokio::io::duplex(1024);
    let writer = FrameWriter::new("test", Box::new(client));
    writer.shutdown().await;
    writer.shutdown().await;

    let err = writer
        .send(&Message::notification("x", None))
        .await
        .expect_err("closed");
    assert!(matches!(err, AppError::Transport(_)), "got {err}");
}

#[tokio::test]
async fn send_to_vanished_peer_is_a_transport_error() {
    let (client, server) = tokio::io::duplex(1024);
    drop(server);
    let writer = FrameWriter::new("test", Box::new(client));

    let err = writer
        .send(&Message::notification("x", None))
        .await
        .expect_err("peer gone");
    assert!(err.is_session_fatal(), "got {err}");
}

/// `shutdown` aborts a send stuck on a peer that stopped reading instead of
/// waiting for its lock.
#[tokio::test]
async fn shutdown_aborts_a_blocked_send() {
    let (client, _server) = tokio::io::duplex(1024);
    let writer = Arc::new(FrameWriter::new("test", Box::new(client)));

    let blocked = tokio::spawn({
        let writer = Arc::clone(&writer);
        async move {
            writer
                .send(&Message::notification("test/bulk", Some(json!({ "p": "y".repeat(8_192) }))))
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    tokio::time::timeout(Duration::from_secs(1), writer.shutdown())
        .await
        .expect("shutdown must not wait on the blocked send");
    let err = blocked
        .await
        .expect("send task")
        .expect_err("blocked send is aborted");
    assert!(matches!(err, AppError::Transport(_)), "got {err}");
}

#[tokio::test]
async fn send_abandoned_mid_write_tears_the_stream() {
    let (client, _server) = tokio::io::duplex(1024);
    let writer = FrameWriter::new("test", Box::new(client));
    let bulk = Message::notification("test/bulk", Some(json!({ "p": "y".repeat(8_192) })));

    let abandoned = tokio::time::timeout(Duration::from_millis(50), writer.send(&bulk)).await;
    assert!(abandoned.is_err(), "peer is not reading, the send cannot finish");
    assert!(writer.is_torn());

    let err = writer
        .send(&Message::notification("x", None))
        .await
        .expect_err("torn stream");
    assert!(err.is_session_fatal(), "got {err}");
}
