//! Push channel connect, join, fan-out and reconnect behavior

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{payload, test_config, MemoryTransport, WAIT};
use hirewire_client::{ChannelConnection, Credentials};
use hirewire_core::ConnectionState;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};

fn credentials() -> Credentials {
    Credentials::new("user-42", "token-42")
}

async fn wait_state(rx: &mut watch::Receiver<ConnectionState>, state: ConnectionState) {
    tokio::time::timeout(WAIT, rx.wait_for(|s| *s == state))
        .await
        .expect("timed out waiting for connection state")
        .expect("channel dropped");
}

#[tokio::test]
async fn test_join_after_connect_and_rejoin_after_reconnect() {
    let (transport, mut server) = MemoryTransport::new();
    let channel = ChannelConnection::new(transport.clone(), credentials(), test_config().reconnect);
    let mut states = channel.state_watch();

    // Not connected yet: remembered, not sent
    channel.join_room("user-42");
    channel.connect();

    let mut conn = server.accept().await;
    assert_eq!(conn.token, "token-42");
    assert_eq!(conn.expect_join().await, "user-42");
    wait_state(&mut states, ConnectionState::Connected).await;

    conn.hang_up();
    let mut conn = server.accept().await;
    assert_eq!(conn.expect_join().await, "user-42");
    wait_state(&mut states, ConnectionState::Connected).await;
    assert_eq!(transport.open_count(), 2);
}

#[tokio::test]
async fn test_join_while_connected_is_sent_immediately() {
    let (transport, mut server) = MemoryTransport::new();
    let channel = ChannelConnection::new(transport, credentials(), test_config().reconnect);
    let mut states = channel.state_watch();

    channel.connect();
    let mut conn = server.accept().await;
    wait_state(&mut states, ConnectionState::Connected).await;

    channel.join_room("user-42");
    assert_eq!(conn.expect_join().await, "user-42");
}

#[tokio::test]
async fn test_connect_is_idempotent() {
    let (transport, mut server) = MemoryTransport::new();
    let channel = ChannelConnection::new(transport.clone(), credentials(), test_config().reconnect);
    let mut states = channel.state_watch();

    channel.connect();
    channel.connect();
    let _conn = server.accept().await;
    wait_state(&mut states, ConnectionState::Connected).await;
    channel.connect();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.open_count(), 1);
    assert!(server.is_idle());
}

#[tokio::test]
async fn test_every_handler_receives_the_event() {
    let (transport, mut server) = MemoryTransport::new();
    let channel = ChannelConnection::new(transport, credentials(), test_config().reconnect);
    let (tx, mut rx) = mpsc::unbounded_channel::<(&'static str, Value)>();

    let first = tx.clone();
    let a = channel.on_event("new_notification", move |data| {
        let _ = first.send(("a", data.clone()));
    });
    let second = tx.clone();
    channel.on_event("new_notification", move |data| {
        let _ = second.send(("b", data.clone()));
    });
    assert_eq!(channel.handler_count("new_notification"), 2);

    channel.join_room("user-42");
    channel.connect();
    let mut conn = server.accept().await;
    conn.expect_join().await;

    conn.notify(payload("n1", 10, false));
    let mut got = vec![
        tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap(),
        tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap(),
    ];
    got.sort_by_key(|(who, _)| *who);
    assert_eq!(got[0].0, "a");
    assert_eq!(got[1].0, "b");
    assert_eq!(got[0].1["id"], json!("n1"));

    assert!(channel.off_event(a));
    assert!(!channel.off_event(a));
    conn.notify(payload("n2", 11, false));
    let (who, data) = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(who, "b");
    assert_eq!(data["id"], json!("n2"));
}

#[tokio::test]
async fn test_undecodable_frame_does_not_drop_the_link() {
    let (transport, mut server) = MemoryTransport::new();
    let channel = ChannelConnection::new(transport.clone(), credentials(), test_config().reconnect);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let (tx, mut rx) = mpsc::unbounded_channel();
    channel.on_event("new_notification", move |data| {
        sink.lock().unwrap().push(data["id"].clone());
        let _ = tx.send(());
    });

    channel.connect();
    let conn = server.accept().await;
    conn.push_garbage("{not json");
    conn.notify(payload("n1", 10, false));

    tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![json!("n1")]);
    assert_eq!(transport.open_count(), 1);
}

#[tokio::test]
async fn test_failed_connects_are_retried() {
    let (transport, mut server) = MemoryTransport::new();
    transport.fail_next_opens(2);
    let channel = ChannelConnection::new(transport.clone(), credentials(), test_config().reconnect);
    let mut states = channel.state_watch();

    channel.join_room("user-42");
    channel.connect();
    let mut conn = server.accept().await;
    assert_eq!(conn.expect_join().await, "user-42");
    wait_state(&mut states, ConnectionState::Connected).await;
    assert_eq!(transport.open_count(), 3);
}

#[tokio::test]
async fn test_disconnect_releases_the_link() {
    let (transport, mut server) = MemoryTransport::new();
    let channel = ChannelConnection::new(transport.clone(), credentials(), test_config().reconnect);
    let mut states = channel.state_watch();

    channel.join_room("user-42");
    channel.connect();
    let mut conn = server.accept().await;
    conn.expect_join().await;
    wait_state(&mut states, ConnectionState::Connected).await;

    channel.disconnect();
    assert_eq!(channel.state(), ConnectionState::Disconnected);
    conn.closed().await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.open_count(), 1);
    assert_eq!(channel.state(), ConnectionState::Disconnected);

    // A new connect starts over, with no room remembered
    channel.connect();
    let _conn = server.accept().await;
    wait_state(&mut states, ConnectionState::Connected).await;
    assert_eq!(transport.open_count(), 2);
}

#[tokio::test]
async fn test_reconnect_survives_slow_close_of_previous_link() {
    let (transport, mut server) = MemoryTransport::new();
    let channel = ChannelConnection::new(transport.clone(), credentials(), test_config().reconnect);
    let mut states = channel.state_watch();

    transport.slow_close(Duration::from_millis(200));
    channel.join_room("user-42");
    channel.connect();
    let mut old = server.accept().await;
    old.expect_join().await;
    wait_state(&mut states, ConnectionState::Connected).await;

    channel.disconnect();
    channel.connect();
    channel.join_room("user-42");

    let mut conn = server.accept().await;
    assert_eq!(conn.expect_join().await, "user-42");
    wait_state(&mut states, ConnectionState::Connected).await;

    // The old link has finished closing by now
    old.closed().await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(channel.state(), ConnectionState::Connected);

    // And joins still reach the live link
    channel.join_room("user-43");
    assert_eq!(conn.expect_join().await, "user-43");
}
