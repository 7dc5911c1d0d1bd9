#[path = "common/mod.rs"]
mod common;

use std::sync::Arc;

use common::{test_config, wait_until};
use peerchat::persist::username_to_path;
use peerchat::protocol::PingArgs;
use peerchat::{serve, DhtNetwork, DhtNode, TcpNetwork, User};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{timeout, Duration};

fn free_addr() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}

#[tokio::test]
async fn ping_over_loopback() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let node = Arc::new(DhtNode::new(addr.clone(), TcpNetwork::default(), 20, 3));
    let (stop, stopped) = watch::channel(false);
    let server = tokio::spawn(serve(listener, node.clone(), stopped, Duration::from_millis(500)));

    let client = TcpNetwork::new(Duration::from_millis(500));
    let reply = client
        .ping(
            &addr,
            PingArgs {
                querying_node_id: 1,
                querying_ip_addr: "127.0.0.1:1".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(reply.queried_node_id, node.id);
    assert!(node.routing_table().await.contains(1));

    stop.send_replace(true);
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn call_to_closed_port_fails() {
    let client = TcpNetwork::new(Duration::from_millis(500));
    let result = client
        .ping(
            &free_addr(),
            PingArgs {
                querying_node_id: 1,
                querying_ip_addr: "127.0.0.1:1".into(),
            },
        )
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn silent_connection_is_closed_by_the_server() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let node = Arc::new(DhtNode::new(addr.to_string(), TcpNetwork::default(), 20, 3));
    let (stop, stopped) = watch::channel(false);
    let server = tokio::spawn(serve(listener, node, stopped, Duration::from_millis(100)));

    let mut idle = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 16];
    let closed = timeout(Duration::from_secs(2), idle.read(&mut buf)).await;
    match closed {
        Ok(Ok(n)) => assert_eq!(n, 0, "server sent bytes to a silent client"),
        Ok(Err(_)) => {}
        Err(_) => panic!("server kept a silent connection open"),
    }

    stop.send_replace(true);
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn failed_bootstrap_writes_no_state_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path()).with_rpc_timeout(Duration::from_millis(300));
    let addr = free_addr();

    let result = User::register_and_login("ghost", &addr, Some(&free_addr()), config.clone()).await;
    assert!(result.is_err());
    assert!(!username_to_path(dir.path(), "ghost").exists());

    // The listener is released, so the same address can log in again.
    let ghost = User::register_and_login("ghost", &addr, None, config).await.unwrap();
    ghost.logoff().await.unwrap();
    assert!(username_to_path(dir.path(), "ghost").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn users_chat_over_tcp() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path()).with_rpc_timeout(Duration::from_millis(500));
    let alice_addr = free_addr();
    let bob_addr = free_addr();

    let alice = User::register_and_login("alice", &alice_addr, None, config.clone())
        .await
        .unwrap();
    let bob = User::register_and_login("bob", &bob_addr, Some(&alice_addr), config)
        .await
        .unwrap();

    assert!(alice.is_online("bob").await);
    alice.send_message("bob", "over the wire").await;

    let b = &bob;
    let delivered = wait_until(Duration::from_secs(5), move || async move {
        b.message_history("alice").await.len() == 1
    })
    .await;
    assert!(delivered);
    assert_eq!(bob.messages_from("alice").await[0].content, "over the wire");

    bob.logoff().await.unwrap();
    assert!(!alice.is_online("bob").await);
    alice.logoff().await.unwrap();
}
