// crates/muxchat-server/tests/server_e2e.rs
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use muxchat_protocol::{Command, Frame, Reply, ReplyKind, SendMany, SendOne};
use muxchat_server::server::Server;
use muxchat_server::{Config, ConnectionRegistry, TcpTransport, Transport};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Running {
    server: Arc<Server>,
    addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<anyhow::Result<()>>,
}

async fn start_server() -> Running {
    let config = Config {
        bind_addr: "127.0.0.1".to_string(),
        port: 0,
        ..Config::default()
    };
    let server = Arc::new(Server::new(config));
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();

    let shutdown = CancellationToken::new();
    let task = {
        let server = server.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { server.serve(listener, shutdown).await })
    };
    Running {
        server,
        addr,
        shutdown,
        task,
    }
}

async fn connect(addr: SocketAddr, key: &str) -> TcpTransport {
    let stream = TcpStream::connect(addr).await.unwrap();
    let conn = TcpTransport::new(stream, 1 << 20, None);
    conn.send(key.as_bytes()).await.unwrap();
    conn
}

async fn wait_online(registry: &ConnectionRegistry, keys: &[&str]) {
    for _ in 0..200 {
        let mut all = true;
        for key in keys {
            all &= registry.contains(key).await;
        }
        if all {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{:?} never came online", keys);
}

async fn next_frame(conn: &TcpTransport) -> Frame {
    let raw = tokio::time::timeout(Duration::from_secs(5), conn.receive())
        .await
        .expect("timed out waiting for a frame")
        .unwrap()
        .expect("connection closed");
    Frame::parse(raw).unwrap()
}

fn send_one(from: &str, to: &str, message: &str) -> SendOne {
    SendOne {
        from: from.to_string(),
        to: to.to_string(),
        send_at: Utc::now(),
        message: message.to_string(),
        extra: Vec::new(),
    }
}

#[tokio::test]
async fn send_one_is_relayed_to_the_recipient() {
    let running = start_server().await;
    let dispatcher = running.server.dispatcher().clone();

    let alice = connect(running.addr, "alice").await;
    let bob = connect(running.addr, "bob").await;
    wait_online(running.server.registry(), &["alice", "bob"]).await;

    let msg = send_one("alice", "bob", "hi bob");
    let frame = dispatcher.encode(Command::SendOne.id(), &msg).unwrap();
    alice.send(frame.as_bytes()).await.unwrap();

    let got = next_frame(&bob).await;
    assert_eq!(got.as_bytes(), frame.as_bytes(), "relayed unchanged");
    assert_eq!(dispatcher.command_of(got.as_bytes()), Command::SendOne.id());
    let decoded: SendOne = dispatcher.payload_of(&got).unwrap();
    assert_eq!(decoded, msg);

    running.shutdown.cancel();
    running.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn send_one_to_offline_user_gets_a_tip() {
    let running = start_server().await;
    let dispatcher = running.server.dispatcher().clone();

    let alice = connect(running.addr, "alice").await;
    wait_online(running.server.registry(), &["alice"]).await;

    let frame = dispatcher
        .encode(Command::SendOne.id(), &send_one("alice", "carol", "anyone?"))
        .unwrap();
    alice.send(frame.as_bytes()).await.unwrap();

    let got = next_frame(&alice).await;
    let reply: Reply = dispatcher.payload_of(&got).unwrap();
    assert_eq!(reply.reply_type, ReplyKind::Tip);
    assert_eq!(reply.tip, "carol is offline");

    running.shutdown.cancel();
    running.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn send_many_fans_out() {
    let running = start_server().await;
    let dispatcher = running.server.dispatcher().clone();

    let alice = connect(running.addr, "alice").await;
    let bob = connect(running.addr, "bob").await;
    let carol = connect(running.addr, "carol").await;
    wait_online(running.server.registry(), &["alice", "bob", "carol"]).await;

    let msg = SendMany {
        from: "alice".to_string(),
        to: vec!["bob".to_string(), "carol".to_string(), "dave".to_string()],
        send_at: Utc::now(),
        message: "hi all".to_string(),
        extra: Vec::new(),
    };
    let frame = dispatcher.encode(Command::SendMany.id(), &msg).unwrap();
    alice.send(frame.as_bytes()).await.unwrap();

    for peer in [&bob, &carol] {
        let got = next_frame(peer).await;
        assert_eq!(got.as_bytes(), frame.as_bytes());
    }

    running.shutdown.cancel();
    running.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn disconnect_takes_the_client_offline() {
    let running = start_server().await;
    let registry = running.server.registry().clone();

    let alice = connect(running.addr, "alice").await;
    wait_online(&registry, &["alice"]).await;

    alice.close().await;
    for _ in 0..200 {
        if !registry.contains("alice").await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!registry.contains("alice").await);

    running.shutdown.cancel();
    running.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn duplicate_connect_keeps_the_first_connection() {
    let running = start_server().await;
    let registry = running.server.registry().clone();

    let first = connect(running.addr, "alice").await;
    wait_online(&registry, &["alice"]).await;
    let original = registry.get("alice").await.unwrap();

    let second = connect(running.addr, "alice").await;
    // Give the second handshake time to land, then drop it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    second.close().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let current = registry.get("alice").await.expect("still online");
    assert!(Arc::ptr_eq(&current, &original));

    first.close().await;
    running.shutdown.cancel();
    running.task.await.unwrap().unwrap();
}
