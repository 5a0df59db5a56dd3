
use std::net::SocketAddr;
use std::time::Duration;

use harness::{MemorySink, RelayHandle, Reply, UpstreamServer};
use tcptap_relay::{BindStep, InterimPolicy, RelayError, RelayState, RelayStats, BUFFER_SIZE};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::timeout;

async fn read_exactly(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    timeout(Duration::from_secs(3), stream.read_exact(&mut buf))
        .await
        .expect("timed out reading from relay")
        .expect("read from relay failed");
    buf
}

async fn ping(addr: SocketAddr) -> (TcpStream, Vec<u8>) {
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"Ping").await.unwrap();
    let reply = read_exactly(&mut client, 4).await;
    (client, reply)
}

#[tokio::test]
async fn ping_pong_round_trip_logs_each_transfer_twice() {
    let server = UpstreamServer::spawn(Reply::Pong).await.unwrap();
    let relay = RelayHandle::spawn(&server).await.unwrap();

    let (_client, reply) = ping(relay.listen_addr).await;
    assert_eq!(reply, b"Pong");
    assert_eq!(server.received(), b"Ping");

    relay.sink.wait_for("forwarded to client: Pong").await;
    assert_eq!(
        relay.sink.transfers(),
        vec![
            "received from client: Ping",
            "forwarded to server: Ping",
            "received from server: Pong",
            "forwarded to client: Pong",
        ]
    );
}

#[tokio::test]
async fn client_bytes_reach_server_verbatim() {
    let server = UpstreamServer::spawn(Reply::Echo).await.unwrap();
    let relay = RelayHandle::spawn(&server).await.unwrap();

    let payload: Vec<u8> = (0u8..=255).chain([0, 0xff, b'\n']).collect();
    let mut client = TcpStream::connect(relay.listen_addr).await.unwrap();
    client.write_all(&payload).await.unwrap();

    assert_eq!(server.wait_for_bytes(payload.len()).await, payload);
    assert_eq!(read_exactly(&mut client, payload.len()).await, payload);
}

#[tokio::test]
async fn server_bytes_reach_client_verbatim() {
    let server = UpstreamServer::spawn(Reply::Silent).await.unwrap();
    let mut relay = RelayHandle::spawn(&server).await.unwrap();

    let mut client = TcpStream::connect(relay.listen_addr).await.unwrap();
    relay.wait_for_state(RelayState::Serving).await;

    server.push(b"unsolicited \x00\x01 bytes");
    assert_eq!(
        read_exactly(&mut client, 20).await,
        b"unsolicited \x00\x01 bytes"
    );
    relay
        .sink
        .wait_for("forwarded to client: unsolicited \u{0}\u{1} bytes")
        .await;
}

#[tokio::test]
async fn clean_disconnect_then_second_client_is_served() {
    let server = UpstreamServer::spawn(Reply::Pong).await.unwrap();
    let relay = RelayHandle::spawn(&server).await.unwrap();

    let (first, reply) = ping(relay.listen_addr).await;
    assert_eq!(reply, b"Pong");
    drop(first);
    relay.sink.wait_for("client disconnected").await;

    let (_second, reply) = ping(relay.listen_addr).await;
    assert_eq!(reply, b"Pong");
    assert_eq!(server.connection_count(), 1);
    assert_eq!(RelayStats::get(&relay.stats.sessions_accepted), 2);
    assert_eq!(RelayStats::get(&relay.stats.sessions_closed), 1);
}

#[tokio::test]
async fn repeated_disconnects_keep_one_upstream_connection() {
    const IDLE_CLIENTS: usize = 5;

    let server = UpstreamServer::spawn(Reply::Pong).await.unwrap();
    let relay = RelayHandle::spawn(&server).await.unwrap();

    for _ in 0..IDLE_CLIENTS {
        let client = TcpStream::connect(relay.listen_addr).await.unwrap();
        drop(client);
    }
    relay
        .sink
        .wait_for_count("client disconnected", IDLE_CLIENTS)
        .await;

    let (_client, reply) = ping(relay.listen_addr).await;
    assert_eq!(reply, b"Pong");

    assert_eq!(server.connection_count(), 1);
    assert_eq!(
        server.peers.lock().unwrap().as_slice(),
        &[relay.upstream_local_addr]
    );
    assert_eq!(
        RelayStats::get(&relay.stats.sessions_accepted),
        IDLE_CLIENTS as u64 + 1
    );
}

#[tokio::test]
async fn silent_client_close_is_not_logged_as_message() {
    let server = UpstreamServer::spawn(Reply::Pong).await.unwrap();
    let relay = RelayHandle::spawn(&server).await.unwrap();

    drop(TcpStream::connect(relay.listen_addr).await.unwrap());
    relay.sink.wait_for("client disconnected").await;

    assert!(relay.sink.transfers().is_empty(), "{:?}", relay.sink.entries());
    assert!(server.received().is_empty());
}

#[tokio::test]
async fn full_buffer_message_waits_for_next_read() {
    let server = UpstreamServer::spawn(Reply::Silent).await.unwrap();
    let relay = RelayHandle::spawn(&server).await.unwrap();

    let full = vec![b'a'; BUFFER_SIZE];
    let mut client = TcpStream::connect(relay.listen_addr).await.unwrap();
    client.write_all(&full).await.unwrap();

    // A read that fills the buffer does not end the message.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(server.received().is_empty());

    client.write_all(b"tail").await.unwrap();
    let received = server.wait_for_bytes(BUFFER_SIZE + 4).await;
    assert_eq!(&received[..BUFFER_SIZE], full.as_slice());
    assert_eq!(&received[BUFFER_SIZE..], b"tail");

    let expected = format!("received from client: {}tail", "a".repeat(BUFFER_SIZE));
    relay.sink.wait_for(&expected).await;
    assert_eq!(relay.sink.count(&expected), 1);
}

#[tokio::test]
async fn upstream_close_ends_relay() {
    let mut server = UpstreamServer::spawn(Reply::Pong).await.unwrap();
    let relay = RelayHandle::spawn(&server).await.unwrap();
    let listen_addr = relay.listen_addr;
    let sink: MemorySink = relay.sink.clone();

    let (_client, reply) = ping(listen_addr).await;
    assert_eq!(reply, b"Pong");

    server.close().await;
    let result = relay.join().await;
    assert!(matches!(result, Err(RelayError::UpstreamClosed)), "{result:?}");
    assert!(sink.contains("connection to server is ended"));

    // The listener went away with the relay.
    assert!(TcpStream::connect(listen_addr).await.is_err());
}

#[tokio::test]
async fn upstream_close_while_awaiting_client_ends_relay() {
    let mut server = UpstreamServer::spawn(Reply::Pong).await.unwrap();
    let mut relay = RelayHandle::spawn(&server).await.unwrap();
    relay.wait_for_state(RelayState::AwaitingClient).await;

    server.close().await;
    let sink = relay.sink.clone();
    let result = relay.join().await;
    assert!(matches!(result, Err(RelayError::UpstreamClosed)), "{result:?}");
    assert!(sink.contains("connection to server is ended"));
}

#[tokio::test]
async fn client_reset_while_serving_is_fatal() {
    let server = UpstreamServer::spawn(Reply::Pong).await.unwrap();
    let mut relay = RelayHandle::spawn(&server).await.unwrap();

    let socket = TcpSocket::new_v4().unwrap();
    socket.set_linger(Some(Duration::ZERO)).unwrap();
    let client = socket.connect(relay.listen_addr).await.unwrap();
    relay.wait_for_state(RelayState::Serving).await;

    // Zero linger turns the close into a reset.
    drop(client);

    let sink = relay.sink.clone();
    let result = relay.join().await;
    assert!(matches!(result, Err(RelayError::Io { .. })), "{result:?}");
    assert!(!sink.contains("client disconnected"));
}

#[tokio::test]
async fn busy_client_does_not_starve_upstream() {
    let server = UpstreamServer::spawn(Reply::Silent).await.unwrap();
    let mut relay = RelayHandle::spawn(&server).await.unwrap();

    let client = TcpStream::connect(relay.listen_addr).await.unwrap();
    relay.wait_for_state(RelayState::Serving).await;
    let (mut reader, mut writer) = client.into_split();

    let flood = tokio::spawn(async move {
        let chunk = vec![b'x'; 4 * BUFFER_SIZE];
        while writer.write_all(&chunk).await.is_ok() {}
    });
    server.wait_for_bytes(64 * BUFFER_SIZE).await;

    server.push(b"marker");
    let mut buf = [0u8; 6];
    timeout(Duration::from_secs(3), reader.read_exact(&mut buf))
        .await
        .expect("upstream message starved by client traffic")
        .unwrap();
    assert_eq!(&buf, b"marker");

    flood.abort();
}

#[tokio::test]
async fn interim_messages_are_held_for_next_client() {
    let server = UpstreamServer::spawn(Reply::Pong).await.unwrap();
    let relay = RelayHandle::spawn(&server).await.unwrap();

    server.push(b"early");
    relay.sink.wait_for("held for next client: early").await;

    let mut client = TcpStream::connect(relay.listen_addr).await.unwrap();
    assert_eq!(read_exactly(&mut client, 5).await, b"early");
    relay.sink.wait_for("forwarded to client: early").await;
    assert_eq!(RelayStats::get(&relay.stats.interim_held), 1);
}

#[tokio::test]
async fn interim_messages_are_discarded_with_drop_policy() {
    let server = UpstreamServer::spawn(Reply::Pong).await.unwrap();
    let relay = RelayHandle::spawn_with_policy(&server, InterimPolicy::Drop)
        .await
        .unwrap();

    server.push(b"early");
    relay.sink.wait_for("dropped, no client attached: early").await;

    let (_client, reply) = ping(relay.listen_addr).await;
    assert_eq!(reply, b"Pong");
    assert!(!relay.sink.contains("forwarded to client: early"));
    assert_eq!(RelayStats::get(&relay.stats.interim_dropped), 1);
}

#[tokio::test]
async fn pending_queue_drops_oldest_when_full() {
    let server = UpstreamServer::spawn(Reply::Pong).await.unwrap();
    let relay = RelayHandle::spawn_with(&server, |config| config.max_pending = 2)
        .await
        .unwrap();

    for message in ["a", "b", "c"] {
        server.push(message.as_bytes());
        relay
            .sink
            .wait_for(&format!("held for next client: {message}"))
            .await;
    }
    assert!(relay.sink.contains("dropped, pending queue full: a"));

    let mut client = TcpStream::connect(relay.listen_addr).await.unwrap();
    assert_eq!(read_exactly(&mut client, 2).await, b"bc");
}

#[tokio::test]
async fn bind_conflict_fails_before_accept() {
    let server = UpstreamServer::spawn(Reply::Pong).await.unwrap();
    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = occupied.local_addr().unwrap().port();

    let result = RelayHandle::spawn_with(&server, |config| {
        config.listener.bind_addr.set_port(port);
    })
    .await;

    match result {
        Err(RelayError::Bind { step, addr, .. }) => {
            assert_eq!(step, BindStep::Bind);
            assert_eq!(addr.port(), port);
        }
        Err(other) => panic!("expected bind error, got {other}"),
        Ok(_) => panic!("bind on an occupied port succeeded"),
    }
}

#[tokio::test]
async fn unreachable_upstream_fails_to_start() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = listener.local_addr().unwrap();
    drop(listener);

    let config = harness::relay_config(dead_addr);
    let result = tcptap_relay::Relay::start(config, Box::new(MemorySink::new())).await;
    assert!(matches!(result, Err(RelayError::Connect { .. })));
}
