//! End-to-end session lifecycle scenarios.
//!
//! Each test binds a real server on an ephemeral localhost port and talks
//! to it over TCP, with small shell commands standing in for the game
//! (`cat` is a perfect echo game). Covered: the happy path, auth failure,
//! the auth buffer cap, disconnect/reconnect onto the same child, child
//! exit, duplicate logins, and the bounded shutdown drain.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use gamemux::config::{AuthConfig, Config, GameConfig, ServerConfig, UserEntry};
use gamemux::protocol::{AUTH_FAILED, AUTH_SUCCESS_NEW, AUTH_SUCCESS_RECONNECT};
use gamemux::{Server, SessionRegistry, UserTable};

struct TestServer {
    addr: std::net::SocketAddr,
    registry: SessionRegistry,
    shutdown: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

/// Bind a server on 127.0.0.1:0 with alice(7) and bob(9) as users and the
/// given command as the game.
async fn start_server(command: &str, args: &[&str]) -> TestServer {
    let config = Config {
        server: ServerConfig {
            port: 0,
            bind_addr_4: "127.0.0.1".to_string(),
            disable_ipv6: true,
            auth_timeout_secs: 5,
            shutdown_grace_ms: 2000,
            ..ServerConfig::default()
        },
        game: GameConfig {
            command: command.to_string(),
            args: args.iter().map(ToString::to_string).collect(),
            working_dir: "/".to_string(),
        },
        auth: AuthConfig {
            users: vec![
                UserEntry {
                    name: "alice".to_string(),
                    password: "secret".to_string(),
                    id: 7,
                },
                UserEntry {
                    name: "bob".to_string(),
                    password: "hunter2".to_string(),
                    id: 9,
                },
            ],
        },
        ..Config::default()
    };

    let authenticator = Arc::new(UserTable::new(config.auth.users.clone()));
    let server = Server::bind(config, authenticator).unwrap();
    let addr = server.local_addrs()[0];
    let registry = server.registry();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(server.run(shutdown.clone()));

    TestServer {
        addr,
        registry,
        shutdown,
        handle,
    }
}

impl TestServer {
    async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("server did not stop in time")
            .unwrap();
    }
}

/// Connect, send a credential frame, return the stream and the one-byte
/// auth result.
async fn login(addr: std::net::SocketAddr, frame: &[u8]) -> (TcpStream, u8) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(frame).await.unwrap();
    let mut result = [0u8; 1];
    stream.read_exact(&mut result).await.unwrap();
    (stream, result[0])
}

/// Poll until the registry reaches the expected (pending, connected,
/// orphaned) populations.
async fn wait_for_counts(registry: &SessionRegistry, want: (usize, usize, usize)) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if registry.counts().await == want {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "registry never reached {want:?}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn test_happy_path_echo() {
    let server = start_server("/bin/cat", &[]).await;

    let (mut stream, result) = login(server.addr, b"{\"user\":\"alice\",\"pass\":\"secret\"}").await;
    assert_eq!(result, AUTH_SUCCESS_NEW);
    assert_eq!(server.registry.counts().await, (0, 1, 0));

    stream.write_all(b"hello").await.unwrap();
    let mut echo = [0u8; 5];
    stream.read_exact(&mut echo).await.unwrap();
    assert_eq!(&echo, b"hello");

    server.stop().await;
}

#[tokio::test]
async fn test_auth_failure_gets_one_byte_then_close() {
    let server = start_server("/bin/cat", &[]).await;

    let (mut stream, result) = login(server.addr, b"{\"user\":\"alice\",\"pass\":\"wrong\"}").await;
    assert_eq!(result, AUTH_FAILED);

    // Nothing follows the status byte; the server goes deaf and waits for
    // us to hang up.
    let mut buf = [0u8; 16];
    match tokio::time::timeout(Duration::from_millis(500), stream.read(&mut buf)).await {
        Err(_) | Ok(Ok(0)) | Ok(Err(_)) => {}
        Ok(Ok(n)) => panic!("unexpected {n} bytes after AUTH_FAILED"),
    }

    // Our close is what releases the pending record.
    drop(stream);
    wait_for_counts(&server.registry, (0, 0, 0)).await;
    server.stop().await;
}

#[tokio::test]
async fn test_auth_overrun_is_destroyed_without_a_reply() {
    let server = start_server("/bin/cat", &[]).await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    // 501 useful bytes, never a closing brace.
    let _ = stream.write_all(&[b'x'; 501]).await;

    let mut buf = [0u8; 16];
    match stream.read(&mut buf).await {
        Ok(0) | Err(_) => {}
        Ok(n) => panic!("overrun connection received {n} bytes"),
    }

    wait_for_counts(&server.registry, (0, 0, 0)).await;
    server.stop().await;
}

#[tokio::test]
async fn test_disconnect_then_reconnect_same_game() {
    let server = start_server("/bin/cat", &[]).await;

    let (mut stream, result) = login(server.addr, b"{\"u\":\"alice\",\"p\":\"secret\"}").await;
    assert_eq!(result, AUTH_SUCCESS_NEW);
    stream.write_all(b"ping").await.unwrap();
    let mut echo = [0u8; 4];
    stream.read_exact(&mut echo).await.unwrap();
    assert_eq!(&echo, b"ping");

    // Drop the connection; the game must survive as an orphan.
    drop(stream);
    wait_for_counts(&server.registry, (0, 0, 1)).await;

    // Same user comes back and lands on the same child.
    let (mut stream, result) = login(server.addr, b"{\"u\":\"alice\",\"p\":\"secret\"}").await;
    assert_eq!(result, AUTH_SUCCESS_RECONNECT);
    wait_for_counts(&server.registry, (0, 1, 0)).await;

    stream.write_all(b"pong").await.unwrap();
    let mut echo = [0u8; 4];
    stream.read_exact(&mut echo).await.unwrap();
    assert_eq!(&echo, b"pong");

    server.stop().await;
}

#[tokio::test]
async fn test_orphan_output_is_discarded_not_buffered() {
    // A chatty game that emits forever, client or no client.
    let server = start_server(
        "/bin/sh",
        &["-c", "while true; do echo tick; sleep 0.1; done"],
    )
    .await;

    let (mut stream, result) = login(server.addr, b"{\"u\":\"bob\",\"p\":\"hunter2\"}").await;
    assert_eq!(result, AUTH_SUCCESS_NEW);
    let mut line = [0u8; 5];
    stream.read_exact(&mut line).await.unwrap();
    assert_eq!(&line, b"tick\n");

    drop(stream);
    wait_for_counts(&server.registry, (0, 0, 1)).await;
    // Let the orphan produce output that has to be thrown away.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let (mut stream, result) = login(server.addr, b"{\"u\":\"bob\",\"p\":\"hunter2\"}").await;
    assert_eq!(result, AUTH_SUCCESS_RECONNECT);
    // The stream resumes on a whole-chunk boundary: the next bytes are a
    // fresh tick, not a stale partial one.
    let mut line = [0u8; 5];
    stream.read_exact(&mut line).await.unwrap();
    assert_eq!(&line, b"tick\n");

    server.stop().await;
}

#[tokio::test]
async fn test_child_exit_half_closes_then_destroys() {
    // A game that answers once and exits.
    let server = start_server("/bin/sh", &["-c", "head -n 1"]).await;

    let (mut stream, result) = login(server.addr, b"{\"u\":\"alice\",\"p\":\"secret\"}").await;
    assert_eq!(result, AUTH_SUCCESS_NEW);

    stream.write_all(b"one\n").await.unwrap();
    let mut echo = [0u8; 4];
    stream.read_exact(&mut echo).await.unwrap();
    assert_eq!(&echo, b"one\n");

    // The child exits; the supervisor half-closes so the tail drains.
    let mut buf = [0u8; 16];
    match stream.read(&mut buf).await {
        Ok(0) | Err(_) => {}
        Ok(n) => panic!("unexpected {n} bytes after the game exited"),
    }

    // Closing our end lets the session be destroyed, freeing the userid.
    drop(stream);
    wait_for_counts(&server.registry, (0, 0, 0)).await;

    let (_stream, result) = login(server.addr, b"{\"u\":\"alice\",\"p\":\"secret\"}").await;
    assert_eq!(result, AUTH_SUCCESS_NEW);

    server.stop().await;
}

#[tokio::test]
async fn test_second_login_while_connected_is_refused() {
    let server = start_server("/bin/cat", &[]).await;

    let (mut first, result) = login(server.addr, b"{\"u\":\"alice\",\"p\":\"secret\"}").await;
    assert_eq!(result, AUTH_SUCCESS_NEW);

    let (second, result) = login(server.addr, b"{\"u\":\"alice\",\"p\":\"secret\"}").await;
    assert_eq!(result, AUTH_FAILED);
    drop(second);
    wait_for_counts(&server.registry, (0, 1, 0)).await;

    // The original session is untouched.
    first.write_all(b"still here").await.unwrap();
    let mut echo = [0u8; 10];
    first.read_exact(&mut echo).await.unwrap();
    assert_eq!(&echo, b"still here");

    server.stop().await;
}

#[tokio::test]
async fn test_shutdown_drains_within_the_grace_period() {
    let server = start_server("/bin/cat", &[]).await;

    // One connected session...
    let (_connected, result) = login(server.addr, b"{\"u\":\"alice\",\"p\":\"secret\"}").await;
    assert_eq!(result, AUTH_SUCCESS_NEW);

    // ...and one orphaned session.
    let (stream, result) = login(server.addr, b"{\"u\":\"bob\",\"p\":\"hunter2\"}").await;
    assert_eq!(result, AUTH_SUCCESS_NEW);
    drop(stream);
    wait_for_counts(&server.registry, (0, 1, 1)).await;

    // Signal shutdown: grace is 2s, so the whole drain (listeners closed,
    // children SIGTERMed, survivors killed) must finish well inside 5s.
    let started = tokio::time::Instant::now();
    server.shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), server.handle)
        .await
        .expect("shutdown exceeded the grace bound")
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    assert_eq!(server.registry.counts().await, (0, 0, 0));

    // New connections are refused once the listeners are gone.
    assert!(TcpStream::connect(server.addr).await.is_err());
}
