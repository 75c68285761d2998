//! Plain TCP Socket Integration Tests
//!
//! # Running with tracing
//!
//! Use TEST_LOG environment variable to control tracing verbosity (like -v, -vv, -vvv):
//!
//! ```bash
//! TEST_LOG=2 cargo test --test plain_socket -- --nocapture
//! ```


use event_helper::*;
use kvmlink::prelude::*;
use kvmlink::Job;
use std::sync::{Arc, Once};
use std::time::Duration;

static INIT: Once = Once::new();

// ============================================================================
// Tracing Initialization
// ============================================================================

/// Initialize tracing based on TEST_LOG environment variable
///
/// Verbosity levels (like -v, -vv, -vvv):
/// - TEST_LOG=1: Info level
/// - TEST_LOG=2: Debug level
/// - TEST_LOG=3: Trace level
fn init_tracing() {
    INIT.call_once(|| {
        if let Ok(level_str) = std::env::var("TEST_LOG") {
            let verbosity = level_str.parse::<u8>().unwrap_or(0);

            if verbosity > 0 {
                let level = match verbosity {
                    1 => "info",
                    2 => "debug",
                    _ => "trace", // 3 or more
                };

                let filter = format!("kvmlink={}", level);
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
                    .with_target(true)
                    .with_writer(std::io::stderr)
                    .with_test_writer()
                    .try_init();
            }
        }
    });
}

// ============================================================================
// Helper Functions
// ============================================================================

fn build_config() -> config::Config {
    config::Config::builder()
        .set_default("poll_timeout_ms", 20)
        .unwrap()
        .build()
        .unwrap()
}

fn loopback() -> NetworkAddress {
    "127.0.0.1:0".parse().unwrap()
}

/// Connects a client socket to a fresh listener and returns both ends.
fn connected_pair(
    server: &mut Transport,
    client: &mut Transport,
) -> (Arc<dyn DataSocket>, Arc<dyn DataSocket>) {
    let (listener_id, listener_addr) = server.listen(&loopback()).unwrap();
    let client_socket = client.connect(&NetworkAddress::from(listener_addr)).unwrap();
    let client_id = client_socket.id();

    expect_event(client, |event| {
        matches!(event, TransportEvent::Connected { id } if *id == client_id)
    });
    expect_event(server, |event| {
        matches!(event, TransportEvent::Incoming { id } if *id == listener_id)
    });

    let mut accepted = server.accept(listener_id).unwrap();
    assert_eq!(accepted.len(), 1);
    let server_socket = accepted.remove(0);
    assert_eq!(server_socket.state(), SocketState::Connected);
    assert_eq!(server_socket.peer_addr(), client_socket.local_addr());

    (client_socket, server_socket)
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn echo_over_loopback() {
    init_tracing();
    let config = build_config();
    let mut server = Transport::new(&config).unwrap();
    let mut client = Transport::new(&config).unwrap();
    let (client_socket, server_socket) = connected_pair(&mut server, &mut client);
    assert!(!client_socket.is_secure());

    write_all(&client, &client_socket, b"Hello, kvmlink!");
    let received = read_exactly(&server, &server_socket, 15);
    assert_eq!(received, b"Hello, kvmlink!");

    write_all(&server, &server_socket, &received);
    let echoed = read_exactly(&client, &client_socket, 15);
    assert_eq!(echoed, b"Hello, kvmlink!");
}

#[test]
fn connect_reports_events_in_order() {
    init_tracing();
    let config = build_config();
    let mut server = Transport::new(&config).unwrap();
    let mut client = Transport::new(&config).unwrap();
    let (_listener_id, listener_addr) = server.listen(&loopback()).unwrap();

    let socket = client.connect(&NetworkAddress::from(listener_addr)).unwrap();
    let id = socket.id();
    let events = wait_for(&client, |event| {
        matches!(event, TransportEvent::Connected { id: got } if *got == id)
    });
    assert_eq!(events[0], TransportEvent::Connecting { id });
    assert_eq!(socket.state(), SocketState::Connected);
    assert_eq!(socket.peer_addr(), Some(listener_addr));
}

#[test]
fn read_without_data_returns_zero() {
    init_tracing();
    let config = build_config();
    let mut server = Transport::new(&config).unwrap();
    let mut client = Transport::new(&config).unwrap();
    let (client_socket, server_socket) = connected_pair(&mut server, &mut client);

    let mut buf = [0u8; 64];
    assert_eq!(client_socket.read(&mut buf).unwrap(), 0);
    assert_eq!(server_socket.read(&mut buf).unwrap(), 0);
}

#[test]
fn write_before_connect_is_rejected() {
    init_tracing();
    let client = Transport::new(&build_config()).unwrap();
    let socket = client.factory().create();

    assert_eq!(socket.state(), SocketState::Unconnected);
    let err = socket.write(b"early").unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));

    let mut buf = [0u8; 8];
    assert_eq!(socket.read(&mut buf).unwrap(), 0);
}

#[test]
fn partial_writes_deliver_all_bytes_in_order() {
    init_tracing();
    let config = config::Config::builder()
        .set_default("poll_timeout_ms", 20)
        .unwrap()
        .set_default("send_buffer_limit", 1024)
        .unwrap()
        .set_default("max_read_size", 512)
        .unwrap()
        .build()
        .unwrap();
    let mut server = Transport::new(&config).unwrap();
    let mut client = Transport::new(&config).unwrap();
    let (client_socket, server_socket) = connected_pair(&mut server, &mut client);

    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();

    // The send buffer takes at most its limit in one call
    let first = client_socket.write(&payload).unwrap();
    assert_eq!(first, 1024);

    let mut sent = first;
    let mut output_ready = 0;
    let mut received = Vec::with_capacity(payload.len());
    let mut buf = [0u8; 8192];
    let deadline = std::time::Instant::now() + TIMEOUT;
    while received.len() < payload.len() {
        assert!(std::time::Instant::now() < deadline, "Timed out");
        for event in client.fetch_events(Some(Duration::from_millis(5))) {
            if matches!(event, TransportEvent::OutputReady { .. }) {
                output_ready += 1;
            }
        }
        if sent < payload.len() {
            sent += client_socket.write(&payload[sent..]).unwrap();
        }
        let n = server_socket.read(&mut buf).unwrap();
        received.extend_from_slice(&buf[..n]);
    }

    assert_eq!(received, payload);
    assert!(output_ready > 0);
}

#[test]
fn connect_refused_fails_once() {
    init_tracing();
    let mut client = Transport::new(&build_config()).unwrap();

    // Grab a free port and release it again
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let address = NetworkAddress::new("127.0.0.1", port).unwrap();

    let socket = client.connect(&address).unwrap();
    let id = socket.id();
    let events = wait_for(&client, |event| event.is_terminal());
    assert!(matches!(events.last(), Some(TransportEvent::Failed { id: got, .. }) if *got == id));
    assert_eq!(socket.state(), SocketState::Failed);

    let err = socket.write(b"too late").unwrap_err();
    assert!(matches!(err, Error::AlreadyFailed { .. }));

    // Closing a failed socket adds nothing
    socket.close();
    std::thread::sleep(Duration::from_millis(50));
    assert!(client.try_fetch_events().is_empty());
    assert_eq!(client.multiplexer().job_count(), 0);
}

#[test]
fn unresolvable_host_fails_once() {
    init_tracing();
    let mut client = Transport::new(&build_config()).unwrap();
    let address: NetworkAddress = "no-such-host.invalid:24800".parse().unwrap();

    // Only a malformed address is rejected up front
    let socket = client.connect(&address).unwrap();
    let id = socket.id();
    let events = wait_for(&client, |event| event.is_terminal());
    assert_eq!(events[0], TransportEvent::Connecting { id });
    assert!(matches!(events.last(), Some(TransportEvent::Failed { id: got, .. }) if *got == id));
    assert_eq!(socket.state(), SocketState::Failed);
    assert!(matches!(
        socket.write(b"lost"),
        Err(Error::AlreadyFailed { .. })
    ));

    socket.close();
    std::thread::sleep(Duration::from_millis(50));
    assert!(client.try_fetch_events().is_empty());
    assert_eq!(client.multiplexer().job_count(), 0);
}

#[test]
fn close_is_idempotent() {
    init_tracing();
    let config = build_config();
    let mut server = Transport::new(&config).unwrap();
    let mut client = Transport::new(&config).unwrap();
    let (client_socket, server_socket) = connected_pair(&mut server, &mut client);
    let id = client_socket.id();

    client_socket.close();
    client_socket.close();
    assert_eq!(client_socket.state(), SocketState::Closed);

    let events = wait_for(&client, |event| event.is_terminal());
    assert_eq!(events.last(), Some(&TransportEvent::Disconnected { id }));
    std::thread::sleep(Duration::from_millis(50));
    assert!(client.try_fetch_events().is_empty());
    assert_eq!(client.multiplexer().job_count(), 0);

    let mut buf = [0u8; 8];
    assert!(matches!(
        client_socket.read(&mut buf),
        Err(Error::SocketClosed { .. })
    ));
    assert!(matches!(
        client_socket.write(b"x"),
        Err(Error::SocketClosed { .. })
    ));

    // The peer sees the stream end
    let server_id = server_socket.id();
    expect_event(&server, |event| {
        *event == TransportEvent::Disconnected { id: server_id }
    });
    assert_eq!(server_socket.state(), SocketState::Closed);
}

#[test]
fn input_stays_readable_after_peer_closes() {
    init_tracing();
    let config = build_config();
    let mut server = Transport::new(&config).unwrap();
    let mut client = Transport::new(&config).unwrap();
    let (client_socket, server_socket) = connected_pair(&mut server, &mut client);
    let client_id = client_socket.id();

    write_all(&server, &server_socket, b"goodbye");

    // Output is flushed once the socket only waits for input again
    let server_id = server_socket.id();
    let reading = Some(Job::transfer(mio::Interest::READABLE));
    wait_until(&server, || server.multiplexer().registered_job(server_id) == reading);
    server_socket.close();

    wait_for(&client, |event| *event == TransportEvent::Disconnected { id: client_id });
    assert_eq!(client_socket.state(), SocketState::Closed);

    let mut buf = [0u8; 64];
    let n = client_socket.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"goodbye");
    assert!(matches!(
        client_socket.read(&mut buf),
        Err(Error::SocketClosed { .. })
    ));
}

#[test]
fn transport_tracks_listeners() {
    init_tracing();
    let mut server = Transport::new(&build_config()).unwrap();
    let (listener_id, addr) = server.listen(&loopback()).unwrap();
    assert_ne!(addr.port(), 0);
    assert_eq!(server.listener_addresses(), vec![addr]);

    server.close(listener_id);
    assert!(server.listener_addresses().is_empty());
    assert_eq!(server.multiplexer().job_count(), 0);
}
