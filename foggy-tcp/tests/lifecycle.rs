//! Connection lifecycle and application API behaviour on the simulator.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;

use foggy_tcp::segment::{flags, Segment};
use foggy_tcp::{
    CloseCause, Config, ConnError, Connection, ConnectionState, Listener, ReadMode, Simulator,
    SimulatorConfig, Transport,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Route `log` output through the test harness; `RUST_LOG` selects the level.
fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, 2], port))
}

fn network() -> Simulator {
    Simulator::new(SimulatorConfig {
        delay: Duration::from_millis(5),
        ..SimulatorConfig::default()
    })
}

/// Open a client on port 2 against a listener on port 1.
async fn pair(sim: &Simulator, config: Config) -> (Connection, Connection, Listener) {
    init_logging();
    let listener = Listener::bind(sim.bind(addr(1)).unwrap(), config.clone()).unwrap();
    let client = Connection::open(sim.bind(addr(2)).unwrap(), addr(1), config)
        .await
        .expect("open");
    let server = listener.accept().await.expect("accept");
    (client, server, listener)
}

// ---------------------------------------------------------------------------
// Read modes
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn no_wait_read_returns_immediately() {
    let sim = network();
    let (client, server, _listener) = pair(&sim, Config::default()).await;

    let empty = server.recv_with(1024, ReadMode::NoWait).await.unwrap();
    assert!(empty.is_empty());

    client.send(b"hello").unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let got = server.recv_with(1024, ReadMode::NoWait).await.unwrap();
    assert_eq!(got, b"hello");
}

#[tokio::test(start_paused = true)]
async fn timed_read_gives_up_after_deadline() {
    let sim = network();
    let (_client, server, _listener) = pair(&sim, Config::default()).await;

    let start = Instant::now();
    let got = server
        .recv_with(1024, ReadMode::Timeout(Duration::from_millis(300)))
        .await
        .unwrap();
    assert!(got.is_empty());
    let waited = start.elapsed();
    assert!(waited >= Duration::from_millis(300) && waited < Duration::from_millis(310));
}

#[tokio::test(start_paused = true)]
async fn reads_honour_max_and_preserve_order() {
    let sim = network();
    let (client, server, _listener) = pair(&sim, Config::default()).await;

    client.send(b"abcdefghij").unwrap();
    assert_eq!(server.recv(4).await.unwrap(), b"abcd");
    assert_eq!(server.recv(4).await.unwrap(), b"efgh");
    assert_eq!(server.recv(4).await.unwrap(), b"ij");
}

#[tokio::test(start_paused = true)]
async fn zero_byte_read_does_not_wait() {
    let sim = network();
    let (client, server, _listener) = pair(&sim, Config::default()).await;

    client.send(b"abc").unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let start = Instant::now();
    assert!(server.recv(0).await.unwrap().is_empty());
    assert_eq!(start.elapsed(), Duration::ZERO);
    assert_eq!(server.recv(16).await.unwrap(), b"abc");
}

// ---------------------------------------------------------------------------
// Buffering
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn send_accepts_partially_when_buffer_is_full() {
    let sim = network();
    let config = Config {
        send_buffer: 8192,
        ..Config::default()
    };
    let (client, server, _listener) = pair(&sim, config).await;

    let accepted = client.send(&[1u8; 20_000]).unwrap();
    assert_eq!(accepted, 8192);

    // send_all waits for acknowledgments to free space.
    let reader = tokio::spawn(async move {
        let mut total = 0;
        while total < 8192 + 30_000 {
            total += server.recv(65_536).await.unwrap().len();
        }
        total
    });
    client.send_all(&[2u8; 30_000]).await.unwrap();
    client.flush().await.unwrap();
    assert_eq!(reader.await.unwrap(), 8192 + 30_000);
}

#[tokio::test(start_paused = true)]
async fn flush_waits_for_acknowledgment() {
    let sim = network();
    let (client, _server, _listener) = pair(&sim, Config::default()).await;

    client.send(&[0u8; 10_000]).unwrap();
    let start = Instant::now();
    client.flush().await.unwrap();
    // At least one 10 ms round trip.
    assert!(start.elapsed() >= Duration::from_millis(10));
    assert_eq!(client.stats().bytes_sent, 10_000);
}

// ---------------------------------------------------------------------------
// Teardown
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn time_wait_lasts_twice_msl_then_closes() {
    let sim = network();
    let config = Config::default();
    let time_wait = config.time_wait();
    let (client, server, _listener) = pair(&sim, config).await;

    client.close().await.unwrap();
    assert!(server.recv(16).await.unwrap().is_empty());
    server.close().await.unwrap();
    // The client entered TIME_WAIT when it acknowledged the server's FIN,
    // one 5 ms hop before that ACK arrived.
    let acked = Instant::now();
    assert_eq!(client.state(), ConnectionState::TimeWait);

    tokio::time::sleep(time_wait - Duration::from_millis(10)).await;
    assert_eq!(client.state(), ConnectionState::TimeWait);

    client.closed().await;
    let lingered = acked.elapsed() + Duration::from_millis(5);
    assert!(
        lingered >= time_wait && lingered < time_wait + Duration::from_millis(5),
        "{lingered:?}"
    );
    assert_eq!(
        client.state(),
        ConnectionState::Closed {
            cause: CloseCause::Graceful
        }
    );
}

#[tokio::test(start_paused = true)]
async fn dropping_the_last_handle_closes_gracefully() {
    let sim = network();
    let (client, server, _listener) = pair(&sim, Config::default()).await;

    client.send(b"last words").unwrap();
    let other = client.clone();
    drop(client);
    // A surviving clone keeps the connection open.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(other.state(), ConnectionState::Established);
    drop(other);

    assert_eq!(server.recv(64).await.unwrap(), b"last words");
    assert!(server.recv(64).await.unwrap().is_empty());
    server.close().await.unwrap();
    assert_eq!(
        server.state(),
        ConnectionState::Closed {
            cause: CloseCause::Graceful
        }
    );
}

#[tokio::test(start_paused = true)]
async fn listener_forgets_finished_connections() {
    init_logging();
    let sim = network();
    let config = Config::default();
    let listener = Listener::bind(sim.bind(addr(1)).unwrap(), config.clone()).unwrap();

    let mut pairs = Vec::new();
    for port in 10..13 {
        let client = Connection::open(sim.bind(addr(port)).unwrap(), addr(1), config.clone())
            .await
            .expect("open");
        let server = listener.accept().await.expect("accept");
        pairs.push((client, server));
    }
    assert_eq!(listener.connections(), 3);

    // The accepted side closes first, so it is the one left in TIME_WAIT.
    for (client, server) in &pairs {
        server.close().await.unwrap();
        assert!(client.recv(16).await.unwrap().is_empty());
        client.close().await.unwrap();
    }
    assert_eq!(listener.connections(), 3);
    drop(pairs);

    tokio::time::sleep(config.time_wait() + Duration::from_millis(50)).await;
    assert_eq!(listener.connections(), 0);
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn abort_resets_the_peer() {
    let sim = network();
    let (client, server, _listener) = pair(&sim, Config::default()).await;

    client.abort();
    assert_eq!(
        client.state(),
        ConnectionState::Closed {
            cause: CloseCause::Aborted
        }
    );
    assert!(matches!(server.recv(16).await, Err(ConnError::Reset)));
    assert!(matches!(server.send(b"x"), Err(ConnError::Reset)));
    assert!(matches!(client.send(b"x"), Err(ConnError::Aborted)));
    // Closing a dead connection is still a no-op.
    client.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn open_to_missing_endpoint_times_out() {
    init_logging();
    let sim = network();
    let result = Connection::open(sim.bind(addr(2)).unwrap(), addr(99), Config::default()).await;
    assert!(matches!(result, Err(ConnError::Timeout)), "{result:?}");
}

#[tokio::test(start_paused = true)]
async fn handshake_retries_back_off_before_giving_up() {
    init_logging();
    let sim = network();
    let _silent = sim.bind(addr(1)).unwrap();
    let config = Config {
        initial_rto: Duration::from_millis(200),
        max_syn_retries: 3,
        ..Config::default()
    };

    let start = Instant::now();
    let result = Connection::open(sim.bind(addr(2)).unwrap(), addr(1), config).await;
    assert!(matches!(result, Err(ConnError::Timeout)));
    // 200 + 400 + 800 + 1600 ms.
    assert_eq!(start.elapsed(), Duration::from_millis(3000));
    assert_eq!(sim.stats().sent, 4);
}

#[tokio::test(start_paused = true)]
async fn data_retry_budget_exhaustion_times_out() {
    let sim = network();
    let config = Config {
        max_data_retries: 3,
        ..Config::default()
    };
    let (client, server, _listener) = pair(&sim, config).await;

    // Black-hole everything from now on.
    sim.set_filter(|_, _, _| true);
    client.send(b"into the void").unwrap();
    client.closed().await;
    assert_eq!(
        client.state(),
        ConnectionState::Closed {
            cause: CloseCause::TimedOut
        }
    );
    assert!(matches!(client.recv(8).await, Err(ConnError::Timeout)));
    drop(server);
}

#[tokio::test(start_paused = true)]
async fn listener_resets_strays() {
    let sim = network();
    let _listener = Listener::bind(sim.bind(addr(1)).unwrap(), Config::default()).unwrap();
    let stray = sim.bind(addr(3)).unwrap();

    let ack = Segment::control(1000, 2000, flags::ACK, 512);
    stray
        .send_datagram(addr(1), &ack.encode().unwrap())
        .await
        .unwrap();
    let (from, bytes) = stray.recv_datagram().await.unwrap();
    let reply = Segment::decode(&bytes).unwrap();
    assert_eq!(from, addr(1));
    assert!(reply.has(flags::RST));
    assert_eq!(reply.header.seq, 2000);
}

#[tokio::test(start_paused = true)]
async fn corrupt_datagrams_are_dropped_silently() {
    let sim = network();
    let (client, server, _listener) = pair(&sim, Config::default()).await;

    let mut bytes = Segment::control(0, 0, flags::ACK, 0).encode().unwrap();
    bytes[3] ^= 0xff;
    let rogue = sim.bind(addr(4)).unwrap();
    rogue.send_datagram(addr(1), &bytes).await.unwrap();
    rogue.send_datagram(addr(1), b"garbage").await.unwrap();

    client.send(b"still fine").unwrap();
    assert_eq!(server.recv(64).await.unwrap(), b"still fine");
    assert_eq!(client.state(), ConnectionState::Established);
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let sim = network();
    let config = Config {
        mss: 0,
        ..Config::default()
    };
    let result = Connection::open(sim.bind(addr(2)).unwrap(), addr(1), config).await;
    assert!(matches!(result, Err(ConnError::Config(_))));
}
