//! Live-socket session tests: wire handshake, keepalive timeout and
//! disconnect semantics.

use std::env;
use std::net::{TcpListener, TcpStream};
use std::str::FromStr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use slog::{Drain, Level, Logger};

use p2p::message::{Command, Message, PingPayload, VersionPayload};
use p2p::peer::{PeerError, PeerHost, TcpPeer};

const MAGIC: u32 = 0x0070_3274;

/// Host that completes the handshake automatically, answers nothing else,
/// and reports the terminating error of every session.
struct EchoHost {
    ping_timeout: Duration,
    answer_pings: bool,
    drops: Sender<String>,
}

impl EchoHost {
    fn new(ping_timeout: Duration, answer_pings: bool) -> (Arc<EchoHost>, Receiver<String>) {
        let (tx, rx) = unbounded();
        (
            Arc::new(EchoHost {
                ping_timeout,
                answer_pings,
                drops: tx,
            }),
            rx,
        )
    }
}

impl PeerHost for EchoHost {
    fn version_message(&self) -> Message {
        let payload = VersionPayload {
            version: 0,
            services: 1,
            timestamp: 0,
            port: 0,
            nonce: rand_nonce(),
            user_agent: "/session-test:0.4.0/".into(),
            start_height: 5,
            relay: true,
        };
        Message::new(MAGIC, Command::Version, payload.to_bytes())
    }

    fn handle_message(&self, peer: &Arc<TcpPeer>, msg: Message) -> Result<(), PeerError> {
        match msg.command {
            Command::Version => {
                let version = VersionPayload::from_bytes(&msg.payload)?;
                peer.handle_version(version)?;
                peer.send_version_ack(Message::new(MAGIC, Command::VerAck, vec![]))
            }
            Command::VerAck => peer.handle_version_ack(),
            Command::Ping => {
                if self.answer_pings {
                    let ping = PingPayload::from_bytes(&msg.payload)?;
                    let pong = PingPayload::new(ping.last_block_index, ping.timestamp);
                    peer.enqueue_hp_message(&Message::new(MAGIC, Command::Pong, pong.to_bytes()))
                } else {
                    Ok(())
                }
            }
            Command::Pong => {
                let pong = PingPayload::from_bytes(&msg.payload)?;
                peer.handle_pong(&pong)
            }
            _ => Ok(()),
        }
    }

    fn unregister(&self, _peer: &Arc<TcpPeer>, err: &PeerError) {
        let _ = self.drops.send(err.to_string());
    }

    fn ping_timeout(&self) -> Duration {
        self.ping_timeout
    }
}

fn rand_nonce() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(1)
}

fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    let client = TcpStream::connect(addr).expect("connect");
    let (server, _) = listener.accept().expect("accept");
    (client, server)
}

/// Test logger honouring `RUST_LOG`, quiet by default.
fn create_test_logger() -> Logger {
    let level = env::var("RUST_LOG")
        .ok()
        .and_then(|s| Level::from_str(&s).ok());
    match level {
        Some(level) => {
            let decorator = slog_term::TermDecorator::new().build();
            let drain = slog_term::FullFormat::new(decorator).build().fuse();
            let drain = slog_async::Async::new(drain)
                .build()
                .fuse()
                .filter_level(level)
                .fuse();
            Logger::root(drain, slog::o!())
        }
        None => Logger::root(slog::Discard, slog::o!()),
    }
}

fn wait_handshaked(peer: &Arc<TcpPeer>) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !peer.handshaked() {
        assert!(Instant::now() < deadline, "handshake timed out");
        thread::sleep(Duration::from_millis(5));
    }
}

fn connected_pair(
    host_a: Arc<EchoHost>,
    host_b: Arc<EchoHost>,
) -> (Arc<TcpPeer>, Arc<TcpPeer>) {
    let (sock_a, sock_b) = tcp_pair();
    let peer_a = TcpPeer::new(sock_a, host_a, create_test_logger());
    let peer_b = TcpPeer::new(sock_b, host_b, create_test_logger());
    peer_a.start();
    peer_b.start();
    (peer_a, peer_b)
}

#[test]
fn handshake_completes_over_the_wire() {
    let (host_a, _) = EchoHost::new(Duration::from_secs(30), true);
    let (host_b, _) = EchoHost::new(Duration::from_secs(30), true);
    let (peer_a, peer_b) = connected_pair(host_a, host_b);
    wait_handshaked(&peer_a);
    wait_handshaked(&peer_b);
    assert_eq!(peer_a.version().unwrap().start_height, 5);
}

#[test]
fn answered_ping_keeps_the_session_alive() {
    let (host_a, drops_a) = EchoHost::new(Duration::from_millis(500), true);
    let (host_b, _) = EchoHost::new(Duration::from_millis(500), true);
    let (peer_a, _peer_b) = connected_pair(host_a, host_b);
    wait_handshaked(&peer_a);

    let ping = PingPayload::new(peer_a.last_block_index(), 0);
    peer_a
        .send_ping(Message::new(MAGIC, Command::Ping, ping.to_bytes()))
        .unwrap();

    // The pong must land well before the timeout; no drop should arrive.
    assert!(drops_a
        .recv_timeout(Duration::from_millis(800))
        .is_err());
}

#[test]
fn unanswered_ping_times_out_and_later_pong_is_unexpected() {
    let (host_a, drops_a) = EchoHost::new(Duration::from_millis(80), false);
    let (host_b, _) = EchoHost::new(Duration::from_secs(30), false);
    let (peer_a, _peer_b) = connected_pair(host_a, host_b);
    wait_handshaked(&peer_a);

    let ping = PingPayload::new(0, 0);
    peer_a
        .send_ping(Message::new(MAGIC, Command::Ping, ping.to_bytes()))
        .unwrap();

    let err = drops_a
        .recv_timeout(Duration::from_secs(2))
        .expect("session must drop on ping timeout");
    assert_eq!(err, PeerError::PingTimeout.to_string());

    // The outstanding ping was consumed by the timeout; a pong now is a
    // protocol violation.
    let pong = PingPayload::new(0, 0);
    assert!(matches!(
        peer_a.handle_pong(&pong),
        Err(PeerError::UnexpectedPong)
    ));
}

#[test]
fn disconnect_is_idempotent_and_kills_enqueues() {
    let (host_a, drops_a) = EchoHost::new(Duration::from_secs(30), true);
    let (host_b, _) = EchoHost::new(Duration::from_secs(30), true);
    let (peer_a, _peer_b) = connected_pair(host_a, host_b);
    wait_handshaked(&peer_a);

    peer_a.disconnect(PeerError::Gone);
    peer_a.disconnect(PeerError::StateMismatch);

    // Exactly one unregister, carrying the first error.
    let first = drops_a.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(first, PeerError::Gone.to_string());
    assert!(drops_a.recv_timeout(Duration::from_millis(200)).is_err());

    // Enqueues race the closed done signal and fail fast.
    let err = peer_a.enqueue_message(&Message::new(MAGIC, Command::Inv, vec![1]));
    assert!(matches!(err, Err(PeerError::Gone)));
}
