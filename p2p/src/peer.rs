//! Per-connection peer session machine.
//!
//! Each session owns three concurrent tasks: the inbound reader, the
//! outbound dispatcher draining three bounded queues, and an optional
//! protocol heartbeat. All of them observe the `done` signal on every
//! blocking wait and exit promptly once [`TcpPeer::disconnect`] runs.

use std::io::{self, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{Arc, Mutex, Once, RwLock, Weak};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, select, Receiver, Sender};
use slog::Logger;
use thiserror::Error;

use crate::message::{Message, MessageError, PingPayload, VersionPayload};
use crate::timer::Timer;

const VERSION_SENT: u8 = 1 << 0;
const VERSION_RECEIVED: u8 = 1 << 1;
const VERACK_SENT: u8 = 1 << 2;
const VERACK_RECEIVED: u8 = 1 << 3;
const HANDSHAKED: u8 = VERSION_SENT | VERSION_RECEIVED | VERACK_SENT | VERACK_RECEIVED;

pub const DEFAULT_QUEUE_SIZE: usize = 32;
pub const P2P_QUEUE_SIZE: usize = 16;
pub const HP_QUEUE_SIZE: usize = 4;

/// The p2p queue shares bandwidth with the default queue in roughly a
/// 3-out-of-4 ratio; see the dispatcher loop.
const P2P_SKIP_DIVISOR: u32 = 4;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("the peer is gone already")]
    Gone,
    #[error("tried to send protocol message before handshake completed")]
    StateMismatch,
    #[error("invalid handshake: {0}")]
    Handshake(&'static str),
    #[error("ping/pong timeout")]
    PingTimeout,
    #[error("pong message wasn't expected")]
    UnexpectedPong,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error("handling {command} message: {reason}")]
    Handler {
        command: &'static str,
        reason: String,
    },
}

/// Server-dispatcher contract consumed by the session. Implementations
/// route decoded commands back into the peer's handshake and keepalive
/// methods and own everything above the session layer.
pub trait PeerHost: Send + Sync + 'static {
    /// The version message announcing this node to a new peer.
    fn version_message(&self) -> Message;

    /// Handles one inbound message; an error ends the session.
    fn handle_message(&self, peer: &Arc<TcpPeer>, msg: Message) -> Result<(), PeerError>;

    fn register(&self, _peer: &Arc<TcpPeer>) {}

    /// Told exactly once, with the error that terminated the session.
    fn unregister(&self, peer: &Arc<TcpPeer>, err: &PeerError);

    fn ping_timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    fn proto_tick_interval(&self) -> Duration {
        Duration::from_secs(5)
    }

    /// Periodic sync work driven by [`TcpPeer::start_protocol`].
    fn protocol_tick(&self, _peer: &Arc<TcpPeer>) -> Result<(), PeerError> {
        Ok(())
    }
}

struct SessionState {
    handshake: u8,
    version: Option<VersionPayload>,
    last_block_index: u32,
    ping_sent: i32,
    ping_timer: Option<Timer>,
}

struct Queue {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

impl Queue {
    fn new(size: usize) -> Queue {
        let (tx, rx) = bounded(size);
        Queue { tx, rx }
    }
}

/// A connected remote node.
pub struct TcpPeer {
    conn: TcpStream,
    host: Arc<dyn PeerHost>,
    logger: Logger,
    /// Back-reference handed to spawned tasks and timer callbacks.
    this: Weak<TcpPeer>,
    state: RwLock<SessionState>,
    done_rx: Receiver<()>,
    done_tx: Mutex<Option<Sender<()>>>,
    finale: Once,
    send_q: Queue,
    p2p_send_q: Queue,
    hp_send_q: Queue,
}

impl TcpPeer {
    pub fn new(conn: TcpStream, host: Arc<dyn PeerHost>, logger: Logger) -> Arc<TcpPeer> {
        let (done_tx, done_rx) = bounded::<()>(0);
        Arc::new_cyclic(|this| TcpPeer {
            conn,
            host,
            logger,
            this: this.clone(),
            state: RwLock::new(SessionState {
                handshake: 0,
                version: None,
                last_block_index: 0,
                ping_sent: 0,
                ping_timer: None,
            }),
            done_rx,
            done_tx: Mutex::new(Some(done_tx)),
            finale: Once::new(),
            send_q: Queue::new(DEFAULT_QUEUE_SIZE),
            p2p_send_q: Queue::new(P2P_QUEUE_SIZE),
            hp_send_q: Queue::new(HP_QUEUE_SIZE),
        })
    }

    /// Spawns the reader and writer tasks. The session lives from here to
    /// the first error.
    pub fn start(&self) {
        let Some(peer) = self.this.upgrade() else {
            return;
        };
        thread::spawn(move || peer.run());
    }

    fn run(self: Arc<Self>) {
        self.host.register(&self);
        let writer = self.clone();
        thread::spawn(move || writer.handle_queues());
        // A new connection gets our version immediately.
        let err = match self.send_version() {
            Err(e) => e,
            Ok(()) => self.read_loop(),
        };
        self.disconnect(err);
    }

    fn read_loop(&self) -> PeerError {
        let stream = match self.conn.try_clone() {
            Ok(s) => s,
            Err(e) => return e.into(),
        };
        let Some(this) = self.this.upgrade() else {
            return PeerError::Gone;
        };
        let mut reader = BufReader::new(stream);
        loop {
            match Message::decode(&mut reader) {
                Err(e) if e.is_soft() => {
                    slog::warn!(self.logger, "not all headers were processed"; "err" => %e);
                }
                Err(e) => return e.into(),
                Ok(msg) => {
                    let command = msg.command.as_str();
                    if let Err(e) = self.host.handle_message(&this, msg) {
                        if self.handshaked() {
                            return PeerError::Handler {
                                command,
                                reason: e.to_string(),
                            };
                        }
                        return e;
                    }
                }
            }
        }
    }

    /// Drains the outbound queues: high-priority always goes first, the
    /// p2p queue is polled on three of every four iterations, and only an
    /// empty poll round blocks on the union of all three.
    fn handle_queues(self: Arc<Self>) {
        let mut skip_counter: u32 = 0;
        let err = loop {
            let mut msg: Option<Vec<u8>> = None;

            select! {
                recv(self.done_rx) -> _ => return,
                recv(self.hp_send_q.rx) -> m => if let Ok(m) = m { msg = Some(m) },
                default => {}
            }

            if msg.is_none() && skip_counter % P2P_SKIP_DIVISOR != 0 {
                select! {
                    recv(self.done_rx) -> _ => return,
                    recv(self.hp_send_q.rx) -> m => if let Ok(m) = m { msg = Some(m) },
                    recv(self.p2p_send_q.rx) -> m => if let Ok(m) = m { msg = Some(m) },
                    default => {}
                }
            }

            if msg.is_none() {
                select! {
                    recv(self.done_rx) -> _ => return,
                    recv(self.hp_send_q.rx) -> m => if let Ok(m) = m { msg = Some(m) },
                    recv(self.p2p_send_q.rx) -> m => if let Ok(m) = m { msg = Some(m) },
                    recv(self.send_q.rx) -> m => if let Ok(m) = m { msg = Some(m) },
                }
            }

            let Some(bytes) = msg else { continue };
            if let Err(e) = (&self.conn).write_all(&bytes) {
                break e;
            }
            skip_counter = skip_counter.wrapping_add(1);
        };
        self.disconnect(PeerError::Io(err));
    }

    fn write_msg(&self, msg: &Message) -> Result<(), PeerError> {
        (&self.conn)
            .write_all(&msg.to_bytes())
            .map_err(PeerError::from)
    }

    // -- handshake.

    pub fn handshaked(&self) -> bool {
        self.read_state().handshake == HANDSHAKED
    }

    /// Sends our version; valid exactly once per session.
    pub fn send_version(&self) -> Result<(), PeerError> {
        let msg = self.host.version_message();
        let mut st = self.write_state();
        if st.handshake & VERSION_SENT != 0 {
            return Err(PeerError::Handshake("already sent Version"));
        }
        self.write_msg(&msg)?;
        st.handshake |= VERSION_SENT;
        Ok(())
    }

    /// Records the peer's version; valid exactly once per session.
    pub fn handle_version(&self, version: VersionPayload) -> Result<(), PeerError> {
        let mut st = self.write_state();
        if st.handshake & VERSION_RECEIVED != 0 {
            return Err(PeerError::Handshake("already received Version"));
        }
        st.last_block_index = version.start_height;
        st.version = Some(version);
        st.handshake |= VERSION_RECEIVED;
        Ok(())
    }

    pub fn send_version_ack(&self, msg: Message) -> Result<(), PeerError> {
        let mut st = self.write_state();
        if st.handshake & VERSION_RECEIVED == 0 {
            return Err(PeerError::Handshake(
                "tried to send VersionAck, but no version received yet",
            ));
        }
        if st.handshake & VERSION_SENT == 0 {
            return Err(PeerError::Handshake(
                "tried to send VersionAck, but didn't send Version yet",
            ));
        }
        if st.handshake & VERACK_SENT != 0 {
            return Err(PeerError::Handshake("already sent VersionAck"));
        }
        self.write_msg(&msg)?;
        st.handshake |= VERACK_SENT;
        Ok(())
    }

    pub fn handle_version_ack(&self) -> Result<(), PeerError> {
        let mut st = self.write_state();
        if st.handshake & VERSION_SENT == 0 {
            return Err(PeerError::Handshake(
                "received VersionAck, but no version sent yet",
            ));
        }
        if st.handshake & VERSION_RECEIVED == 0 {
            return Err(PeerError::Handshake(
                "received VersionAck, but no version received yet",
            ));
        }
        if st.handshake & VERACK_RECEIVED != 0 {
            return Err(PeerError::Handshake("already received VersionAck"));
        }
        st.handshake |= VERACK_RECEIVED;
        Ok(())
    }

    // -- outbound queues.

    fn put_packet(&self, queue: &Sender<Vec<u8>>, msg: Vec<u8>) -> Result<(), PeerError> {
        if !self.handshaked() {
            return Err(PeerError::StateMismatch);
        }
        // The enqueue races the done signal so a full queue on a dying
        // session cannot block forever.
        select! {
            send(queue, msg) -> res => res.map_err(|_| PeerError::Gone),
            recv(self.done_rx) -> _ => Err(PeerError::Gone),
        }
    }

    pub fn enqueue_packet(&self, msg: Vec<u8>) -> Result<(), PeerError> {
        self.put_packet(&self.send_q.tx, msg)
    }

    pub fn enqueue_message(&self, msg: &Message) -> Result<(), PeerError> {
        self.enqueue_packet(msg.to_bytes())
    }

    pub fn enqueue_p2p_packet(&self, msg: Vec<u8>) -> Result<(), PeerError> {
        self.put_packet(&self.p2p_send_q.tx, msg)
    }

    pub fn enqueue_p2p_message(&self, msg: &Message) -> Result<(), PeerError> {
        self.enqueue_p2p_packet(msg.to_bytes())
    }

    pub fn enqueue_hp_packet(&self, msg: Vec<u8>) -> Result<(), PeerError> {
        self.put_packet(&self.hp_send_q.tx, msg)
    }

    pub fn enqueue_hp_message(&self, msg: &Message) -> Result<(), PeerError> {
        self.enqueue_hp_packet(msg.to_bytes())
    }

    // -- keepalive.

    /// Queues a ping and arms the timeout timer; the timer firing before
    /// the matching pong ends the session.
    pub fn send_ping(&self, msg: Message) -> Result<(), PeerError> {
        if !self.handshaked() {
            return Err(PeerError::StateMismatch);
        }
        {
            let mut st = self.write_state();
            st.ping_sent += 1;
            if st.ping_timer.is_none() {
                let weak = self.this.clone();
                let timeout = self.host.ping_timeout();
                st.ping_timer = Some(Timer::after(timeout, move || {
                    if let Some(peer) = weak.upgrade() {
                        {
                            let mut st = peer.write_state();
                            st.ping_timer = None;
                            st.ping_sent = 0;
                        }
                        peer.disconnect(PeerError::PingTimeout);
                    }
                }));
            }
        }
        self.enqueue_message(&msg)
    }

    /// Accounts for one pong. Failing to stop the timer means it already
    /// fired; a pong with no outstanding ping is a protocol violation.
    pub fn handle_pong(&self, pong: &PingPayload) -> Result<(), PeerError> {
        let mut st = self.write_state();
        if let Some(timer) = st.ping_timer.take() {
            if !timer.stop() {
                return Err(PeerError::PingTimeout);
            }
        }
        st.ping_sent -= 1;
        if st.ping_sent < 0 {
            return Err(PeerError::UnexpectedPong);
        }
        st.last_block_index = pong.last_block_index;
        Ok(())
    }

    // -- protocol heartbeat.

    /// Long-running loop ticking the host for sync work; only good to run
    /// after the handshake.
    pub fn start_protocol(&self) {
        {
            let st = self.read_state();
            slog::info!(self.logger, "started protocol";
                "addr" => self.remote_addr_display(),
                "user_agent" => st.version.as_ref().map(|v| v.user_agent.clone()).unwrap_or_default(),
                "start_height" => st.version.as_ref().map(|v| v.start_height).unwrap_or_default(),
            );
        }
        let Some(peer) = self.this.upgrade() else {
            return;
        };
        thread::spawn(move || {
            let tick = peer.host.proto_tick_interval();
            loop {
                select! {
                    recv(peer.done_rx) -> _ => return,
                    default(tick) => {
                        if let Err(e) = peer.host.protocol_tick(&peer) {
                            peer.disconnect(e);
                            return;
                        }
                    }
                }
            }
        });
    }

    // -- lifecycle.

    /// Ends the session: closes the done signal, shuts the socket down and
    /// reports the terminating error to the host. Idempotent; only the
    /// first call has any effect.
    pub fn disconnect(&self, err: PeerError) {
        self.finale.call_once(|| {
            self.done_tx
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            let _ = self.conn.shutdown(Shutdown::Both);
            if let Some(this) = self.this.upgrade() {
                self.host.unregister(&this, &err);
            }
        });
    }

    // -- accessors.

    pub fn version(&self) -> Option<VersionPayload> {
        self.read_state().version.clone()
    }

    pub fn last_block_index(&self) -> u32 {
        self.read_state().last_block_index
    }

    pub fn remote_addr(&self) -> io::Result<SocketAddr> {
        self.conn.peer_addr()
    }

    fn remote_addr_display(&self) -> String {
        self.conn
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "<unknown>".into())
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, SessionState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, SessionState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}
