//! Peer-to-peer session machinery.
//!
//! [`message`] frames the wire protocol; [`peer`] runs the four-way
//! handshake, the prioritized outbound queues and the keepalive timer over
//! one TCP connection. The server side of the protocol is a collaborator
//! behind the [`peer::PeerHost`] trait.

pub mod message;
pub mod peer;
pub mod timer;

pub use message::{Command, Message, MessageError, PingPayload, VersionPayload};
pub use peer::{PeerError, PeerHost, TcpPeer};
