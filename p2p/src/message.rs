//! Wire message framing.
//!
//! Every message is `magic (u32-LE) || command (12 bytes, zero-padded
//! ASCII) || payload length (u32-LE) || checksum (4 bytes) || payload`.
//! The checksum is the first four bytes of the double-SHA256 of the
//! payload. Past framing the session treats payloads as opaque; only the
//! handshake and keepalive payloads are decoded here.

use std::io::{self, Read};

use thiserror::Error;

use chain::util::codec::{CodecError, Reader, Writer};
use chain::util::hash::checksum4;

/// Hard cap on a single payload.
pub const MAX_PAYLOAD_SIZE: u32 = 0x0200_0000;
/// Headers per `headers` message; larger batches are a soft decode error.
pub const MAX_HEADERS_COUNT: u64 = 2000;

const COMMAND_SIZE: usize = 12;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("payload checksum mismatch")]
    ChecksumMismatch,
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("payload of {0} bytes exceeds the limit")]
    PayloadTooLarge(u32),
    /// Soft error: the batch is oversized but the frame itself was read
    /// fully, so the session may keep going.
    #[error("too many headers in one message")]
    TooManyHeaders,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed payload: {0}")]
    Codec(#[from] CodecError),
}

impl MessageError {
    /// Soft errors are logged by the read loop instead of ending the
    /// session.
    pub fn is_soft(&self) -> bool {
        matches!(self, MessageError::TooManyHeaders)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Version,
    VerAck,
    GetAddr,
    Addr,
    Ping,
    Pong,
    Inv,
    GetData,
    GetHeaders,
    Headers,
    GetBlocks,
    Block,
    Transaction,
    Mempool,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Version => "version",
            Command::VerAck => "verack",
            Command::GetAddr => "getaddr",
            Command::Addr => "addr",
            Command::Ping => "ping",
            Command::Pong => "pong",
            Command::Inv => "inv",
            Command::GetData => "getdata",
            Command::GetHeaders => "getheaders",
            Command::Headers => "headers",
            Command::GetBlocks => "getblocks",
            Command::Block => "block",
            Command::Transaction => "tx",
            Command::Mempool => "mempool",
        }
    }

    fn from_str(s: &str) -> Option<Command> {
        Some(match s {
            "version" => Command::Version,
            "verack" => Command::VerAck,
            "getaddr" => Command::GetAddr,
            "addr" => Command::Addr,
            "ping" => Command::Ping,
            "pong" => Command::Pong,
            "inv" => Command::Inv,
            "getdata" => Command::GetData,
            "getheaders" => Command::GetHeaders,
            "headers" => Command::Headers,
            "getblocks" => Command::GetBlocks,
            "block" => Command::Block,
            "tx" => Command::Transaction,
            "mempool" => Command::Mempool,
            _ => return None,
        })
    }

    fn to_wire(self) -> [u8; COMMAND_SIZE] {
        let mut out = [0u8; COMMAND_SIZE];
        let s = self.as_str().as_bytes();
        out[..s.len()].copy_from_slice(s);
        out
    }

    fn from_wire(raw: &[u8; COMMAND_SIZE]) -> Result<Command, MessageError> {
        let end = raw.iter().position(|b| *b == 0).unwrap_or(COMMAND_SIZE);
        let s = std::str::from_utf8(&raw[..end])
            .map_err(|_| MessageError::UnknownCommand(format!("{:02x?}", raw)))?;
        Command::from_str(s).ok_or_else(|| MessageError::UnknownCommand(s.to_string()))
    }
}

/// A framed wire message with its payload still serialized.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub magic: u32,
    pub command: Command,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(magic: u32, command: Command, payload: Vec<u8>) -> Message {
        Message {
            magic,
            command,
            payload,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_u32_le(self.magic);
        w.write_bytes(&self.command.to_wire());
        w.write_u32_le(self.payload.len() as u32);
        w.write_bytes(&checksum4(&self.payload));
        w.write_bytes(&self.payload);
        w.into_bytes()
    }

    /// Reads one framed message. The frame is always consumed in full, so
    /// a soft error leaves the stream positioned at the next frame.
    pub fn decode<R: Read>(r: &mut R) -> Result<Message, MessageError> {
        let mut header = [0u8; 4 + COMMAND_SIZE + 4 + 4];
        r.read_exact(&mut header)?;
        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let mut raw_command = [0u8; COMMAND_SIZE];
        raw_command.copy_from_slice(&header[4..4 + COMMAND_SIZE]);
        let length = u32::from_le_bytes([header[16], header[17], header[18], header[19]]);
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&header[20..24]);

        if length > MAX_PAYLOAD_SIZE {
            return Err(MessageError::PayloadTooLarge(length));
        }
        let mut payload = vec![0u8; length as usize];
        r.read_exact(&mut payload)?;
        if checksum4(&payload) != checksum {
            return Err(MessageError::ChecksumMismatch);
        }
        let command = Command::from_wire(&raw_command)?;
        if command == Command::Headers {
            let mut reader = Reader::new(&payload);
            if reader.read_var_uint()? > MAX_HEADERS_COUNT {
                return Err(MessageError::TooManyHeaders);
            }
        }
        Ok(Message {
            magic,
            command,
            payload,
        })
    }
}

/// Version handshake payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionPayload {
    pub version: u32,
    pub services: u64,
    pub timestamp: u32,
    pub port: u16,
    pub nonce: u32,
    pub user_agent: String,
    pub start_height: u32,
    pub relay: bool,
}

impl VersionPayload {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_u32_le(self.version);
        w.write_u64_le(self.services);
        w.write_u32_le(self.timestamp);
        w.write_u16_le(self.port);
        w.write_u32_le(self.nonce);
        w.write_var_string(&self.user_agent);
        w.write_u32_le(self.start_height);
        w.write_u8(self.relay as u8);
        w.into_bytes()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, MessageError> {
        let mut r = Reader::new(data);
        let payload = VersionPayload {
            version: r.read_u32_le()?,
            services: r.read_u64_le()?,
            timestamp: r.read_u32_le()?,
            port: r.read_u16_le()?,
            nonce: r.read_u32_le()?,
            user_agent: r.read_var_string()?,
            start_height: r.read_u32_le()?,
            relay: r.read_u8()? != 0,
        };
        r.ensure_exhausted().map_err(MessageError::from)?;
        Ok(payload)
    }
}

/// Ping/pong payload carrying the peer's chain height.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PingPayload {
    pub last_block_index: u32,
    pub timestamp: u32,
    pub nonce: u32,
}

impl PingPayload {
    pub fn new(last_block_index: u32, timestamp: u32) -> Self {
        PingPayload {
            last_block_index,
            timestamp,
            nonce: rand::random(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_u32_le(self.last_block_index);
        w.write_u32_le(self.timestamp);
        w.write_u32_le(self.nonce);
        w.into_bytes()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, MessageError> {
        let mut r = Reader::new(data);
        let payload = PingPayload {
            last_block_index: r.read_u32_le()?,
            timestamp: r.read_u32_le()?,
            nonce: r.read_u32_le()?,
        };
        r.ensure_exhausted().map_err(MessageError::from)?;
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: u32 = 0x74_65_73_74;

    #[test]
    fn frame_round_trip() {
        let msg = Message::new(MAGIC, Command::Inv, vec![1, 2, 3]);
        let bytes = msg.to_bytes();
        let decoded = Message::decode(&mut bytes.as_slice()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn corrupt_checksum_is_rejected() {
        let msg = Message::new(MAGIC, Command::Block, b"payload".to_vec());
        let mut bytes = msg.to_bytes();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(matches!(
            Message::decode(&mut bytes.as_slice()),
            Err(MessageError::ChecksumMismatch)
        ));
    }

    #[test]
    fn unknown_command_is_rejected() {
        let msg = Message::new(MAGIC, Command::Ping, vec![]);
        let mut bytes = msg.to_bytes();
        bytes[4..8].copy_from_slice(b"nope");
        assert!(matches!(
            Message::decode(&mut bytes.as_slice()),
            Err(MessageError::UnknownCommand(_))
        ));
    }

    #[test]
    fn oversized_header_batch_is_soft() {
        let mut w = Writer::new();
        w.write_var_uint(MAX_HEADERS_COUNT + 1);
        let msg = Message::new(MAGIC, Command::Headers, w.into_bytes());
        let bytes = msg.to_bytes();
        let err = Message::decode(&mut bytes.as_slice()).unwrap_err();
        assert!(err.is_soft());

        // The frame was consumed in full; the next one decodes cleanly.
        let next = Message::new(MAGIC, Command::Ping, vec![]);
        let mut stream = msg.to_bytes();
        stream.extend(next.to_bytes());
        let mut cursor = stream.as_slice();
        assert!(Message::decode(&mut cursor).unwrap_err().is_soft());
        assert_eq!(Message::decode(&mut cursor).unwrap(), next);
    }

    #[test]
    fn version_payload_round_trip() {
        let payload = VersionPayload {
            version: 0,
            services: 1,
            timestamp: 1_600_000_000,
            port: 10333,
            nonce: 0xdead_beef,
            user_agent: "/node:0.4.0/".into(),
            start_height: 1234,
            relay: true,
        };
        assert_eq!(
            VersionPayload::from_bytes(&payload.to_bytes()).unwrap(),
            payload
        );
    }

    #[test]
    fn ping_payload_round_trip() {
        let payload = PingPayload::new(77, 1_600_000_000);
        assert_eq!(PingPayload::from_bytes(&payload.to_bytes()).unwrap(), payload);
    }
}
