//! Peer wire messages
//!
//! Length-prefixed message framing per BEP 3 (`<u32 length><u8 id><payload>`,
//! zero length is a keep-alive) plus the fast extension message set (BEP 6).

use crate::error::{EngineError, ProtocolErrorKind, Result};

/// Largest frame we accept: a block plus header slack.
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024;

/// A decoded peer wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Zero-length frame
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    /// The sender acquired piece `index`
    Have { index: u32 },
    /// Raw bitfield payload; only valid as the first message
    Bitfield { bytes: Vec<u8> },
    /// Request a block
    Request { index: u32, begin: u32, length: u32 },
    /// A block of piece data
    Piece {
        index: u32,
        begin: u32,
        block: Vec<u8>,
    },
    /// Withdraw a pending request
    Cancel { index: u32, begin: u32, length: u32 },
    /// DHT listen port hint (BEP 5); forwarded, never acted on here
    Port { port: u16 },

    // Fast extension (BEP 6)
    SuggestPiece { index: u32 },
    /// Replaces the initial bitfield: sender has every piece
    HaveAll,
    /// Replaces the initial bitfield: sender has nothing
    HaveNone,
    /// The sender will not serve this request
    Reject { index: u32, begin: u32, length: u32 },
    /// This piece may be requested even while choked
    AllowedFast { index: u32 },

    /// Message id we do not understand; ignored
    Unknown { id: u8, payload: Vec<u8> },
}

mod id {
    pub const CHOKE: u8 = 0;
    pub const UNCHOKE: u8 = 1;
    pub const INTERESTED: u8 = 2;
    pub const NOT_INTERESTED: u8 = 3;
    pub const HAVE: u8 = 4;
    pub const BITFIELD: u8 = 5;
    pub const REQUEST: u8 = 6;
    pub const PIECE: u8 = 7;
    pub const CANCEL: u8 = 8;
    pub const PORT: u8 = 9;
    pub const SUGGEST_PIECE: u8 = 0x0D;
    pub const HAVE_ALL: u8 = 0x0E;
    pub const HAVE_NONE: u8 = 0x0F;
    pub const REJECT: u8 = 0x10;
    pub const ALLOWED_FAST: u8 = 0x11;
}

fn violation(message: impl Into<String>) -> EngineError {
    EngineError::protocol(ProtocolErrorKind::Violation, message)
}

fn read_u32(payload: &[u8], at: usize) -> Result<u32> {
    payload
        .get(at..at + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| violation("message payload too short"))
}

impl PeerMessage {
    /// True for the fast-extension messages that require negotiation.
    pub fn requires_fast_extension(&self) -> bool {
        matches!(
            self,
            Self::SuggestPiece { .. }
                | Self::HaveAll
                | Self::HaveNone
                | Self::Reject { .. }
                | Self::AllowedFast { .. }
        )
    }

    /// Encode including the length prefix.
    pub fn encode(&self) -> Vec<u8> {
        fn frame(id: u8, payload_len: usize) -> Vec<u8> {
            let mut buf = Vec::with_capacity(5 + payload_len);
            buf.extend_from_slice(&(1 + payload_len as u32).to_be_bytes());
            buf.push(id);
            buf
        }

        fn triple(id: u8, a: u32, b: u32, c: u32) -> Vec<u8> {
            let mut buf = frame(id, 12);
            buf.extend_from_slice(&a.to_be_bytes());
            buf.extend_from_slice(&b.to_be_bytes());
            buf.extend_from_slice(&c.to_be_bytes());
            buf
        }

        fn single(id: u8, value: u32) -> Vec<u8> {
            let mut buf = frame(id, 4);
            buf.extend_from_slice(&value.to_be_bytes());
            buf
        }

        match self {
            Self::KeepAlive => vec![0, 0, 0, 0],
            Self::Choke => frame(id::CHOKE, 0),
            Self::Unchoke => frame(id::UNCHOKE, 0),
            Self::Interested => frame(id::INTERESTED, 0),
            Self::NotInterested => frame(id::NOT_INTERESTED, 0),
            Self::Have { index } => single(id::HAVE, *index),
            Self::Bitfield { bytes } => {
                let mut buf = frame(id::BITFIELD, bytes.len());
                buf.extend_from_slice(bytes);
                buf
            }
            Self::Request {
                index,
                begin,
                length,
            } => triple(id::REQUEST, *index, *begin, *length),
            Self::Piece {
                index,
                begin,
                block,
            } => {
                let mut buf = frame(id::PIECE, 8 + block.len());
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(block);
                buf
            }
            Self::Cancel {
                index,
                begin,
                length,
            } => triple(id::CANCEL, *index, *begin, *length),
            Self::Port { port } => {
                let mut buf = frame(id::PORT, 2);
                buf.extend_from_slice(&port.to_be_bytes());
                buf
            }
            Self::SuggestPiece { index } => single(id::SUGGEST_PIECE, *index),
            Self::HaveAll => frame(id::HAVE_ALL, 0),
            Self::HaveNone => frame(id::HAVE_NONE, 0),
            Self::Reject {
                index,
                begin,
                length,
            } => triple(id::REJECT, *index, *begin, *length),
            Self::AllowedFast { index } => single(id::ALLOWED_FAST, *index),
            Self::Unknown { id, payload } => {
                let mut buf = frame(*id, payload.len());
                buf.extend_from_slice(payload);
                buf
            }
        }
    }

    /// Decode a frame body (everything after the length prefix). An empty
    /// body is a keep-alive.
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.is_empty() {
            return Ok(Self::KeepAlive);
        }
        let msg_id = body[0];
        let payload = &body[1..];

        let msg = match msg_id {
            id::CHOKE => Self::Choke,
            id::UNCHOKE => Self::Unchoke,
            id::INTERESTED => Self::Interested,
            id::NOT_INTERESTED => Self::NotInterested,
            id::HAVE => Self::Have {
                index: read_u32(payload, 0)?,
            },
            id::BITFIELD => Self::Bitfield {
                bytes: payload.to_vec(),
            },
            id::REQUEST => Self::Request {
                index: read_u32(payload, 0)?,
                begin: read_u32(payload, 4)?,
                length: read_u32(payload, 8)?,
            },
            id::PIECE => {
                if payload.len() < 8 {
                    return Err(violation("piece message too short"));
                }
                Self::Piece {
                    index: read_u32(payload, 0)?,
                    begin: read_u32(payload, 4)?,
                    block: payload[8..].to_vec(),
                }
            }
            id::CANCEL => Self::Cancel {
                index: read_u32(payload, 0)?,
                begin: read_u32(payload, 4)?,
                length: read_u32(payload, 8)?,
            },
            id::PORT => {
                if payload.len() < 2 {
                    return Err(violation("port message too short"));
                }
                Self::Port {
                    port: u16::from_be_bytes([payload[0], payload[1]]),
                }
            }
            id::SUGGEST_PIECE => Self::SuggestPiece {
                index: read_u32(payload, 0)?,
            },
            id::HAVE_ALL => Self::HaveAll,
            id::HAVE_NONE => Self::HaveNone,
            id::REJECT => Self::Reject {
                index: read_u32(payload, 0)?,
                begin: read_u32(payload, 4)?,
                length: read_u32(payload, 8)?,
            },
            id::ALLOWED_FAST => Self::AllowedFast {
                index: read_u32(payload, 0)?,
            },
            other => Self::Unknown {
                id: other,
                payload: payload.to_vec(),
            },
        };
        Ok(msg)
    }
}
