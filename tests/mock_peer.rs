//! Scripted BitTorrent peer for integration tests
//!
//! Listens on a loopback port, performs the responder handshake and plays
//! one of two roles: a seeder that advertises pieces and answers requests
//! (optionally with corrupt data), or a leecher that asks for blocks.
//! Every inbound message is recorded for later assertions.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// Simplified decoded message, recorded as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { index: u32 },
    Bitfield { bytes: Vec<u8> },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, len: u32 },
    Cancel { index: u32, begin: u32, length: u32 },
    Other { id: u8 },
}

/// Mock peer behavior.
#[derive(Clone)]
pub struct MockPeerConfig {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub num_pieces: usize,
    /// Piece index -> full piece data to serve
    pub piece_data: HashMap<u32, Vec<u8>>,
    /// Advertise the fast extension and open with HaveAll
    pub have_all: bool,
    /// Unchoke immediately after the bitfield
    pub auto_unchoke: bool,
    /// Serve garbage instead of real data
    pub corrupt: bool,
    /// Act as a leecher: declare interest and request this block once
    /// unchoked
    pub leech_request: Option<(u32, u32, u32)>,
}

impl MockPeerConfig {
    pub fn new(info_hash: [u8; 20], num_pieces: usize) -> Self {
        let mut peer_id = [0u8; 20];
        peer_id[..8].copy_from_slice(b"-MK0001-");
        for (i, byte) in peer_id[8..].iter_mut().enumerate() {
            *byte = i as u8;
        }
        Self {
            info_hash,
            peer_id,
            num_pieces,
            piece_data: HashMap::new(),
            have_all: false,
            auto_unchoke: true,
            corrupt: false,
            leech_request: None,
        }
    }

    pub fn with_piece(mut self, index: u32, data: Vec<u8>) -> Self {
        self.piece_data.insert(index, data);
        self
    }

    pub fn with_have_all(mut self) -> Self {
        self.have_all = true;
        self
    }

    pub fn with_corrupt_data(mut self) -> Self {
        self.corrupt = true;
        self
    }

    pub fn as_leech(mut self, index: u32, begin: u32, length: u32) -> Self {
        self.leech_request = Some((index, begin, length));
        self
    }
}

/// A listening mock peer. Call [`MockPeer::start`] to begin accepting.
pub struct MockPeer {
    config: MockPeerConfig,
    listener: TcpListener,
    received: Arc<Mutex<Vec<Recorded>>>,
}

impl MockPeer {
    pub async fn bind(config: MockPeerConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        Ok(Self {
            config,
            listener,
            received: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.listener.local_addr().unwrap()
    }

    /// Everything received so far, in arrival order.
    pub fn received(&self) -> Vec<Recorded> {
        self.received.lock().clone()
    }

    /// Count of received messages matching a predicate.
    pub fn count_received(&self, predicate: impl Fn(&Recorded) -> bool) -> usize {
        self.received.lock().iter().filter(|m| predicate(m)).count()
    }

    /// Accept connections forever, each served on its own task.
    pub fn start(self: Arc<Self>) {
        let peer = Arc::clone(&self);
        tokio::spawn(async move {
            loop {
                match peer.listener.accept().await {
                    Ok((stream, _)) => {
                        let peer = Arc::clone(&peer);
                        tokio::spawn(async move {
                            if let Err(e) = peer.serve(stream).await {
                                tracing::debug!("mock peer connection ended: {}", e);
                            }
                        });
                    }
                    Err(_) => break,
                }
            }
        });
    }

    async fn serve(&self, mut stream: TcpStream) -> std::io::Result<()> {
        self.handshake(&mut stream).await?;

        if self.config.have_all {
            send_message(&mut stream, 0x0E, &[]).await?; // HaveAll
        } else {
            let bitfield = self.bitfield_bytes();
            send_message(&mut stream, 5, &bitfield).await?;
        }
        if self.config.auto_unchoke {
            send_message(&mut stream, 1, &[]).await?;
        }
        if self.config.leech_request.is_some() {
            send_message(&mut stream, 2, &[]).await?; // Interested
        }

        let mut leech_sent = false;
        loop {
            let (id, payload) = match read_message(&mut stream).await {
                Ok(frame) => frame,
                Err(e) => return Err(e),
            };
            let recorded = decode(id, &payload);
            self.received.lock().push(recorded.clone());

            match recorded {
                Recorded::Request {
                    index,
                    begin,
                    length,
                } => {
                    if let Some(block) = self.block_for(index, begin, length) {
                        let mut body = Vec::with_capacity(8 + block.len());
                        body.extend_from_slice(&index.to_be_bytes());
                        body.extend_from_slice(&begin.to_be_bytes());
                        body.extend_from_slice(&block);
                        send_message(&mut stream, 7, &body).await?;
                    }
                }
                Recorded::Unchoke => {
                    if let Some((index, begin, length)) = self.config.leech_request {
                        if !leech_sent {
                            leech_sent = true;
                            let mut body = Vec::with_capacity(12);
                            body.extend_from_slice(&index.to_be_bytes());
                            body.extend_from_slice(&begin.to_be_bytes());
                            body.extend_from_slice(&length.to_be_bytes());
                            send_message(&mut stream, 6, &body).await?;
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn block_for(&self, index: u32, begin: u32, length: u32) -> Option<Vec<u8>> {
        if self.config.corrupt {
            return Some(vec![0xFF; length as usize]);
        }
        let piece = self.config.piece_data.get(&index)?;
        let start = begin as usize;
        let end = start + length as usize;
        if end > piece.len() {
            return None;
        }
        Some(piece[start..end].to_vec())
    }

    fn bitfield_bytes(&self) -> Vec<u8> {
        bitfield_bytes(&self.config)
    }

    async fn handshake(&self, stream: &mut TcpStream) -> std::io::Result<()> {
        let mut theirs = [0u8; 68];
        stream.read_exact(&mut theirs).await?;

        if theirs[0] != 19 || &theirs[1..20] != PROTOCOL_STRING {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "bad protocol string",
            ));
        }
        if theirs[28..48] != self.config.info_hash {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "info-hash mismatch",
            ));
        }

        let mut reply = Vec::with_capacity(68);
        reply.push(19);
        reply.extend_from_slice(PROTOCOL_STRING);
        let mut reserved = [0u8; 8];
        if self.config.have_all {
            reserved[7] |= 0x04; // fast extension
        }
        reply.extend_from_slice(&reserved);
        reply.extend_from_slice(&self.config.info_hash);
        reply.extend_from_slice(&self.config.peer_id);
        stream.write_all(&reply).await
    }
}

async fn read_message(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Ok((u8::MAX, Vec::new())); // keep-alive marker
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    let id = body[0];
    Ok((id, body[1..].to_vec()))
}

async fn send_message(stream: &mut TcpStream, id: u8, payload: &[u8]) -> std::io::Result<()> {
    let mut frame = Vec::with_capacity(5 + payload.len());
    frame.extend_from_slice(&(1 + payload.len() as u32).to_be_bytes());
    frame.push(id);
    frame.extend_from_slice(payload);
    stream.write_all(&frame).await
}

fn bitfield_bytes(config: &MockPeerConfig) -> Vec<u8> {
    let mut bytes = vec![0u8; config.num_pieces.div_ceil(8)];
    for index in config.piece_data.keys() {
        let index = *index as usize;
        if index < config.num_pieces {
            bytes[index / 8] |= 0x80 >> (index % 8);
        }
    }
    bytes
}

fn u32_at(payload: &[u8], at: usize) -> u32 {
    u32::from_be_bytes(payload[at..at + 4].try_into().unwrap())
}

fn decode(id: u8, payload: &[u8]) -> Recorded {
    match id {
        u8::MAX => Recorded::KeepAlive,
        0 => Recorded::Choke,
        1 => Recorded::Unchoke,
        2 => Recorded::Interested,
        3 => Recorded::NotInterested,
        4 if payload.len() >= 4 => Recorded::Have {
            index: u32_at(payload, 0),
        },
        5 => Recorded::Bitfield {
            bytes: payload.to_vec(),
        },
        6 if payload.len() >= 12 => Recorded::Request {
            index: u32_at(payload, 0),
            begin: u32_at(payload, 4),
            length: u32_at(payload, 8),
        },
        7 if payload.len() >= 8 => Recorded::Piece {
            index: u32_at(payload, 0),
            begin: u32_at(payload, 4),
            len: (payload.len() - 8) as u32,
        },
        8 if payload.len() >= 12 => Recorded::Cancel {
            index: u32_at(payload, 0),
            begin: u32_at(payload, 4),
            length: u32_at(payload, 8),
        },
        other => Recorded::Other { id: other },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_peer_binds() {
        let config = MockPeerConfig::new([1u8; 20], 4);
        let peer = MockPeer::bind(config).await.unwrap();
        assert!(peer.addr().port() > 0);
        assert!(peer.received().is_empty());
    }

    #[test]
    fn test_bitfield_bytes() {
        let config = MockPeerConfig::new([1u8; 20], 10)
            .with_piece(0, vec![0])
            .with_piece(9, vec![0]);
        // Bit 0 is the MSB of byte 0; bit 9 the second bit of byte 1
        assert_eq!(bitfield_bytes(&config), vec![0b1000_0000, 0b0100_0000]);
    }
}
