//! Peer session tasks
//!
//! Each connected peer is served by a session: the handshake followed by a
//! reader half that forwards decoded frames into the coordinator's fan-in
//! channel and a writer half that drains the coordinator's command queue.
//! The session owns the socket; the coordinator never touches I/O.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::message::{PeerMessage, MAX_MESSAGE_SIZE};
use super::PeerKey;
use crate::error::{EngineError, ProtocolErrorKind, Result};
use crate::limiter::RateLimits;
use crate::types::{InfoHash, PeerId};

/// BEP 3 protocol string.
const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// pstrlen + pstr + reserved + info_hash + peer_id
const HANDSHAKE_SIZE: usize = 1 + 19 + 8 + 20 + 20;

/// Write timeout for individual frames.
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// The eight reserved handshake bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reserved([u8; 8]);

impl Reserved {
    /// The bits we advertise: fast extension (BEP 6) and the extension
    /// protocol marker (BEP 10). Unknown bits from peers are ignored.
    pub fn ours() -> Self {
        let mut bytes = [0u8; 8];
        bytes[7] |= 0x04; // fast extension
        bytes[5] |= 0x10; // extension protocol
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Fast extension negotiated (BEP 6)?
    pub fn supports_fast(&self) -> bool {
        self.0[7] & 0x04 != 0
    }

    /// Extension protocol marker (BEP 10)?
    pub fn supports_extension_protocol(&self) -> bool {
        self.0[5] & 0x10 != 0
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Handshake failed, timed out, or carried the wrong info-hash
    Handshake(String),
    /// Socket-level failure or orderly remote close
    Transport(String),
    /// No inbound traffic within the idle window
    IdleTimeout,
    /// Oversized or malformed frame
    Violation(String),
    /// The coordinator asked us to stop
    Shutdown,
}

impl CloseReason {
    /// Offenses that warrant blacklisting the address.
    pub fn is_violation(&self) -> bool {
        matches!(self, Self::Handshake(_) | Self::Violation(_))
    }
}

/// Events a session feeds into the coordinator's fan-in channel.
#[derive(Debug)]
pub enum PeerEvent {
    /// Handshake completed
    Connected {
        key: PeerKey,
        addr: SocketAddr,
        peer_id: PeerId,
        fast: bool,
    },
    /// A decoded wire message
    Message { key: PeerKey, msg: PeerMessage },
    /// An upload task finished sending a block to this peer
    Uploaded { key: PeerKey, bytes: u64 },
    /// The session ended; always the session's final event
    Closed { key: PeerKey, reason: CloseReason },
}

/// Commands the coordinator sends to a session's writer half.
#[derive(Debug)]
pub enum PeerCommand {
    Send(PeerMessage),
    Close,
}

/// Timeouts a session needs, snapshot from the engine config.
#[derive(Debug, Clone, Copy)]
pub struct SessionTimeouts {
    pub connect: Duration,
    pub handshake: Duration,
    pub keepalive: Duration,
    pub idle: Duration,
}

/// Everything a session task needs.
pub struct SessionParams {
    pub key: PeerKey,
    pub addr: SocketAddr,
    pub info_hash: InfoHash,
    pub our_peer_id: PeerId,
    pub events: mpsc::Sender<PeerEvent>,
    pub commands: mpsc::Receiver<PeerCommand>,
    pub limits: RateLimits,
    pub cancel: CancellationToken,
    pub timeouts: SessionTimeouts,
}

/// Dial a peer and run the session until it closes.
pub async fn run_outbound(params: SessionParams) {
    let stream = match timeout(params.timeouts.connect, TcpStream::connect(params.addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            let _ = params
                .events
                .send(PeerEvent::Closed {
                    key: params.key,
                    reason: CloseReason::Transport(e.to_string()),
                })
                .await;
            return;
        }
        Err(_) => {
            let _ = params
                .events
                .send(PeerEvent::Closed {
                    key: params.key,
                    reason: CloseReason::Transport("connect timeout".to_string()),
                })
                .await;
            return;
        }
    };
    run_session(stream, params, true).await;
}

/// Serve an accepted connection; the responder side of the handshake.
pub async fn run_inbound(stream: TcpStream, params: SessionParams) {
    run_session(stream, params, false).await;
}

async fn run_session(mut stream: TcpStream, params: SessionParams, initiator: bool) {
    let SessionParams {
        key,
        addr,
        info_hash,
        our_peer_id,
        events,
        commands,
        limits,
        cancel,
        timeouts,
    } = params;

    let handshake = tokio::select! {
        result = timeout(
            timeouts.handshake,
            exchange_handshake(&mut stream, info_hash, our_peer_id, initiator),
        ) => match result {
            Ok(Ok(handshake)) => handshake,
            Ok(Err(e)) => {
                tracing::debug!("peer {} handshake failed: {}", addr, e);
                let _ = events
                    .send(PeerEvent::Closed {
                        key,
                        reason: CloseReason::Handshake(e.to_string()),
                    })
                    .await;
                return;
            }
            Err(_) => {
                let _ = events
                    .send(PeerEvent::Closed {
                        key,
                        reason: CloseReason::Handshake("handshake timeout".to_string()),
                    })
                    .await;
                return;
            }
        },
        _ = cancel.cancelled() => {
            let _ = events
                .send(PeerEvent::Closed { key, reason: CloseReason::Shutdown })
                .await;
            return;
        }
    };

    let fast = handshake.reserved.supports_fast();
    if events
        .send(PeerEvent::Connected {
            key,
            addr,
            peer_id: handshake.peer_id,
            fast,
        })
        .await
        .is_err()
    {
        return;
    }

    let (read_half, write_half) = stream.into_split();

    // The writer gets a child token so the reader can stop it on exit.
    let writer_cancel = cancel.child_token();
    let writer = tokio::spawn(write_loop(
        write_half,
        commands,
        limits.clone(),
        writer_cancel.clone(),
        timeouts.keepalive,
    ));

    let reason = read_loop(read_half, key, &events, &limits, &cancel, timeouts.idle).await;

    writer_cancel.cancel();
    let _ = writer.await;

    let _ = events.send(PeerEvent::Closed { key, reason }).await;
}

#[derive(Debug)]
struct HandshakeReply {
    reserved: Reserved,
    peer_id: PeerId,
}

async fn exchange_handshake(
    stream: &mut TcpStream,
    info_hash: InfoHash,
    our_peer_id: PeerId,
    initiator: bool,
) -> Result<HandshakeReply> {
    if initiator {
        stream
            .write_all(&encode_handshake(info_hash, our_peer_id))
            .await?;
        read_handshake(stream, info_hash).await
    } else {
        let reply = read_handshake(stream, info_hash).await?;
        stream
            .write_all(&encode_handshake(info_hash, our_peer_id))
            .await?;
        Ok(reply)
    }
}

fn encode_handshake(info_hash: InfoHash, peer_id: PeerId) -> [u8; HANDSHAKE_SIZE] {
    let mut buf = [0u8; HANDSHAKE_SIZE];
    buf[0] = PROTOCOL_STRING.len() as u8;
    buf[1..20].copy_from_slice(PROTOCOL_STRING);
    buf[20..28].copy_from_slice(&Reserved::ours().0);
    buf[28..48].copy_from_slice(&info_hash);
    buf[48..68].copy_from_slice(&peer_id);
    buf
}

async fn read_handshake(stream: &mut TcpStream, info_hash: InfoHash) -> Result<HandshakeReply> {
    let mut buf = [0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut buf).await?;
    parse_handshake(&buf, info_hash)
}

fn parse_handshake(buf: &[u8; HANDSHAKE_SIZE], info_hash: InfoHash) -> Result<HandshakeReply> {
    if buf[0] as usize != PROTOCOL_STRING.len() || &buf[1..20] != PROTOCOL_STRING {
        return Err(EngineError::protocol(
            ProtocolErrorKind::BadHandshake,
            "unknown protocol string",
        ));
    }

    let mut reserved = [0u8; 8];
    reserved.copy_from_slice(&buf[20..28]);

    if buf[28..48] != info_hash {
        return Err(EngineError::protocol(
            ProtocolErrorKind::BadHandshake,
            "info-hash mismatch",
        ));
    }

    let mut peer_id = [0u8; 20];
    peer_id.copy_from_slice(&buf[48..68]);

    Ok(HandshakeReply {
        reserved: Reserved::from_bytes(reserved),
        peer_id,
    })
}

async fn read_loop(
    mut stream: OwnedReadHalf,
    key: PeerKey,
    events: &mpsc::Sender<PeerEvent>,
    limits: &RateLimits,
    cancel: &CancellationToken,
    idle: Duration,
) -> CloseReason {
    let mut body = BytesMut::with_capacity(MAX_MESSAGE_SIZE);

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return CloseReason::Shutdown,
            result = timeout(idle, read_frame(&mut stream, &mut body, limits)) => match result {
                Ok(Ok(msg)) => msg,
                Ok(Err(e)) => {
                    return match e {
                        EngineError::Protocol { message, .. } => CloseReason::Violation(message),
                        other => CloseReason::Transport(other.to_string()),
                    }
                }
                Err(_) => return CloseReason::IdleTimeout,
            },
        };

        // The fan-in channel is bounded; a full channel backpressures this
        // reader. Stay cancellable while parked on it.
        tokio::select! {
            _ = cancel.cancelled() => return CloseReason::Shutdown,
            sent = events.send(PeerEvent::Message { key, msg: frame }) => {
                if sent.is_err() {
                    // Coordinator is gone; nothing left to do.
                    return CloseReason::Shutdown;
                }
            }
        }
    }
}

async fn read_frame(
    stream: &mut OwnedReadHalf,
    body: &mut BytesMut,
    limits: &RateLimits,
) -> Result<PeerMessage> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len == 0 {
        return Ok(PeerMessage::KeepAlive);
    }
    if len > MAX_MESSAGE_SIZE {
        return Err(EngineError::protocol(
            ProtocolErrorKind::Violation,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }

    // Global download throttle applies at the socket, so a saturated link
    // backpressures the peer instead of flooding the loop.
    limits.download.acquire(len).await;

    body.resize(len, 0);
    stream.read_exact(&mut body[..]).await?;
    PeerMessage::decode(body)
}

async fn write_loop(
    mut stream: OwnedWriteHalf,
    mut commands: mpsc::Receiver<PeerCommand>,
    limits: RateLimits,
    cancel: CancellationToken,
    keepalive: Duration,
) {
    let mut keepalive_timer =
        tokio::time::interval_at(tokio::time::Instant::now() + keepalive, keepalive);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            command = commands.recv() => match command {
                Some(PeerCommand::Send(msg)) => {
                    if let PeerMessage::Piece { block, .. } = &msg {
                        limits.upload.acquire(block.len()).await;
                    }
                    let frame = msg.encode();
                    match timeout(WRITE_TIMEOUT, stream.write_all(&frame)).await {
                        Ok(Ok(())) => {
                            keepalive_timer.reset();
                        }
                        _ => break,
                    }
                }
                Some(PeerCommand::Close) | None => break,
            },
            _ = keepalive_timer.tick() => {
                let frame = PeerMessage::KeepAlive.encode();
                if timeout(WRITE_TIMEOUT, stream.write_all(&frame)).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = stream.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_reserved_bits() {
        let ours = Reserved::ours();
        assert!(ours.supports_fast());
        assert!(ours.supports_extension_protocol());

        let theirs = Reserved::from_bytes([0; 8]);
        assert!(!theirs.supports_fast());
        assert!(!theirs.supports_extension_protocol());

        // Unknown bits are carried but ignored
        let weird = Reserved::from_bytes([0xFF; 8]);
        assert!(weird.supports_fast());
    }

    #[test]
    fn test_handshake_round_trip() {
        let info_hash = [0x11u8; 20];
        let peer_id = [0x22u8; 20];
        let buf = encode_handshake(info_hash, peer_id);
        assert_eq!(buf.len(), 68);
        assert_eq!(buf[0], 19);

        let reply = parse_handshake(&buf, info_hash).unwrap();
        assert_eq!(reply.peer_id, peer_id);
        assert!(reply.reserved.supports_fast());
    }

    #[test]
    fn test_handshake_rejects_wrong_hash() {
        let buf = encode_handshake([0x11u8; 20], [0x22u8; 20]);
        let err = parse_handshake(&buf, [0x33u8; 20]).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Protocol {
                kind: ProtocolErrorKind::BadHandshake,
                ..
            }
        ));
    }

    #[test]
    fn test_handshake_rejects_bad_protocol_string() {
        let mut buf = encode_handshake([0x11u8; 20], [0x22u8; 20]);
        buf[1] = b'X';
        assert!(parse_handshake(&buf, [0x11u8; 20]).is_err());
    }

    fn timeouts() -> SessionTimeouts {
        SessionTimeouts {
            connect: Duration::from_secs(2),
            handshake: Duration::from_secs(2),
            keepalive: Duration::from_secs(60),
            idle: Duration::from_secs(60),
        }
    }

    /// Connect an initiator and a responder session back to back and push a
    /// message through each direction.
    #[tokio::test]
    async fn test_loopback_sessions_exchange_messages() {
        let info_hash = [7u8; 20];
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (a_events_tx, mut a_events) = mpsc::channel(16);
        let (a_cmd_tx, a_cmd_rx) = mpsc::channel(16);
        let (b_events_tx, mut b_events) = mpsc::channel(16);
        let (b_cmd_tx, b_cmd_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let a_params = SessionParams {
            key: PeerKey(1),
            addr,
            info_hash,
            our_peer_id: [b'a'; 20],
            events: a_events_tx,
            commands: a_cmd_rx,
            limits: RateLimits::unlimited(),
            cancel: cancel.clone(),
            timeouts: timeouts(),
        };
        tokio::spawn(run_outbound(a_params));

        let (stream, peer_addr) = listener.accept().await.unwrap();
        let b_params = SessionParams {
            key: PeerKey(2),
            addr: peer_addr,
            info_hash,
            our_peer_id: [b'b'; 20],
            events: b_events_tx,
            commands: b_cmd_rx,
            limits: RateLimits::unlimited(),
            cancel: cancel.clone(),
            timeouts: timeouts(),
        };
        tokio::spawn(run_inbound(stream, b_params));

        // Both sides complete the handshake
        match a_events.recv().await.unwrap() {
            PeerEvent::Connected { peer_id, fast, .. } => {
                assert_eq!(peer_id, [b'b'; 20]);
                assert!(fast);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(
            b_events.recv().await.unwrap(),
            PeerEvent::Connected { .. }
        ));

        // a -> b
        a_cmd_tx
            .send(PeerCommand::Send(PeerMessage::Have { index: 5 }))
            .await
            .unwrap();
        match b_events.recv().await.unwrap() {
            PeerEvent::Message { msg, .. } => assert_eq!(msg, PeerMessage::Have { index: 5 }),
            other => panic!("unexpected event: {:?}", other),
        }

        // b -> a
        b_cmd_tx
            .send(PeerCommand::Send(PeerMessage::Unchoke))
            .await
            .unwrap();
        match a_events.recv().await.unwrap() {
            PeerEvent::Message { msg, .. } => assert_eq!(msg, PeerMessage::Unchoke),
            other => panic!("unexpected event: {:?}", other),
        }

        // Cancellation drains both sessions
        cancel.cancel();
        loop {
            match a_events.recv().await {
                Some(PeerEvent::Closed { reason, .. }) => {
                    assert_eq!(reason, CloseReason::Shutdown);
                    break;
                }
                Some(_) => continue,
                None => panic!("closed event missing"),
            }
        }
    }

    #[tokio::test]
    async fn test_outbound_handshake_info_hash_mismatch() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Remote answers with a different info-hash
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 68];
            stream.read_exact(&mut buf).await.unwrap();
            let reply = encode_handshake([9u8; 20], [b'x'; 20]);
            stream.write_all(&reply).await.unwrap();
        });

        let (events_tx, mut events) = mpsc::channel(4);
        let (_cmd_tx, cmd_rx) = mpsc::channel(4);
        let params = SessionParams {
            key: PeerKey(1),
            addr,
            info_hash: [1u8; 20],
            our_peer_id: [b'a'; 20],
            events: events_tx,
            commands: cmd_rx,
            limits: RateLimits::unlimited(),
            cancel: CancellationToken::new(),
            timeouts: timeouts(),
        };
        tokio::spawn(run_outbound(params));

        match events.recv().await.unwrap() {
            PeerEvent::Closed { reason, .. } => {
                assert!(reason.is_violation());
                assert!(matches!(reason, CloseReason::Handshake(_)));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
