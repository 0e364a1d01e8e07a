//! Peer connections
//!
//! `message` is the wire codec, `connection` the session tasks that own the
//! sockets. [`PeerState`] is the coordinator-side view of one peer: the
//! choke/interest flags, its bitfield, request accounting and rate meters.
//! The coordinator is the only writer of this state.

pub mod connection;
pub mod message;

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::bitfield::Bitfield;
use crate::piece::BlockInfo;
use crate::stats::SpeedMeter;
use crate::types::PeerId;

pub use connection::{
    CloseReason, PeerCommand, PeerEvent, Reserved, SessionParams, SessionTimeouts,
};
pub use message::PeerMessage;

/// Loop-internal peer handle, unique for the lifetime of a torrent.
/// Addresses repeat across reconnects; keys never do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerKey(pub u64);

impl std::fmt::Display for PeerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Coordinator-side state for one peer connection.
pub struct PeerState {
    pub key: PeerKey,
    pub addr: SocketAddr,
    /// Known after the handshake
    pub peer_id: Option<PeerId>,
    /// Writer-half command queue for this peer's session
    pub commands: mpsc::Sender<PeerCommand>,

    /// Handshake completed
    pub connected: bool,
    /// Fast extension negotiated
    pub fast: bool,
    /// True once any post-handshake message arrived; Bitfield/HaveAll/
    /// HaveNone are only legal before this flips
    pub saw_first_message: bool,

    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,

    /// Pieces the peer claims to have
    pub bitfield: Bitfield,
    /// Pieces the peer granted us via AllowedFast
    pub allowed_fast: HashSet<u32>,

    /// Requests sent and not yet answered, rejected or cancelled
    pub inflight: HashSet<BlockInfo>,
    /// Blocks the peer asked us for, not yet served
    pub upload_queue: VecDeque<BlockInfo>,
    /// An upload task is running for the head of the queue
    pub upload_active: bool,

    /// When the last block arrived from this peer
    pub last_block_at: Instant,
    /// Set when the peer stalls with requests outstanding
    pub snubbed_since: Option<Instant>,
    /// Consecutive pieces from this peer that failed verification
    pub hash_failures: u32,

    pub connected_at: Instant,
    pub download_meter: SpeedMeter,
    pub upload_meter: SpeedMeter,
    pub downloaded: u64,
    pub uploaded: u64,
}

impl PeerState {
    pub fn new(
        key: PeerKey,
        addr: SocketAddr,
        commands: mpsc::Sender<PeerCommand>,
        num_pieces: usize,
        rate_window: Duration,
    ) -> Self {
        let now = Instant::now();
        Self {
            key,
            addr,
            peer_id: None,
            commands,
            connected: false,
            fast: false,
            saw_first_message: false,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            bitfield: Bitfield::new(num_pieces),
            allowed_fast: HashSet::new(),
            inflight: HashSet::new(),
            upload_queue: VecDeque::new(),
            upload_active: false,
            last_block_at: now,
            snubbed_since: None,
            hash_failures: 0,
            connected_at: now,
            download_meter: SpeedMeter::new(rate_window),
            upload_meter: SpeedMeter::new(rate_window),
            downloaded: 0,
            uploaded: 0,
        }
    }

    /// Best-effort enqueue of a wire message to this peer. A full queue
    /// means the socket is hopelessly behind; the frame is dropped and the
    /// idle/snub machinery deals with the peer.
    pub fn send(&self, msg: PeerMessage) {
        if self.commands.try_send(PeerCommand::Send(msg)).is_err() {
            tracing::debug!("{}: command queue full, dropping frame", self.key);
        }
    }

    /// Whether this peer may currently be asked for blocks: unchoked, or
    /// fast-ext allowed pieces remain.
    pub fn can_request(&self) -> bool {
        !self.peer_choking || (self.fast && !self.allowed_fast.is_empty())
    }

    /// A block may be requested from this peer right now.
    pub fn may_request_piece(&self, piece: u32) -> bool {
        if !self.peer_choking {
            return true;
        }
        self.fast && self.allowed_fast.contains(&piece)
    }

    /// How long the peer has been snubbing us.
    pub fn snubbed_for(&self, now: Instant) -> Option<Duration> {
        self.snubbed_since.map(|since| now.duration_since(since))
    }

    /// Record an arrived block for snub and rate accounting.
    pub fn note_block(&mut self, bytes: u64) {
        self.last_block_at = Instant::now();
        self.snubbed_since = None;
        self.downloaded += bytes;
        self.download_meter.record(bytes);
    }
}
