//! Core types for riptide
//!
//! Torrent identity, user-visible status, engine events and the contracts
//! of session-level collaborators.

use std::net::SocketAddr;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// 20-byte torrent identity on the wire.
pub type InfoHash = [u8; 20];

/// 20-byte peer identity from the handshake.
pub type PeerId = [u8; 20];

/// Unique identifier for a torrent within a session.
///
/// Backed by a time-ordered UUID; the canonical string form is URL-safe
/// base64 without padding and doubles as the persistence key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TorrentId(Uuid);

impl TorrentId {
    /// Create a new time-ordered id.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Create from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The persistence key: URL-safe base64 of the UUID bytes, no padding.
    pub fn to_key(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0.as_bytes())
    }

    /// Parse a persistence key back into an id.
    pub fn from_key(key: &str) -> Option<Self> {
        let bytes = URL_SAFE_NO_PAD.decode(key).ok()?;
        let bytes: [u8; 16] = bytes.try_into().ok()?;
        Some(Self(Uuid::from_bytes(bytes)))
    }
}

impl Default for TorrentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TorrentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_key())
    }
}

/// User-visible torrent status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TorrentStatus {
    /// Not running
    Stopped,
    /// Waiting for the metadata collaborator to supply the info dictionary
    DownloadingMetadata,
    /// Re-hashing existing data on disk
    Verifying,
    /// Exchanging pieces with the swarm
    Downloading,
    /// Complete, serving uploads
    Seeding,
    /// Stop requested, workers draining
    Stopping,
    /// Fatal error, torrent halted
    Errored(String),
}

impl TorrentStatus {
    /// Check if the torrent is actively exchanging data.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Downloading | Self::Seeding | Self::Verifying)
    }
}

/// Events broadcast by a torrent's coordinator loop.
#[derive(Debug, Clone)]
pub enum TorrentEvent {
    /// Torrent started
    Started,
    /// Status transition
    StatusChanged {
        old: TorrentStatus,
        new: TorrentStatus,
    },
    /// A piece passed verification and was written
    PieceVerified { index: u32 },
    /// A piece failed verification
    PieceFailed { index: u32 },
    /// All wanted pieces verified
    Completed,
    /// A peer connection became ready
    PeerConnected { addr: SocketAddr },
    /// A peer connection closed
    PeerDisconnected { addr: SocketAddr },
    /// Torrent stopped
    Stopped,
}

/// Point-in-time transfer statistics for a torrent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TorrentStats {
    /// Bytes of verified pieces
    pub bytes_downloaded: u64,
    /// Bytes served to peers
    pub bytes_uploaded: u64,
    /// Bytes discarded (hash failures, duplicate blocks)
    pub bytes_wasted: u64,
    /// Current download rate, bytes/sec
    pub download_rate: u64,
    /// Current upload rate, bytes/sec
    pub upload_rate: u64,
    /// Connected peer count
    pub connected_peers: usize,
    /// Verified piece count
    pub have_pieces: usize,
    /// Total piece count (0 until the info is known)
    pub total_pieces: usize,
    /// Cumulative time spent seeding
    pub seeded_for: Duration,
}

/// Session-side allocator for peer listen ports.
///
/// The session owns the pool; torrents receive a concrete port at
/// construction and the session releases it when the torrent is removed.
pub trait PortAllocator: Send + Sync {
    /// Take a free port from the pool.
    fn acquire(&self) -> Result<u16>;
    /// Return a port to the pool.
    fn release(&self, port: u16);
}
