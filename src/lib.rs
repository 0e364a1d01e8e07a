//! # riptide
//!
//! An asynchronous BitTorrent swarm engine. Each torrent runs as a
//! single-writer coordinator task that owns all of that torrent's state
//! and multiplexes its workers (peer sessions, piece writers, webseed
//! fetches, tracker announcers) over bounded channels.
//!
//! ## Features
//!
//! - **Peer wire protocol** (BEP 3) with the fast extension (BEP 6)
//! - **Tracker announces** over HTTP (BEP 3/23) and UDP (BEP 15),
//!   organized into tiers (BEP 12)
//! - **Webseeds** (BEP 19) as alternate piece sources with backoff
//! - **Rarest-first piece picking** with sequential mode, priorities and
//!   endgame duplicate requests
//! - **Tit-for-tat choking** with an optimistic unchoke slot
//! - **Resume**: coalesced snapshots into a SQLite store, sampled
//!   re-verification on restart
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use riptide::{
//!     Collaborators, Config, FileStorage, Metainfo, RateLimits,
//!     SqliteResumeStore, Torrent, TorrentId, TorrentParams, TrackerClient,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bytes = std::fs::read("example.torrent")?;
//!     let metainfo = Metainfo::parse(&bytes)?;
//!     let config = Config::default();
//!
//!     let params = TorrentParams::from_metainfo(
//!         TorrentId::new(),
//!         &metainfo,
//!         "/downloads",
//!         6881,
//!     );
//!     let collab = Collaborators {
//!         storage: Arc::new(FileStorage::open(metainfo.info.clone(), "/downloads")),
//!         resume: Arc::new(SqliteResumeStore::open("/downloads/resume.db")?),
//!         tracker: Arc::new(TrackerClient::new(
//!             config.tracker_timeout,
//!             &config.user_agent,
//!         )?),
//!         limits: RateLimits::unlimited(),
//!     };
//!
//!     let torrent = Torrent::spawn(params, config, collab);
//!     torrent.start().await?;
//!
//!     let mut events = torrent.subscribe();
//!     while let Ok(event) = events.recv().await {
//!         println!("event: {:?}", event);
//!     }
//!     Ok(())
//! }
//! ```

pub mod announcer;
pub mod bencode;
pub mod bitfield;
pub mod choker;
pub mod config;
pub mod downloader;
pub mod error;
pub mod limiter;
pub mod magnet;
pub mod metainfo;
pub mod peer;
pub mod picker;
pub mod piece;
pub mod resume;
pub mod stats;
pub mod storage;
pub mod torrent;
pub mod tracker;
pub mod types;
pub mod webseed;
pub mod writer;

// Core surface
pub use config::Config;
pub use error::{EngineError, ProtocolErrorKind, Result, TransportErrorKind};
pub use torrent::{Collaborators, Torrent, TorrentParams};
pub use types::{InfoHash, PeerId, TorrentEvent, TorrentId, TorrentStats, TorrentStatus};

// Data model
pub use bitfield::Bitfield;
pub use magnet::MagnetUri;
pub use metainfo::{FileInfo, Info, Metainfo, Sha1Hash};
pub use picker::PiecePriority;
pub use piece::{BlockInfo, Piece, BLOCK_SIZE};

// Collaborator contracts and implementations
pub use limiter::{RateLimiter, RateLimits};
pub use resume::{MemoryResumeStore, ResumeSnapshot, ResumeStore, SqliteResumeStore};
pub use storage::{FileStorage, MemoryStorage, Storage};
pub use tracker::{
    AnnounceEvent, AnnounceRequest, AnnounceResponse, TrackerClient, TrackerTransport,
};
pub use types::PortAllocator;
