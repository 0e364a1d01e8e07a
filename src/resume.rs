//! Resume persistence
//!
//! A torrent's persisted state is a [`ResumeSnapshot`]: everything needed
//! to reconstruct it after a restart. The coordinator projects a snapshot
//! after relevant state changes and hands it to a [`ResumeStore`]; writes
//! are coalesced by the loop, not here.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::bitfield::Bitfield;
use crate::error::{EngineError, Result};
use crate::types::{InfoHash, TorrentId};

/// Persisted per-torrent state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeSnapshot {
    /// Torrent identity
    pub info_hash: InfoHash,
    /// Tracker tiers
    pub trackers: Vec<Vec<String>>,
    /// Webseed URLs
    pub url_list: Vec<String>,
    /// Download destination
    pub dest_path: PathBuf,
    /// Peer listen port
    pub port: u16,
    /// Display name
    pub name: String,
    /// Serialized piece bitfield; empty until the info is known
    pub bitfield: Vec<u8>,
    /// Piece count the bitfield was serialized against
    pub num_pieces: u32,
    /// Bytes of verified pieces
    pub bytes_downloaded: u64,
    /// Bytes served to peers
    pub bytes_uploaded: u64,
    /// Bytes discarded
    pub bytes_wasted: u64,
    /// Cumulative seeding time
    pub seeded_for: Duration,
    /// When the torrent was added
    pub added_at: DateTime<Utc>,
}

impl ResumeSnapshot {
    /// Decode the persisted bitfield, if any.
    pub fn decode_bitfield(&self) -> Option<Bitfield> {
        if self.num_pieces == 0 {
            return None;
        }
        Bitfield::parse(&self.bitfield, self.num_pieces as usize).ok()
    }
}

/// Key/value persistence for resume snapshots, keyed by torrent id.
#[async_trait]
pub trait ResumeStore: Send + Sync {
    /// Insert or replace a snapshot.
    async fn write(&self, id: &TorrentId, snapshot: &ResumeSnapshot) -> Result<()>;

    /// Fetch a snapshot.
    async fn read(&self, id: &TorrentId) -> Result<Option<ResumeSnapshot>>;

    /// Remove a snapshot.
    async fn delete(&self, id: &TorrentId) -> Result<()>;

    /// List all stored torrents.
    async fn list(&self) -> Result<Vec<(TorrentId, ResumeSnapshot)>>;
}

/// SQLite-backed resume store. One row per torrent, JSON snapshot payload,
/// WAL mode for crash-safe commits.
pub struct SqliteResumeStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteResumeStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let conn = Connection::open(&path)
            .map_err(|e| EngineError::storage(&path, e.to_string()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS torrents (
                id TEXT PRIMARY KEY,
                snapshot TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database, for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS torrents (
                id TEXT PRIMARY KEY,
                snapshot TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl ResumeStore for SqliteResumeStore {
    async fn write(&self, id: &TorrentId, snapshot: &ResumeSnapshot) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        let key = id.to_key();
        let json = serde_json::to_string(snapshot)?;
        tokio::task::spawn_blocking(move || -> Result<()> {
            conn.lock().execute(
                "INSERT INTO torrents (id, snapshot) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET snapshot = ?2",
                rusqlite::params![key, json],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::storage("resume db", e.to_string()))?
    }

    async fn read(&self, id: &TorrentId) -> Result<Option<ResumeSnapshot>> {
        let conn = Arc::clone(&self.conn);
        let key = id.to_key();
        tokio::task::spawn_blocking(move || -> Result<Option<ResumeSnapshot>> {
            let conn = conn.lock();
            let mut stmt = conn.prepare("SELECT snapshot FROM torrents WHERE id = ?1")?;
            let mut rows = stmt.query([key])?;
            match rows.next()? {
                Some(row) => {
                    let json: String = row.get(0)?;
                    Ok(Some(serde_json::from_str(&json)?))
                }
                None => Ok(None),
            }
        })
        .await
        .map_err(|e| EngineError::storage("resume db", e.to_string()))?
    }

    async fn delete(&self, id: &TorrentId) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        let key = id.to_key();
        tokio::task::spawn_blocking(move || -> Result<()> {
            conn.lock()
                .execute("DELETE FROM torrents WHERE id = ?1", [key])?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::storage("resume db", e.to_string()))?
    }

    async fn list(&self) -> Result<Vec<(TorrentId, ResumeSnapshot)>> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || -> Result<Vec<(TorrentId, ResumeSnapshot)>> {
            let conn = conn.lock();
            let mut stmt = conn.prepare("SELECT id, snapshot FROM torrents")?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let key: String = row.get(0)?;
                let json: String = row.get(1)?;
                if let Some(id) = TorrentId::from_key(&key) {
                    out.push((id, serde_json::from_str(&json)?));
                }
            }
            Ok(out)
        })
        .await
        .map_err(|e| EngineError::storage("resume db", e.to_string()))?
    }
}

/// In-memory resume store for tests.
#[derive(Default)]
pub struct MemoryResumeStore {
    entries: Mutex<HashMap<TorrentId, ResumeSnapshot>>,
}

impl MemoryResumeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of writes that landed. Test hook.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl ResumeStore for MemoryResumeStore {
    async fn write(&self, id: &TorrentId, snapshot: &ResumeSnapshot) -> Result<()> {
        self.entries.lock().insert(*id, snapshot.clone());
        Ok(())
    }

    async fn read(&self, id: &TorrentId) -> Result<Option<ResumeSnapshot>> {
        Ok(self.entries.lock().get(id).cloned())
    }

    async fn delete(&self, id: &TorrentId) -> Result<()> {
        self.entries.lock().remove(id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<(TorrentId, ResumeSnapshot)>> {
        Ok(self
            .entries
            .lock()
            .iter()
            .map(|(id, snapshot)| (*id, snapshot.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_snapshot() -> ResumeSnapshot {
        let mut bitfield = Bitfield::new(10);
        bitfield.set(0);
        bitfield.set(3);
        ResumeSnapshot {
            info_hash: [0xAB; 20],
            trackers: vec![vec!["http://tracker.example/announce".to_string()]],
            url_list: vec!["http://seed.example/file".to_string()],
            dest_path: PathBuf::from("/downloads/torrent"),
            port: 6881,
            name: "test".to_string(),
            bitfield: bitfield.serialize(),
            num_pieces: 10,
            bytes_downloaded: 32_768,
            bytes_uploaded: 1_024,
            bytes_wasted: 16_384,
            seeded_for: Duration::from_secs(90),
            added_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_sqlite_round_trip_is_fixed_point() {
        let store = SqliteResumeStore::open_in_memory().unwrap();
        let id = TorrentId::new();
        let snapshot = sample_snapshot();

        store.write(&id, &snapshot).await.unwrap();
        let first = store.read(&id).await.unwrap().unwrap();
        assert_eq!(first, snapshot);

        // write(read(write(s))) == write(s)
        store.write(&id, &first).await.unwrap();
        let second = store.read(&id).await.unwrap().unwrap();
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn test_sqlite_overwrite_and_delete() {
        let store = SqliteResumeStore::open_in_memory().unwrap();
        let id = TorrentId::new();
        let mut snapshot = sample_snapshot();

        store.write(&id, &snapshot).await.unwrap();
        snapshot.bytes_downloaded = 65_536;
        store.write(&id, &snapshot).await.unwrap();

        let read = store.read(&id).await.unwrap().unwrap();
        assert_eq!(read.bytes_downloaded, 65_536);
        assert_eq!(store.list().await.unwrap().len(), 1);

        store.delete(&id).await.unwrap();
        assert!(store.read(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_missing_returns_none() {
        let store = SqliteResumeStore::open_in_memory().unwrap();
        assert!(store.read(&TorrentId::new()).await.unwrap().is_none());
    }

    #[test]
    fn test_bitfield_decode() {
        let snapshot = sample_snapshot();
        let bf = snapshot.decode_bitfield().unwrap();
        assert_eq!(bf.count(), 2);
        assert!(bf.has(0));
        assert!(bf.has(3));
        assert!(!bf.has(1));
    }
}
