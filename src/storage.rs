//! Block storage
//!
//! The storage collaborator maps piece-indexed reads and writes onto the
//! torrent's files. [`FileStorage`] is the filesystem implementation;
//! [`MemoryStorage`] backs tests.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::{EngineError, Result};
use crate::metainfo::Info;

/// Piece-addressed byte storage for one torrent.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Write a complete, verified piece.
    async fn write_piece(&self, index: u32, data: &[u8]) -> Result<()>;

    /// Read `length` bytes starting at `offset` within a piece.
    async fn read_block(&self, index: u32, offset: u32, length: u32) -> Result<Vec<u8>>;

    /// Read a whole piece. Used by startup verification and uploads.
    async fn read_piece(&self, index: u32) -> Result<Vec<u8>>;

    /// Flush and release resources.
    async fn close(&self) -> Result<()>;
}

/// Filesystem storage rooted at a destination directory.
///
/// Single-file torrents write `dest/<name>`; multi-file torrents write
/// `dest/<name>/<file path>`. Path components were validated at metainfo
/// parse time.
pub struct FileStorage {
    info: Arc<Info>,
    dest: PathBuf,
}

impl FileStorage {
    /// Open storage for a torrent under `dest`.
    pub fn open(info: Arc<Info>, dest: impl Into<PathBuf>) -> Self {
        Self {
            info,
            dest: dest.into(),
        }
    }

    fn file_path(&self, file_idx: usize) -> PathBuf {
        let file = &self.info.files[file_idx];
        if self.info.is_single_file {
            self.dest.join(&file.path)
        } else {
            self.dest.join(&self.info.name).join(&file.path)
        }
    }

    fn bounds_check(&self, index: u32, offset: u32, length: u32) -> Result<()> {
        let piece_length = self
            .info
            .piece_length_at(index as usize)
            .ok_or_else(|| EngineError::storage(&self.dest, format!("piece {} out of range", index)))?;
        if offset as u64 + length as u64 > piece_length {
            return Err(EngineError::storage(
                &self.dest,
                format!(
                    "read past piece end: piece={} offset={} length={} piece_length={}",
                    index, offset, length, piece_length
                ),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn write_piece(&self, index: u32, data: &[u8]) -> Result<()> {
        let mut data_offset = 0usize;

        for (file_idx, file_offset, length) in self.info.files_for_piece(index as usize) {
            let path = self.file_path(file_idx);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| EngineError::storage(parent, e.to_string()))?;
            }

            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .await
                .map_err(|e| EngineError::storage(&path, e.to_string()))?;

            file.seek(SeekFrom::Start(file_offset))
                .await
                .map_err(|e| EngineError::storage(&path, e.to_string()))?;

            let end = data_offset + length as usize;
            file.write_all(&data[data_offset..end])
                .await
                .map_err(|e| EngineError::storage(&path, e.to_string()))?;
            data_offset = end;
        }

        Ok(())
    }

    async fn read_block(&self, index: u32, offset: u32, length: u32) -> Result<Vec<u8>> {
        self.bounds_check(index, offset, length)?;

        let mut block = Vec::with_capacity(length as usize);
        let block_start = offset as u64;
        let block_end = block_start + length as u64;
        let mut span_start = 0u64;

        for (file_idx, file_offset, span_len) in self.info.files_for_piece(index as usize) {
            let span_end = span_start + span_len;
            if span_end <= block_start || span_start >= block_end {
                span_start = span_end;
                continue;
            }

            let read_start = block_start.max(span_start);
            let read_end = block_end.min(span_end);
            let path = self.file_path(file_idx);

            let mut file = File::open(&path)
                .await
                .map_err(|e| EngineError::storage(&path, e.to_string()))?;
            file.seek(SeekFrom::Start(file_offset + (read_start - span_start)))
                .await
                .map_err(|e| EngineError::storage(&path, e.to_string()))?;

            let mut buf = vec![0u8; (read_end - read_start) as usize];
            file.read_exact(&mut buf)
                .await
                .map_err(|e| EngineError::storage(&path, e.to_string()))?;
            block.extend_from_slice(&buf);

            span_start = span_end;
        }

        if block.len() != length as usize {
            return Err(EngineError::storage(
                &self.dest,
                format!(
                    "short read for piece {}: got {} of {} bytes",
                    index,
                    block.len(),
                    length
                ),
            ));
        }
        Ok(block)
    }

    async fn read_piece(&self, index: u32) -> Result<Vec<u8>> {
        let length = self
            .info
            .piece_length_at(index as usize)
            .ok_or_else(|| EngineError::storage(&self.dest, format!("piece {} out of range", index)))?;
        self.read_block(index, 0, length as u32).await
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// In-memory storage keyed by piece index. Test use only.
#[derive(Default)]
pub struct MemoryStorage {
    info: Option<Arc<Info>>,
    pieces: Mutex<HashMap<u32, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new(info: Arc<Info>) -> Self {
        Self {
            info: Some(info),
            pieces: Mutex::new(HashMap::new()),
        }
    }

    /// Number of stored pieces.
    pub fn piece_count(&self) -> usize {
        self.pieces.lock().len()
    }

    /// Preload a piece, as if it had been written in an earlier run.
    pub fn insert_piece(&self, index: u32, data: Vec<u8>) {
        self.pieces.lock().insert(index, data);
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn write_piece(&self, index: u32, data: &[u8]) -> Result<()> {
        self.pieces.lock().insert(index, data.to_vec());
        Ok(())
    }

    async fn read_block(&self, index: u32, offset: u32, length: u32) -> Result<Vec<u8>> {
        let pieces = self.pieces.lock();
        let piece = pieces
            .get(&index)
            .ok_or_else(|| EngineError::storage("memory", format!("piece {} missing", index)))?;
        let start = offset as usize;
        let end = start + length as usize;
        if end > piece.len() {
            return Err(EngineError::storage(
                "memory",
                format!("read past piece {} end", index),
            ));
        }
        Ok(piece[start..end].to_vec())
    }

    async fn read_piece(&self, index: u32) -> Result<Vec<u8>> {
        let expected = self
            .info
            .as_ref()
            .and_then(|info| info.piece_length_at(index as usize));
        let pieces = self.pieces.lock();
        let piece = pieces
            .get(&index)
            .ok_or_else(|| EngineError::storage("memory", format!("piece {} missing", index)))?;
        if let Some(expected) = expected {
            if piece.len() as u64 != expected {
                return Err(EngineError::storage(
                    "memory",
                    format!("piece {} has unexpected length", index),
                ));
            }
        }
        Ok(piece.clone())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
