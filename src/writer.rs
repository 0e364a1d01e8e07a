//! Piece writer
//!
//! Verifies a completed piece buffer against its expected hash and writes
//! it to storage. One writer task per piece result; the coordinator
//! guarantees at most one writer per piece index is alive at a time.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::peer::PeerKey;
use crate::piece::Piece;
use crate::storage::Storage;

/// Where a piece buffer came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PieceSource {
    Peer(PeerKey),
    Webseed(String),
}

/// Outcome of one write attempt.
#[derive(Debug)]
pub enum WriterResult {
    /// Hash matched and the piece is on disk
    Verified { index: u32, source: PieceSource },
    /// Hash mismatch; the buffer was dropped
    Failed { index: u32, source: PieceSource },
    /// Storage failed; fatal to the torrent
    StorageError {
        index: u32,
        message: String,
    },
}

/// Verify and persist one piece, reporting the outcome on `results`.
pub async fn run(
    piece: Piece,
    buffer: Vec<u8>,
    source: PieceSource,
    storage: Arc<dyn Storage>,
    results: mpsc::Sender<WriterResult>,
) {
    let index = piece.index;

    let result = if !piece.verify(&buffer) {
        tracing::debug!("piece {} failed verification ({:?})", index, source);
        WriterResult::Failed { index, source }
    } else {
        match storage.write_piece(index, &buffer).await {
            Ok(()) => WriterResult::Verified { index, source },
            Err(e) => {
                tracing::error!("writing piece {} failed: {}", index, e);
                WriterResult::StorageError {
                    index,
                    message: e.to_string(),
                }
            }
        }
    };

    let _ = results.send(result).await;
}
