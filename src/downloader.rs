//! Piece downloader
//!
//! Tracks one (peer, piece) assignment: which blocks to request next,
//! which are in flight, and the buffer the arriving blocks assemble into.
//! Driven entirely by the coordinator; a downloader never touches I/O.
//! Each downloader yields at most one completed buffer.

use crate::error::{EngineError, ProtocolErrorKind, Result};
use crate::peer::PeerKey;
use crate::piece::{BlockInfo, Piece};

/// Per-block progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockState {
    Pending,
    Requested,
    Received,
}

/// Assembles one piece from one peer.
#[derive(Debug)]
pub struct PieceDownload {
    piece: Piece,
    peer: PeerKey,
    buffer: Vec<u8>,
    blocks: Vec<BlockState>,
    received: usize,
    completed: bool,
}

impl PieceDownload {
    pub fn new(piece: Piece, peer: PeerKey) -> Self {
        let num_blocks = piece.num_blocks();
        Self {
            buffer: vec![0u8; piece.length as usize],
            blocks: vec![BlockState::Pending; num_blocks],
            received: 0,
            completed: false,
            piece,
            peer,
        }
    }

    pub fn piece_index(&self) -> u32 {
        self.piece.index
    }

    pub fn peer(&self) -> PeerKey {
        self.peer
    }

    /// Blocks currently requested and unanswered.
    pub fn outstanding(&self) -> usize {
        self.blocks
            .iter()
            .filter(|s| **s == BlockState::Requested)
            .count()
    }

    /// All blocks received.
    pub fn is_complete(&self) -> bool {
        self.completed
    }

    /// Take up to `budget` pending blocks, marking them requested. The
    /// caller sends the matching Request messages.
    pub fn next_requests(&mut self, budget: usize) -> Vec<BlockInfo> {
        let mut out = Vec::new();
        for (i, state) in self.blocks.iter_mut().enumerate() {
            if out.len() >= budget {
                break;
            }
            if *state == BlockState::Pending {
                *state = BlockState::Requested;
                out.push(self.piece.block(i).expect("block index in range"));
            }
        }
        out
    }

    /// Requested-but-unanswered blocks, e.g. to Cancel on snub or endgame
    /// completion elsewhere.
    pub fn requested_blocks(&self) -> Vec<BlockInfo> {
        self.blocks
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == BlockState::Requested)
            .filter_map(|(i, _)| self.piece.block(i))
            .collect()
    }

    /// Store an arrived block. Returns the full piece buffer exactly once,
    /// when the last block lands.
    ///
    /// Errors are protocol violations (bad offset or length); duplicate
    /// blocks return Ok(None) and are counted by the caller as wasted.
    pub fn on_block(&mut self, offset: u32, data: &[u8]) -> Result<Option<Vec<u8>>> {
        let index = self.piece.block_index(offset).ok_or_else(|| {
            EngineError::protocol(
                ProtocolErrorKind::Violation,
                format!(
                    "bad block offset {} for piece {}",
                    offset, self.piece.index
                ),
            )
        })?;

        let expected = self.piece.block(index).expect("index validated").length as usize;
        if data.len() != expected {
            return Err(EngineError::protocol(
                ProtocolErrorKind::Violation,
                format!(
                    "block size mismatch for piece {} offset {}: got {}, want {}",
                    self.piece.index,
                    offset,
                    data.len(),
                    expected
                ),
            ));
        }

        if self.blocks[index] == BlockState::Received || self.completed {
            return Ok(None);
        }

        let start = offset as usize;
        self.buffer[start..start + expected].copy_from_slice(data);
        self.blocks[index] = BlockState::Received;
        self.received += 1;

        if self.received == self.blocks.len() {
            self.completed = true;
            Ok(Some(std::mem::take(&mut self.buffer)))
        } else {
            Ok(None)
        }
    }

    /// The peer rejected a request (fast extension): put the block back so
    /// it can be re-requested or released.
    pub fn on_reject(&mut self, offset: u32) {
        if let Some(index) = self.piece.block_index(offset) {
            if self.blocks[index] == BlockState::Requested {
                self.blocks[index] = BlockState::Pending;
            }
        }
    }

    /// Forget all unanswered requests, e.g. after a Choke without fast
    /// extension. Received blocks are kept.
    pub fn reset_requests(&mut self) {
        for state in &mut self.blocks {
            if *state == BlockState::Requested {
                *state = BlockState::Pending;
            }
        }
    }
}
