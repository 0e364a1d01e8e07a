//! Piece and block model
//!
//! A piece is the verification unit (SHA-1 per piece); a block is the
//! 16 KiB transfer unit. The final block of a piece, and the final piece of
//! a torrent, may be shorter.

use sha1::{Digest, Sha1};

use crate::metainfo::{Info, Sha1Hash};

/// Transfer quantum: all requests are at most this long.
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// Geometry and expected hash of one piece.
#[derive(Debug, Clone)]
pub struct Piece {
    /// Piece index
    pub index: u32,
    /// Length in bytes; equals the torrent piece length except possibly for
    /// the last piece
    pub length: u32,
    /// Expected SHA-1 of the piece data
    pub hash: Sha1Hash,
}

/// One block within a piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockInfo {
    /// Piece index
    pub piece: u32,
    /// Offset within the piece
    pub offset: u32,
    /// Block length, at most [`BLOCK_SIZE`]
    pub length: u32,
}

impl Piece {
    /// Number of blocks in this piece.
    pub fn num_blocks(&self) -> usize {
        (self.length as usize).div_ceil(BLOCK_SIZE as usize)
    }

    /// The block at `block_index`, or None past the end.
    pub fn block(&self, block_index: usize) -> Option<BlockInfo> {
        if block_index >= self.num_blocks() {
            return None;
        }
        let offset = block_index as u32 * BLOCK_SIZE;
        Some(BlockInfo {
            piece: self.index,
            offset,
            length: (self.length - offset).min(BLOCK_SIZE),
        })
    }

    /// Iterate the piece's blocks in order.
    pub fn blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        (0..self.num_blocks()).filter_map(|i| self.block(i))
    }

    /// Block index for a wire offset, if the offset is block-aligned and in
    /// bounds.
    pub fn block_index(&self, offset: u32) -> Option<usize> {
        if offset % BLOCK_SIZE != 0 || offset >= self.length {
            return None;
        }
        Some((offset / BLOCK_SIZE) as usize)
    }

    /// Check that a request `(offset, length)` falls within the piece and
    /// respects the block size cap.
    pub fn valid_request(&self, offset: u32, length: u32) -> bool {
        length > 0
            && length <= BLOCK_SIZE
            && (offset as u64 + length as u64) <= self.length as u64
    }

    /// Verify piece data against the expected hash.
    pub fn verify(&self, data: &[u8]) -> bool {
        if data.len() != self.length as usize {
            return false;
        }
        let mut hasher = Sha1::new();
        hasher.update(data);
        let actual: Sha1Hash = hasher.finalize().into();
        actual == self.hash
    }
}

/// Build the piece table for a torrent.
pub fn pieces_from_info(info: &Info) -> Vec<Piece> {
    (0..info.num_pieces())
        .map(|index| Piece {
            index: index as u32,
            length: info.piece_length_at(index).unwrap_or(0) as u32,
            hash: *info.piece_hash(index).expect("piece index in range"),
        })
        .collect()
}
