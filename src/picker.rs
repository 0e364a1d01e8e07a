//! Piece picker
//!
//! Owns the per-piece download state and chooses what to fetch next.
//! Default strategy is rarest-first; ties within a rarity class break by a
//! deterministic per-torrent shuffle so two peers with identical views do
//! not converge on the same piece, while tests stay reproducible. Optional
//! overrides: sequential mode, per-piece priorities, and endgame once the
//! remaining piece count drops to the threshold.

use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::bitfield::Bitfield;

/// Caller-assigned piece priority. Higher sorts before rarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PiecePriority {
    Low,
    Normal,
    High,
}

/// Download state of one piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    /// Not downloaded, no active downloader
    Missing,
    /// `n` active downloaders hold assignments for this piece (n > 1 only
    /// in endgame)
    Assigned(u32),
    /// Buffer complete, writer in flight
    Writing,
    /// Verified and written
    Have,
}

#[derive(Debug)]
struct Slot {
    state: PieceState,
    priority: PiecePriority,
    /// How many connected peers advertise this piece
    availability: u32,
}

/// Piece selection strategy for one torrent.
#[derive(Debug)]
pub struct PiecePicker {
    slots: Vec<Slot>,
    /// Pieces not yet Have or Writing
    remaining: usize,
    endgame_threshold: usize,
    sequential: bool,
    /// Deterministic tie-break rank per piece index
    rank: Vec<u32>,
}

impl PiecePicker {
    /// Create a picker for `num_pieces` pieces. `seed` fixes the shuffle
    /// used for rarity tie-breaks.
    pub fn new(num_pieces: usize, endgame_threshold: usize, sequential: bool, seed: u64) -> Self {
        let mut order: Vec<u32> = (0..num_pieces as u32).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        order.shuffle(&mut rng);

        let mut rank = vec![0u32; num_pieces];
        for (position, &index) in order.iter().enumerate() {
            rank[index as usize] = position as u32;
        }

        Self {
            slots: (0..num_pieces)
                .map(|_| Slot {
                    state: PieceState::Missing,
                    priority: PiecePriority::Normal,
                    availability: 0,
                })
                .collect(),
            remaining: num_pieces,
            endgame_threshold,
            sequential,
            rank,
        }
    }

    /// Number of pieces.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// State of a piece.
    pub fn state(&self, index: u32) -> Option<PieceState> {
        self.slots.get(index as usize).map(|s| s.state)
    }

    /// Pieces not yet written or being written.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Count of verified pieces.
    pub fn have_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state == PieceState::Have)
            .count()
    }

    /// All wanted pieces are Have.
    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(|s| s.state == PieceState::Have)
    }

    /// Endgame: few enough pieces remain that duplicate assignments pay off.
    pub fn in_endgame(&self) -> bool {
        self.remaining > 0 && self.remaining <= self.endgame_threshold
    }

    /// Our bitfield view: set bits are verified pieces.
    pub fn bitfield(&self) -> Bitfield {
        let mut bf = Bitfield::new(self.slots.len());
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.state == PieceState::Have {
                bf.set(i);
            }
        }
        bf
    }

    /// Adopt a verified bitfield, e.g. from a resume snapshot.
    pub fn restore_have(&mut self, have: &Bitfield) {
        for index in have.ones() {
            self.mark_have(index as u32);
        }
    }

    /// Set a piece's priority.
    pub fn set_priority(&mut self, index: u32, priority: PiecePriority) {
        if let Some(slot) = self.slots.get_mut(index as usize) {
            slot.priority = priority;
        }
    }

    /// Switch sequential mode.
    pub fn set_sequential(&mut self, sequential: bool) {
        self.sequential = sequential;
    }

    /// A peer advertised its full bitfield.
    pub fn peer_added(&mut self, peer: &Bitfield) {
        for index in peer.ones() {
            if let Some(slot) = self.slots.get_mut(index) {
                slot.availability = slot.availability.saturating_add(1);
            }
        }
    }

    /// A peer announced one more piece (Have message).
    pub fn peer_has(&mut self, index: u32) {
        if let Some(slot) = self.slots.get_mut(index as usize) {
            slot.availability = slot.availability.saturating_add(1);
        }
    }

    /// A peer disconnected; drop its contribution to rarity.
    pub fn peer_removed(&mut self, peer: &Bitfield) {
        for index in peer.ones() {
            if let Some(slot) = self.slots.get_mut(index) {
                slot.availability = slot.availability.saturating_sub(1);
            }
        }
    }

    /// True when the peer has at least one piece we still want.
    pub fn is_interesting(&self, peer: &Bitfield) -> bool {
        peer.ones().any(|i| {
            matches!(
                self.slots.get(i).map(|s| s.state),
                Some(PieceState::Missing) | Some(PieceState::Assigned(_))
            )
        })
    }

    /// Choose the next piece to download from a peer advertising `peer`.
    ///
    /// `skip` holds pieces the caller already downloads from this peer.
    /// Outside endgame only Missing pieces qualify; in endgame, Assigned
    /// pieces may be handed out again so several peers race the tail.
    pub fn pick(&self, peer: &Bitfield, skip: &HashSet<u32>) -> Option<u32> {
        let endgame = self.in_endgame();

        let mut best: Option<(u32, &Slot)> = None;
        for (i, slot) in self.slots.iter().enumerate() {
            let index = i as u32;
            if skip.contains(&index) || !peer.has(i) {
                continue;
            }
            let candidate = match slot.state {
                PieceState::Missing => true,
                PieceState::Assigned(_) => endgame,
                _ => false,
            };
            if !candidate {
                continue;
            }

            // Prefer untouched pieces over endgame duplicates
            let is_dup = matches!(slot.state, PieceState::Assigned(_));
            match &best {
                None => best = Some((index, slot)),
                Some((best_index, best_slot)) => {
                    let best_dup = matches!(best_slot.state, PieceState::Assigned(_));
                    if self.candidate_key(index, slot, is_dup)
                        < self.candidate_key(*best_index, best_slot, best_dup)
                    {
                        best = Some((index, slot));
                    }
                }
            }
        }

        best.map(|(index, _)| index)
    }

    /// Sort key: priority desc, then (sequential ? index : rarity then
    /// shuffled rank). Duplicates always lose to fresh pieces.
    fn candidate_key(&self, index: u32, slot: &Slot, is_dup: bool) -> (bool, u8, u32, u32) {
        let priority_inverted = match slot.priority {
            PiecePriority::High => 0,
            PiecePriority::Normal => 1,
            PiecePriority::Low => 2,
        };
        if self.sequential {
            (is_dup, priority_inverted, index, 0)
        } else {
            (
                is_dup,
                priority_inverted,
                slot.availability,
                self.rank[index as usize],
            )
        }
    }

    /// Record a new download assignment for a piece.
    pub fn assign(&mut self, index: u32) {
        if let Some(slot) = self.slots.get_mut(index as usize) {
            slot.state = match slot.state {
                PieceState::Missing => PieceState::Assigned(1),
                PieceState::Assigned(n) => PieceState::Assigned(n + 1),
                other => other,
            };
        }
    }

    /// Drop one download assignment; the piece returns to Missing when the
    /// last assignment goes away.
    pub fn release(&mut self, index: u32) {
        if let Some(slot) = self.slots.get_mut(index as usize) {
            slot.state = match slot.state {
                PieceState::Assigned(1) => PieceState::Missing,
                PieceState::Assigned(n) => PieceState::Assigned(n - 1),
                other => other,
            };
        }
    }

    /// A buffer for this piece completed; a writer now owns it.
    pub fn mark_writing(&mut self, index: u32) {
        if let Some(slot) = self.slots.get_mut(index as usize) {
            if slot.state != PieceState::Have {
                slot.state = PieceState::Writing;
            }
        }
    }

    /// Verification succeeded.
    pub fn mark_have(&mut self, index: u32) {
        if let Some(slot) = self.slots.get_mut(index as usize) {
            if slot.state != PieceState::Have {
                self.remaining -= 1;
                slot.state = PieceState::Have;
            }
        }
    }

    /// Verification failed or a webseed fetch errored: back to Missing so
    /// any source can retry it.
    pub fn mark_missing(&mut self, index: u32) {
        if let Some(slot) = self.slots.get_mut(index as usize) {
            if slot.state == PieceState::Have {
                self.remaining += 1;
            }
            slot.state = PieceState::Missing;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_peer(n: usize) -> Bitfield {
        Bitfield::full(n)
    }

    #[test]
    fn test_pick_prefers_rarest() {
        let mut picker = PiecePicker::new(4, 1, false, 7);
        // Piece 2 is rarest (availability 1), others at 2
        let mut common = Bitfield::new(4);
        common.set(0);
        common.set(1);
        common.set(3);
        picker.peer_added(&common);
        picker.peer_added(&full_peer(4));

        let picked = picker.pick(&full_peer(4), &HashSet::new()).unwrap();
        assert_eq!(picked, 2);
    }

    #[test]
    fn test_pick_deterministic_for_fixed_seed() {
        let run = |seed| {
            let picker = PiecePicker::new(16, 1, false, seed);
            picker.pick(&full_peer(16), &HashSet::new()).unwrap()
        };
        // Same seed, same observation order, same pick
        assert_eq!(run(42), run(42));
    }

    #[test]
    fn test_priority_beats_rarity() {
        let mut picker = PiecePicker::new(3, 1, false, 0);
        // Piece 0 is rarest
        let mut bf = Bitfield::new(3);
        bf.set(1);
        bf.set(2);
        picker.peer_added(&bf);
        picker.set_priority(2, PiecePriority::High);

        assert_eq!(picker.pick(&full_peer(3), &HashSet::new()), Some(2));

        picker.set_priority(2, PiecePriority::Low);
        assert_eq!(picker.pick(&full_peer(3), &HashSet::new()), Some(0));
    }

    #[test]
    fn test_sequential_mode() {
        let mut picker = PiecePicker::new(8, 1, true, 9);
        picker.assign(0);
        picker.mark_writing(0);
        assert_eq!(picker.pick(&full_peer(8), &HashSet::new()), Some(1));
    }

    #[test]
    fn test_assign_release_cycle() {
        let mut picker = PiecePicker::new(2, 1, false, 0);
        picker.assign(0);
        assert_eq!(picker.state(0), Some(PieceState::Assigned(1)));
        // Assigned pieces are not offered again outside endgame
        assert_eq!(picker.pick(&full_peer(2), &HashSet::new()), Some(1));

        picker.release(0);
        assert_eq!(picker.state(0), Some(PieceState::Missing));
    }

    #[test]
    fn test_endgame_allows_duplicates() {
        // threshold 2, two pieces left: endgame from the start
        let mut picker = PiecePicker::new(2, 2, false, 0);
        assert!(picker.in_endgame());

        picker.assign(0);
        picker.assign(1);

        // Another peer may still pick an assigned piece, skipping its own
        let skip: HashSet<u32> = [0].into_iter().collect();
        assert_eq!(picker.pick(&full_peer(2), &skip), Some(1));
        picker.assign(1);
        assert_eq!(picker.state(1), Some(PieceState::Assigned(2)));

        // Releasing one duplicate leaves the other assignment live
        picker.release(1);
        assert_eq!(picker.state(1), Some(PieceState::Assigned(1)));
    }

    #[test]
    fn test_no_duplicates_outside_endgame() {
        let mut picker = PiecePicker::new(10, 1, false, 0);
        for i in 0..9 {
            picker.assign(i);
        }
        // Only piece 9 is missing; everything else assigned and remaining=10
        assert!(!picker.in_endgame());
        assert_eq!(picker.pick(&full_peer(10), &HashSet::new()), Some(9));
        picker.assign(9);
        assert_eq!(picker.pick(&full_peer(10), &HashSet::new()), None);
    }

    #[test]
    fn test_have_tracking_and_completion() {
        let mut picker = PiecePicker::new(3, 1, false, 0);
        assert_eq!(picker.remaining(), 3);

        picker.assign(0);
        picker.mark_writing(0);
        picker.mark_have(0);
        assert_eq!(picker.remaining(), 2);
        assert_eq!(picker.have_count(), 1);
        assert!(picker.bitfield().has(0));

        picker.mark_have(1);
        picker.mark_have(2);
        assert!(picker.is_complete());
        assert!(!picker.in_endgame());

        // mark_have is idempotent
        picker.mark_have(2);
        assert_eq!(picker.remaining(), 0);
    }

    #[test]
    fn test_failed_piece_returns_to_missing() {
        let mut picker = PiecePicker::new(2, 1, false, 0);
        picker.assign(0);
        picker.mark_writing(0);
        picker.mark_missing(0);
        assert_eq!(picker.state(0), Some(PieceState::Missing));
        assert_eq!(picker.remaining(), 2);
    }

    #[test]
    fn test_interest() {
        let mut picker = PiecePicker::new(2, 1, false, 0);
        let mut peer = Bitfield::new(2);
        peer.set(1);
        assert!(picker.is_interesting(&peer));

        picker.mark_have(1);
        assert!(!picker.is_interesting(&peer));
    }

    #[test]
    fn test_restore_have() {
        let mut picker = PiecePicker::new(4, 1, false, 0);
        let mut have = Bitfield::new(4);
        have.set(1);
        have.set(2);
        picker.restore_have(&have);
        assert_eq!(picker.have_count(), 2);
        assert_eq!(picker.remaining(), 2);
    }
}
