use rand::Rng;
use crate::Bitfield;

/*
Pieces are downloaded in rarest first order. The client keeps the initial
bitfield from each peer and updates it with every have message, then
downloads the pieces that appear least frequently across the connected
swarm. Selection includes randomization among the least common pieces at
the start of a download, as many clients all jumping on the same "least
common" piece would be counter productive.
*/

// Candidates considered by the bootstrap window before the first piece
// has verified.
const EARLY_PIECE_WINDOW: usize = 4;

#[derive(Clone, Copy, Default, Debug)]
struct PieceInfo {
    // Number of connected peers that have this piece.
    frequency: usize,
    // Is the piece currently being assembled.
    is_partial: bool,
}

#[derive(Debug)]
pub struct PiecePicker {

    // All pieces in the torrent, idx aligned.
    pieces: Vec<PieceInfo>,

    // The pieces that we have.
    have: Bitfield,

    // Pieces verified so far; gates the bootstrap window.
    num_verified: usize,

}

impl PiecePicker {

    pub fn new(num_pieces: usize) -> Self {
        let mut have = Bitfield::new();
        have.resize(num_pieces, false);
        Self {
            pieces: vec![PieceInfo::default(); num_pieces],
            have,
            num_verified: 0,
        }
    }

    pub fn own_bitfield(&self) -> &Bitfield {
        &self.have
    }

    // Seeds ownership from the startup disk check.
    pub fn set_own_bitfield(&mut self, bf: Bitfield) {
        debug_assert_eq!(bf.len(), self.have.len());
        self.num_verified = bf.count_ones();
        self.have = bf;
    }

    // After a have message. Returns true if the piece is one we lack,
    // i.e. the peer just became interesting.
    pub fn increment_piece(&mut self, idx: usize) -> bool {
        assert!(idx < self.pieces.len());
        self.pieces[idx].frequency += 1;
        !self.have[idx]
    }

    pub fn received_piece(&mut self, idx: usize) {
        assert!(idx < self.pieces.len());
        self.have.set(idx, true);
        self.pieces[idx].is_partial = false;
        self.num_verified += 1;
    }

    // Folds a whole bitfield into the frequency counts. Returns true if
    // the peer has at least one piece we don't.
    pub fn bitfield_update(&mut self, bf: &Bitfield) -> bool {
        debug_assert_eq!(bf.len(), self.have.len());
        let mut interested = false;
        bf.iter()
            .enumerate()
            .filter(|(_, b)| **b)
            .for_each(|(i, _)| {
                self.pieces[i].frequency += 1;
                if !self.have[i] {
                    interested = true;
                }
            });
        interested
    }

    // Rarity counts only cover currently connected peers, so a leaving
    // peer's bitfield is subtracted again.
    pub fn bitfield_remove(&mut self, bf: &Bitfield) {
        debug_assert_eq!(bf.len(), self.have.len());
        bf.iter()
            .enumerate()
            .filter(|(_, b)| **b)
            .for_each(|(i, _)| {
                self.pieces[i].frequency = self.pieces[i].frequency.saturating_sub(1);
            });
    }

    // True when the peer owns at least one piece we are missing.
    pub fn peer_is_interesting(&self, bf: &Bitfield) -> bool {
        bf.iter()
            .enumerate()
            .any(|(i, b)| *b && !self.have[i])
    }

    // Rarest-first selection over the pieces the given peer has. Ties
    // break to the lowest index. Until the first piece verifies, the
    // choice is uniform among the first few rarest candidates so that a
    // cold swarm doesn't pile onto one piece.
    pub fn pick_new_piece(&mut self, bf: &Bitfield) -> Option<usize> {

        let mut candidates: Vec<(usize, usize)> = Vec::new();
        for idx in 0..self.have.len() {
            let piece = &self.pieces[idx];
            if !self.have[idx] && piece.frequency > 0 && !piece.is_partial && bf[idx] {
                candidates.push((piece.frequency, idx));
            }
        }
        if candidates.is_empty() {
            return None;
        }
        candidates.sort_unstable();

        let chosen = if self.num_verified == 0 {
            let window = candidates.len().min(EARLY_PIECE_WINDOW);
            candidates[rand::thread_rng().gen_range(0..window)].1
        } else {
            candidates[0].1
        };

        self.pieces[chosen].is_partial = true;
        Some(chosen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitvec::prelude::*;

    fn full_bf(n: usize) -> Bitfield {
        BitVec::repeat(true, n)
    }

    #[test]
    fn test_rarest_first_order() {
        let mut picker = PiecePicker::new(4);
        // One piece is verified already so the bootstrap window is off.
        picker.set_own_bitfield({
            let mut bf = Bitfield::repeat(false, 4);
            bf.set(3, true);
            bf
        });

        // Piece 2 is on one peer, pieces 0 and 1 on two.
        let mut sparse = Bitfield::repeat(false, 4);
        sparse.set(0, true);
        sparse.set(1, true);
        picker.bitfield_update(&full_bf(4));
        picker.bitfield_update(&sparse);

        assert_eq!(picker.pick_new_piece(&full_bf(4)), Some(2));
        // Rarest gone; ties at frequency 2 break to the lowest index.
        assert_eq!(picker.pick_new_piece(&full_bf(4)), Some(0));
        assert_eq!(picker.pick_new_piece(&full_bf(4)), Some(1));
        assert_eq!(picker.pick_new_piece(&full_bf(4)), None);
    }

    #[test]
    fn test_early_window_stays_within_candidates() {
        let mut picker = PiecePicker::new(16);
        picker.bitfield_update(&full_bf(16));
        // Nothing verified yet: picks must come from the four rarest, which
        // are all tied here, so indexes 0..4.
        for _ in 0..4 {
            let idx = picker.pick_new_piece(&full_bf(16)).unwrap();
            assert!(idx < 4 + 4, "early pick {} outside window", idx);
        }
    }

    #[test]
    fn test_respects_peer_bitfield() {
        let mut picker = PiecePicker::new(3);
        picker.bitfield_update(&full_bf(3));
        let mut only_two = Bitfield::repeat(false, 3);
        only_two.set(2, true);
        assert_eq!(picker.pick_new_piece(&only_two), Some(2));
        assert_eq!(picker.pick_new_piece(&only_two), None);
    }

    #[test]
    fn test_disconnect_decrements_rarity() {
        let mut picker = PiecePicker::new(2);
        let bf = full_bf(2);
        picker.bitfield_update(&bf);
        picker.bitfield_remove(&bf);
        // No connected peer has anything now.
        assert_eq!(picker.pick_new_piece(&full_bf(2)), None);
    }

    #[test]
    fn test_interest() {
        let mut picker = PiecePicker::new(2);
        let mut bf = Bitfield::repeat(false, 2);
        assert!(!picker.peer_is_interesting(&bf));
        bf.set(1, true);
        assert!(picker.peer_is_interesting(&bf));
        picker.received_piece(1);
        assert!(!picker.peer_is_interesting(&bf));
    }
}
