use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
    time::Instant,
};
use tokio::sync::RwLock;
use crate::{block::BlockInfo, Bitfield};

pub mod piece_picker;
pub mod partial_piece;

use piece_picker::PiecePicker;
use partial_piece::PartialPiece;

// Owns all download scheduling state: the piece rarity table, the own
// bitmap and the per-piece assembly progress. Sessions only touch it
// through this api.
#[derive(Debug)]
pub struct Picker {

    pub piece_picker: RwLock<PiecePicker>,

    pub partial_pieces: RwLock<HashMap<usize, RwLock<PartialPiece>>>,

    num_pieces: u32,

    piece_len: usize,

    last_piece_len: usize,

    // Set once every missing piece is in flight; duplicate requests are
    // allowed from then on.
    endgame: AtomicBool,

}

impl Picker {

    pub fn new(num_pieces: u32, piece_len: usize, last_piece_len: usize) -> Self {
        Self {
            piece_picker: RwLock::new(PiecePicker::new(num_pieces as usize)),
            partial_pieces: RwLock::new(HashMap::new()),
            num_pieces,
            piece_len,
            last_piece_len,
            endgame: AtomicBool::new(false),
        }
    }

    pub fn is_endgame(&self) -> bool {
        self.endgame.load(Ordering::Relaxed)
    }

    fn piece_length(&self, idx: usize) -> usize {
        if idx as u32 == self.num_pieces - 1 {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }

    // Picks up to the pipeline budget of blocks for one peer: first from
    // pieces already in flight, then from fresh rarest-first picks, and
    // finally, in endgame, by duplicating outstanding requests.
    pub async fn pick_blocks(
        &self,
        current_requests: &HashMap<BlockInfo, Instant>,
        target_queue_len: usize,
        bf: &Bitfield,
    ) -> Vec<BlockInfo> {

        let mut requests = vec![];
        let mut remaining = target_queue_len.saturating_sub(current_requests.len());
        if remaining == 0 {
            return vec![];
        }

        // Attempt to pick blocks from partially downloaded pieces.
        for partial_piece in self.partial_pieces.write().await.values_mut() {

            if remaining == 0 {
                break;
            }

            // Skip pieces that peer does not have.
            if !bf[partial_piece.read().await.idx] {
                continue;
            }

            remaining -= partial_piece
                .write()
                .await
                .pick_next_blocks(remaining, &mut requests, current_requests, false);
        }

        // Pick blocks from new pieces.
        while remaining != 0 {

            if let Some(idx) = self.piece_picker.write().await.pick_new_piece(bf) {
                tracing::trace!("picked piece {}", idx);
                let mut partial_piece = PartialPiece::new(idx, self.piece_length(idx));
                remaining -= partial_piece.pick_next_blocks(remaining, &mut requests, current_requests, false);
                self.partial_pieces.write().await.insert(idx, partial_piece.into());

            } else {
                // Every missing piece is in flight; duplicate requests so a
                // single slow peer can't stall the tail of the download.
                let before = requests.len();
                for partial_piece in self.partial_pieces.write().await.values_mut() {

                    if remaining == 0 {
                        break;
                    }
                    if !bf[partial_piece.read().await.idx] {
                        continue;
                    }

                    remaining -= partial_piece
                        .write()
                        .await
                        .pick_next_blocks(remaining, &mut requests, current_requests, true);
                }
                if requests.len() > before {
                    self.endgame.store(true, Ordering::Relaxed);
                }
                break;
            }
        }
        requests
    }

    // A block request freed by a choke, timeout or disconnect.
    pub async fn free_block(&self, block: &BlockInfo) {
        if let Some(partial_piece) = self.partial_pieces.read().await.get(&block.piece_idx) {
            partial_piece.write().await.free_block(block);
        }
    }

    // Marks a delivered block. Returns true if it was a duplicate.
    pub async fn received_block(&self, block: &BlockInfo) -> Option<bool> {
        let partial_pieces = self.partial_pieces.read().await;
        if let Some(partial_piece) = partial_pieces.get(&block.piece_idx) {
            Some(partial_piece.write().await.received_block(block))
        } else {
            None
        }
    }

    // A verified piece leaves the assembly table and flips the bitmap.
    pub async fn piece_verified(&self, idx: usize) {
        self.partial_pieces.write().await.remove(&idx);
        self.piece_picker.write().await.received_piece(idx);
    }

    // A piece that failed verification is re-fetched from scratch.
    pub async fn piece_rejected(&self, idx: usize) {
        if let Some(partial_piece) = self.partial_pieces.read().await.get(&idx) {
            partial_piece.write().await.free_all_blocks();
        }
        self.endgame.store(false, Ordering::Relaxed);
    }
}
