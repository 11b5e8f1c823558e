use std::{collections::HashMap, time::Instant};
use crate::{block::*, BLOCK_SIZE};

#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub enum BlockState {

    // Block has not been requested.
    #[default]
    Free,

    // Block has been requested by at least 1 peer.
    Requested,

    // Block has been received.
    Received,

}

// Assembly progress of one piece being downloaded.
#[derive(Debug)]
pub struct PartialPiece {

    // Piece index.
    pub idx: usize,

    // Length of piece.
    pub len: usize,

    // State of all blocks within this piece.
    pub block_states: Vec<BlockState>,

}

impl PartialPiece {

    pub fn new(idx: usize, len: usize) -> Self {
        Self {
            idx,
            len,
            block_states: vec![BlockState::default(); num_blocks(len)],
        }
    }

    pub fn free_block(&mut self, block: &BlockInfo) {
        assert!(block.piece_idx == self.idx);
        let state = &mut self.block_states[block.idx_in_piece()];
        // Don't resurrect a block another peer already delivered.
        if *state == BlockState::Requested {
            *state = BlockState::Free;
        }
    }

    // After a failed hash check every block is fetched again.
    pub fn free_all_blocks(&mut self) {
        self.block_states.iter_mut().for_each(|b| *b = BlockState::Free)
    }

    // Returns whether the block is a duplicate (already received).
    pub fn received_block(&mut self, block: &BlockInfo) -> bool {
        let state = &mut self.block_states[block.idx_in_piece()];
        match *state {
            // A request that timed out or was freed on choke can still be
            // answered later; accept the bytes.
            BlockState::Free | BlockState::Requested => {
                *state = BlockState::Received;
                false
            },
            BlockState::Received => true,
        }
    }

    // Pick open blocks sequentially within a partially downloaded piece.
    // In endgame, blocks already requested elsewhere may be handed out
    // again, except to a peer that already holds the request.
    pub fn pick_next_blocks(
        &mut self,
        num: usize,
        buf: &mut Vec<BlockInfo>,
        prev: &HashMap<BlockInfo, Instant>,
        end_game: bool,
    ) -> usize {
        let mut num_picked = 0;
        for (i, block) in self.block_states.iter_mut().enumerate() {
            if num_picked == num {
                break;
            }

            let info = BlockInfo {
                piece_idx: self.idx,
                offset: i * BLOCK_SIZE,
                len: block_len(self.len, i),
            };

            match *block {
                BlockState::Free => {
                    buf.push(info);
                    *block = BlockState::Requested;
                    num_picked += 1;
                },
                BlockState::Requested if end_game => {
                    if !prev.contains_key(&info) {
                        buf.push(info);
                        num_picked += 1;
                    }
                },
                _ => {},
            }
        }
        num_picked
    }
}
