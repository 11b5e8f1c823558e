use std::sync::Arc;
use crate::{store::StoreInfo, BLOCK_SIZE};

// Identifies a block within a torrent; the payload of request and cancel
// messages, and the key for tracking outstanding requests.
#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy)]
pub struct BlockInfo {

    pub piece_idx: usize,

    // Offset in bytes of the block within its piece.
    pub offset: usize,

    pub len: usize,

}

impl BlockInfo {

    #[inline]
    pub fn idx_in_piece(&self) -> usize {
        self.offset / BLOCK_SIZE
    }

    // Requests from peers are untrusted and validated before they touch
    // the disk task.
    pub fn is_valid(&self, info: &StoreInfo) -> bool {
        self.piece_idx < info.num_pieces as usize
            && self.len > 0
            && self.len <= BLOCK_SIZE
            && self.offset % BLOCK_SIZE == 0
            && self.offset + self.len <= info.piece_length(self.piece_idx)
    }
}

// A block payload travelling between a peer session and the disk task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {

    pub piece_idx: usize,

    pub offset: usize,

    pub data: BlockData,

}

// Blocks served from the read cache share the underlying buffer instead
// of copying it per peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockData {
    Owned(Vec<u8>),
    Cached(Arc<Vec<u8>>),
}

impl Block {
    pub fn info(&self) -> BlockInfo {
        BlockInfo {
            piece_idx: self.piece_idx,
            offset: self.offset,
            len: self.data.len(),
        }
    }
}

impl BlockData {

    pub fn len(&self) -> usize {
        match self {
            BlockData::Owned(data) => data.len(),
            BlockData::Cached(data) => data.len(),
        }
    }
}

impl AsRef<[u8]> for BlockData {
    fn as_ref(&self) -> &[u8] {
        match self {
            BlockData::Owned(data) => data,
            BlockData::Cached(data) => data,
        }
    }
}

pub fn block_len(piece_len: usize, block_idx: usize) -> usize {
    BLOCK_SIZE.min(piece_len - (block_idx * BLOCK_SIZE))
}

pub fn num_blocks(piece_len: usize) -> usize {
    (piece_len + (BLOCK_SIZE - 1)) / BLOCK_SIZE
}
