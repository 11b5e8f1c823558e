use std::{
    collections::HashSet,
    io::{Read, Seek, Write},
    net::SocketAddr,
    sync::Arc,
};
use sha1::{Digest, Sha1};
use crate::{block::Block, BLOCK_SIZE, ID};
use super::{DiskError, Result, TorrentFile};

// An in-flight piece being assembled from blocks. Presence is tracked per
// block; a legitimate block may be all zeros, so the data itself is never
// used as a sentinel.
#[derive(Debug)]
pub struct PieceBuf {

    // Piece hash originally given in metainfo.
    pub hash: ID,

    // Length of piece in bytes.
    pub len: usize,

    // Piece data.
    pub data: Vec<u8>,

    // Which blocks have been received.
    pub blocks_received: Vec<bool>,

    pub num_blocks_received: usize,

    // Range of file indices that the piece overlaps.
    pub file_range: std::ops::Range<usize>,

    // Peers that delivered blocks for this piece; feeds reliability
    // scoring once the hash check settles.
    pub contributors: HashSet<SocketAddr>,

}

impl PieceBuf {

    pub fn add_block(&mut self, block: &Block, from: SocketAddr) {
        let block_idx = block.offset / BLOCK_SIZE;
        if self.blocks_received[block_idx] {
            tracing::warn!("duplicate block in piece {} at offset {}", block.piece_idx, block.offset);
        } else {
            self.blocks_received[block_idx] = true;
            self.num_blocks_received += 1;
            self.data[block.offset..block.offset + block.data.len()]
                .copy_from_slice(block.data.as_ref());
            self.contributors.insert(from);
        }
    }

    pub fn is_complete(&self) -> bool {
        self.num_blocks_received == self.blocks_received.len()
    }

    // Hash the piece data and compare with the hash given in metainfo
    // (computationally expensive, runs on the blocking pool).
    pub fn verify_hash(&self) -> bool {
        let mut hasher = Sha1::new();
        hasher.update(&self.data);
        let hash = hasher.finalize();
        hash.as_slice() == self.hash
    }

    // Scatter-write the piece across every file region it covers.
    pub fn write(&self, piece_offset: usize, files: &[TorrentFile]) -> Result<()> {

        let mut total_offset = piece_offset;
        let mut bytes_written = 0;

        for file in files {
            let mut f = file.file_lock.write()?;

            let byte_range = file.byte_range();
            let file_offset = total_offset - byte_range.start;
            let piece_remaining = self.len - bytes_written;
            let file_remaining = byte_range.end - total_offset;
            let bytes_remaining = std::cmp::min(piece_remaining, file_remaining);

            f.seek(std::io::SeekFrom::Start(file_offset as u64))?;
            f.write_all(&self.data[bytes_written..bytes_written + bytes_remaining])?;

            total_offset += bytes_remaining;
            bytes_written += bytes_remaining;
        }

        if bytes_written != self.len {
            return Err(DiskError::IoSize {
                expected: self.len,
                actual: bytes_written,
            });
        }

        Ok(())
    }
}

// Reads a whole piece from the files it spans, split into blocks for the
// read cache.
pub fn read_piece(
    offset: usize,
    len: usize,
    files: &[TorrentFile],
) -> Result<Vec<Arc<Vec<u8>>>> {

    let mut bytes_read: usize = 0;
    let mut total_offset = offset;
    let mut buf = vec![0; len];

    for file in files.iter() {
        let mut f = file.file_lock.write()?;
        let byte_range = file.byte_range();

        let file_offset = total_offset.checked_sub(byte_range.start).ok_or(DiskError::IoSize {
            expected: byte_range.start,
            actual: total_offset,
        })?;

        let piece_remaining = len - bytes_read;
        let file_remaining = byte_range.end - total_offset;
        let bytes_remaining = std::cmp::min(piece_remaining, file_remaining);

        f.seek(std::io::SeekFrom::Start(file_offset as u64))?;
        let n = f.read(&mut buf[bytes_read..bytes_read + bytes_remaining])?;

        bytes_read += n;
        total_offset += n;
        // Short read: the file has not been extended this far yet.
        if n < bytes_remaining {
            break;
        }
    }

    if bytes_read != len {
        return Err(DiskError::IoSize {
            expected: len,
            actual: bytes_read,
        });
    }

    Ok(buf.chunks(BLOCK_SIZE)
        .map(|chunk| Arc::new(chunk.to_vec()))
        .collect())
}
