use std::{ops::Range, path::PathBuf};
use crate::metainfo::MetaInfo;

// A file of the torrent when the payload is viewed as one contiguous
// byte array.
#[derive(Debug, Clone)]
pub struct FileInfo {

    // Path relative to the download root.
    pub path: PathBuf,

    // Length of the file in bytes.
    pub length: usize,

    // Offset in bytes from the start of the torrent.
    pub offset: usize,

}

impl FileInfo {

    // Byte index range within the whole torrent.
    pub fn byte_range(&self) -> Range<usize> {
        self.offset..(self.offset + self.length)
    }

}

// Storage layout shared by the disk task, the scheduler and the peer
// sessions.
#[derive(Debug, Clone)]
pub struct StoreInfo {

    // Length of torrent in bytes.
    pub total_len: u64,

    // Length of pieces in bytes.
    pub piece_len: usize,

    // Length of the last piece, in (0, piece_len].
    pub last_piece_len: usize,

    // Number of pieces in torrent.
    pub num_pieces: u32,

    // Files contained in torrent, in metainfo order.
    pub files: Vec<FileInfo>,

    // Directory to store downloaded files.
    pub output_dir: PathBuf,

}

impl StoreInfo {

    pub fn new(metainfo: &MetaInfo, output_dir: PathBuf) -> Self {

        let total_len = metainfo.total_len();
        let num_pieces = metainfo.num_pieces();
        let piece_len = metainfo.piece_len();
        let last_piece_len = (total_len - (piece_len as u64 * (num_pieces as u64 - 1))) as usize;
        let files = metainfo.files();
        // Multi-file torrents live under a directory named after the torrent.
        let output_dir = if metainfo.is_multi_file() {
            output_dir.join(metainfo.name())
        } else {
            output_dir
        };

        Self {
            total_len,
            piece_len,
            last_piece_len,
            num_pieces,
            files,
            output_dir,
        }
    }

    // Returns length of a piece given its index.
    pub fn piece_length(&self, idx: usize) -> usize {
        if idx as u32 == self.num_pieces - 1 {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }

    pub fn piece_byte_offset(&self, piece_idx: usize) -> usize {
        piece_idx * self.piece_len
    }

    // Indexes of the files that a piece intersects.
    pub fn piece_file_intersections(&self, piece_idx: usize) -> Range<usize> {
        debug_assert!(piece_idx < self.num_pieces as usize, "piece index out of bounds");

        // If only one file, there are no intersections to compute.
        if self.files.len() == 1 {
            return 0..1;
        }

        let offset = self.piece_byte_offset(piece_idx);
        let last = offset + self.piece_length(piece_idx) - 1;

        let start_file = self.files
            .iter()
            .position(|f| f.byte_range().contains(&offset))
            .expect("piece byte offset exceeds torrent length");

        let end_file = self.files[start_file..]
            .iter()
            .position(|f| f.byte_range().contains(&last))
            .map(|idx| start_file + idx)
            .expect("piece last byte exceeds torrent length");

        start_file..(end_file + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::multi_file_torrent;

    fn store(files: &[(&str, usize)], piece_length: usize) -> StoreInfo {
        let fixture = multi_file_torrent(files, piece_length);
        let metainfo = MetaInfo::from_bytes(&fixture.bytes).unwrap();
        StoreInfo::new(&metainfo, PathBuf::from("downloads"))
    }

    #[test]
    fn test_piece_file_intersections() {
        // Piece 0 spans both files, piece 1 only the second.
        let info = store(&[("a.bin", 8192), ("b.bin", 12_288)], 16_384);
        assert_eq!(info.piece_file_intersections(0), 0..2);
        assert_eq!(info.piece_file_intersections(1), 1..2);
    }

    #[test]
    fn test_piece_lengths() {
        let info = store(&[("a.bin", 8192), ("b.bin", 12_288)], 16_384);
        assert_eq!(info.piece_length(0), 16_384);
        assert_eq!(info.piece_length(1), 4096);
        assert_eq!(info.last_piece_len, 4096);
    }

    #[test]
    fn test_multi_file_output_dir() {
        let info = store(&[("a.bin", 4096), ("b.bin", 4096)], 8192);
        assert_eq!(info.output_dir, PathBuf::from("downloads").join("testdir"));
    }
}
