use std::net::SocketAddr;
use tokio::sync::mpsc;
use crate::{
    block::{block_len, num_blocks, Block, BlockData, BlockInfo},
    metainfo::MetaInfo,
    p2p::PeerCommand,
    store::StoreInfo,
    test_utils::{multi_file_torrent, single_file_torrent, TorrentFixture},
    torrent::{TorrentCommand, TorrentRx},
};
use super::{spawn, DiskCommand, DiskTx};

fn peer() -> SocketAddr {
    "10.0.0.1:6881".parse().unwrap()
}

struct Harness {
    info: StoreInfo,
    fixture: TorrentFixture,
    disk_tx: DiskTx,
    torrent_rx: TorrentRx,
    _dir: tempfile::TempDir,
}

fn start_disk(fixture: TorrentFixture) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let metainfo = MetaInfo::from_bytes(&fixture.bytes).unwrap();
    let info = StoreInfo::new(&metainfo, dir.path().to_path_buf());
    let (torrent_tx, torrent_rx) = mpsc::unbounded_channel();
    let (_, disk_tx) = spawn(info.clone(), metainfo.piece_hashes(), torrent_tx).unwrap();
    Harness { info, fixture, disk_tx, torrent_rx, _dir: dir }
}

impl Harness {

    async fn expect_storage_ready(&mut self) -> crate::Bitfield {
        match self.torrent_rx.recv().await.expect("disk task gone") {
            TorrentCommand::StorageReady { bitfield } => bitfield,
            _ => panic!("expected storage ready"),
        }
    }

    async fn expect_piece_written(&mut self) -> (usize, bool) {
        match self.torrent_rx.recv().await.expect("disk task gone") {
            TorrentCommand::PieceWritten { idx, valid, .. } => (idx, valid),
            _ => panic!("expected piece written"),
        }
    }

    // Feeds every block of a piece from the fixture payload.
    fn send_piece(&self, idx: usize, corrupt_last_byte: bool) {
        let piece_len = self.info.piece_length(idx);
        let piece_offset = self.info.piece_byte_offset(idx);
        for block_idx in 0..num_blocks(piece_len) {
            let offset = block_idx * crate::BLOCK_SIZE;
            let len = block_len(piece_len, block_idx);
            let mut data = self.fixture.payload[piece_offset + offset..piece_offset + offset + len].to_vec();
            if corrupt_last_byte && block_idx == num_blocks(piece_len) - 1 {
                *data.last_mut().unwrap() ^= 0xff;
            }
            self.disk_tx.send(DiskCommand::WriteBlock {
                block: Block { piece_idx: idx, offset, data: BlockData::Owned(data) },
                from: peer(),
            }).unwrap();
        }
    }

    fn on_disk(&self, path: &std::path::Path) -> Vec<u8> {
        std::fs::read(self.info.output_dir.join(path)).unwrap()
    }
}

// Two files of 8,192 and 12,288 bytes with 16 KiB pieces: piece 0 spans
// both files, piece 1 covers the tail of the second. Both files must end
// up byte exact.
#[tokio::test]
async fn test_multi_file_striping() {
    let fixture = multi_file_torrent(&[("a.bin", 8192), ("sub/b.bin", 12_288)], 16_384);
    let mut harness = start_disk(fixture);

    let bitfield = harness.expect_storage_ready().await;
    assert_eq!(bitfield.count_ones(), 0);

    harness.send_piece(0, false);
    assert_eq!(harness.expect_piece_written().await, (0, true));
    harness.send_piece(1, false);
    assert_eq!(harness.expect_piece_written().await, (1, true));

    let a = harness.on_disk(std::path::Path::new("a.bin"));
    let b = harness.on_disk(&std::path::Path::new("sub").join("b.bin"));
    assert_eq!(a.len(), 8192);
    assert_eq!(b.len(), 12_288);
    assert_eq!(a, &harness.fixture.payload[..8192]);
    assert_eq!(b, &harness.fixture.payload[8192..]);
}

// 20,000 byte file with 16 KiB pieces: the last piece is 3,616 bytes and
// the file on disk must be exactly 20,000 bytes.
#[tokio::test]
async fn test_last_piece_short_block() {
    let payload = crate::test_utils::fixture_payload(20_000);
    let fixture = single_file_torrent(&payload, 16_384);
    let mut harness = start_disk(fixture);
    harness.expect_storage_ready().await;

    assert_eq!(harness.info.piece_length(1), 3616);
    harness.send_piece(1, false);
    assert_eq!(harness.expect_piece_written().await, (1, true));
    harness.send_piece(0, false);
    assert_eq!(harness.expect_piece_written().await, (0, true));

    let on_disk = harness.on_disk(std::path::Path::new("test.bin"));
    assert_eq!(on_disk.len(), 20_000);
    assert_eq!(on_disk, harness.fixture.payload);
}

// A delivery with the final byte flipped fails verification and is
// discarded; a second, correct delivery succeeds.
#[tokio::test]
async fn test_hash_mismatch_recovery() {
    let payload = crate::test_utils::fixture_payload(32_768);
    let fixture = single_file_torrent(&payload, 16_384);
    let mut harness = start_disk(fixture);
    harness.expect_storage_ready().await;

    harness.send_piece(0, true);
    assert_eq!(harness.expect_piece_written().await, (0, false));

    harness.send_piece(0, false);
    assert_eq!(harness.expect_piece_written().await, (0, true));
}

// The upload reply path: a written block reads back byte exact.
#[tokio::test]
async fn test_read_block_round_trip() {
    let payload = crate::test_utils::fixture_payload(32_768);
    let fixture = single_file_torrent(&payload, 16_384);
    let mut harness = start_disk(fixture);
    harness.expect_storage_ready().await;

    harness.send_piece(0, false);
    assert_eq!(harness.expect_piece_written().await, (0, true));

    let (peer_tx, mut peer_rx) = mpsc::unbounded_channel();
    let request = BlockInfo { piece_idx: 0, offset: 0, len: crate::BLOCK_SIZE };
    harness.disk_tx.send(DiskCommand::ReadBlock { block: request, tx: peer_tx }).unwrap();

    match peer_rx.recv().await.expect("no read reply") {
        PeerCommand::BlockRead(block) => {
            assert_eq!(block.info(), request);
            assert_eq!(block.data.as_ref(), &harness.fixture.payload[..crate::BLOCK_SIZE]);
        },
        _ => panic!("expected block read"),
    }
}

// Files already on disk pass the startup check and come back as owned
// pieces, so nothing is downloaded twice across restarts.
#[tokio::test]
async fn test_startup_check_finds_existing_pieces() {
    let payload = crate::test_utils::fixture_payload(32_768);
    let fixture = single_file_torrent(&payload, 16_384);

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("test.bin"), &fixture.payload).unwrap();

    let metainfo = MetaInfo::from_bytes(&fixture.bytes).unwrap();
    let info = StoreInfo::new(&metainfo, dir.path().to_path_buf());
    let (torrent_tx, mut torrent_rx) = mpsc::unbounded_channel();
    let (_, _disk_tx) = spawn(info, metainfo.piece_hashes(), torrent_tx).unwrap();

    match torrent_rx.recv().await.expect("disk task gone") {
        TorrentCommand::StorageReady { bitfield } => {
            assert_eq!(bitfield.count_ones(), 2);
        },
        _ => panic!("expected storage ready"),
    }
}

// A half written file fails the hash check for the damaged piece only.
#[tokio::test]
async fn test_startup_check_rejects_damaged_piece() {
    let payload = crate::test_utils::fixture_payload(32_768);
    let fixture = single_file_torrent(&payload, 16_384);

    let dir = tempfile::tempdir().unwrap();
    let mut damaged = fixture.payload.clone();
    damaged[20_000] ^= 0xff; // inside piece 1
    std::fs::write(dir.path().join("test.bin"), &damaged).unwrap();

    let metainfo = MetaInfo::from_bytes(&fixture.bytes).unwrap();
    let info = StoreInfo::new(&metainfo, dir.path().to_path_buf());
    let (torrent_tx, mut torrent_rx) = mpsc::unbounded_channel();
    let (_, _disk_tx) = spawn(info, metainfo.piece_hashes(), torrent_tx).unwrap();

    match torrent_rx.recv().await.expect("disk task gone") {
        TorrentCommand::StorageReady { bitfield } => {
            assert!(bitfield[0]);
            assert!(!bitfield[1]);
        },
        _ => panic!("expected storage ready"),
    }
}
