mod metainfo;
mod store;
mod torrent;
mod tracker;
mod p2p;
mod disk;
mod block;
mod picker;
mod swarm;
mod stats;
mod config;
mod resume;

#[cfg(test)]
mod test_utils;

// The unit of request over the wire, 16 KiB.
const BLOCK_SIZE: usize = 0x4000;

// 20-byte SHA-1 output: infohashes, piece hashes, peer ids.
pub type ID = [u8; 20];

// MSB-first so the in-memory layout is the wire layout of the bitfield
// message.
type Bitfield = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

pub use block::BlockInfo;
pub use config::TorrentConfig;
pub use disk::DiskError;
pub use metainfo::{File, Info, MetaInfo, MetaInfoError};
pub use p2p::state::{ConnState, SessionState};
pub use stats::{Counter, PeerStats, PieceStats, ThroughputStats, TorrentStats};
pub use torrent::{Torrent, TorrentCommand, TorrentError, TorrentEvent, TorrentState};
pub use tracker::{RequestHook, TrackerIdentity, TrackerPeer};
