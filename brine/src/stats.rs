use std::net::SocketAddr;
use crate::{p2p::state::SessionState, torrent::TorrentState};

// Snapshot published on the stats channel once a second. The embedder
// never reaches into the engine; this is the whole read surface.
#[derive(Debug, Default, Clone)]
pub struct TorrentStats {

    pub state: TorrentState,

    // Completed fraction of the payload, by verified bytes.
    pub progress: f64,

    // Wire totals since start.
    pub downloaded: u64,
    pub uploaded: u64,

    // Bytes still missing from the payload.
    pub left: u64,

    // Smoothed rates in bytes per second.
    pub down_rate: u64,
    pub up_rate: u64,

    pub eta_secs: Option<u64>,

    pub num_connected: usize,
    pub num_known: usize,

    pub pieces: PieceStats,

    pub peers: Vec<PeerStats>,

    // Last error kind observed, one line, alongside ordinary statistics.
    pub last_error: Option<String>,

}

#[derive(Debug, Default, Clone, Copy)]
pub struct PieceStats {

    pub num_pieces: usize,

    // Pieces currently being assembled.
    pub num_pending: usize,

    pub num_downloaded: usize,

}

impl PieceStats {
    pub fn is_seed(&self) -> bool {
        self.num_downloaded == self.num_pieces
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PeerStats {

    pub address: SocketAddr,

    pub state: SessionState,

}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThroughputStats {

    pub up: Counter,

    pub down: Counter,

}

impl ThroughputStats {
    pub fn reset(&mut self) {
        self.up.reset();
        self.down.reset();
    }
}

impl std::ops::AddAssign<&ThroughputStats> for ThroughputStats {
    fn add_assign(&mut self, other: &ThroughputStats) {
        self.up += other.up.round();
        self.down += other.down.round();
    }
}

// Byte counter with a 5 second smoothed rate. `round` holds the bytes of
// the current one second window and is folded into the average on reset.
#[derive(Debug, Default, Clone, Copy)]
pub struct Counter {
    total: u64,
    round: u64,
    avg: f64,
    peak: f64,
}

impl Counter {

    pub fn add(&mut self, n: u64) {
        self.total += n;
        self.round += n;
    }

    pub fn reset(&mut self) {
        self.avg = (self.avg * (5 - 1) as f64 / 5.0) + (self.round as f64 / 5.0);
        self.round = 0;
        if self.avg > self.peak {
            self.peak = self.avg;
        }
    }

    pub fn avg(&self) -> u64 {
        self.avg as u64
    }

    pub fn peak(&self) -> u64 {
        self.peak as u64
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn round(&self) -> u64 {
        self.round
    }

}

impl std::ops::AddAssign<u64> for Counter {
    fn add_assign(&mut self, n: u64) {
        self.add(n);
    }
}
