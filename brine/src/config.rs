use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};
use crate::{p2p::message::DEFAULT_MAX_FRAME_LEN, tracker::TrackerIdentity};

#[derive(Debug, Clone)]
pub struct TorrentConfig {

    pub output_dir: PathBuf,

    // Address to listen on for inbound peers; port 0 binds an ephemeral
    // port which is then reported to the tracker.
    pub listen_address: SocketAddr,

    // Fewer connected peers than the minimum triggers announces asking
    // for more; the maximum caps concurrent sessions.
    pub min_max_peers: (u32, u32),

    // Outstanding requests kept in flight per unchoked peer.
    pub target_request_queue_len: usize,

    // Frames above this terminate the session.
    pub max_frame_len: usize,

    // Interested peers unchoked at a time.
    pub max_upload_slots: usize,

    pub connect_timeout: Duration,

    pub request_timeout: Duration,

    // Silence limit in both directions; keep-alives go out at half this.
    pub keep_alive_interval: Duration,

    // How long shutdown waits for a session to flush its sends.
    pub drain_deadline: Duration,

    // Write a resume file on shutdown and read it on start.
    pub resume: bool,

    // Supplies the peer id, announce port/ip overrides and the optional
    // announce request transform.
    pub identity: TrackerIdentity,

}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("downloads"),
            listen_address: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 6881),
            min_max_peers: (5, 50),
            target_request_queue_len: 5,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            max_upload_slots: 4,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            keep_alive_interval: Duration::from_secs(120),
            drain_deadline: Duration::from_secs(2),
            resume: true,
            identity: TrackerIdentity::default(),
        }
    }
}
