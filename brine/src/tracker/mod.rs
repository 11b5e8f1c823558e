use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Instant,
};
use bytes::Buf;
use rand::Rng;
use tokio::{sync::watch, task::JoinHandle};
use tracing::Instrument;
use url::Url;
use crate::{torrent::{TorrentCommand, TorrentTx}, ID};

mod http;
pub use http::{AnnounceResponse, HttpTracker};

type Result<T> = std::result::Result<T, TrackerError>;
pub type TrackerTx = watch::Sender<Option<AnnounceParams>>;

// In cases where the tracker doesn't give us a min interval.
const DEFAULT_MIN_ANNOUNCE_INTERVAL: u64 = 60; // seconds

#[derive(thiserror::Error, Debug)]
pub enum TrackerError {

    #[error("request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("error decoding response: {0}")]
    Bencode(#[from] bencode::Error),

    #[error("announce timeout")]
    Timeout(#[from] tokio::time::error::Elapsed),

    // The `failure reason` key; surfaced without retry.
    #[error("tracker failure: {0}")]
    Failure(String),

    #[error("invalid response: {0}")]
    InvalidResponse(&'static str),

}

// A peer endpoint from an announce response. Dictionary-form responses
// may carry a peer id; compact ones never do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerPeer {

    pub address: SocketAddr,

    pub id: Option<ID>,

}

#[derive(Debug, Copy, Clone)]
pub struct AnnounceParams {

    // Hash of the info dict.
    pub info_hash: ID,

    // Urlencoded 20-byte string used as a unique ID for the client.
    pub peer_id: ID,

    // Port the client listens on.
    pub port: u16,

    // Total uploaded since the started event, in bytes.
    pub uploaded: u64,

    // Total downloaded since the started event, in bytes.
    pub downloaded: u64,

    // Bytes this client still has to download.
    pub left: u64,

    // Absent means a request performed at regular intervals.
    pub event: Option<Event>,

    // Number of peers the client would like to receive.
    pub num_want: Option<usize>,

}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Event {

    Started,

    Completed,

    Stopped,

}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Started => write!(f, "started"),
            Event::Completed => write!(f, "completed"),
            Event::Stopped => write!(f, "stopped"),
        }
    }
}

// Transform applied to the prepared announce request; what it does is
// opaque to the tracker client.
pub type RequestHook = Arc<dyn Fn(reqwest::RequestBuilder) -> reqwest::RequestBuilder + Send + Sync>;

// The identity layer's input into announces: the peer id we present, and
// optional overrides for the advertised port and source address.
#[derive(Clone)]
pub struct TrackerIdentity {

    pub peer_id: ID,

    // Overrides the bound listen port in announces when set.
    pub port: Option<u16>,

    // Sent as the `ip` parameter when set.
    pub source_ip: Option<Ipv4Addr>,

    pub wrap: Option<RequestHook>,

}

impl Default for TrackerIdentity {
    fn default() -> Self {
        Self {
            peer_id: gen_peer_id(),
            port: None,
            source_ip: None,
            wrap: None,
        }
    }
}

impl std::fmt::Debug for TrackerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerIdentity")
            .field("peer_id", &String::from_utf8_lossy(&self.peer_id))
            .field("port", &self.port)
            .field("source_ip", &self.source_ip)
            .field("wrap", &self.wrap.as_ref().map(|_| "<hook>"))
            .finish()
    }
}

// Azureus-style peer id: client tag then random digits.
pub fn gen_peer_id() -> ID {
    let mut id = *b"-BR0100-000000000000";
    let mut rng = rand::thread_rng();
    for b in id[8..].iter_mut() {
        *b = rng.gen_range(b'0'..=b'9');
    }
    id
}

// Runs announces for one torrent on its own task, walking tracker tiers
// in priority order. Announces are sequential; a new set of params only
// gets looked at once the previous cycle finished. The task exits after
// a stopped event or once the torrent drops the params channel.
pub fn spawn(
    tiers: Vec<Vec<Url>>,
    identity: TrackerIdentity,
    torrent_tx: TorrentTx,
) -> (JoinHandle<()>, TrackerTx) {

    let (params_tx, mut params_rx) = watch::channel(None);

    let handle = tokio::spawn(async move {
        let mut trackers: Vec<Vec<HttpTracker>> = tiers
            .into_iter()
            .map(|tier| {
                tier.into_iter()
                    .map(|url| HttpTracker::new(url, identity.clone()))
                    .collect()
            })
            .collect();

        while params_rx.changed().await.is_ok() {
            let params = *params_rx.borrow_and_update();
            if let Some(params) = params {
                announce_cycle(&mut trackers, params, &torrent_tx).await;
                if params.event == Some(Event::Stopped) {
                    break;
                }
            }
        }
    }.instrument(tracing::info_span!("tracker")));

    (handle, params_tx)
}

async fn announce_cycle(
    trackers: &mut [Vec<HttpTracker>],
    params: AnnounceParams,
    torrent_tx: &TorrentTx,
) {
    let time = Instant::now();
    let mut attempted = false;
    let mut last_error: Option<TrackerError> = None;

    for tier in trackers.iter_mut() {
        for i in 0..tier.len() {

            let due = params.event.is_some()
                || tier[i].should_announce(time)
                || (params.num_want.unwrap_or(0) > 0 && tier[i].can_announce(time));
            if !due {
                continue;
            }

            attempted = true;
            match tier[i].announce(params).await {
                Ok(resp) => {
                    tracing::debug!("{} peers from {}", resp.peers.len(), tier[i].url());
                    // The tracker that answered leads its tier next time.
                    tier.swap(0, i);
                    if !resp.peers.is_empty() {
                        torrent_tx.send(TorrentCommand::Peers { peers: resp.peers }).ok();
                    }
                    return;
                },
                Err(e) => {
                    tracing::warn!("tracker announce error: {}", e);
                    last_error = Some(e);
                },
            }
        }
    }

    // Every reachable tracker failed this cycle; the torrent keeps its
    // current peers but the user gets to see the error.
    if attempted {
        if let Some(e) = last_error {
            torrent_tx.send(TorrentCommand::TrackerFailed { error: e.to_string() }).ok();
        }
    }
}

// The first 4 bytes of each record are the IP address and the last 2 the
// port, all in network byte order.
pub fn parse_compact(mut bytes: &[u8]) -> Result<Vec<TrackerPeer>> {

    if bytes.len() % 6 != 0 {
        return Err(TrackerError::InvalidResponse("peer string not multiple of 6"));
    }

    let num_peers = bytes.len() / 6;
    let mut peers = Vec::with_capacity(num_peers);
    for _ in 0..num_peers {
        peers.push(TrackerPeer {
            address: SocketAddr::new(
                IpAddr::V4(Ipv4Addr::from(bytes.get_u32())),
                bytes.get_u16(),
            ),
            id: None,
        });
    }

    Ok(peers)
}

// Inverse of parse_compact; also used by the resume file.
pub fn encode_compact<'a>(addrs: impl IntoIterator<Item = &'a SocketAddr>) -> Vec<u8> {
    let mut out = Vec::new();
    for addr in addrs {
        if let IpAddr::V4(ip) = addr.ip() {
            out.extend_from_slice(&ip.octets());
            out.extend_from_slice(&addr.port().to_be_bytes());
        }
    }
    out
}
