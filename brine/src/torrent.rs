use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{atomic::AtomicUsize, Arc},
    time::{Duration, Instant},
};
use tokio::{net::TcpListener, sync::{mpsc, watch}, time};
use tokio_util::sync::CancellationToken;
use url::Url;
use crate::{
    config::TorrentConfig,
    disk::{self, DiskCommand, DiskError, DiskTx},
    metainfo::MetaInfo,
    p2p::{state::SessionState, PeerCommand, PeerHandle},
    picker::Picker,
    resume::ResumeData,
    stats::{PeerStats, PieceStats, ThroughputStats, TorrentStats},
    store::StoreInfo,
    swarm::{SwarmKey, SwarmSelector},
    tracker::{self, AnnounceParams, Event, TrackerPeer, TrackerTx},
    block::BlockInfo,
    Bitfield,
    ID,
};

#[derive(Debug, thiserror::Error)]
pub enum TorrentError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Disk(#[from] DiskError),

    #[error("channel error: {0}")]
    Channel(String),

}

impl<T> From<mpsc::error::SendError<T>> for TorrentError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        TorrentError::Channel(e.to_string())
    }
}

// Type aliases.
pub type Result<T> = std::result::Result<T, TorrentError>;
pub type TorrentTx = mpsc::UnboundedSender<TorrentCommand>;
pub type TorrentRx = mpsc::UnboundedReceiver<TorrentCommand>;

// Commands into the torrent task; everything the sessions, the disk and
// the tracker report funnels through here so that shared state has a
// single writer.
pub enum TorrentCommand {

    // Sent by a session once the handshake checks out.
    PeerConnected { address: SocketAddr, id: ID },

    // Per-second state and throughput report from a session.
    PeerState { address: SocketAddr, state: SessionState },

    // A session ended; its bitfield comes back so rarity counts only
    // cover connected peers.
    PeerDisconnected {
        address: SocketAddr,
        bitfield: Option<Bitfield>,
        error: Option<String>,
    },

    // First delivery of an endgame-duplicated block.
    BlockReceived { info: BlockInfo, from: SocketAddr },

    // Sent by the disk task when a completed piece settled.
    PieceWritten { idx: usize, valid: bool, contributors: Vec<SocketAddr> },

    // Result of the startup disk check.
    StorageReady { bitfield: Bitfield },

    // The destination is unusable; fatal to the torrent.
    StorageError { error: String },

    // Fresh endpoints from an announce.
    Peers { peers: Vec<TrackerPeer> },

    // Every reachable tracker failed one announce cycle.
    TrackerFailed { error: String },

    Pause,

    Resume,

    Shutdown,

}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum TorrentState {
    #[default]
    Starting,
    Downloading,
    Seeding,
    Paused,
    Stopped,
    Error,
}

impl std::fmt::Display for TorrentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TorrentState::Starting => write!(f, "starting"),
            TorrentState::Downloading => write!(f, "downloading"),
            TorrentState::Seeding => write!(f, "seeding"),
            TorrentState::Paused => write!(f, "paused"),
            TorrentState::Stopped => write!(f, "stopped"),
            TorrentState::Error => write!(f, "error"),
        }
    }
}

// Notable moments, for embedders that want more than the stats stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TorrentEvent {
    PieceVerified { idx: usize },
    PieceFailed { idx: usize },
    DownloadComplete,
    TrackerError { error: String },
    StorageError { error: String },
    Stopped,
}

// Read-only state shared with every session task.
#[derive(Debug)]
pub struct TorrentContext {

    pub info_hash: ID,

    pub client_id: ID,

    // All download scheduling state.
    pub picker: Picker,

    pub torrent_tx: TorrentTx,

    pub disk_tx: DiskTx,

    pub info: StoreInfo,

    pub config: TorrentConfig,

    // Upload slots currently handed out to interested peers.
    pub upload_slots: AtomicUsize,

    // Cooperative shutdown for every task of this torrent.
    pub cancel: CancellationToken,

}

pub struct Torrent {

    ctx: Arc<TorrentContext>,

    // Peers we have active sessions with.
    peers: HashMap<SocketAddr, PeerHandle>,

    // Every endpoint we have heard of, with the peer id when known.
    known: HashMap<SocketAddr, Option<ID>>,

    // Tracker tiers, handed to the tracker task on start.
    tiers: Vec<Vec<Url>>,

    torrent_rx: TorrentRx,

    torrent_tx: TorrentTx,

    listen_address: SocketAddr,

    disk_handle: Option<tokio::task::JoinHandle<disk::Result<()>>>,

    tracker_handle: Option<tokio::task::JoinHandle<()>>,

    params_tx: Option<TrackerTx>,

    swarm: SwarmSelector,

    state: TorrentState,

    start_time: Option<Instant>,

    // Wire throughput across all sessions.
    throughput: ThroughputStats,

    // Bytes of payload verified and on disk.
    verified_bytes: u64,

    // Carried over from a resume file.
    resumed_uploaded: u64,
    resumed_downloaded: u64,

    storage_ready: bool,

    completed_sent: bool,

    last_error: Option<String>,

    stats_tx: watch::Sender<TorrentStats>,
    stats_rx: watch::Receiver<TorrentStats>,

    event_tx: mpsc::UnboundedSender<TorrentEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<TorrentEvent>>,

}

impl Torrent {

    // Must be called within a tokio runtime; the disk task starts
    // immediately so that the startup check overlaps connecting.
    pub fn new(metainfo: MetaInfo, config: TorrentConfig) -> Result<Self> {

        let info = StoreInfo::new(&metainfo, config.output_dir.clone());
        let (torrent_tx, torrent_rx) = mpsc::unbounded_channel();
        let (disk_handle, disk_tx) = disk::spawn(info.clone(), metainfo.piece_hashes(), torrent_tx.clone())?;
        let (stats_tx, stats_rx) = watch::channel(TorrentStats::default());
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let listen_address = config.listen_address;
        let client_id = config.identity.peer_id;

        Ok(Torrent {
            ctx: Arc::new(TorrentContext {
                info_hash: metainfo.info_hash(),
                client_id,
                picker: Picker::new(info.num_pieces, info.piece_len, info.last_piece_len),
                torrent_tx: torrent_tx.clone(),
                disk_tx,
                info,
                config,
                upload_slots: AtomicUsize::new(0),
                cancel: CancellationToken::new(),
            }),
            peers: HashMap::new(),
            known: HashMap::new(),
            tiers: metainfo.trackers(),
            torrent_rx,
            torrent_tx,
            listen_address,
            disk_handle: Some(disk_handle),
            tracker_handle: None,
            params_tx: None,
            swarm: SwarmSelector::default(),
            state: TorrentState::Starting,
            start_time: None,
            throughput: ThroughputStats::default(),
            verified_bytes: 0,
            resumed_uploaded: 0,
            resumed_downloaded: 0,
            storage_ready: false,
            completed_sent: false,
            last_error: None,
            stats_tx,
            stats_rx,
            event_tx,
            event_rx: Some(event_rx),
        })
    }

    // Stats snapshots at 1 Hz.
    pub fn stats(&self) -> watch::Receiver<TorrentStats> {
        self.stats_rx.clone()
    }

    // The events stream; can be taken once.
    pub fn events(&mut self) -> Option<mpsc::UnboundedReceiver<TorrentEvent>> {
        self.event_rx.take()
    }

    // For sending Pause/Resume/Shutdown from outside.
    pub fn command_tx(&self) -> TorrentTx {
        self.torrent_tx.clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.ctx.cancel.clone()
    }

    // Runs the torrent to shutdown. Errors only escape from binding the
    // listen socket; after that everything is reported on the stats and
    // event channels.
    #[tracing::instrument(skip(self), fields(info_hash = %hex::encode(self.ctx.info_hash)))]
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!("starting torrent");
        self.start_time = Some(Instant::now());
        if self.ctx.config.resume {
            self.load_resume();
        }
        self.run().await
    }

    async fn run(&mut self) -> Result<()> {

        let listener = TcpListener::bind(&self.listen_address).await?;
        self.listen_address = listener.local_addr()?;
        tracing::info!("listening on {}", self.listen_address);

        let (tracker_handle, params_tx) = tracker::spawn(
            std::mem::take(&mut self.tiers),
            self.ctx.config.identity.clone(),
            self.torrent_tx.clone(),
        );
        self.tracker_handle = Some(tracker_handle);
        self.params_tx = Some(params_tx);

        let mut stats_ticker = time::interval(Duration::from_secs(1));

        // Top level torrent loop.
        loop { tokio::select! {

            _ = self.ctx.cancel.cancelled() => break,

            new_peer_conn = listener.accept() => {
                match new_peer_conn {
                    Ok((stream, address)) => self.accept_peer(stream, address),
                    Err(e) => tracing::warn!("inbound peer connection error: {}", e),
                }
            },

            Some(cmd) = self.torrent_rx.recv() => {
                if !self.handle_command(cmd).await {
                    break;
                }
            },

            _ = stats_ticker.tick() => self.update_stats().await,

        }}

        self.shutdown().await
    }

    fn accept_peer(&mut self, stream: tokio::net::TcpStream, address: SocketAddr) {
        if self.state == TorrentState::Paused
            || self.state == TorrentState::Error
            || self.peers.len() >= self.ctx.config.min_max_peers.1 as usize
            || self.swarm.is_blacklisted(&self.key_for(address))
        {
            tracing::debug!("rejecting inbound connection from {}", address);
            return;
        }
        tracing::info!("inbound connection from {}", address);
        self.known.entry(address).or_insert(None);
        self.peers.insert(
            address,
            PeerHandle::start_session(address, self.ctx.clone(), Some(stream)),
        );
    }

    // Returns false when the torrent should stop.
    async fn handle_command(&mut self, cmd: TorrentCommand) -> bool {
        match cmd {

            TorrentCommand::PeerConnected { address, id } => {
                if let Some(peer) = self.peers.get_mut(&address) {
                    peer.id = Some(id);
                }
                self.known.insert(address, Some(id));
                if self.state == TorrentState::Starting {
                    self.state = TorrentState::Downloading;
                }
            },

            TorrentCommand::PeerState { address, state } => {
                let sample = state.throughput.down.round();
                self.throughput += &state.throughput;
                let key = self.key_for(address);
                if sample > 0 {
                    self.swarm.record_throughput(key.clone(), sample);
                }
                if let Some(rtt) = state.request_rtt {
                    self.swarm.record_response_time(key, rtt.as_secs_f64());
                }
                if let Some(peer) = self.peers.get_mut(&address) {
                    peer.state = state;
                }
            },

            TorrentCommand::PeerDisconnected { address, bitfield, error } => {
                self.peers.remove(&address);
                if let Some(bitfield) = bitfield {
                    self.ctx.picker.piece_picker.write().await.bitfield_remove(&bitfield);
                }
                if let Some(error) = error {
                    tracing::debug!("peer {} failed: {}", address, error);
                    let key = self.key_for(address);
                    self.swarm.record_failure(key);
                    self.last_error = Some(error);
                }
                self.connect_to_peers();
            },

            TorrentCommand::BlockReceived { info, from } => {
                // Cancel the duplicates everyone else is holding.
                for (address, peer) in self.peers.iter() {
                    if *address != from {
                        peer.peer_tx.send(PeerCommand::BlockReceived(info)).ok();
                    }
                }
            },

            TorrentCommand::PieceWritten { idx, valid, contributors } => {
                self.handle_piece_written(idx, valid, contributors).await;
            },

            TorrentCommand::StorageReady { bitfield } => {
                self.verified_bytes = (0..self.ctx.info.num_pieces as usize)
                    .filter(|i| bitfield[*i])
                    .map(|i| self.ctx.info.piece_length(i) as u64)
                    .sum();
                if bitfield.all() {
                    self.state = TorrentState::Seeding;
                    self.completed_sent = true;
                }
                self.ctx.picker.piece_picker.write().await.set_own_bitfield(bitfield);
                self.storage_ready = true;

                // The first announce carries the started event.
                self.push_announce(Some(Event::Started));
                self.connect_to_peers();
            },

            TorrentCommand::StorageError { error } => {
                tracing::error!("storage error: {}", error);
                self.state = TorrentState::Error;
                self.last_error = Some(error.clone());
                self.send_event(TorrentEvent::StorageError { error });
                return false;
            },

            TorrentCommand::Peers { peers } => {
                for peer in peers {
                    match self.known.get_mut(&peer.address) {
                        Some(known_id) => {
                            if known_id.is_none() {
                                *known_id = peer.id;
                            }
                        },
                        None => {
                            self.known.insert(peer.address, peer.id);
                        },
                    }
                }
                tracing::debug!("{} peers known", self.known.len());
                self.connect_to_peers();
            },

            TorrentCommand::TrackerFailed { error } => {
                self.last_error = Some(error.clone());
                self.send_event(TorrentEvent::TrackerError { error });
            },

            TorrentCommand::Pause => {
                if self.state != TorrentState::Paused {
                    tracing::info!("pausing torrent");
                    self.state = TorrentState::Paused;
                    for peer in self.peers.values() {
                        peer.peer_tx.send(PeerCommand::Shutdown).ok();
                    }
                }
            },

            TorrentCommand::Resume => {
                if self.state == TorrentState::Paused {
                    tracing::info!("resuming torrent");
                    self.state = if self.completed_sent {
                        TorrentState::Seeding
                    } else {
                        TorrentState::Starting
                    };
                    self.push_announce(None);
                    self.connect_to_peers();
                }
            },

            TorrentCommand::Shutdown => return false,

        }
        true
    }

    async fn handle_piece_written(&mut self, idx: usize, valid: bool, contributors: Vec<SocketAddr>) {

        if valid {
            // Bitmap and assembly state flip before anyone is told, so no
            // new request for this piece can be scheduled after the have.
            self.ctx.picker.piece_verified(idx).await;
            self.verified_bytes += self.ctx.info.piece_length(idx) as u64;

            for address in &contributors {
                let key = self.key_for(*address);
                self.swarm.record_verification(key, true);
            }

            let missing = self.ctx.info.num_pieces as usize
                - self.ctx.picker.piece_picker.read().await.own_bitfield().count_ones();
            tracing::info!("piece {} verified, {} pieces remain", idx, missing);

            for peer in self.peers.values() {
                peer.peer_tx.send(PeerCommand::PieceWritten(idx)).ok();
            }
            self.send_event(TorrentEvent::PieceVerified { idx });

            if missing == 0 && !self.completed_sent {
                self.completed_sent = true;
                self.state = TorrentState::Seeding;
                tracing::info!("download complete");
                self.push_announce(Some(Event::Completed));
                self.send_event(TorrentEvent::DownloadComplete);
            }

        } else {
            // The bytes are gone; the piece goes back into rarest-first
            // selection and whoever fed it loses reliability.
            self.last_error = Some(format!("piece {} failed verification", idx));
            self.ctx.picker.piece_rejected(idx).await;
            for address in &contributors {
                let key = self.key_for(*address);
                self.swarm.record_verification(key, false);
            }
            self.send_event(TorrentEvent::PieceFailed { idx });
        }
    }

    fn connect_to_peers(&mut self) {

        if !self.storage_ready
            || matches!(self.state, TorrentState::Paused | TorrentState::Error | TorrentState::Stopped)
        {
            return;
        }

        let budget = (self.ctx.config.min_max_peers.1 as usize).saturating_sub(self.peers.len());
        if budget == 0 {
            return;
        }

        let candidates: Vec<(SocketAddr, SwarmKey)> = self.known
            .keys()
            .filter(|address| !self.peers.contains_key(address))
            .map(|address| (*address, self.key_for(*address)))
            .collect();
        if candidates.is_empty() {
            return;
        }

        let selected = self.swarm.select(candidates, budget);
        tracing::info!("connecting to {} peers", selected.len());
        for address in selected {
            let handle = PeerHandle::start_session(address, self.ctx.clone(), None);
            self.peers.insert(address, handle);
        }
    }

    // Scores follow the peer id when one is known, from the handshake or
    // a dictionary-form announce, and fall back to the endpoint.
    fn key_for(&self, address: SocketAddr) -> SwarmKey {
        if let Some(id) = self.peers.get(&address).and_then(|p| p.id) {
            return SwarmKey::Id(id);
        }
        match self.known.get(&address) {
            Some(Some(id)) => SwarmKey::Id(*id),
            _ => SwarmKey::Addr(address),
        }
    }

    fn send_event(&self, event: TorrentEvent) {
        self.event_tx.send(event).ok();
    }

    // Keeps the announce params fresh; the tracker task decides, per
    // tracker, whether the intervals actually allow an announce.
    fn push_announce(&self, event: Option<Event>) {
        let Some(params_tx) = &self.params_tx else { return };

        let num_peers = self.peers.len()
            + self.known.keys().filter(|a| !self.peers.contains_key(a)).count();
        let num_want = if event == Some(Event::Stopped)
            || num_peers >= self.ctx.config.min_max_peers.0 as usize
        {
            None
        } else {
            Some((self.ctx.config.min_max_peers.1 as usize).saturating_sub(num_peers))
        };

        params_tx.send_replace(Some(AnnounceParams {
            info_hash: self.ctx.info_hash,
            peer_id: self.ctx.client_id,
            port: self.listen_address.port(),
            uploaded: self.resumed_uploaded + self.throughput.up.total(),
            downloaded: self.resumed_downloaded + self.throughput.down.total(),
            left: self.ctx.info.total_len.saturating_sub(self.verified_bytes),
            event,
            num_want,
        }));
    }

    async fn update_stats(&mut self) {

        // Fold this second's bytes into the rates.
        self.throughput.reset();
        let down_rate = self.throughput.down.avg();
        let up_rate = self.throughput.up.avg();

        let left = self.ctx.info.total_len.saturating_sub(self.verified_bytes);
        let eta_secs = if left == 0 {
            Some(0)
        } else if down_rate > 0 {
            Some(left / down_rate)
        } else {
            None
        };

        let num_downloaded = self.ctx.picker.piece_picker.read().await.own_bitfield().count_ones();
        let num_pending = self.ctx.picker.partial_pieces.read().await.len();

        let stats = TorrentStats {
            state: self.state,
            progress: if self.ctx.info.total_len == 0 {
                0.0
            } else {
                self.verified_bytes as f64 / self.ctx.info.total_len as f64
            },
            downloaded: self.resumed_downloaded + self.throughput.down.total(),
            uploaded: self.resumed_uploaded + self.throughput.up.total(),
            left,
            down_rate,
            up_rate,
            eta_secs,
            num_connected: self.peers.len(),
            num_known: self.known.len(),
            pieces: PieceStats {
                num_pieces: self.ctx.info.num_pieces as usize,
                num_pending,
                num_downloaded,
            },
            peers: self.peers
                .iter()
                .map(|(address, peer)| PeerStats { address: *address, state: peer.state })
                .collect(),
            last_error: self.last_error.clone(),
        };
        self.stats_tx.send_replace(stats);

        // Keep the tracker task fed; it applies the interval rules.
        if self.storage_ready && self.state != TorrentState::Paused {
            self.push_announce(None);
        }
    }

    async fn shutdown(&mut self) -> Result<()> {

        tracing::info!("disconnecting from {} peers", self.peers.len());
        self.ctx.cancel.cancel();
        for peer in self.peers.values() {
            peer.peer_tx.send(PeerCommand::Shutdown).ok();
        }
        let drain = self.ctx.config.drain_deadline + Duration::from_secs(1);
        for (_, mut peer) in self.peers.drain() {
            if let Some(handle) = peer.session_handle.take() {
                if time::timeout(drain, handle).await.is_err() {
                    tracing::warn!("session did not drain before the deadline");
                }
            }
        }

        // Storage drains pending writes before the torrent lets go.
        self.ctx.disk_tx.send(DiskCommand::Shutdown).ok();
        if let Some(handle) = self.disk_handle.take() {
            match handle.await {
                Ok(Ok(())) => {},
                Ok(Err(e)) => tracing::error!("disk shutdown error: {}", e),
                Err(e) => tracing::error!("disk task panicked: {}", e),
            }
        }

        // Courtesy stopped announce, bounded so shutdown stays prompt.
        self.push_announce(Some(Event::Stopped));
        if let Some(mut handle) = self.tracker_handle.take() {
            if time::timeout(Duration::from_secs(5), &mut handle).await.is_err() {
                tracing::warn!("stopped announce did not finish in time");
                handle.abort();
            }
        }

        if self.ctx.config.resume {
            self.write_resume().await;
        }

        if self.state != TorrentState::Error {
            self.state = TorrentState::Stopped;
        }
        self.send_event(TorrentEvent::Stopped);
        self.update_stats().await;
        match self.start_time {
            Some(start) => tracing::info!("torrent stopped after {:?}", start.elapsed()),
            None => tracing::info!("torrent stopped"),
        }
        Ok(())
    }

    fn load_resume(&mut self) {
        let path = ResumeData::file_path(&self.ctx.info.output_dir, self.ctx.info_hash);
        if !path.is_file() {
            return;
        }
        match ResumeData::load(&path) {
            Ok(data) => {
                tracing::info!("resume file loaded: {} known peers", data.peers.len());
                self.resumed_uploaded = data.uploaded;
                self.resumed_downloaded = data.downloaded;
                for address in data.peers {
                    self.known.entry(address).or_insert(None);
                }
            },
            Err(e) => tracing::warn!("ignoring resume file: {}", e),
        }
    }

    async fn write_resume(&self) {
        let data = ResumeData {
            bitfield: self.ctx.picker.piece_picker.read().await.own_bitfield().as_raw_slice().to_vec(),
            uploaded: self.resumed_uploaded + self.throughput.up.total(),
            downloaded: self.resumed_downloaded + self.throughput.down.total(),
            peers: self.known.keys().copied().take(50).collect(),
        };
        let path = ResumeData::file_path(&self.ctx.info.output_dir, self.ctx.info_hash);
        match data.save(&path) {
            Ok(()) => tracing::debug!("resume file written: {:?}", path),
            Err(e) => tracing::warn!("failed to write resume file: {}", e),
        }
    }
}
