use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{atomic::Ordering, Arc},
    time::Instant,
};
use tokio::{net::TcpStream, sync::mpsc, time};
use tokio_util::codec::Framed;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use crate::{
    block::{Block, BlockInfo},
    disk::DiskCommand,
    torrent::{TorrentCommand, TorrentContext},
    Bitfield,
};
use super::{*, message::*, handshake::*, state::*};

type MessageSink = SplitSink<Framed<TcpStream, MessageCodec>, Message>;

// One task per peer connection. The session owns the socket; everything
// shared lives behind the torrent context and is reached through the
// scheduler api or command channels.
#[derive(Debug)]
pub struct PeerSession {

    // The peer's address.
    address: SocketAddr,

    // Read-only state shared across the torrent.
    ctx: Arc<TorrentContext>,

    // Commands to the session.
    peer_rx: PeerRx,

    // Handed to the disk task for read replies.
    peer_tx: PeerTx,

    // Pending block requests from the peer to the client.
    requests_in: HashSet<BlockInfo>,

    // Pending block requests from the client to the peer, with the time
    // each was issued.
    requests_out: HashMap<BlockInfo, Instant>,

    // Pieces the peer currently has.
    bitfield: Bitfield,

    state: SessionState,

    // Timers for keep-alives in both directions.
    last_recv: Instant,
    last_send: Instant,

    // Whether this session holds one of the torrent's upload slots.
    has_upload_slot: bool,

}

impl PeerSession {

    pub fn new(address: SocketAddr, ctx: Arc<TorrentContext>) -> (PeerSession, PeerTx) {

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let bitfield = Bitfield::repeat(false, ctx.info.num_pieces as usize);

        (
            PeerSession {
                address,
                ctx,
                peer_rx,
                peer_tx: peer_tx.clone(),
                requests_in: HashSet::new(),
                requests_out: HashMap::new(),
                bitfield,
                state: SessionState::default(),
                last_recv: Instant::now(),
                last_send: Instant::now(),
                has_upload_slot: false,
            },
            peer_tx,
        )
    }

    pub async fn start_session(&mut self, inbound_stream: Option<TcpStream>) -> Result<()> {

        self.state.update(|state| state.conn_state = ConnState::Connecting);
        let inbound = inbound_stream.is_some();
        let mut socket = if let Some(stream) = inbound_stream {
            Framed::new(stream, HandshakeCodec)
        } else {
            let stream = time::timeout(self.ctx.config.connect_timeout, TcpStream::connect(self.address))
                .await
                .map_err(|_| PeerError::ConnectTimeout)??;
            tracing::trace!("outbound connection successful");
            Framed::new(stream, HandshakeCodec)
        };

        // The handshake gets the same deadline as the connect.
        time::timeout(
            self.ctx.config.connect_timeout,
            self.exchange_handshake(&mut socket, inbound),
        )
        .await
        .map_err(|_| PeerError::ConnectTimeout)??;

        let socket = Framed::new(
            socket.into_inner(),
            MessageCodec { max_frame_len: self.ctx.config.max_frame_len },
        );
        self.run(socket).await
    }

    // Tears down session state and reports the disconnect so the torrent
    // can reclaim the peer's rarity counts and requests.
    pub async fn disconnect(&mut self, error: Option<PeerError>) {
        self.state.update(|state| state.conn_state = ConnState::Disconnected);
        self.free_requests_out().await;
        self.release_upload_slot();

        let bitfield = std::mem::take(&mut self.bitfield);
        self.ctx.torrent_tx.send(TorrentCommand::PeerDisconnected {
            address: self.address,
            bitfield: Some(bitfield),
            error: error.map(|e| e.to_string()),
        }).ok();
    }

    async fn exchange_handshake(&mut self, socket: &mut Framed<TcpStream, HandshakeCodec>, inbound: bool) -> Result<()> {

        self.state.update(|state| state.conn_state = ConnState::Handshaking);
        let handshake = Handshake::new(self.ctx.info_hash, self.ctx.client_id);

        if !inbound {
            tracing::debug!("send handshake");
            socket.send(handshake).await?;
        }

        tracing::trace!("waiting for handshake");
        match socket.next().await {
            Some(Ok(handshake)) => {
                // The codec has already validated the protocol string.
                if handshake.info_hash != self.ctx.info_hash {
                    return Err(PeerError::InfoHashMismatch);
                }

                // Respond with our handshake if the connection is inbound.
                if inbound {
                    tracing::debug!("send handshake");
                    let reply = Handshake::new(self.ctx.info_hash, self.ctx.client_id);
                    socket.send(reply).await?;
                }

                tracing::debug!("handshake successful, peer connected");
                self.ctx.torrent_tx.send(TorrentCommand::PeerConnected {
                    address: self.address,
                    id: handshake.peer_id,
                })?;
                Ok(())
            },
            Some(Err(e)) => Err(e),
            None => Err(PeerError::NoHandshake),
        }
    }

    async fn run(&mut self, socket: Framed<TcpStream, MessageCodec>) -> Result<()> {

        self.state.update(|state| state.conn_state = ConnState::Introducing);
        self.last_recv = Instant::now();
        self.last_send = Instant::now();

        let (mut sink, mut stream) = socket.split();
        let mut ticker = time::interval(time::Duration::from_secs(1));

        // Advertise what we already have.
        let own_bitfield = self.ctx.picker.piece_picker.read().await.own_bitfield().clone();
        if own_bitfield.any() {
            self.send_message(&mut sink, Message::Bitfield(own_bitfield)).await?;
        }

        let result = loop { tokio::select! {

            // Cooperative shutdown of the whole torrent.
            _ = self.ctx.cancel.cancelled() => break Err(PeerError::Cancelled),

            // Message from peer.
            maybe_msg = stream.next() => match maybe_msg {
                Some(Ok(msg)) => {
                    if let Err(e) = self.handle_msg(&mut sink, msg).await {
                        break Err(e);
                    }
                },
                Some(Err(e)) => break Err(e),
                None => break Err(PeerError::PeerClosed),
            },

            // Command from elsewhere in the client.
            Some(cmd) = self.peer_rx.recv() => {
                let res = match cmd {

                    // From disk.
                    PeerCommand::BlockRead(block) => self.send_block(&mut sink, block).await,

                    // From torrent.
                    PeerCommand::PieceWritten(idx) => self.handle_written_piece(&mut sink, idx).await,

                    PeerCommand::BlockReceived(info) => self.handle_block_received(&mut sink, info).await,

                    PeerCommand::Shutdown => {
                        tracing::debug!("session shutdown");
                        break Ok(());
                    },

                };
                if let Err(e) = res {
                    break Err(e);
                }
            },

            t = ticker.tick() => {
                if let Err(e) = self.tick(&mut sink, t.into_std()).await {
                    break Err(e);
                }
            },

        }};

        // Drain pending sends within the deadline, then drop the socket.
        let _ = time::timeout(self.ctx.config.drain_deadline, sink.flush()).await;
        result
    }

    // Logs a message and sends it to the peer.
    #[inline(always)]
    async fn send_message(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        tracing::debug!("send: {}", msg);
        self.last_send = Instant::now();
        sink.send(msg).await
    }

    async fn handle_msg(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        tracing::debug!("read: {}", msg);
        self.last_recv = Instant::now();

        match msg {

            // Bitfield can only be sent directly after the handshake.
            Message::Bitfield(bitfield) => {
                if self.state.conn_state == ConnState::Introducing {
                    self.handle_bitfield(sink, bitfield).await?;
                } else {
                    return Err(PeerError::ProtocolViolation(
                        "bitfield after first message".into(),
                    ));
                }
            },

            Message::KeepAlive => {},

            Message::Choke => {
                if !self.state.peer_choking {
                    self.state.update(|state| state.peer_choking = true);
                    // Give pending requests back to the scheduler.
                    self.free_requests_out().await;
                }
            },

            Message::Unchoke => {
                if self.state.peer_choking {
                    self.state.update(|state| state.peer_choking = false);
                    // Start to make requests if interested.
                    if self.state.interested {
                        self.make_requests(sink).await?;
                    }
                }
            },

            Message::Interested => {
                if !self.state.peer_interested {
                    self.state.update(|state| state.peer_interested = true);
                    // Reactive unchoke while the torrent has slots free.
                    if self.state.choked && self.try_acquire_upload_slot() {
                        self.send_message(sink, Message::Unchoke).await?;
                        self.state.update(|state| state.choked = false);
                    }
                }
            },

            Message::NotInterested => {
                if self.state.peer_interested {
                    self.state.update(|state| state.peer_interested = false);
                    if !self.state.choked {
                        self.send_message(sink, Message::Choke).await?;
                        self.state.update(|state| state.choked = true);
                        self.release_upload_slot();
                    }
                }
            },

            Message::Block(block) => {
                self.handle_block(block).await?;
                self.make_requests(sink).await?;
            },

            Message::Request(request) => self.handle_request(request).await?,

            Message::Have { idx } => self.handle_have(sink, idx).await?,

            Message::Cancel(info) => {
                self.requests_in.remove(&info);
            },

        }

        if self.state.conn_state == ConnState::Introducing {
            self.state.update(|state| state.conn_state = ConnState::Connected);
        }

        Ok(())
    }

    async fn handle_bitfield(&mut self, sink: &mut MessageSink, mut bitfield: Bitfield) -> Result<()> {

        let num_pieces = self.ctx.info.num_pieces as usize;
        let expected_bytes = (num_pieces + 7) / 8;
        if bitfield.as_raw_slice().len() != expected_bytes {
            return Err(PeerError::ProtocolViolation(format!(
                "bitfield of {} bytes, expected {}",
                bitfield.as_raw_slice().len(),
                expected_bytes,
            )));
        }
        // Trailing pad bits must be zero.
        if bitfield[num_pieces..].any() {
            return Err(PeerError::ProtocolViolation("bitfield padding bits set".into()));
        }
        bitfield.truncate(num_pieces);

        tracing::debug!("peer has {}/{} pieces", bitfield.count_ones(), num_pieces);

        // Interested if the peer has pieces we don't.
        let interested = self.ctx.picker.piece_picker.write().await.bitfield_update(&bitfield);
        self.state.update(|state| state.num_pieces = bitfield.count_ones());
        self.bitfield = bitfield;
        self.update_interest(sink, interested).await
    }

    async fn handle_have(&mut self, sink: &mut MessageSink, idx: u32) -> Result<()> {
        if idx >= self.ctx.info.num_pieces {
            return Err(PeerError::ProtocolViolation(format!(
                "have with invalid piece idx {}", idx,
            )));
        }
        // Peer already has the piece.
        if self.bitfield[idx as usize] {
            return Ok(());
        }
        self.bitfield.set(idx as usize, true);
        self.state.update(|state| state.num_pieces += 1);

        let interested = self
            .ctx
            .picker
            .piece_picker
            .write()
            .await
            .increment_piece(idx as usize);

        self.update_interest(sink, interested).await
    }

    async fn handle_block(&mut self, block: Block) -> Result<()> {

        let info = block.info();
        let Some(issued) = self.requests_out.remove(&info) else {
            // Unmatched blocks are discarded but not fatal.
            tracing::warn!("unexpected block: {:?}", info);
            return Ok(());
        };

        match self.ctx.picker.received_block(&info).await {

            // Fresh block.
            Some(false) => {
                self.state.update(|state| {
                    state.throughput.down += info.len as u64;
                    state.request_rtt = Some(issued.elapsed());
                });
                // First delivery wins in endgame; everyone else gets a cancel.
                if self.ctx.picker.is_endgame() {
                    self.ctx.torrent_tx.send(TorrentCommand::BlockReceived {
                        info,
                        from: self.address,
                    })?;
                }
                self.ctx.disk_tx.send(DiskCommand::WriteBlock {
                    block,
                    from: self.address,
                })?;
            },

            // Another session delivered it first.
            Some(true) => tracing::trace!("duplicate block: {:?}", info),

            // The piece completed and left the assembly table already.
            None => tracing::trace!("block for piece no longer in flight: {:?}", info),
        }

        Ok(())
    }

    async fn handle_request(&mut self, request: BlockInfo) -> Result<()> {

        // Requests sent while we choke the peer are dropped.
        if self.state.choked {
            tracing::warn!("request whilst choked: {:?}", request);
            return Ok(());
        }
        if !request.is_valid(&self.ctx.info) {
            return Err(PeerError::ProtocolViolation(format!(
                "invalid request: {:?}", request,
            )));
        }
        if !self.requests_in.insert(request) {
            tracing::warn!("duplicate request: {:?}", request);
            return Ok(());
        }

        self.ctx.disk_tx.send(DiskCommand::ReadBlock {
            block: request,
            tx: self.peer_tx.clone(),
        })?;

        Ok(())
    }

    // When a piece is verified and on disk: announce it, and drop any
    // in-flight requests of ours that it satisfies.
    async fn handle_written_piece(&mut self, sink: &mut MessageSink, idx: usize) -> Result<()> {

        self.send_message(sink, Message::Have { idx: idx as u32 }).await?;

        let stale: Vec<BlockInfo> = self
            .requests_out
            .keys()
            .filter(|b| b.piece_idx == idx)
            .copied()
            .collect();
        for info in stale {
            self.requests_out.remove(&info);
            self.send_message(sink, Message::Cancel(info)).await?;
        }

        // The peer may not have anything we need any more.
        if self.state.interested {
            let still_interesting = self
                .ctx
                .picker
                .piece_picker
                .read()
                .await
                .peer_is_interesting(&self.bitfield);
            if !still_interesting {
                self.state.update(|state| state.interested = false);
                self.send_message(sink, Message::NotInterested).await?;
            }
        }

        Ok(())
    }

    // Endgame: another session received this block first.
    async fn handle_block_received(&mut self, sink: &mut MessageSink, info: BlockInfo) -> Result<()> {
        if self.requests_out.remove(&info).is_some() {
            self.send_message(sink, Message::Cancel(info)).await?;
        }
        Ok(())
    }

    // Queue requests up to the configured pipeline budget.
    async fn make_requests(&mut self, sink: &mut MessageSink) -> Result<()> {

        if self.state.peer_choking || !self.state.interested {
            return Ok(());
        }

        let requests = self
            .ctx.picker
            .pick_blocks(
                &self.requests_out,
                self.ctx.config.target_request_queue_len,
                &self.bitfield,
            )
            .await;

        for block in requests {
            tracing::debug!("send request: {:?}", block);
            self.requests_out.insert(block, Instant::now());
            self.send_message(sink, Message::Request(block)).await?;
        }

        Ok(())
    }

    // Answer a peer's request with a block read from disk, unless it was
    // cancelled in the meantime.
    async fn send_block(&mut self, sink: &mut MessageSink, block: Block) -> Result<()> {
        let info = block.info();
        if !self.requests_in.remove(&info) {
            tracing::trace!("block read but request cancelled: {:?}", info);
            return Ok(());
        }
        self.send_message(sink, Message::Block(block)).await?;
        self.state.update(|state| state.throughput.up += info.len as u64);
        Ok(())
    }

    // Free all requested blocks, making them available to other peers.
    async fn free_requests_out(&mut self) {
        for (info, _) in self.requests_out.drain() {
            self.ctx.picker.free_block(&info).await;
            tracing::trace!("freed block request: {:?}", info);
        }
    }

    // If we have BECOME interested, say so, and start requesting right
    // away when the peer already unchoked us.
    async fn update_interest(&mut self, sink: &mut MessageSink, interested: bool) -> Result<()> {
        if !self.state.interested && interested {
            self.state.update(|state| state.interested = true);
            self.send_message(sink, Message::Interested).await?;
            if !self.state.peer_choking {
                self.make_requests(sink).await?;
            }
        }
        Ok(())
    }

    async fn tick(&mut self, sink: &mut MessageSink, time: Instant) -> Result<()> {

        // Two minutes of silence from the peer ends the session.
        if time.duration_since(self.last_recv) >= self.ctx.config.keep_alive_interval {
            return Err(PeerError::IdleTimeout);
        }

        // Keep-alives go out at half the silence limit so the peer never
        // sees two quiet minutes from us.
        if time.duration_since(self.last_send) >= self.ctx.config.keep_alive_interval / 2 {
            self.send_message(sink, Message::KeepAlive).await?;
        }

        // An unanswered request drops the session; disconnect reclaims
        // every outstanding block for other peers.
        let request_timeout = self.ctx.config.request_timeout;
        if self.requests_out.values().any(|t| time.duration_since(*t) >= request_timeout) {
            return Err(PeerError::RequestTimeout);
        }

        // Report throughput and state for stats and swarm scoring.
        self.ctx.torrent_tx.send(TorrentCommand::PeerState {
            address: self.address,
            state: self.state,
        })?;
        self.state.tick();
        self.state.changed = false;

        Ok(())
    }

    fn try_acquire_upload_slot(&mut self) -> bool {
        if self.has_upload_slot {
            return true;
        }
        let max = self.ctx.config.max_upload_slots;
        let claimed = self.ctx.upload_slots
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n < max { Some(n + 1) } else { None }
            })
            .is_ok();
        self.has_upload_slot = claimed;
        claimed
    }

    fn release_upload_slot(&mut self) {
        if self.has_upload_slot {
            self.ctx.upload_slots.fetch_sub(1, Ordering::SeqCst);
            self.has_upload_slot = false;
        }
    }
}
