use std::{
    collections::HashMap,
    net::SocketAddr,
    ops::Range,
    sync::{Arc, Mutex, RwLock},
};
use tokio::{sync::mpsc, task};
use crate::{
    block::{Block, BlockData, BlockInfo, num_blocks},
    p2p::{PeerCommand, PeerTx},
    store::StoreInfo,
    torrent::{TorrentCommand, TorrentTx},
    Bitfield,
    ID,
};
use piece::{read_piece, PieceBuf};

mod piece;
#[cfg(test)]
mod tests;

#[derive(thiserror::Error, Debug)]
pub enum DiskError {

    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage io error: expected {expected} bytes, got {actual}")]
    IoSize {
        expected: usize,
        actual: usize,
    },

    // Poisoned file locks.
    #[error("sync error: {0}")]
    Sync(String),

    #[error("channel error: {0}")]
    Channel(String),

}

impl<T> From<std::sync::PoisonError<T>> for DiskError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        DiskError::Sync(e.to_string())
    }
}

impl<T> From<mpsc::error::SendError<T>> for DiskError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        DiskError::Channel(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DiskError>;
pub type DiskTx = mpsc::UnboundedSender<DiskCommand>;
pub type DiskRx = mpsc::UnboundedReceiver<DiskCommand>;

pub enum DiskCommand {

    // Block from a peer to be buffered and, once its piece completes,
    // verified and written.
    WriteBlock {
        block: Block,
        from: SocketAddr,
    },

    // Block a peer requested; read from disk and send back through the
    // peer's channel.
    ReadBlock {
        block: BlockInfo,
        tx: PeerTx,
    },

    // Drain pending writes and stop.
    Shutdown,

}

#[derive(Debug)]
pub struct TorrentFile {

    pub len: usize,

    // Offset from the start of the torrent.
    pub offset: usize,

    pub file_lock: RwLock<std::fs::File>,

}

impl TorrentFile {
    pub fn byte_range(&self) -> Range<usize> {
        self.offset..(self.offset + self.len)
    }
}

// Spawns the disk task. Failing to create the download layout is fatal
// before the torrent is admitted.
pub fn spawn(
    info: StoreInfo,
    piece_hashes: Vec<ID>,
    torrent_tx: TorrentTx,
) -> Result<(task::JoinHandle<Result<()>>, DiskTx)> {
    let (mut disk, disk_tx) = Disk::new(info, piece_hashes, torrent_tx)?;
    let handle = task::spawn(async move { disk.run().await });
    Ok((handle, disk_tx))
}

#[derive(Debug)]
pub struct Disk {

    // Storage layout for mapping pieces onto file regions.
    info: StoreInfo,

    // Piece hashes for verification.
    piece_hashes: Vec<ID>,

    // Pieces being assembled, keyed by piece index.
    write_buf: HashMap<usize, PieceBuf>,

    disk_rx: DiskRx,

    // State shared with the blocking io workers.
    ctx: Arc<Ctx>,

    // In-flight verification/write workers, reaped as they finish and
    // drained on shutdown.
    pending_writes: Vec<task::JoinHandle<()>>,

}

// Data needed by the io workers.
#[derive(Debug)]
struct Ctx {

    files: Vec<TorrentFile>,

    torrent_tx: TorrentTx,

    // Peers tend to read several blocks from the same piece, so whole
    // pieces are cached after the first read.
    read_cache: Mutex<lru::LruCache<usize, Vec<Arc<Vec<u8>>>>>,

}

impl Disk {

    pub fn new(info: StoreInfo, piece_hashes: Vec<ID>, torrent_tx: TorrentTx) -> Result<(Self, DiskTx)> {

        if !info.output_dir.is_dir() {
            std::fs::create_dir_all(&info.output_dir)?;
            tracing::info!("created missing output directory: {:?}", info.output_dir);
        }

        debug_assert!(!info.files.is_empty());
        let mut files = Vec::with_capacity(info.files.len());
        for file in info.files.iter() {
            let path = info.output_dir.join(&file.path);
            // Create sub-directories if they don't exist.
            if let Some(subdir) = path.parent() {
                if !subdir.exists() {
                    tracing::info!("creating sub-directory: {:?}", subdir);
                    std::fs::create_dir_all(subdir)?;
                }
            }
            files.push(TorrentFile {
                len: file.length,
                offset: file.offset,
                file_lock: RwLock::new(
                    std::fs::OpenOptions::new()
                        .create(true)
                        .read(true)
                        .write(true)
                        .open(&path)?,
                ),
            });
            tracing::info!("opened file: {:?}", &path);
        }

        let (disk_tx, disk_rx) = mpsc::unbounded_channel();
        // Unwrap safe because value is always > 0.
        let read_cache = Mutex::new(lru::LruCache::new(std::num::NonZeroUsize::new(64).unwrap()));
        Ok((
            Self {
                info,
                piece_hashes,
                write_buf: HashMap::new(),
                disk_rx,
                ctx: Arc::new(Ctx {
                    files,
                    torrent_tx,
                    read_cache,
                }),
                pending_writes: Vec::new(),
            },
            disk_tx,
        ))
    }

    #[tracing::instrument(name = "disk", skip_all)]
    pub async fn run(&mut self) -> Result<()> {

        // Re-verify whatever is already on disk before any scheduling
        // happens; a crash mid-write leaves a piece that simply fails the
        // hash check and gets downloaded again.
        let bitfield = self.check_existing_pieces();
        tracing::info!("storage check: {}/{} pieces on disk", bitfield.count_ones(), self.info.num_pieces);
        self.ctx.torrent_tx.send(TorrentCommand::StorageReady { bitfield })?;

        while let Some(cmd) = self.disk_rx.recv().await {
            match cmd {

                DiskCommand::WriteBlock { block, from } => {
                    if let Err(e) = self.write_block(block, from) {
                        // The destination is unusable; the torrent is told
                        // once and the disk task stops.
                        tracing::error!("storage failure: {}", e);
                        self.ctx.torrent_tx
                            .send(TorrentCommand::StorageError { error: e.to_string() })
                            .ok();
                        break;
                    }
                },

                DiskCommand::ReadBlock { block, tx } => self.read_block(block, tx),

                DiskCommand::Shutdown => {
                    tracing::info!("disk shutdown");
                    break;
                },

            }
        }

        // Drain pending writes before the task exits.
        for handle in self.pending_writes.drain(..) {
            handle.await.ok();
        }
        Ok(())
    }

    fn write_block(&mut self, block: Block, from: SocketAddr) -> Result<()> {
        // Block info is validated in the peer session.

        let piece_idx = block.piece_idx;
        let piece = self.write_buf.entry(piece_idx).or_insert_with(|| {
            let len = self.info.piece_length(piece_idx);
            tracing::trace!("creating new piece {} in write buf", piece_idx);
            PieceBuf {
                hash: self.piece_hashes[piece_idx],
                len,
                data: vec![0; len],
                blocks_received: vec![false; num_blocks(len)],
                num_blocks_received: 0,
                file_range: self.info.piece_file_intersections(piece_idx),
                contributors: Default::default(),
            }
        });

        piece.add_block(&block, from);
        tracing::trace!(
            "piece {}: {}/{} blocks received",
            piece_idx,
            piece.num_blocks_received,
            piece.blocks_received.len(),
        );

        if piece.is_complete() {
            let piece = self.write_buf.remove(&piece_idx).expect("piece not found in write buf");
            let offset = self.info.piece_byte_offset(piece_idx);
            let ctx = Arc::clone(&self.ctx);

            self.pending_writes.retain(|h| !h.is_finished());
            // Hashing and file io happen off the async workers.
            self.pending_writes.push(task::spawn_blocking(move || {

                let contributors: Vec<SocketAddr> = piece.contributors.iter().copied().collect();
                if piece.verify_hash() {
                    // The write completes before the torrent learns of the
                    // piece, so a `have` is never announced for bytes that
                    // are not on disk.
                    if let Err(e) = piece.write(offset, &ctx.files[piece.file_range.clone()]) {
                        tracing::error!("storage failure: {}", e);
                        ctx.torrent_tx
                            .send(TorrentCommand::StorageError { error: e.to_string() })
                            .ok();
                        return;
                    }
                    ctx.read_cache.lock().map(|mut c| c.pop(&piece_idx)).ok();
                    ctx.torrent_tx
                        .send(TorrentCommand::PieceWritten { idx: piece_idx, valid: true, contributors })
                        .ok();

                } else {
                    // Assembled bytes are discarded with the buffer; the
                    // scheduler re-requests the piece from scratch.
                    tracing::warn!("piece {} failed hash verification", piece_idx);
                    ctx.torrent_tx
                        .send(TorrentCommand::PieceWritten { idx: piece_idx, valid: false, contributors })
                        .ok();
                }
            }));
        }
        Ok(())
    }

    // Reads a block and sends it back through the peer's channel.
    fn read_block(&mut self, block_info: BlockInfo, peer_tx: PeerTx) {

        let block_idx = block_info.idx_in_piece();

        let cached = self.ctx.read_cache
            .lock()
            .ok()
            .and_then(|mut c| c.get(&block_info.piece_idx).cloned());

        if let Some(cached) = cached {
            tracing::trace!("cache hit for piece {}", block_info.piece_idx);
            if block_idx >= cached.len() {
                tracing::warn!("block index out of range: {:?}", block_info);
                return;
            }
            peer_tx.send(PeerCommand::BlockRead(Block {
                piece_idx: block_info.piece_idx,
                offset: block_info.offset,
                data: BlockData::Cached(Arc::clone(&cached[block_idx])),
            })).ok();

        } else {
            let file_range = self.info.piece_file_intersections(block_info.piece_idx);
            let offset = self.info.piece_byte_offset(block_info.piece_idx);
            let len = self.info.piece_length(block_info.piece_idx);
            let ctx = Arc::clone(&self.ctx);

            self.pending_writes.retain(|h| !h.is_finished());
            self.pending_writes.push(task::spawn_blocking(move || {
                let piece = match read_piece(offset, len, &ctx.files[file_range]) {
                    Ok(piece) => piece,
                    Err(e) => {
                        // A read for a piece we don't have yet; drop the
                        // request rather than the torrent.
                        tracing::warn!("read of piece {} failed: {}", block_info.piece_idx, e);
                        return;
                    },
                };
                let block = Arc::clone(&piece[block_idx]);
                ctx.read_cache.lock().map(|mut c| c.put(block_info.piece_idx, piece)).ok();

                peer_tx.send(PeerCommand::BlockRead(Block {
                    piece_idx: block_info.piece_idx,
                    offset: block_info.offset,
                    data: BlockData::Cached(block),
                })).ok();
            }));
        }
    }

    // Hashes whatever is on disk already; pieces that check out are
    // reported as owned.
    fn check_existing_pieces(&self) -> Bitfield {

        let mut bitfield = Bitfield::repeat(false, self.info.num_pieces as usize);

        for piece_idx in 0..self.info.num_pieces as usize {
            let file_range = self.info.piece_file_intersections(piece_idx);
            match read_piece(
                self.info.piece_byte_offset(piece_idx),
                self.info.piece_length(piece_idx),
                &self.ctx.files[file_range],
            ) {
                Ok(piece) => {
                    use sha1::Digest;
                    let mut hasher = sha1::Sha1::new();
                    for block in piece.iter() {
                        hasher.update(&**block);
                    }
                    let hash = hasher.finalize();
                    if hash.as_slice() == self.piece_hashes[piece_idx] {
                        bitfield.set(piece_idx, true);
                    }
                },
                Err(_) => continue,
            }
        }

        bitfield
    }
}
